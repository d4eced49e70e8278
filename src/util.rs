use regex::Regex;

/// Type name without module paths, e.g. `WithService` or
/// `Arc<PolicyManager>`.
pub fn short_name<T: ?Sized>() -> String {
    abs_to_rel_paths(std::any::type_name::<T>())
}

fn abs_to_rel_paths(s: &str) -> String {
    match Regex::new("[_a-zA-Z0-9]*::") {
        Ok(re) => re.replace_all(s, "").into(),
        Err(_) => s.to_string(),
    }
}

#[test]
fn abs_to_rel_paths_works() {
    assert_eq!(
        "WithDatabase",
        abs_to_rel_paths("app_kernel::options::WithDatabase")
    );
    assert_eq!(
        "Arc<dyn DatabasePool>",
        abs_to_rel_paths("alloc::sync::Arc<dyn app_kernel::database::DatabasePool>")
    );
    assert_eq!(
        "HashMap<String, Vec<Rule>>",
        abs_to_rel_paths("std::collections::hash::map::HashMap<alloc::string::String, alloc::vec::Vec<app_kernel::policy::Rule>>")
    );
    assert_eq!(
        "(Capability, ShutdownFailure)",
        abs_to_rel_paths("(app_kernel::context::Capability, app_kernel::error::ShutdownFailure)")
    );
    assert_eq!("u32", abs_to_rel_paths("u32"));
}
