use std::collections::HashSet;
use std::sync::Arc;

use casbin::{CoreApi, DefaultModel, Enforcer, MemoryAdapter, MgmtApi};
use futures::lock::Mutex;
use parking_lot::RwLock;

use super::{Effect, PolicyStore, Rule, WILDCARD};
use crate::error::{Error, Result};

const LOGIN_OBJECT: &str = "login";
const LOGIN_ACTION: &str = "execute";

/// Request `(sub, obj, act)` against rules carrying an effect. `*` in a rule
/// matches any value; any matching deny wins.
const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[policy_effect]
e = some(where (p.eft == allow)) && !some(where (p.eft == deny))

[matchers]
m = (p.sub == "*" || r.sub == p.sub) && (p.obj == "*" || r.obj == p.obj) && (p.act == "*" || r.act == p.act)
"#;

/// Casbin enforcer over the rules of a [`PolicyStore`].
///
/// Reads (`enforce`, lookups) never wait on the store. Mutations go to the
/// store first and the enforcer is swapped only once the store accepted
/// them, one mutation at a time.
pub struct PolicyManager {
    enforcer: RwLock<Enforcer>,
    store: Arc<dyn PolicyStore>,
    writes: Mutex<()>,
}

impl PolicyManager {
    /// Loads every rule from `store`.
    pub async fn new(store: Arc<dyn PolicyStore>) -> Result<Self> {
        let rules = store.load().await.map_err(|e| Error::PolicyStore(e.into()))?;
        tracing::debug!(rules = rules.len(), "policy rules loaded");
        Ok(Self {
            enforcer: RwLock::new(build(&dedup(rules)).await?),
            store,
            writes: Mutex::new(()),
        })
    }

    /// Decides whether `subject` may perform `action` on `object`.
    ///
    /// A matching deny rule wins over any allow rule. Without a matching
    /// rule the request is denied.
    pub fn enforce(&self, subject: &str, object: &str, action: &str) -> Result<bool> {
        if subject.is_empty() || object.is_empty() || action.is_empty() {
            return Err(Error::Policy(
                "subject, object and action must not be empty".into(),
            ));
        }
        self.enforcer
            .read()
            .enforce((subject, object, action))
            .map_err(policy_error)
    }

    /// Adds every rule or none. Fails if any of them already exists.
    pub async fn add_policies(&self, rules: &[Rule]) -> Result<()> {
        let rules = dedup(rules.to_vec());
        if rules.is_empty() {
            return Ok(());
        }
        let _write = self.writes.lock().await;
        if let Some(existing) = rules.iter().find(|r| self.has_rule(r)) {
            return Err(Error::Policy(format!("policy already exists: {existing}")));
        }
        let mut next = self.policies();
        next.extend(rules.iter().cloned());
        let enforcer = build(&next).await?;
        self.store
            .add(&rules)
            .await
            .map_err(|e| Error::PolicyStore(e.into()))?;
        *self.enforcer.write() = enforcer;
        Ok(())
    }

    /// Removes every rule or none. Fails if any of them does not exist.
    pub async fn remove_policies(&self, rules: &[Rule]) -> Result<()> {
        let rules = dedup(rules.to_vec());
        if rules.is_empty() {
            return Ok(());
        }
        let _write = self.writes.lock().await;
        if let Some(missing) = rules.iter().find(|r| !self.has_rule(r)) {
            return Err(Error::Policy(format!("policy does not exist: {missing}")));
        }
        self.remove_unchecked(&rules).await
    }

    /// Rules whose field at `index` (0 subject, 1 object, 2 action,
    /// 3 effect) equals `value`. Finding nothing is an error.
    pub fn filtered_policy(&self, index: usize, value: &str) -> Result<Vec<Rule>> {
        if index > 3 {
            return Err(Error::Policy(format!("field index {index} is out of range")));
        }
        let found: Vec<Rule> = self
            .enforcer
            .read()
            .get_filtered_policy(index, vec![value.to_string()])
            .iter()
            .filter_map(|row| Rule::from_row(row))
            .collect();
        if found.is_empty() {
            return Err(Error::Policy(format!(
                "no policy has `{value}` at field {index}"
            )));
        }
        Ok(found)
    }

    /// Replaces the enforcer's rules with the store's current content.
    pub async fn reload(&self) -> Result<()> {
        let _write = self.writes.lock().await;
        let rules = self
            .store
            .load()
            .await
            .map_err(|e| Error::PolicyStore(e.into()))?;
        let enforcer = build(&dedup(rules)).await?;
        *self.enforcer.write() = enforcer;
        Ok(())
    }

    /// Forgets the loaded rules. The store is left untouched.
    pub async fn reset(&self) -> Result<()> {
        let _write = self.writes.lock().await;
        let enforcer = build(&[]).await?;
        *self.enforcer.write() = enforcer;
        Ok(())
    }

    /// Every rule currently loaded.
    pub fn policies(&self) -> Vec<Rule> {
        self.enforcer
            .read()
            .get_policy()
            .iter()
            .filter_map(|row| Rule::from_row(row))
            .collect()
    }

    pub(crate) async fn close(&self) -> anyhow::Result<()> {
        self.store.close().await
    }

    pub async fn add_policy_for_user(
        &self,
        user: &str,
        object: &str,
        action: &str,
        effect: Effect,
    ) -> Result<()> {
        self.add_policies(&[Rule::new(user, object, action, effect)])
            .await
    }

    /// Adds one rule for `user` per `(object, action, effect)` grant.
    pub async fn add_policies_for_user(
        &self,
        user: &str,
        grants: &[(&str, &str, Effect)],
    ) -> Result<()> {
        let rules: Vec<Rule> = grants
            .iter()
            .map(|(object, action, effect)| Rule::new(user, *object, *action, *effect))
            .collect();
        self.add_policies(&rules).await
    }

    pub async fn add_multiple_policies(&self, rules: &[Rule]) -> Result<()> {
        self.add_policies(rules).await
    }

    pub async fn remove_policy_for_user(
        &self,
        user: &str,
        object: &str,
        action: &str,
        effect: Effect,
    ) -> Result<()> {
        self.remove_policies(&[Rule::new(user, object, action, effect)])
            .await
    }

    /// Removes every rule whose subject is `user`. A user without rules is
    /// not an error.
    pub async fn remove_all_policies_for_user(&self, user: &str) -> Result<()> {
        let _write = self.writes.lock().await;
        let owned: Vec<Rule> = self
            .policies()
            .into_iter()
            .filter(|r| r.subject == user)
            .collect();
        if owned.is_empty() {
            return Ok(());
        }
        self.remove_unchecked(&owned).await
    }

    pub async fn remove_multiple_policies(&self, rules: &[Rule]) -> Result<()> {
        self.remove_policies(rules).await
    }

    /// True when a rule with exactly this triple and effect exists.
    pub fn has_policy_for_user(
        &self,
        user: &str,
        object: &str,
        action: &str,
        effect: Effect,
    ) -> bool {
        self.has_rule(&Rule::new(user, object, action, effect))
    }

    pub fn can_user_login(&self, user: &str) -> Result<bool> {
        self.enforce(user, LOGIN_OBJECT, LOGIN_ACTION)
    }

    pub fn can_user_perform_action(&self, user: &str, object: &str, action: &str) -> Result<bool> {
        self.enforce(user, object, action)
    }

    /// Same as [`filtered_policy`](Self::filtered_policy); `*` as `value`
    /// returns every rule.
    pub fn get_filtered_policy(&self, index: usize, value: &str) -> Result<Vec<Rule>> {
        if value == WILDCARD && index <= 3 {
            let all = self.policies();
            if all.is_empty() {
                return Err(Error::Policy("no policies are loaded".into()));
            }
            return Ok(all);
        }
        self.filtered_policy(index, value)
    }

    fn has_rule(&self, rule: &Rule) -> bool {
        self.enforcer.read().has_policy(rule.to_row())
    }

    async fn remove_unchecked(&self, rules: &[Rule]) -> Result<()> {
        let next: Vec<Rule> = self
            .policies()
            .into_iter()
            .filter(|r| !rules.contains(r))
            .collect();
        let enforcer = build(&next).await?;
        self.store
            .remove(rules)
            .await
            .map_err(|e| Error::PolicyStore(e.into()))?;
        *self.enforcer.write() = enforcer;
        Ok(())
    }
}

async fn build(rules: &[Rule]) -> Result<Enforcer> {
    let model = DefaultModel::from_str(MODEL).await.map_err(policy_error)?;
    let mut enforcer = Enforcer::new(model, MemoryAdapter::default())
        .await
        .map_err(policy_error)?;
    if !rules.is_empty() {
        enforcer
            .add_policies(rules.iter().map(Rule::to_row).collect())
            .await
            .map_err(policy_error)?;
    }
    Ok(enforcer)
}

fn policy_error(e: casbin::Error) -> Error {
    Error::Policy(e.to_string())
}

fn dedup(rules: Vec<Rule>) -> Vec<Rule> {
    let mut seen = HashSet::new();
    rules
        .into_iter()
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::policy::MemoryPolicyStore;

    async fn manager(rules: Vec<Rule>) -> (PolicyManager, Arc<MemoryPolicyStore>) {
        let store = Arc::new(MemoryPolicyStore::new(rules));
        (PolicyManager::new(store.clone()).await.unwrap(), store)
    }

    #[tokio::test]
    async fn nothing_is_allowed_without_rules() {
        let (manager, _) = manager(vec![]).await;
        assert!(!manager.enforce("alice", "/orders", "GET").unwrap());
        assert!(!manager.can_user_login("alice").unwrap());
    }

    #[tokio::test]
    async fn deny_overrides_allow() {
        let (manager, _) = manager(vec![
            Rule::allow("alice", WILDCARD, "GET"),
            Rule::deny("alice", "/admin", "GET"),
        ])
        .await;
        assert!(manager.enforce("alice", "/orders", "GET").unwrap());
        assert!(!manager.enforce("alice", "/admin", "GET").unwrap());
    }

    #[tokio::test]
    async fn wildcards_match_any_value() {
        let (manager, _) = manager(vec![Rule::allow("admin", WILDCARD, "GET")]).await;
        assert!(manager.enforce("admin", "/orders", "GET").unwrap());
        assert!(!manager.enforce("admin", "/orders", "POST").unwrap());
        assert!(!manager.enforce("alice", "/orders", "GET").unwrap());
    }

    #[tokio::test]
    async fn empty_arguments_are_rejected() {
        let (manager, _) = manager(vec![]).await;
        assert_eq!("policy", manager.enforce("", "/x", "GET").unwrap_err().kind());
    }

    #[tokio::test]
    async fn added_policies_are_persisted_and_enforced() {
        let (manager, store) = manager(vec![]).await;
        manager
            .add_policies_for_user(
                "bob",
                &[
                    ("login", "execute", Effect::Allow),
                    ("/orders", "POST", Effect::Allow),
                    ("/orders", "DELETE", Effect::Deny),
                ],
            )
            .await
            .unwrap();

        assert!(manager.can_user_login("bob").unwrap());
        assert!(manager.can_user_perform_action("bob", "/orders", "POST").unwrap());
        assert!(manager.has_policy_for_user("bob", "/orders", "POST", Effect::Allow));
        assert!(!manager.has_policy_for_user("bob", "/orders", "POST", Effect::Deny));
        assert!(!manager.can_user_perform_action("bob", "/orders", "DELETE").unwrap());
        assert_eq!(3, store.rules().len());
    }

    #[tokio::test]
    async fn adding_an_existing_rule_adds_nothing() {
        let (manager, store) = manager(vec![Rule::allow("bob", "/a", "GET")]).await;
        let err = manager
            .add_multiple_policies(&[Rule::allow("bob", "/b", "GET"), Rule::allow("bob", "/a", "GET")])
            .await
            .unwrap_err();
        assert_eq!("policy", err.kind());
        assert!(!manager.has_policy_for_user("bob", "/b", "GET", Effect::Allow));
        assert_eq!(1, store.rules().len());
    }

    #[tokio::test]
    async fn removing_requires_every_rule_to_exist() {
        let (manager, _) = manager(vec![Rule::allow("bob", "/a", "GET")]).await;
        assert!(manager
            .remove_multiple_policies(&[Rule::allow("bob", "/a", "GET"), Rule::allow("bob", "/z", "GET")])
            .await
            .is_err());
        assert!(manager.has_policy_for_user("bob", "/a", "GET", Effect::Allow));

        assert!(manager
            .remove_policy_for_user("bob", "/a", "GET", Effect::Deny)
            .await
            .is_err());
        manager
            .remove_policy_for_user("bob", "/a", "GET", Effect::Allow)
            .await
            .unwrap();
        assert!(!manager.has_policy_for_user("bob", "/a", "GET", Effect::Allow));
    }

    #[tokio::test]
    async fn remove_all_for_user_leaves_others() {
        let (manager, store) = manager(vec![
            Rule::allow("bob", "/a", "GET"),
            Rule::deny("bob", "/b", "GET"),
            Rule::allow("carol", "/a", "GET"),
        ])
        .await;
        manager.remove_all_policies_for_user("bob").await.unwrap();
        manager.remove_all_policies_for_user("nobody").await.unwrap();
        assert_eq!(vec![Rule::allow("carol", "/a", "GET")], manager.policies());
        assert_eq!(1, store.rules().len());
    }

    #[tokio::test]
    async fn filtered_lookup_by_field() {
        let (manager, _) = manager(vec![
            Rule::allow("bob", "/a", "GET"),
            Rule::deny("carol", "/a", "POST"),
        ])
        .await;
        assert_eq!(2, manager.filtered_policy(1, "/a").unwrap().len());
        assert_eq!(
            vec![Rule::deny("carol", "/a", "POST")],
            manager.get_filtered_policy(3, "deny").unwrap()
        );
        assert_eq!(2, manager.get_filtered_policy(0, WILDCARD).unwrap().len());
        assert!(manager.filtered_policy(0, "dave").is_err());
        assert!(manager.filtered_policy(7, "bob").is_err());
    }

    #[tokio::test]
    async fn reset_then_reload_restores_from_store() {
        let (manager, _) = manager(vec![Rule::allow("bob", "login", "execute")]).await;
        manager.reset().await.unwrap();
        assert!(!manager.can_user_login("bob").unwrap());
        manager.reload().await.unwrap();
        assert!(manager.can_user_login("bob").unwrap());
    }

    struct BrokenStore;

    #[async_trait]
    impl PolicyStore for BrokenStore {
        async fn load(&self) -> anyhow::Result<Vec<Rule>> {
            Ok(vec![])
        }

        async fn add(&self, _rules: &[Rule]) -> anyhow::Result<()> {
            anyhow::bail!("read-only replica")
        }

        async fn remove(&self, _rules: &[Rule]) -> anyhow::Result<()> {
            anyhow::bail!("read-only replica")
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_failures_leave_memory_unchanged() {
        let manager = PolicyManager::new(Arc::new(BrokenStore)).await.unwrap();
        let err = manager
            .add_policy_for_user("bob", "/a", "GET", Effect::Allow)
            .await
            .unwrap_err();
        assert_eq!("policy_store", err.kind());
        assert!(manager.policies().is_empty());
    }
}
