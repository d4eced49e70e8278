//! Access-control rules and the stores that persist them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;

mod manager;

pub use manager::PolicyManager;

/// Matches any value in a rule position.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        })
    }
}

impl FromStr for Effect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            other => anyhow::bail!("unknown policy effect `{other}`"),
        }
    }
}

/// One `(subject, object, action, effect)` access rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub subject: String,
    pub object: String,
    pub action: String,
    pub effect: Effect,
}

impl Rule {
    pub fn new(
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
        effect: Effect,
    ) -> Self {
        Self {
            subject: subject.into(),
            object: object.into(),
            action: action.into(),
            effect,
        }
    }

    pub fn allow(
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::new(subject, object, action, Effect::Allow)
    }

    pub fn deny(
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::new(subject, object, action, Effect::Deny)
    }

    /// Field by position: subject, object, action, effect.
    pub fn field(&self, index: usize) -> Option<String> {
        match index {
            0 => Some(self.subject.clone()),
            1 => Some(self.object.clone()),
            2 => Some(self.action.clone()),
            3 => Some(self.effect.to_string()),
            _ => None,
        }
    }

    pub(crate) fn to_row(&self) -> Vec<String> {
        vec![
            self.subject.clone(),
            self.object.clone(),
            self.action.clone(),
            self.effect.to_string(),
        ]
    }

    /// Reads a stored row; a missing or empty effect means allow.
    pub(crate) fn from_row(row: &[String]) -> Option<Self> {
        let [subject, object, action, rest @ ..] = row else {
            return None;
        };
        let effect = match rest.first().map(String::as_str) {
            None | Some("") => Effect::Allow,
            Some(effect) => effect.parse().ok()?,
        };
        Some(Self::new(subject, object, action, effect))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}",
            self.subject, self.object, self.action, self.effect
        )
    }
}

/// Persistent backing of the policy engine.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<Rule>>;

    /// Persists every rule or none of them.
    async fn add(&self, rules: &[Rule]) -> anyhow::Result<()>;

    /// Deletes every rule or none of them.
    async fn remove(&self, rules: &[Rule]) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PolicyStoreConnector: Send + Sync {
    async fn open(&self, config: &PolicyConfig) -> anyhow::Result<Arc<dyn PolicyStore>>;
}

/// Store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryPolicyStore {
    rules: Mutex<Vec<Rule>>,
}

impl MemoryPolicyStore {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.lock().clone()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn load(&self) -> anyhow::Result<Vec<Rule>> {
        Ok(self.rules())
    }

    async fn add(&self, rules: &[Rule]) -> anyhow::Result<()> {
        self.rules.lock().extend_from_slice(rules);
        Ok(())
    }

    async fn remove(&self, rules: &[Rule]) -> anyhow::Result<()> {
        self.rules.lock().retain(|r| !rules.contains(r));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Connector used when the crate is built without a database driver.
pub struct NoPolicyStoreDriver;

#[async_trait]
impl PolicyStoreConnector for NoPolicyStoreDriver {
    async fn open(&self, _config: &PolicyConfig) -> anyhow::Result<Arc<dyn PolicyStore>> {
        anyhow::bail!("built without the `postgres` feature, no policy store available")
    }
}
