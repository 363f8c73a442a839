//! Actor identity and deactivation reasons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Type name plus key of an actor instance, e.g. `Counter[user-42]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorIdentity {
    type_name: String,
    key: String,
}

impl ActorIdentity {
    /// Create an identity.
    pub fn new(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            key: key.into(),
        }
    }

    /// Actor type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Instance key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Name used to register the actor in the process-local registry.
    #[must_use]
    pub fn registry_name(&self) -> String {
        format!("{}:{}", self.type_name, self.key)
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.type_name, self.key)
    }
}

/// Why an actor is being deactivated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeactivationReason {
    /// The host is shutting down.
    #[default]
    Shutdown,
    /// The actor sat idle.
    Idle,
    /// The actor's state was deleted.
    Deleted,
    /// A caller asked for deactivation.
    Requested(String),
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::Idle => write!(f, "idle"),
            Self::Deleted => write!(f, "deleted"),
            Self::Requested(why) => write!(f, "requested: {why}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let identity = ActorIdentity::new("Counter", "user-42");
        assert_eq!(identity.to_string(), "Counter[user-42]");
        assert_eq!(identity.registry_name(), "Counter:user-42");
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            DeactivationReason::Requested("rebalance".into()).to_string(),
            "requested: rebalance"
        );
        assert_eq!(DeactivationReason::default(), DeactivationReason::Shutdown);
    }
}
