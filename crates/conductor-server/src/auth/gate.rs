//! Auth gate: validates client-presented secrets against the configured
//! allow-list.
//!
//! An empty allow-list disables authentication entirely. The check is pure;
//! rejections are reported to the client as structured failures and never
//! close the connection. Repeated failures are not rate-limited.

use conductor_core::Rejection;
use serde_json::Value;
use std::collections::HashSet;

/// Immutable set of accepted client secrets.
#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    secrets: HashSet<String>,
}

impl AuthGate {
    /// Build a gate from the accepted secrets.
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        Self {
            secrets: secrets.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.secrets.is_empty()
    }

    /// Number of accepted secrets.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Check the secret a client attached to its command.
    ///
    /// Only a string can match; a secret of any other JSON type is invalid.
    pub fn authorize(&self, presented: Option<&Value>) -> Result<(), Rejection> {
        if !self.is_enabled() {
            return Ok(());
        }
        match presented {
            None => Err(Rejection::SecretRequired),
            Some(Value::String(secret)) if self.secrets.contains(secret) => Ok(()),
            Some(_) => Err(Rejection::InvalidSecret),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disabled_gate_allows_everything() {
        let gate = AuthGate::default();
        assert!(!gate.is_enabled());
        assert!(gate.authorize(None).is_ok());
        assert!(gate.authorize(Some(&json!("anything"))).is_ok());
        assert!(gate.authorize(Some(&json!(5))).is_ok());
    }

    #[test]
    fn missing_secret_is_required() {
        let gate = AuthGate::new(vec!["alpha".to_string()]);
        assert_eq!(gate.authorize(None), Err(Rejection::SecretRequired));
    }

    #[test]
    fn unknown_secret_is_invalid() {
        let gate = AuthGate::new(vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(gate.len(), 2);
        assert_eq!(gate.authorize(Some(&json!("gamma"))), Err(Rejection::InvalidSecret));
        assert_eq!(gate.authorize(Some(&json!(""))), Err(Rejection::InvalidSecret));
    }

    #[test]
    fn non_string_secret_is_invalid() {
        let gate = AuthGate::new(vec!["5".to_string()]);
        assert_eq!(gate.authorize(Some(&json!(5))), Err(Rejection::InvalidSecret));
        assert_eq!(gate.authorize(Some(&json!(["5"]))), Err(Rejection::InvalidSecret));
    }

    #[test]
    fn known_secret_is_allowed() {
        let gate = AuthGate::new(vec!["alpha".to_string(), "beta".to_string()]);
        assert!(gate.authorize(Some(&json!("beta"))).is_ok());
    }
}
