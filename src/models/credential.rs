//! Bearer credentials and account identities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CopyError;

const MIN_TOKEN_LEN: usize = 8;
const MAX_TOKEN_LEN: usize = 128;
const VISIBLE_PREFIX: usize = 4;

/// Which side of the replication an account sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Follower => "follower",
        }
    }

    /// Scopes an authorize response must grant before the session is usable.
    ///
    /// A master only observes; a follower executes orders.
    pub fn required_scopes(&self) -> &'static [&'static str] {
        match self {
            Role::Master => &["read"],
            Role::Follower => &["read", "trade"],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of an account within a copying session.
///
/// Follower identities key the idempotency set, so they must not change
/// between restarts of the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn master() -> Self {
        Self("master".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque bearer token.
///
/// The raw value is only reachable through [`Credential::expose`]; `Debug`
/// and `Display` print the redacted prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    /// Validate a raw token against the accepted format.
    pub fn parse(raw: &str) -> Result<Self, CopyError> {
        let token = raw.trim();

        if token.is_empty() {
            return Err(CopyError::Validation("credential is missing".to_string()));
        }

        if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token.len()) {
            return Err(CopyError::Validation(format!(
                "credential length must be between {} and {} characters",
                MIN_TOKEN_LEN, MAX_TOKEN_LEN
            )));
        }

        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CopyError::Validation(
                "credential contains unsupported characters".to_string(),
            ));
        }

        Ok(Self {
            token: token.to_string(),
        })
    }

    /// Raw token, for protocol adapters building an authorize request.
    pub fn expose(&self) -> &str {
        &self.token
    }

    /// Short non-identifying prefix safe for logs.
    pub fn redacted(&self) -> String {
        format!("{}***", &self.token[..VISIBLE_PREFIX])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_token_formats() {
        assert!(Credential::parse("a1-f7pnteezo4jzhpxclctizt27hyeot").is_ok());
        assert!(Credential::parse("  AbCdEfGh12345  ").is_ok());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(Credential::parse(""), Err(CopyError::Validation(_))));
        assert!(matches!(Credential::parse("short"), Err(CopyError::Validation(_))));
        assert!(matches!(
            Credential::parse("has spaces inside it"),
            Err(CopyError::Validation(_))
        ));
        assert!(Credential::parse(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_never_prints_raw_token() {
        let cred = Credential::parse("secretTOKEN12345").unwrap();
        assert_eq!(cred.redacted(), "secr***");
        assert!(!format!("{:?}", cred).contains("TOKEN12345"));
        assert!(!cred.to_string().contains("TOKEN12345"));
    }

    #[test]
    fn test_required_scopes() {
        assert_eq!(Role::Master.required_scopes(), &["read"]);
        assert!(Role::Follower.required_scopes().contains(&"trade"));
    }
}
