//! Identity types produced by SAML SSO.
//!
//! An [`IdentityAssertion`] is what a validated IdP callback yields. Once the
//! orchestrator consumes it, it is bound to the caller's [`Credentials`] and
//! becomes an [`AuthenticatedIdentity`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{SsoError, SsoResult};

/// Prefix applied to every attribute-derived injection token.
pub const TOKEN_PREFIX: &str = "SAML_";

/// Identity asserted by the IdP for one login attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAssertion {
    username: String,
    attributes: HashMap<String, Vec<String>>,
}

impl IdentityAssertion {
    /// Build an assertion. The username must be non-empty.
    pub fn new(
        username: impl Into<String>,
        attributes: HashMap<String, Vec<String>>,
    ) -> SsoResult<Self> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(SsoError::InvalidAssertion(
                "asserted username is empty".to_string(),
            ));
        }
        Ok(Self {
            username,
            attributes,
        })
    }

    /// Verified principal identifier.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// All asserted attributes.
    pub fn attributes(&self) -> &HashMap<String, Vec<String>> {
        &self.attributes
    }

    /// First value of an attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    /// All values of an attribute (empty if absent).
    pub fn attribute_values(&self, name: &str) -> &[String] {
        self.attributes
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn into_parts(self) -> (String, HashMap<String, Vec<String>>) {
        (self.username, self.attributes)
    }
}

/// Request context handed to the orchestrator by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Username, back-filled from the assertion on success.
    pub username: Option<String>,

    /// Query/form parameters of the login request.
    pub parameters: HashMap<String, String>,

    /// Client address, for logging.
    pub remote_address: Option<String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Read the correlation token carried under `param`, if any.
    pub fn correlation_token(&self, param: &str) -> Option<&str> {
        self.parameters
            .get(param)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Identity returned from a successful `authenticate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    pub username: String,
    pub attributes: HashMap<String, Vec<String>>,
    /// Values of the configured group attribute.
    pub groups: Vec<String>,
    /// Set when the identity came from the SAML flow; token injection keys off it.
    pub issued_by_sso: bool,
    pub credentials: Credentials,
}

impl AuthenticatedIdentity {
    /// Bind an assertion onto the caller's credentials.
    pub fn from_assertion(
        assertion: IdentityAssertion,
        mut credentials: Credentials,
        group_attribute: Option<&str>,
    ) -> Self {
        let (username, attributes) = assertion.into_parts();
        credentials.username = Some(username.clone());

        let groups = group_attribute
            .and_then(|name| attributes.get(name))
            .cloned()
            .unwrap_or_default();

        Self {
            username,
            attributes,
            groups,
            issued_by_sso: true,
            credentials,
        }
    }

    /// Parameter tokens to inject into downstream connection configuration.
    ///
    /// Only SSO-issued identities contribute tokens. Multi-valued attributes
    /// contribute their first value.
    pub fn injection_tokens(&self) -> HashMap<String, String> {
        if !self.issued_by_sso {
            return HashMap::new();
        }

        self.attributes
            .iter()
            .filter_map(|(name, values)| {
                values
                    .first()
                    .map(|v| (format!("{}{}", TOKEN_PREFIX, canonical_token_name(name)), v.clone()))
            })
            .collect()
    }
}

/// Convert an attribute name into an upper snake case token name.
///
/// `emailAddress` becomes `EMAIL_ADDRESS`, `urn:oid:1.2` becomes `URN_OID_1_2`.
pub fn canonical_token_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_uppercase());
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            out.push('_');
            prev_lower = false;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_empty_username_rejected() {
        assert!(IdentityAssertion::new("", HashMap::new()).is_err());
        assert!(IdentityAssertion::new("   ", HashMap::new()).is_err());
        assert!(IdentityAssertion::new("alice", HashMap::new()).is_ok());
    }

    #[test]
    fn test_attribute_access() {
        let assertion = IdentityAssertion::new(
            "alice",
            attrs(&[("email", &["alice@example.com"]), ("groups", &["admin", "ops"])]),
        )
        .unwrap();

        assert_eq!(assertion.attribute("email"), Some("alice@example.com"));
        assert_eq!(assertion.attribute("groups"), Some("admin"));
        assert_eq!(assertion.attribute_values("groups").len(), 2);
        assert!(assertion.attribute_values("missing").is_empty());
    }

    #[test]
    fn test_bind_onto_credentials() {
        let assertion = IdentityAssertion::new(
            "alice",
            attrs(&[("groups", &["admin", "ops"])]),
        )
        .unwrap();
        let credentials = Credentials::new().with_parameter("state", "abc");

        let identity = AuthenticatedIdentity::from_assertion(assertion, credentials, Some("groups"));
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.credentials.username.as_deref(), Some("alice"));
        assert_eq!(identity.groups, vec!["admin".to_string(), "ops".to_string()]);
        assert!(identity.issued_by_sso);
    }

    #[test]
    fn test_canonical_token_name() {
        assert_eq!(canonical_token_name("email"), "EMAIL");
        assert_eq!(canonical_token_name("emailAddress"), "EMAIL_ADDRESS");
        assert_eq!(canonical_token_name("urn:oid:1.2"), "URN_OID_1_2");
        assert_eq!(canonical_token_name("given-name"), "GIVEN_NAME");
    }

    #[test]
    fn test_injection_tokens_only_for_sso() {
        let assertion = IdentityAssertion::new(
            "alice",
            attrs(&[("displayName", &["Alice A."]), ("empty", &[])]),
        )
        .unwrap();
        let mut identity =
            AuthenticatedIdentity::from_assertion(assertion, Credentials::new(), None);

        let tokens = identity.injection_tokens();
        assert_eq!(tokens.get("SAML_DISPLAY_NAME").map(|s| s.as_str()), Some("Alice A."));
        assert!(!tokens.contains_key("SAML_EMPTY"));

        identity.issued_by_sso = false;
        assert!(identity.injection_tokens().is_empty());
    }

    #[test]
    fn test_correlation_token_lookup() {
        let creds = Credentials::new().with_parameter("state", "");
        assert_eq!(creds.correlation_token("state"), None);

        let creds = Credentials::new().with_parameter("state", "abc123");
        assert_eq!(creds.correlation_token("state"), Some("abc123"));
        assert_eq!(creds.correlation_token("other"), None);
    }
}
