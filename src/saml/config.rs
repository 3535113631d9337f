//! SAML SSO configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::session::DEFAULT_SWEEP_INTERVAL_SECS;

/// Upper bound for `token_ttl_secs` (one day).
pub const MAX_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Upper bound for `clock_skew_secs` (one hour).
pub const MAX_CLOCK_SKEW_SECS: i64 = 60 * 60;

/// SAML Service Provider and correlation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Enable SAML authentication.
    #[serde(default)]
    pub enabled: bool,

    /// SP Entity ID (unique identifier for this service provider).
    #[serde(default)]
    pub entity_id: String,

    /// Assertion Consumer Service URL (where IdP posts SAML response).
    #[serde(default)]
    pub acs_url: String,

    /// IdP SSO URL (HTTP-Redirect binding endpoint).
    #[serde(default)]
    pub idp_sso_url: Option<String>,

    /// IdP Entity ID, matched against the assertion issuer in strict mode.
    #[serde(default)]
    pub idp_entity_id: Option<String>,

    /// Allow unsigned responses and assertions (NOT recommended for production).
    #[serde(default)]
    pub allow_unsigned_assertions: bool,

    /// Clock skew tolerance in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    /// Query parameter carrying the correlation token.
    #[serde(default = "default_state_param")]
    pub state_param: String,

    /// Login URL the browser returns to after the callback.
    #[serde(default = "default_login_url")]
    pub login_url: String,

    /// Lifetime of a login attempt in seconds (default: 5 minutes).
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Sweep interval in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// DEFLATE the AuthnRequest before encoding.
    #[serde(default = "default_true")]
    pub compress_request: bool,

    /// Enforce audience and issuer checks.
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Attribute holding group membership.
    #[serde(default = "default_group_attribute")]
    pub group_attribute: String,

    /// NameID format to request (optional).
    /// e.g., "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress"
    #[serde(default)]
    pub name_id_format: Option<String>,
}

fn default_clock_skew() -> i64 {
    300 // 5 minutes
}

fn default_state_param() -> String {
    "state".to_string()
}

fn default_login_url() -> String {
    "/".to_string()
}

fn default_token_ttl() -> u64 {
    5 * 60 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

fn default_group_attribute() -> String {
    "groups".to_string()
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            entity_id: String::new(),
            acs_url: String::new(),
            idp_sso_url: None,
            idp_entity_id: None,
            allow_unsigned_assertions: false,
            clock_skew_secs: default_clock_skew(),
            state_param: default_state_param(),
            login_url: default_login_url(),
            token_ttl_secs: default_token_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            compress_request: true,
            strict: true,
            group_attribute: default_group_attribute(),
            name_id_format: None,
        }
    }
}

impl SamlConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        if self.entity_id.is_empty() {
            return Err("SAML entity_id is required".to_string());
        }

        if self.acs_url.is_empty() {
            return Err("SAML acs_url is required".to_string());
        }

        if self.idp_sso_url.as_deref().map_or(true, str::is_empty) {
            return Err("SAML idp_sso_url is required".to_string());
        }

        if self.strict && self.idp_entity_id.is_none() {
            return Err("SAML idp_entity_id is required in strict mode".to_string());
        }

        if self.state_param.is_empty() {
            return Err("SAML state_param must not be empty".to_string());
        }

        if self.token_ttl_secs == 0 {
            return Err("SAML token_ttl_secs must be positive".to_string());
        }

        if self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(format!(
                "SAML token_ttl_secs must not exceed {}",
                MAX_TOKEN_TTL_SECS
            ));
        }

        if !(0..=MAX_CLOCK_SKEW_SECS).contains(&self.clock_skew_secs) {
            return Err(format!(
                "SAML clock_skew_secs must be between 0 and {}",
                MAX_CLOCK_SKEW_SECS
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err("SAML sweep_interval_secs must be positive".to_string());
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Build the URL the browser re-polls with after the callback.
    pub fn return_location(&self, token: &str) -> String {
        let separator = if self.login_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            self.login_url,
            separator,
            urlencoding::encode(&self.state_param),
            urlencoding::encode(token)
        )
    }
}

/// JSON configuration for dynamic reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct SamlConfigJson {
    pub enabled: Option<bool>,
    pub entity_id: Option<String>,
    pub acs_url: Option<String>,
    pub idp_sso_url: Option<String>,
    pub idp_entity_id: Option<String>,
    #[serde(default)]
    pub allow_unsigned_assertions: bool,
    pub clock_skew_secs: Option<i64>,
    pub state_param: Option<String>,
    pub login_url: Option<String>,
    pub token_ttl_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub compress_request: Option<bool>,
    pub strict: Option<bool>,
    pub group_attribute: Option<String>,
    pub name_id_format: Option<String>,
}

impl SamlConfigJson {
    /// Merge JSON config into existing config.
    pub fn apply_to(&self, config: &mut SamlConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(ref entity_id) = self.entity_id {
            config.entity_id = entity_id.clone();
        }
        if let Some(ref acs_url) = self.acs_url {
            config.acs_url = acs_url.clone();
        }
        if let Some(ref url) = self.idp_sso_url {
            config.idp_sso_url = Some(url.clone());
        }
        if let Some(ref id) = self.idp_entity_id {
            config.idp_entity_id = Some(id.clone());
        }
        config.allow_unsigned_assertions = self.allow_unsigned_assertions;
        if let Some(skew) = self.clock_skew_secs {
            config.clock_skew_secs = skew;
        }
        if let Some(ref param) = self.state_param {
            config.state_param = param.clone();
        }
        if let Some(ref url) = self.login_url {
            config.login_url = url.clone();
        }
        if let Some(ttl) = self.token_ttl_secs {
            config.token_ttl_secs = ttl;
        }
        if let Some(interval) = self.sweep_interval_secs {
            config.sweep_interval_secs = interval;
        }
        if let Some(compress) = self.compress_request {
            config.compress_request = compress;
        }
        if let Some(strict) = self.strict {
            config.strict = strict;
        }
        if let Some(ref attr) = self.group_attribute {
            config.group_attribute = attr.clone();
        }
        if let Some(ref format) = self.name_id_format {
            config.name_id_format = Some(format.clone());
        }
    }
}
