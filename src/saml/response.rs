//! IdP callback (ACS POST) validation.
//!
//! The raw `samael` response is first flattened into a [`ParsedResponse`],
//! then checked against the SP policy. Only a fully checked response yields
//! an [`IdentityAssertion`].

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::config::SamlConfig;
use crate::error::{SsoError, SsoResult};
use crate::identity::IdentityAssertion;
use crate::session::StateToken;

const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Raw ACS POST contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPayload {
    /// Base64-encoded `SAMLResponse`.
    pub saml_response: String,
    /// `RelayState`, echoing the correlation token.
    pub relay_state: Option<String>,
}

impl CallbackPayload {
    /// Parse an `application/x-www-form-urlencoded` ACS body.
    pub fn from_form(body: &str) -> SsoResult<Self> {
        let mut saml_response: Option<String> = None;
        let mut relay_state: Option<String> = None;

        for pair in body.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                let decoded_value = decode_form_component(value)?;

                if key == "SAMLResponse" {
                    saml_response = Some(decoded_value);
                } else if key == "RelayState" {
                    relay_state = Some(decoded_value);
                }
            }
        }

        let saml_response = saml_response
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SsoError::InvalidAssertion("missing SAMLResponse".to_string()))?;

        Ok(Self {
            saml_response,
            relay_state,
        })
    }
}

/// Decode one `application/x-www-form-urlencoded` component (`+` is a space).
fn decode_form_component(value: &str) -> SsoResult<String> {
    urlencoding::decode(&value.replace('+', " "))
        .map(|s| s.into_owned())
        .map_err(|_| SsoError::InvalidAssertion("malformed form body".to_string()))
}

/// Result of a validated callback.
#[derive(Debug, Clone)]
pub struct ValidatedCallback {
    pub token: StateToken,
    pub assertion: IdentityAssertion,
}

/// Validates an inbound IdP callback.
///
/// Implementations never return unvalidated data; any failure is
/// [`SsoError::InvalidAssertion`] or [`SsoError::InvalidToken`].
pub trait CallbackProcessor: Send + Sync {
    fn validate(&self, payload: &CallbackPayload) -> SsoResult<ValidatedCallback>;
}

/// Flattened view of a SAML Response, independent of the XML schema types.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub status_code: Option<String>,
    pub status_message: Option<String>,
    pub destination: Option<String>,
    pub response_signed: bool,
    pub assertion: Option<ParsedAssertion>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedAssertion {
    pub id: String,
    pub issuer: Option<String>,
    pub signed: bool,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub audiences: Vec<String>,
    pub name_id: Option<String>,
    pub attributes: HashMap<String, Vec<String>>,
}

impl ParsedResponse {
    /// Decode and parse a base64 `SAMLResponse`.
    ///
    /// IdPs commonly wrap the payload in 76-column lines, so ASCII whitespace
    /// is ignored.
    pub fn from_base64(saml_response: &str) -> Result<Self> {
        let compact: String = saml_response
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let response_xml = BASE64
            .decode(compact)
            .context("Failed to decode SAML response")?;
        let response_str =
            String::from_utf8(response_xml).context("SAML response is not valid UTF-8")?;

        let response: samael::schema::Response = response_str
            .parse()
            .context("Failed to parse SAML response")?;

        Ok(Self::from_schema(&response))
    }

    fn from_schema(response: &samael::schema::Response) -> Self {
        let (status_code, status_message) = match response.status {
            Some(ref status) => (
                status.status_code.value.clone(),
                status
                    .status_message
                    .as_ref()
                    .and_then(|m| m.value.clone()),
            ),
            None => (None, None),
        };

        let assertion = response.assertion.as_ref().map(|assertion| {
            let (not_before, not_on_or_after, audiences) = match assertion.conditions {
                Some(ref conditions) => (
                    conditions.not_before,
                    conditions.not_on_or_after,
                    conditions
                        .audience_restrictions
                        .iter()
                        .flatten()
                        .flat_map(|r| r.audience.iter().cloned())
                        .collect(),
                ),
                None => (None, None, Vec::new()),
            };

            let name_id = assertion
                .subject
                .as_ref()
                .and_then(|s| s.name_id.as_ref())
                .map(|n| n.value.clone());

            let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
            for attr_statement in assertion.attribute_statements.iter().flatten() {
                for attr in &attr_statement.attributes {
                    let values: Vec<String> = attr
                        .values
                        .iter()
                        .filter_map(|v| v.value.clone())
                        .filter(|v| !v.is_empty())
                        .collect();
                    if values.is_empty() {
                        continue;
                    }
                    for key in [attr.name.as_ref(), attr.friendly_name.as_ref()]
                        .into_iter()
                        .flatten()
                    {
                        attributes.insert(key.clone(), values.clone());
                    }
                }
            }

            ParsedAssertion {
                id: assertion.id.clone(),
                issuer: assertion.issuer.value.clone(),
                signed: assertion.signature.is_some(),
                not_before,
                not_on_or_after,
                audiences,
                name_id,
                attributes,
            }
        });

        Self {
            status_code,
            status_message,
            destination: response.destination.clone(),
            response_signed: response.signature.is_some(),
            assertion,
        }
    }
}

/// SAML 2.0 callback processor with assertion replay tracking.
pub struct SamlResponseProcessor {
    config: SamlConfig,
    /// Assertion ID -> time after which it may be forgotten.
    seen_assertions: DashMap<String, DateTime<Utc>>,
}

impl SamlResponseProcessor {
    pub fn new(config: SamlConfig) -> Result<Self> {
        if config.enabled {
            config.validate().map_err(|e| anyhow!(e))?;
        }
        Ok(Self {
            config,
            seen_assertions: DashMap::new(),
        })
    }

    /// Apply SP policy to a parsed response and extract the identity.
    pub fn check(&self, response: ParsedResponse) -> Result<IdentityAssertion> {
        let config = &self.config;

        if response.status_code.as_deref() != Some(STATUS_SUCCESS) {
            let message = response
                .status_message
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(anyhow!("SAML authentication failed: {}", message));
        }

        let assertion = response
            .assertion
            .ok_or_else(|| anyhow!("SAML response contains no assertion"))?;

        if !config.allow_unsigned_assertions && !response.response_signed && !assertion.signed {
            return Err(anyhow!("SAML response is not signed"));
        }

        // Validate timestamps with clock skew tolerance
        let now = Utc::now();
        let skew = self.clock_skew()?;

        if let Some(not_before) = assertion.not_before {
            let earliest = not_before.checked_sub_signed(skew).unwrap_or(not_before);
            if now < earliest {
                return Err(anyhow!("SAML assertion not yet valid"));
            }
        }
        if let Some(not_on_or_after) = assertion.not_on_or_after {
            let latest = not_on_or_after
                .checked_add_signed(skew)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now >= latest {
                return Err(anyhow!("SAML assertion has expired"));
            }
        }

        if config.strict {
            if !assertion.audiences.iter().any(|a| a == &config.entity_id) {
                return Err(anyhow!("SAML assertion audience mismatch"));
            }

            if assertion.issuer != config.idp_entity_id {
                return Err(anyhow!("SAML assertion issuer mismatch"));
            }

            if let Some(ref destination) = response.destination {
                if destination != &config.acs_url {
                    return Err(anyhow!("SAML response destination mismatch"));
                }
            }
        }

        let user_id = assertion
            .name_id
            .ok_or_else(|| anyhow!("SAML assertion missing NameID"))?;

        let identity = IdentityAssertion::new(user_id, assertion.attributes)
            .map_err(|e| anyhow!("{}", e))?;

        // Record the assertion ID last so a rejected response can be retried
        self.record_assertion(&assertion.id, assertion.not_on_or_after, now)?;

        info!(
            user_id = %identity.username(),
            attributes = identity.attributes().len(),
            "SAML assertion validated"
        );

        Ok(identity)
    }

    fn clock_skew(&self) -> Result<Duration> {
        let secs = self.config.clock_skew_secs;
        if secs < 0 {
            return Err(anyhow!("SAML clock_skew_secs must not be negative"));
        }
        Duration::try_seconds(secs).ok_or_else(|| anyhow!("SAML clock_skew_secs out of range"))
    }

    fn record_assertion(
        &self,
        assertion_id: &str,
        not_on_or_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if assertion_id.is_empty() {
            return Err(anyhow!("SAML assertion missing ID"));
        }

        self.seen_assertions.retain(|_, forget_at| *forget_at > now);

        let skew = self.clock_skew()?;
        let horizon = i64::try_from(self.config.token_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .and_then(|t| t.checked_add_signed(skew))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let forget_at = not_on_or_after
            .and_then(|t| t.checked_add_signed(skew))
            .map_or(horizon, |t| t.max(horizon));

        match self.seen_assertions.entry(assertion_id.to_string()) {
            Entry::Occupied(_) => Err(anyhow!("SAML assertion replay detected")),
            Entry::Vacant(slot) => {
                slot.insert(forget_at);
                Ok(())
            }
        }
    }
}

impl CallbackProcessor for SamlResponseProcessor {
    fn validate(&self, payload: &CallbackPayload) -> SsoResult<ValidatedCallback> {
        let token = payload
            .relay_state
            .as_deref()
            .and_then(StateToken::parse)
            .ok_or_else(|| {
                debug!("SAML callback without a usable RelayState");
                SsoError::InvalidToken
            })?;

        let assertion = ParsedResponse::from_base64(&payload.saml_response)
            .and_then(|parsed| self.check(parsed))
            .map_err(|e| {
                let reason = format!("{:#}", e);
                warn!(token = %token.redacted(), error = %reason, "SAML assertion validation failed");
                SsoError::InvalidAssertion(reason)
            })?;

        Ok(ValidatedCallback { token, assertion })
    }
}
