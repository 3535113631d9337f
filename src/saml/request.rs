//! SP-initiated AuthnRequest construction (HTTP-Redirect binding).

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use tracing::debug;

use super::config::SamlConfig;
use crate::session::StateToken;

/// A redirect target plus the token that will correlate the IdP callback.
#[derive(Debug, Clone)]
pub struct RedirectRequest {
    pub uri: String,
    pub token: StateToken,
}

/// Produces IdP redirect URIs.
///
/// Implementations must not touch the correlation store and must return a
/// fresh token on every call.
pub trait RedirectRequestBuilder: Send + Sync {
    fn create_request(&self) -> Result<RedirectRequest>;
}

/// Builds SAML 2.0 AuthnRequests for the HTTP-Redirect binding.
pub struct SamlRedirectBuilder {
    config: SamlConfig,
}

impl SamlRedirectBuilder {
    pub fn new(config: SamlConfig) -> Result<Self> {
        if config.enabled {
            config.validate().map_err(|e| anyhow!(e))?;
        }
        Ok(Self { config })
    }

    fn authn_request_xml(&self, idp_sso_url: &str) -> String {
        let request_id = format!("_id{}", uuid::Uuid::new_v4());
        let issue_instant = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let name_id_policy = self
            .config
            .name_id_format
            .as_ref()
            .map(|format| {
                format!(
                    r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                    xml_escape(format)
                )
            })
            .unwrap_or_default();

        format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"
                xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion"
                ID="{}"
                Version="2.0"
                IssueInstant="{}"
                Destination="{}"
                ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"
                AssertionConsumerServiceURL="{}">
                <saml:Issuer>{}</saml:Issuer>
                {}
            </samlp:AuthnRequest>"#,
            request_id,
            issue_instant,
            xml_escape(idp_sso_url),
            xml_escape(&self.config.acs_url),
            xml_escape(&self.config.entity_id),
            name_id_policy
        )
    }
}

impl RedirectRequestBuilder for SamlRedirectBuilder {
    fn create_request(&self) -> Result<RedirectRequest> {
        let idp_sso_url = self
            .config
            .idp_sso_url
            .as_ref()
            .ok_or_else(|| anyhow!("IdP SSO URL not configured"))?;

        let xml = self.authn_request_xml(idp_sso_url);
        let encoded = if self.config.compress_request {
            deflate_and_encode(&xml)?
        } else {
            BASE64.encode(xml.as_bytes())
        };

        let token = StateToken::generate();
        let separator = if idp_sso_url.contains('?') { '&' } else { '?' };
        let uri = format!(
            "{}{}SAMLRequest={}&RelayState={}",
            idp_sso_url,
            separator,
            urlencoding::encode(&encoded),
            urlencoding::encode(token.as_str())
        );

        debug!(token = %token.redacted(), "Created SAML AuthnRequest redirect");
        Ok(RedirectRequest { uri, token })
    }
}

/// Deflate and base64 encode for SAML redirect binding.
fn deflate_and_encode(xml: &str) -> Result<String> {
    use std::io::Write;

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
