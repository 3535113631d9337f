//! SAML authentication module.
//!
//! Provides SP-initiated SSO: AuthnRequest redirects out to the IdP and
//! validation of the IdP's ACS POST back.

pub mod config;
pub mod request;
pub mod response;

pub use config::{SamlConfig, SamlConfigJson};
pub use request::{RedirectRequest, RedirectRequestBuilder, SamlRedirectBuilder};
pub use response::{
    CallbackPayload, CallbackProcessor, ParsedAssertion, ParsedResponse, SamlResponseProcessor,
    ValidatedCallback,
};
