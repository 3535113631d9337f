//! Zentinel SAML SSO correlation
//!
//! Redirect-based single sign-on for Zentinel agents. A login attempt is handed
//! to the SAML IdP with a fresh correlation token; the IdP's callback is
//! validated and parked under that token; the browser's next login request
//! carrying the token consumes the asserted identity exactly once.
//!
//! ```text
//! login (no token) ──► AuthenticationOrchestrator ──► RedirectRequired(uri)
//!                                  │ register(token)
//!                                  ▼
//! IdP POST /saml/acs ──► CallbackProcessor ──► CorrelationStore::complete
//!                                  │
//! login (?state=token) ──► consume(token) ──► Authenticated(identity)
//! ```

pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod saml;
pub mod session;

pub use error::{SsoError, SsoResult};
pub use identity::{AuthenticatedIdentity, Credentials, IdentityAssertion};
pub use orchestrator::{AuthOutcome, AuthenticationOrchestrator, CallbackOutcome, RedirectInstruction};
pub use saml::{
    CallbackPayload, CallbackProcessor, RedirectRequest, RedirectRequestBuilder, SamlConfig,
    SamlConfigJson, SamlRedirectBuilder, SamlResponseProcessor, ValidatedCallback,
};
pub use session::{CorrelationStore, StateToken};
