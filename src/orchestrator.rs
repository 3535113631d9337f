//! Login orchestration across the IdP redirect round-trip.
//!
//! A login attempt moves through three observable states, keyed by the
//! correlation token carried on the request:
//! - no token: issue a redirect and register a pending entry
//! - token pending, unknown or expired: issue a fresh redirect
//! - token asserted: consume the assertion and return the identity

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SsoError, SsoResult};
use crate::identity::{AuthenticatedIdentity, Credentials};
use crate::saml::{
    CallbackPayload, CallbackProcessor, RedirectRequestBuilder, SamlConfig, SamlRedirectBuilder,
    SamlResponseProcessor,
};
use crate::session::{CorrelationStore, StateToken};

/// Name of the redirect field in the "additional input required" response.
pub const REDIRECT_FIELD: &str = "samlRedirect";

/// Translation key shown while the browser is sent to the IdP.
pub const REDIRECT_MESSAGE_KEY: &str = "LOGIN.INFO_SAML_REDIRECT_PENDING";

/// Instruction for the host to send the browser to the IdP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectInstruction {
    pub field: String,
    pub uri: String,
    pub message_key: String,
}

impl RedirectInstruction {
    pub fn new(uri: String) -> Self {
        Self {
            field: REDIRECT_FIELD.to_string(),
            uri,
            message_key: REDIRECT_MESSAGE_KEY.to_string(),
        }
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated(AuthenticatedIdentity),
    RedirectRequired(RedirectInstruction),
}

/// Result of a successfully processed IdP callback.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub token: StateToken,
    pub username: String,
    /// Where to send the browser so it re-polls the login with the token.
    pub location: String,
}

/// Public entry point for SAML SSO logins.
pub struct AuthenticationOrchestrator {
    config: SamlConfig,
    store: Arc<CorrelationStore>,
    redirects: Arc<dyn RedirectRequestBuilder>,
    callbacks: Arc<dyn CallbackProcessor>,
}

impl AuthenticationOrchestrator {
    /// Wire an orchestrator from explicit collaborators.
    pub fn new(
        config: SamlConfig,
        store: Arc<CorrelationStore>,
        redirects: Arc<dyn RedirectRequestBuilder>,
        callbacks: Arc<dyn CallbackProcessor>,
    ) -> Self {
        Self {
            config,
            store,
            redirects,
            callbacks,
        }
    }

    /// Build the SAML collaborators and a fresh store from configuration.
    pub fn from_config(config: SamlConfig) -> SsoResult<Self> {
        config.validate().map_err(SsoError::Config)?;

        let redirects = SamlRedirectBuilder::new(config.clone())?;
        let callbacks = SamlResponseProcessor::new(config.clone())?;
        let store = Arc::new(CorrelationStore::new(config.token_ttl()));

        Ok(Self::new(
            config,
            store,
            Arc::new(redirects),
            Arc::new(callbacks),
        ))
    }

    /// Start the background sweep at the configured interval.
    pub fn start_sweeper(&self) -> SsoResult<()> {
        self.store.start_sweeper(self.config.sweep_interval())
    }

    pub fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    pub fn config(&self) -> &SamlConfig {
        &self.config
    }

    /// Authenticate a login request.
    ///
    /// Returns the identity once the IdP has asserted it for the token the
    /// request carries, otherwise a redirect to the IdP with a new token.
    pub fn authenticate(&self, credentials: Credentials) -> SsoResult<AuthOutcome> {
        let raw = match credentials.correlation_token(&self.config.state_param) {
            Some(raw) => raw,
            None => return self.redirect(),
        };

        let token = match StateToken::parse(raw) {
            Some(token) => token,
            None => {
                debug!("Malformed correlation token on login request, starting over");
                return self.redirect();
            }
        };

        match self.store.consume(&token) {
            Some(assertion) => {
                let identity = AuthenticatedIdentity::from_assertion(
                    assertion,
                    credentials,
                    Some(self.config.group_attribute.as_str()),
                );
                info!(
                    username = %identity.username,
                    remote_address = ?identity.credentials.remote_address,
                    "SAML authentication successful"
                );
                Ok(AuthOutcome::Authenticated(identity))
            }
            None => {
                debug!(
                    token = %token.redacted(),
                    pending = self.store.is_pending(&token),
                    "No assertion for correlation token, issuing fresh redirect"
                );
                self.redirect()
            }
        }
    }

    fn redirect(&self) -> SsoResult<AuthOutcome> {
        let request = self.redirects.create_request()?;

        if request.uri.is_empty() {
            return Err(SsoError::Collaborator(anyhow::anyhow!(
                "redirect builder returned an empty URI"
            )));
        }

        self.store.register(&request.token)?;

        info!(token = %request.token.redacted(), "Redirecting to SAML IdP");
        Ok(AuthOutcome::RedirectRequired(RedirectInstruction::new(
            request.uri,
        )))
    }

    /// Process an IdP callback.
    ///
    /// The store is only touched after the payload validates.
    pub fn handle_callback(&self, payload: &CallbackPayload) -> SsoResult<CallbackOutcome> {
        let validated = self.callbacks.validate(payload)?;
        let username = validated.assertion.username().to_string();

        if let Err(e) = self.store.complete(&validated.token, validated.assertion) {
            if !e.is_benign() {
                warn!(
                    token = %validated.token.redacted(),
                    reason = e.reason_code(),
                    "SAML callback rejected"
                );
            }
            return Err(e);
        }

        let location = self.config.return_location(validated.token.as_str());
        Ok(CallbackOutcome {
            token: validated.token,
            username,
            location,
        })
    }

    /// Process a form-encoded ACS POST body.
    pub fn handle_callback_form(&self, body: &str) -> SsoResult<CallbackOutcome> {
        let payload = CallbackPayload::from_form(body)?;
        self.handle_callback(&payload)
    }

    /// Teardown hook. Safe to call repeatedly, and before any login.
    pub fn shutdown(&self) {
        self.store.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityAssertion;
    use crate::saml::{RedirectRequest, ValidatedCallback};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Issues a fresh token per call and counts calls.
    #[derive(Default)]
    struct MockRedirects {
        calls: AtomicUsize,
    }

    impl RedirectRequestBuilder for MockRedirects {
        fn create_request(&self) -> anyhow::Result<RedirectRequest> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let token = StateToken::generate();
            Ok(RedirectRequest {
                uri: format!("https://idp.example.com/sso?RelayState={}", token),
                token,
            })
        }
    }

    /// Always hands out the same token.
    struct FixedRedirects(StateToken);

    impl RedirectRequestBuilder for FixedRedirects {
        fn create_request(&self) -> anyhow::Result<RedirectRequest> {
            Ok(RedirectRequest {
                uri: "https://idp.example.com/sso".to_string(),
                token: self.0.clone(),
            })
        }
    }

    struct UnreachableIdp;

    impl RedirectRequestBuilder for UnreachableIdp {
        fn create_request(&self) -> anyhow::Result<RedirectRequest> {
            Err(anyhow::anyhow!("IdP metadata unavailable"))
        }
    }

    /// Treats the SAMLResponse as the username; "forged" fails validation.
    struct MockCallbacks;

    impl CallbackProcessor for MockCallbacks {
        fn validate(&self, payload: &CallbackPayload) -> SsoResult<ValidatedCallback> {
            if payload.saml_response == "forged" {
                return Err(SsoError::InvalidAssertion("bad signature".to_string()));
            }
            let token = payload
                .relay_state
                .as_deref()
                .and_then(StateToken::parse)
                .ok_or(SsoError::InvalidToken)?;
            let mut attributes = HashMap::new();
            attributes.insert("groups".to_string(), vec!["admins".to_string()]);
            Ok(ValidatedCallback {
                token,
                assertion: IdentityAssertion::new(payload.saml_response.clone(), attributes)?,
            })
        }
    }

    fn test_config() -> SamlConfig {
        SamlConfig {
            login_url: "https://app.example.com/".to_string(),
            ..Default::default()
        }
    }

    fn orchestrator_with(redirects: Arc<dyn RedirectRequestBuilder>) -> AuthenticationOrchestrator {
        AuthenticationOrchestrator::new(
            test_config(),
            Arc::new(CorrelationStore::new(Duration::from_secs(300))),
            redirects,
            Arc::new(MockCallbacks),
        )
    }

    fn orchestrator() -> AuthenticationOrchestrator {
        orchestrator_with(Arc::new(MockRedirects::default()))
    }

    fn callback(token: &StateToken, username: &str) -> CallbackPayload {
        CallbackPayload {
            saml_response: username.to_string(),
            relay_state: Some(token.to_string()),
        }
    }

    fn login_with(token: &StateToken) -> Credentials {
        Credentials::new().with_parameter("state", token.as_str())
    }

    fn expect_redirect(outcome: AuthOutcome) -> RedirectInstruction {
        match outcome {
            AuthOutcome::RedirectRequired(instruction) => instruction,
            AuthOutcome::Authenticated(identity) => {
                panic!("expected redirect, got identity {}", identity.username)
            }
        }
    }

    fn token_from(instruction: &RedirectInstruction) -> StateToken {
        let raw = instruction.uri.rsplit("RelayState=").next().unwrap();
        StateToken::parse(raw).unwrap()
    }

    #[test]
    fn test_no_token_redirects_and_registers_pending() {
        let orchestrator = orchestrator();

        let instruction = expect_redirect(orchestrator.authenticate(Credentials::new()).unwrap());
        assert!(!instruction.uri.is_empty());
        assert_eq!(instruction.field, REDIRECT_FIELD);
        assert_eq!(instruction.message_key, REDIRECT_MESSAGE_KEY);

        let token = token_from(&instruction);
        assert_eq!(orchestrator.store().len(), 1);
        assert!(orchestrator.store().is_pending(&token));
    }

    #[test]
    fn test_callback_then_login_returns_identity_once() {
        let orchestrator = orchestrator();
        let instruction = expect_redirect(orchestrator.authenticate(Credentials::new()).unwrap());
        let token = token_from(&instruction);

        let outcome = orchestrator.handle_callback(&callback(&token, "alice")).unwrap();
        assert_eq!(outcome.username, "alice");
        assert_eq!(
            outcome.location,
            format!("https://app.example.com/?state={}", token)
        );
        assert!(!orchestrator.store().is_pending(&token));

        let identity = match orchestrator.authenticate(login_with(&token)).unwrap() {
            AuthOutcome::Authenticated(identity) => identity,
            AuthOutcome::RedirectRequired(_) => panic!("expected identity"),
        };
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.credentials.username.as_deref(), Some("alice"));
        assert_eq!(identity.groups, vec!["admins".to_string()]);
        assert!(identity.issued_by_sso);
        assert!(!orchestrator.store().contains(&token));

        // Replaying the same token starts over.
        expect_redirect(orchestrator.authenticate(login_with(&token)).unwrap());
    }

    #[test]
    fn test_unknown_token_gets_fresh_redirect() {
        let redirects = Arc::new(MockRedirects::default());
        let orchestrator = orchestrator_with(redirects.clone());
        let stale = StateToken::generate();

        let instruction = expect_redirect(orchestrator.authenticate(login_with(&stale)).unwrap());
        let fresh = token_from(&instruction);
        assert_ne!(fresh, stale);
        assert!(orchestrator.store().is_pending(&fresh));
        assert!(!orchestrator.store().contains(&stale));
        assert_eq!(redirects.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_token_gets_fresh_redirect() {
        let orchestrator = orchestrator();
        let credentials = Credentials::new().with_parameter("state", "not a token!");
        expect_redirect(orchestrator.authenticate(credentials).unwrap());
        assert_eq!(orchestrator.store().len(), 1);
    }

    #[test]
    fn test_pending_token_gets_fresh_redirect() {
        let orchestrator = orchestrator();
        let first = token_from(&expect_redirect(
            orchestrator.authenticate(Credentials::new()).unwrap(),
        ));

        let second = token_from(&expect_redirect(
            orchestrator.authenticate(login_with(&first)).unwrap(),
        ));
        assert_ne!(first, second);
        assert!(orchestrator.store().is_pending(&first));
        assert!(orchestrator.store().is_pending(&second));
    }

    #[test]
    fn test_duplicate_callback_rejected() {
        let orchestrator = orchestrator();
        let token = token_from(&expect_redirect(
            orchestrator.authenticate(Credentials::new()).unwrap(),
        ));

        orchestrator.handle_callback(&callback(&token, "alice")).unwrap();
        let result = orchestrator.handle_callback(&callback(&token, "mallory"));
        assert!(matches!(result, Err(SsoError::AlreadyAsserted)));

        match orchestrator.authenticate(login_with(&token)).unwrap() {
            AuthOutcome::Authenticated(identity) => assert_eq!(identity.username, "alice"),
            AuthOutcome::RedirectRequired(_) => panic!("original assertion should survive"),
        }
        expect_redirect(orchestrator.authenticate(login_with(&token)).unwrap());
    }

    #[test]
    fn test_invalid_callback_leaves_store_untouched() {
        let orchestrator = orchestrator();
        let token = token_from(&expect_redirect(
            orchestrator.authenticate(Credentials::new()).unwrap(),
        ));

        let result = orchestrator.handle_callback(&callback(&token, "forged"));
        assert!(matches!(result, Err(SsoError::InvalidAssertion(_))));
        assert!(orchestrator.store().is_pending(&token));
        assert_eq!(orchestrator.store().len(), 1);
    }

    #[test]
    fn test_callback_for_unknown_token() {
        let orchestrator = orchestrator();
        let result = orchestrator.handle_callback(&callback(&StateToken::generate(), "alice"));
        assert!(matches!(result, Err(SsoError::UnknownToken)));
        assert!(orchestrator.store().is_empty());
    }

    #[test]
    fn test_callback_form() {
        let orchestrator = orchestrator();
        let token = token_from(&expect_redirect(
            orchestrator.authenticate(Credentials::new()).unwrap(),
        ));

        let body = format!("SAMLResponse=alice&RelayState={}", token);
        let outcome = orchestrator.handle_callback_form(&body).unwrap();
        assert_eq!(outcome.token, token);

        assert!(orchestrator.handle_callback_form("RelayState=abc").is_err());
    }

    #[test]
    fn test_collaborator_failure_is_fatal() {
        let orchestrator = orchestrator_with(Arc::new(UnreachableIdp));
        let result = orchestrator.authenticate(Credentials::new());
        assert!(matches!(result, Err(SsoError::Collaborator(_))));
        assert!(orchestrator.store().is_empty());
    }

    #[test]
    fn test_token_collision_surfaces_error() {
        let orchestrator = orchestrator_with(Arc::new(FixedRedirects(StateToken::generate())));
        expect_redirect(orchestrator.authenticate(Credentials::new()).unwrap());

        let result = orchestrator.authenticate(Credentials::new());
        assert!(matches!(result, Err(SsoError::DuplicateToken)));
        assert_eq!(orchestrator.store().len(), 1);
    }

    #[test]
    fn test_shutdown_twice_without_logins() {
        let orchestrator = orchestrator();
        orchestrator.shutdown();
        orchestrator.shutdown();
        assert!(orchestrator.store().is_shut_down());
        assert!(!orchestrator.store().is_sweeping());
    }

    #[test]
    fn test_from_config_validates() {
        let config = SamlConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            AuthenticationOrchestrator::from_config(config),
            Err(SsoError::Config(_))
        ));

        let config = SamlConfig {
            enabled: true,
            entity_id: "https://sp.example.com".to_string(),
            acs_url: "https://sp.example.com/saml/acs".to_string(),
            idp_sso_url: Some("https://idp.example.com/sso".to_string()),
            idp_entity_id: Some("https://idp.example.com".to_string()),
            token_ttl_secs: 120,
            ..Default::default()
        };
        let orchestrator = AuthenticationOrchestrator::from_config(config).unwrap();
        assert_eq!(orchestrator.store().ttl(), Duration::from_secs(120));

        let instruction = expect_redirect(orchestrator.authenticate(Credentials::new()).unwrap());
        assert!(instruction.uri.starts_with("https://idp.example.com/sso?SAMLRequest="));
        assert_eq!(orchestrator.store().pending_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_logins_and_callbacks() {
        let orchestrator = Arc::new(orchestrator());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let orchestrator = Arc::clone(&orchestrator);
            tasks.push(tokio::spawn(async move {
                let username = format!("user{}", i);
                let token = token_from(&expect_redirect(
                    orchestrator.authenticate(Credentials::new()).unwrap(),
                ));
                orchestrator
                    .handle_callback(&callback(&token, &username))
                    .unwrap();
                match orchestrator.authenticate(login_with(&token)).unwrap() {
                    AuthOutcome::Authenticated(identity) => identity.username == username,
                    AuthOutcome::RedirectRequired(_) => false,
                }
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert!(orchestrator.store().is_empty());

        orchestrator.start_sweeper().unwrap();
        assert!(orchestrator.store().is_sweeping());
        orchestrator.shutdown();
        assert!(!orchestrator.store().is_sweeping());
    }
}
