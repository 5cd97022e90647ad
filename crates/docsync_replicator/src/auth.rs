//! Authorizers for cookie-based login.
//!
//! A replication whose authorizer uses cookie login checks the remote's
//! `_session` endpoint and, if nobody is logged in, POSTs login parameters
//! to the authorizer's login path.
//!
//! Credentials are registered once, when a replication is created from a
//! URL carrying them as query parameters, in a [`CredentialRegistry`] that
//! outlives individual sessions.
//!
//! ## Identity assertions
//!
//! An assertion is a `.`-separated string with at least four components.
//! Component 1 is unpadded base64 JSON holding `principal.email`, and
//! component 3 is unpadded base64 JSON holding `aud` (the audience origin)
//! and `exp` (expiry, Unix milliseconds).

use crate::error::{ReplicationError, ReplicationResult};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use docsync_protocol::RemoteUrl;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Query parameter carrying an identity assertion.
pub const ASSERTION_QUERY_PARAMETER: &str = "personaAssertion";
/// Query parameter carrying an access token.
pub const ACCESS_TOKEN_QUERY_PARAMETER: &str = "facebookAccessToken";
/// Query parameter carrying the email an access token belongs to.
pub const EMAIL_QUERY_PARAMETER: &str = "email";

/// Login capability of a replication.
pub trait Authorizer: Send + Sync {
    /// Whether a session check and login step precede replication.
    fn uses_cookie_login(&self) -> bool;

    /// Path the login parameters are POSTed to, relative to the remote.
    fn login_path(&self, site: &RemoteUrl) -> String;

    /// Login request body, or `None` if no usable credential is available.
    fn login_parameters(&self, site: &RemoteUrl) -> Option<Map<String, Value>>;
}

/// The fields of an identity assertion the replicator cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAssertion {
    /// Asserted email address.
    pub email: String,
    /// Lowercased audience origin.
    pub origin: String,
    /// Expiry time.
    pub expires_at: SystemTime,
}

impl ParsedAssertion {
    /// Returns true if the assertion expired before `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at < now
    }
}

fn decode_component(component: &str) -> ReplicationResult<Value> {
    let trimmed = component.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| ReplicationError::AuthenticationFailed(format!("invalid assertion encoding: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn malformed(what: &str) -> ReplicationError {
    ReplicationError::AuthenticationFailed(format!("invalid assertion: {what}"))
}

/// Parses an identity assertion.
pub fn parse_assertion(assertion: &str) -> ReplicationResult<ParsedAssertion> {
    let components: Vec<&str> = assertion.split('.').collect();
    if components.len() < 4 {
        return Err(malformed(&format!(
            "only {} components, expected 4 or more",
            components.len()
        )));
    }

    let identity = decode_component(components[1])?;
    let email = identity
        .pointer("/principal/email")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing principal email"))?
        .to_string();

    let claims = decode_component(components[3])?;
    let audience = claims
        .get("aud")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing audience"))?;
    let origin = RemoteUrl::parse(audience)
        .map_err(|_| malformed("audience is not a URL"))?
        .origin();
    let exp = claims
        .get("exp")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing expiry"))?;

    Ok(ParsedAssertion {
        email,
        origin,
        expires_at: UNIX_EPOCH + Duration::from_millis(exp),
    })
}

fn key(email: &str, site: &str) -> String {
    format!("{email}:{site}")
}

/// Registered credentials, keyed by email and site.
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    assertions: RwLock<HashMap<String, String>>,
    access_tokens: RwLock<HashMap<String, String>>,
}

impl CredentialRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an assertion under the email and audience it names.
    /// Returns the email.
    pub fn register_assertion(&self, assertion: &str) -> ReplicationResult<String> {
        let parsed = parse_assertion(assertion)?;
        debug!(email = %parsed.email, origin = %parsed.origin, "registering assertion");
        self.assertions
            .write()
            .insert(key(&parsed.email, &parsed.origin), assertion.to_string());
        Ok(parsed.email)
    }

    /// Assertion registered for `email` at `site`'s origin.
    pub fn assertion_for(&self, email: &str, site: &RemoteUrl) -> Option<String> {
        self.assertions.read().get(&key(email, &site.origin())).cloned()
    }

    /// Registers an access token for `email` at `site`.
    pub fn register_access_token(&self, token: &str, email: &str, site: &RemoteUrl) {
        debug!(email, site = %site, "registering access token");
        self.access_tokens
            .write()
            .insert(key(email, site.as_str()), token.to_string());
    }

    /// Access token registered for `email` at `site`.
    pub fn access_token_for(&self, email: &str, site: &RemoteUrl) -> Option<String> {
        self.access_tokens.read().get(&key(email, site.as_str())).cloned()
    }
}

/// Logs in by exchanging a registered identity assertion.
pub struct AssertionAuthorizer {
    email: String,
    registry: Arc<CredentialRegistry>,
    skip_expiration_check: bool,
}

impl AssertionAuthorizer {
    /// Creates an authorizer for `email`.
    pub fn new(email: impl Into<String>, registry: Arc<CredentialRegistry>) -> Self {
        Self {
            email: email.into(),
            registry,
            skip_expiration_check: false,
        }
    }

    /// Accepts expired assertions. Useful against test servers.
    pub fn with_skip_expiration_check(mut self, skip: bool) -> Self {
        self.skip_expiration_check = skip;
        self
    }

    /// The email this authorizer logs in as.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// The registered, unexpired assertion for `site`.
    pub fn assertion_for_site(&self, site: &RemoteUrl) -> Option<String> {
        let Some(assertion) = self.registry.assertion_for(&self.email, site) else {
            warn!(email = %self.email, site = %site, "no assertion registered");
            return None;
        };
        if self.skip_expiration_check {
            return Some(assertion);
        }
        match parse_assertion(&assertion) {
            Ok(parsed) if !parsed.is_expired_at(SystemTime::now()) => Some(assertion),
            Ok(_) => {
                warn!(email = %self.email, "assertion expired");
                None
            }
            Err(err) => {
                warn!(error = %err, "registered assertion no longer parses");
                None
            }
        }
    }
}

impl Authorizer for AssertionAuthorizer {
    fn uses_cookie_login(&self) -> bool {
        true
    }

    fn login_path(&self, _site: &RemoteUrl) -> String {
        "/_persona".to_string()
    }

    fn login_parameters(&self, site: &RemoteUrl) -> Option<Map<String, Value>> {
        let assertion = self.assertion_for_site(site)?;
        let mut parameters = Map::new();
        parameters.insert("assertion".into(), Value::String(assertion));
        Some(parameters)
    }
}

/// Logs in by presenting a registered third-party access token.
pub struct AccessTokenAuthorizer {
    email: String,
    registry: Arc<CredentialRegistry>,
}

impl AccessTokenAuthorizer {
    /// Creates an authorizer for `email`.
    pub fn new(email: impl Into<String>, registry: Arc<CredentialRegistry>) -> Self {
        Self {
            email: email.into(),
            registry,
        }
    }

    /// The email this authorizer logs in as.
    pub fn email(&self) -> &str {
        &self.email
    }
}

impl Authorizer for AccessTokenAuthorizer {
    fn uses_cookie_login(&self) -> bool {
        true
    }

    fn login_path(&self, _site: &RemoteUrl) -> String {
        "/_facebook".to_string()
    }

    fn login_parameters(&self, site: &RemoteUrl) -> Option<Map<String, Value>> {
        let token = self.registry.access_token_for(&self.email, site)?;
        let mut parameters = Map::new();
        parameters.insert("access_token".into(), Value::String(token));
        Some(parameters)
    }
}

/// Builds a syntactically valid assertion for tests. Signatures are not
/// checked by the replicator, so the signature components are placeholders.
pub fn encode_assertion(email: &str, audience: &str, expires_at: SystemTime) -> String {
    let millis = expires_at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    let exp = u64::try_from(millis).unwrap_or(u64::MAX);
    let identity = serde_json::json!({ "principal": { "email": email } });
    let claims = serde_json::json!({ "aud": audience, "exp": exp });
    format!(
        "eyJhbGciOiJSUzI1NiJ9.{}.sig.{}.sig",
        URL_SAFE_NO_PAD.encode(identity.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
    )
}
