//! OAuth2 session handling for Drive.
//!
//! [Authenticator::ensure_session] decides between three paths:
//!
//! 1. An authorization code is given: exchange it for a token.
//! 2. A token is stored: use it, refreshing it first if it [expired](Token::is_expired).
//!    A refresh the provider rejects asks for consent again, see [AuthError::ConsentRevoked].
//! 3. Otherwise: ask the operator to visit the consent URL.
//!
//! Every new token is persisted before it is used.

use chrono::Utc;
use derive_more::{Display, Error};
use url::Url;

use crate::settings::{Settings, SettingsError, SettingsStore};

/// Google's OAuth2 consent screen.
pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Full access to Drive, required to delete backups.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Tokens expiring within this many seconds count as expired.
const EXPIRY_LEEWAY_SECS: i64 = 30;

/// An OAuth2 access token with its refresh token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, counted from `created`.
    #[serde(default)]
    pub expires_in: i64,
    /// Unix timestamp of issuance.
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl Token {
    /// Whether the token is expired at `now` (unix seconds).
    ///
    /// A token without issuance time is always expired.
    pub fn is_expired(&self, now: i64) -> bool {
        self.created == 0
            || self
                .created
                .saturating_add(self.expires_in)
                .saturating_sub(EXPIRY_LEEWAY_SECS)
                < now
    }

    /// Sets the issuance time unless the provider did.
    pub fn issued_at(mut self, now: i64) -> Self {
        if self.created == 0 {
            self.created = now;
        }
        self
    }
}

/// An authenticated Drive session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    token: Token,
}

impl Session {
    pub fn new(token: Token) -> Self {
        Self { token }
    }

    pub fn access_token(&self) -> &str {
        &self.token.access_token
    }

    pub fn token(&self) -> &Token {
        &self.token
    }
}

/// The OAuth2 client registered at Google.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl ClientCredentials {
    /// Client of the settings, [None] if id or secret is missing.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        settings.has_client_credentials().then(|| Self {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_uri: settings.options.redirect_uri.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Display, Error)]
/// Errors of the OAuth2 token endpoint.
pub enum OAuthError {
    /// The request didn't get a response.
    #[display("Token request failed: {_0}")]
    Transport(#[error(ignore)] String),
    /// The endpoint refused the grant.
    #[display("Token endpoint rejected the grant ({status}): {error} {description}")]
    Rejected {
        status: u16,
        error: String,
        description: String,
    },
    /// The response was not understood.
    #[display("Unexpected token response: {_0}")]
    Decode(#[error(ignore)] String),
    /// No refresh token is available.
    #[display("No refresh token available")]
    MissingRefreshToken,
}

impl OAuthError {
    /// Whether the grant itself is unusable, e.g. revoked by the user.
    ///
    /// Only a new consent helps then, retrying never does.
    pub fn is_revoked(&self) -> bool {
        matches!(
            self,
            OAuthError::Rejected {
                status: 400..=499,
                ..
            } | OAuthError::MissingRefreshToken
        )
    }
}

/// Network side of OAuth2: the token endpoint.
pub trait TokenEndpoint {
    /// Exchanges an authorization code for a token.
    fn exchange_code(&self, client: &ClientCredentials, code: &str) -> Result<Token, OAuthError>;

    /// Obtains a new access token with a refresh token.
    fn refresh(&self, client: &ClientCredentials, refresh_token: &str) -> Result<Token, OAuthError>;
}

#[derive(Debug, Display, Error)]
/// Errors on establishing a [Session].
pub enum AuthError {
    /// Client id or secret are not configured.
    #[display("Client id and client secret must be configured first")]
    NotConfigured,
    /// The operator has to grant access first.
    #[display("Not authenticated, grant access at {consent_url}")]
    NotAuthenticated { consent_url: Url },
    /// The stored token expired and couldn't be refreshed.
    #[display("Refreshing the access token failed: {_0}")]
    RefreshFailed(OAuthError),
    /// The stored grant is no longer accepted, access has to be granted again.
    #[display("Stored authorization is no longer valid ({source}), grant access again at {consent_url}")]
    ConsentRevoked { source: OAuthError, consent_url: Url },
    /// The authorization code was refused.
    #[display("Exchanging the authorization code failed: {_0}")]
    CodeExchangeFailed(OAuthError),
    /// The consent URL couldn't be built.
    #[display("Invalid consent URL: {_0}")]
    ConsentUrl(url::ParseError),
    /// A new token couldn't be persisted.
    #[display("Persisting the access token failed: {_0}")]
    Persist(SettingsError),
}

impl AuthError {
    /// Whether the operator can resolve the error by granting access again.
    pub fn needs_consent(&self) -> bool {
        self.consent_url().is_some()
    }

    /// Where the operator grants access, if that resolves the error.
    pub fn consent_url(&self) -> Option<&Url> {
        match self {
            AuthError::NotAuthenticated { consent_url }
            | AuthError::ConsentRevoked { consent_url, .. } => Some(consent_url),
            _ => None,
        }
    }
}

/// URL of the consent screen the operator has to visit.
pub fn consent_url(client: &ClientCredentials) -> Result<Url, url::ParseError> {
    Url::parse_with_params(
        AUTH_URL,
        &[
            ("client_id", client.client_id.as_str()),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", DRIVE_SCOPE),
            // offline access issues a refresh token
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
}

/// Exchanges the refresh token of `token` for a new access token.
///
/// Providers may omit the refresh token on refresh, the old one is kept then.
pub fn refresh<O: TokenEndpoint>(
    oauth: &O,
    client: &ClientCredentials,
    token: &Token,
    now: i64,
) -> Result<Token, AuthError> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::RefreshFailed(OAuthError::MissingRefreshToken))?;

    let mut refreshed = oauth
        .refresh(client, refresh_token)
        .map_err(AuthError::RefreshFailed)?
        .issued_at(now);
    if refreshed.refresh_token.is_none() {
        refreshed.refresh_token = Some(refresh_token.to_string());
    }

    Ok(refreshed)
}

/// Establishes [Session]s and persists new tokens.
pub struct Authenticator<'a, O> {
    oauth: &'a O,
    store: &'a SettingsStore,
}

impl<'a, O: TokenEndpoint> Authenticator<'a, O> {
    pub fn new(oauth: &'a O, store: &'a SettingsStore) -> Self {
        Self { oauth, store }
    }

    /// Returns a usable session, see the [module documentation](self).
    pub fn ensure_session(
        &self,
        settings: &mut Settings,
        code: Option<&str>,
    ) -> Result<Session, AuthError> {
        self.ensure_session_at(settings, code, Utc::now().timestamp())
    }

    pub fn ensure_session_at(
        &self,
        settings: &mut Settings,
        code: Option<&str>,
        now: i64,
    ) -> Result<Session, AuthError> {
        let client = ClientCredentials::from_settings(settings).ok_or(AuthError::NotConfigured)?;

        if let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) {
            log::info!(target: "drive::auth", "Exchanging authorization code for an access token");
            let token = self
                .oauth
                .exchange_code(&client, code)
                .map_err(AuthError::CodeExchangeFailed)?
                .issued_at(now);
            self.persist(settings, &token)?;
            return Ok(Session::new(token));
        }

        match settings.token() {
            Some(token) if token.is_expired(now) => {
                log::info!(target: "drive::auth", "Access token expired, refreshing it");
                let token = match refresh(self.oauth, &client, &token, now) {
                    Ok(token) => token,
                    Err(AuthError::RefreshFailed(source)) if source.is_revoked() => {
                        log::warn!(target: "drive::auth", "Stored authorization is no longer valid: {source}");
                        let consent_url = consent_url(&client).map_err(AuthError::ConsentUrl)?;
                        return Err(AuthError::ConsentRevoked {
                            source,
                            consent_url,
                        });
                    }
                    Err(e) => return Err(e),
                };
                self.persist(settings, &token)?;
                Ok(Session::new(token))
            }
            Some(token) => {
                log::trace!(target: "drive::auth", "Using stored access token");
                Ok(Session::new(token))
            }
            None => {
                let consent_url = consent_url(&client).map_err(AuthError::ConsentUrl)?;
                log::debug!(target: "drive::auth", "No access token stored, consent required");
                Err(AuthError::NotAuthenticated { consent_url })
            }
        }
    }

    fn persist(&self, settings: &mut Settings, token: &Token) -> Result<(), AuthError> {
        settings.set_token(token).map_err(AuthError::Persist)?;
        self.store.save(settings).map_err(AuthError::Persist)?;
        log::debug!(target: "drive::auth", "Persisted access token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[derive(Default)]
    struct CountingEndpoint {
        exchanges: Cell<usize>,
        refreshes: Cell<usize>,
        refresh_error: Option<OAuthError>,
    }

    impl TokenEndpoint for CountingEndpoint {
        fn exchange_code(&self, _client: &ClientCredentials, code: &str) -> Result<Token, OAuthError> {
            self.exchanges.set(self.exchanges.get() + 1);
            Ok(token(&format!("access-{code}"), Some("refresh-1"), 0))
        }

        fn refresh(&self, _client: &ClientCredentials, refresh_token: &str) -> Result<Token, OAuthError> {
            self.refreshes.set(self.refreshes.get() + 1);
            if let Some(e) = &self.refresh_error {
                return Err(e.clone());
            }
            assert_eq!(refresh_token, "refresh-1");
            Ok(token("access-refreshed", None, 0))
        }
    }

    fn token(access: &str, refresh: Option<&str>, created: i64) -> Token {
        Token {
            access_token: access.into(),
            refresh_token: refresh.map(Into::into),
            expires_in: 3600,
            created,
            scope: None,
            token_type: default_token_type(),
        }
    }

    fn configured() -> Settings {
        Settings {
            client_id: "client".into(),
            client_secret: "secret".into(),
            ..Default::default()
        }
    }

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.toml"));
        (dir, store)
    }

    #[test]
    fn expiry_includes_leeway() {
        let t = token("a", None, NOW);
        assert!(!t.is_expired(NOW));
        assert!(!t.is_expired(NOW + 3600 - 31));
        assert!(t.is_expired(NOW + 3600 - 29));
        assert!(token("a", None, 0).is_expired(NOW));
    }

    #[test]
    fn missing_token_asks_for_consent_without_network() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint::default();
        let mut settings = configured();

        let err = Authenticator::new(&oauth, &store)
            .ensure_session_at(&mut settings, None, NOW)
            .unwrap_err();

        let consent_url = match err {
            AuthError::NotAuthenticated { consent_url } => consent_url,
            other => panic!("unexpected error: {other}"),
        };
        assert!(consent_url.as_str().starts_with(AUTH_URL));
        let params: Vec<_> = consent_url.query_pairs().into_owned().collect();
        assert!(params.contains(&("client_id".into(), "client".into())));
        assert!(params.contains(&("access_type".into(), "offline".into())));
        assert_eq!(oauth.exchanges.get() + oauth.refreshes.get(), 0);
        assert!(!store.path().exists(), "nothing is persisted");
    }

    #[test]
    fn missing_client_credentials_are_reported() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint::default();
        let mut settings = Settings::default();

        let err = Authenticator::new(&oauth, &store)
            .ensure_session_at(&mut settings, Some("code"), NOW)
            .unwrap_err();
        assert!(matches!(err, AuthError::NotConfigured));
        assert_eq!(oauth.exchanges.get(), 0);
    }

    #[test]
    fn authorization_code_is_exchanged_and_persisted() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint::default();
        let mut settings = configured();

        let session = Authenticator::new(&oauth, &store)
            .ensure_session_at(&mut settings, Some("xyz"), NOW)
            .unwrap();

        assert_eq!(session.access_token(), "access-xyz");
        assert_eq!(session.token().created, NOW);
        let persisted = store.load().unwrap().token().unwrap();
        assert_eq!(&persisted, session.token());
    }

    #[test]
    fn valid_token_needs_no_network_calls() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint::default();
        let mut settings = configured();
        settings.set_token(&token("stored", Some("refresh-1"), NOW)).unwrap();

        let auth = Authenticator::new(&oauth, &store);
        let first = auth.ensure_session_at(&mut settings, None, NOW + 10).unwrap();
        let second = auth.ensure_session_at(&mut settings, None, NOW + 20).unwrap();

        assert_eq!(first, second);
        assert_eq!(oauth.exchanges.get() + oauth.refreshes.get(), 0);
    }

    #[test]
    fn expired_token_is_refreshed_once_and_keeps_refresh_token() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint::default();
        let mut settings = configured();
        settings.set_token(&token("old", Some("refresh-1"), NOW - 7200)).unwrap();

        let auth = Authenticator::new(&oauth, &store);
        let session = auth.ensure_session_at(&mut settings, None, NOW).unwrap();
        assert_eq!(session.access_token(), "access-refreshed");
        assert_eq!(session.token().refresh_token.as_deref(), Some("refresh-1"));

        auth.ensure_session_at(&mut settings, None, NOW + 5).unwrap();
        assert_eq!(oauth.refreshes.get(), 1);
        assert_eq!(store.load().unwrap().token().as_ref(), Some(session.token()));
    }

    fn revoked() -> OAuthError {
        OAuthError::Rejected {
            status: 400,
            error: "invalid_grant".into(),
            description: "Token has been expired or revoked.".into(),
        }
    }

    #[test]
    fn revoked_grant_asks_for_consent_again() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint {
            refresh_error: Some(revoked()),
            ..Default::default()
        };
        let mut settings = configured();
        settings.set_token(&token("old", Some("refresh-1"), NOW - 7200)).unwrap();
        let auth = Authenticator::new(&oauth, &store);

        // every attempt without a code leads to the consent screen
        for attempt in 1..=2 {
            let err = auth.ensure_session_at(&mut settings, None, NOW).unwrap_err();
            match &err {
                AuthError::ConsentRevoked { source, consent_url } => {
                    assert_eq!(source, &revoked());
                    assert!(consent_url.as_str().starts_with(AUTH_URL));
                }
                other => panic!("unexpected error on attempt {attempt}: {other}"),
            }
            assert!(err.needs_consent());
        }

        // a new code replaces the revoked grant
        let session = auth.ensure_session_at(&mut settings, Some("new"), NOW).unwrap();
        assert_eq!(session.access_token(), "access-new");
        assert_eq!(oauth.refreshes.get(), 2);
    }

    #[test]
    fn unreachable_token_endpoint_is_not_a_consent_problem() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint {
            refresh_error: Some(OAuthError::Transport("connection reset".into())),
            ..Default::default()
        };
        let mut settings = configured();
        settings.set_token(&token("old", Some("refresh-1"), NOW - 7200)).unwrap();

        let err = Authenticator::new(&oauth, &store)
            .ensure_session_at(&mut settings, None, NOW)
            .unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(OAuthError::Transport(_))));
        assert!(!err.needs_consent());
        assert!(settings.token().is_some(), "stored token is kept");
    }

    #[test]
    fn expired_token_without_refresh_token_asks_for_consent() {
        let (_dir, store) = store();
        let oauth = CountingEndpoint::default();
        let client = ClientCredentials::from_settings(&configured()).unwrap();

        let err = refresh(&oauth, &client, &token("old", None, 1), NOW).unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(OAuthError::MissingRefreshToken)));

        let mut settings = configured();
        settings.set_token(&token("old", None, 1)).unwrap();
        let err = Authenticator::new(&oauth, &store)
            .ensure_session_at(&mut settings, None, NOW)
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::ConsentRevoked {
                source: OAuthError::MissingRefreshToken,
                ..
            }
        ));
        assert_eq!(oauth.refreshes.get(), 0);
    }

    #[test]
    fn corrupted_timestamps_do_not_overflow() {
        let mut t = token("a", None, i64::MAX);
        t.expires_in = i64::MAX;
        assert!(!t.is_expired(NOW));

        t.created = i64::MIN + 1;
        t.expires_in = i64::MIN;
        assert!(t.is_expired(NOW));
    }
}
