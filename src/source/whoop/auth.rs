//! OAuth2 token lifecycle for the WHOOP API.
//!
//! One [`TokenManager`] per process owns the credential. All token access
//! goes through `get_access_token`, which serializes refresh and interactive
//! authorization behind a mutex so concurrent callers piggyback on a single
//! in-flight attempt instead of racing the token endpoint.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::{IngestError, Result};
use crate::store::{Credential, HealthStore};

/// Tokens within this window of expiry are treated as already expired,
/// so a token cannot lapse mid-request.
pub const SAFETY_MARGIN_SECS: i64 = 30;

/// How long to wait for the browser redirect before giving up.
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub callback_port: u16,
    pub scopes: String,
    pub auth_timeout_secs: u64,
}

/// Token endpoint response. `expires_in` is optional in the wild; absent
/// means we assume the common one-hour lifetime.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    token_type: Option<String>,
}

impl TokenResponse {
    fn into_credential(self, prior_refresh: Option<String>) -> Credential {
        Credential {
            access_token: self.access_token,
            // Providers may omit the refresh token on refresh; keep the old one.
            refresh_token: self.refresh_token.or(prior_refresh),
            scope: self.scope,
            token_type: self.token_type,
            expires_at: Utc::now() + Duration::seconds(self.expires_in.unwrap_or(3600)),
        }
    }
}

struct TokenState {
    credential: Option<Credential>,
    loaded: bool,
    /// False when the last credential could not be written durably.
    persisted: bool,
}

pub type Opener = Box<dyn Fn(&str) + Send + Sync>;

pub struct TokenManager {
    http: reqwest::Client,
    store: HealthStore,
    settings: OAuthSettings,
    source_system: &'static str,
    state: Mutex<TokenState>,
    opener: Opener,
}

impl TokenManager {
    pub fn new(store: HealthStore, settings: OAuthSettings, source_system: &'static str) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            settings,
            source_system,
            state: Mutex::new(TokenState {
                credential: None,
                loaded: false,
                persisted: true,
            }),
            opener: Box::new(default_opener),
        }
    }

    /// Replace the browser opener. Tests use this to drive the callback
    /// without a real browser.
    pub fn with_opener(mut self, opener: Opener) -> Self {
        self.opener = opener;
        self
    }

    /// Return a usable access token, refreshing or re-authorizing as needed.
    pub async fn get_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        if !state.loaded {
            state.credential = self.load_stored();
            state.loaded = true;
        }

        if let Some(cred) = &state.credential {
            if cred.usable_at(Utc::now(), Duration::seconds(SAFETY_MARGIN_SECS)) {
                if !state.persisted {
                    // Earlier durable write failed; retry it while we hold the lock.
                    match self.store.save_credential(self.source_system, cred) {
                        Ok(()) => state.persisted = true,
                        Err(e) => {
                            tracing::warn!(error = %e, "credential persist retry failed")
                        }
                    }
                }
                return Ok(cred.access_token.clone());
            }
        }

        let cred = self.obtain(state).await?;
        Ok(cred.access_token)
    }

    /// Discard the current access token and obtain a fresh credential.
    /// Used by the HTTP client when the API answers 401 despite a token
    /// we believed valid.
    pub async fn force_refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        if !state.loaded {
            state.credential = self.load_stored();
            state.loaded = true;
        }
        let cred = self.obtain(state).await?;
        Ok(cred.access_token)
    }

    /// Load the persisted credential. An unavailable store is not fatal:
    /// the manager proceeds without one and keeps the credential it
    /// obtains in memory.
    fn load_stored(&self) -> Option<Credential> {
        match self.store.load_latest_credential(self.source_system) {
            Ok(cred) => cred,
            Err(e) => {
                tracing::warn!(error = %e, "credential store unavailable, starting without a stored credential");
                None
            }
        }
    }

    /// Refresh if a refresh token is on hand, otherwise (or when the
    /// provider rejects the refresh) run the interactive flow. Caller
    /// holds the state lock.
    async fn obtain(&self, state: &mut TokenState) -> Result<Credential> {
        let refresh_token = state
            .credential
            .as_ref()
            .and_then(|c| c.refresh_token.clone());

        let cred = match refresh_token {
            Some(token) => match self.refresh(&token).await? {
                Some(cred) => cred,
                None => {
                    tracing::info!("refresh token rejected, falling back to authorization");
                    self.authorize().await?
                }
            },
            None => self.authorize().await?,
        };

        state.persisted = match self.store.save_credential(self.source_system, &cred) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "credential not persisted, continuing in memory");
                false
            }
        };
        state.credential = Some(cred.clone());
        Ok(cred)
    }

    /// Exchange a refresh token. `Ok(None)` means the provider rejected it
    /// and the interactive flow should run; transport errors propagate.
    async fn refresh(&self, refresh_token: &str) -> Result<Option<Credential>> {
        let (client_id, client_secret) = self.client_credentials()?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        let resp = self
            .http
            .post(&self.settings.token_url)
            .form(&params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            tracing::warn!(status = %status, "token refresh rejected");
            return Ok(None);
        }

        let token: TokenResponse = resp.json().await?;
        Ok(Some(
            token.into_credential(Some(refresh_token.to_string())),
        ))
    }

    /// Interactive authorization-code flow with a loopback callback server.
    async fn authorize(&self) -> Result<Credential> {
        let (client_id, _) = self.client_credentials()?;

        let state_token = uuid::Uuid::new_v4().simple().to_string();
        let auth_url = reqwest::Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("response_type", "code"),
                ("client_id", client_id),
                ("redirect_uri", &self.settings.redirect_uri),
                ("scope", &self.settings.scopes),
                ("state", &state_token),
            ],
        )
        .map_err(|e| IngestError::Auth(format!("bad authorization URL: {e}")))?;

        let (tx, mut rx) = mpsc::channel::<String>(1);
        let ctx = Arc::new(CallbackCtx {
            expected_state: state_token,
            tx,
        });
        let app = Router::new()
            .route("/callback", get(callback_handler))
            .with_state(ctx);

        let listener =
            tokio::net::TcpListener::bind(("127.0.0.1", self.settings.callback_port)).await?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (self.opener)(auth_url.as_str());

        let timeout = std::time::Duration::from_secs(self.settings.auth_timeout_secs);
        let code = tokio::time::timeout(timeout, rx.recv()).await;
        server.abort();

        let code = match code {
            Ok(Some(code)) => code,
            Ok(None) => return Err(IngestError::Auth("callback channel closed".into())),
            Err(_) => {
                return Err(IngestError::AuthorizationTimeout(
                    self.settings.auth_timeout_secs,
                ))
            }
        };

        self.exchange_code(&code).await
    }

    async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let (client_id, client_secret) = self.client_credentials()?;

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", &self.settings.redirect_uri),
        ];
        let resp = self
            .http
            .post(&self.settings.token_url)
            .form(&params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::Api { status, body });
        }

        let token: TokenResponse = resp.json().await?;
        Ok(token.into_credential(None))
    }

    fn client_credentials(&self) -> Result<(&str, &str)> {
        match (
            self.settings.client_id.as_deref(),
            self.settings.client_secret.as_deref(),
        ) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
            _ => Err(IngestError::MissingClientCredentials),
        }
    }
}

struct CallbackCtx {
    expected_state: String,
    tx: mpsc::Sender<String>,
}

async fn callback_handler(
    State(ctx): State<Arc<CallbackCtx>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    match params.get("state") {
        Some(state) if *state == ctx.expected_state => {}
        // Stray or forged callback: reject it and keep waiting for the real one.
        _ => return (StatusCode::BAD_REQUEST, "State mismatch"),
    }
    let Some(code) = params.get("code") else {
        return (StatusCode::BAD_REQUEST, "Missing authorization code");
    };
    let _ = ctx.tx.send(code.clone()).await;
    (
        StatusCode::OK,
        "Authorization complete. You may close this tab.",
    )
}

fn default_opener(url: &str) {
    tracing::info!(url, "opening browser for authorization");
    println!("Open this URL to authorize:\n  {url}");
    #[cfg(target_os = "macos")]
    let _ = std::process::Command::new("open").arg(url).spawn();
    #[cfg(target_os = "linux")]
    let _ = std::process::Command::new("xdg-open").arg(url).spawn();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(server_uri: &str, callback_port: u16) -> OAuthSettings {
        OAuthSettings {
            client_id: Some("cid".into()),
            client_secret: Some("csecret".into()),
            auth_url: format!("{server_uri}/oauth/oauth2/auth"),
            token_url: format!("{server_uri}/oauth/oauth2/token"),
            redirect_uri: format!("http://localhost:{callback_port}/callback"),
            callback_port,
            scopes: "read:profile".into(),
            auth_timeout_secs: 5,
        }
    }

    fn token_body(access: &str, refresh: &str) -> serde_json::Value {
        json!({
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": 3600,
            "token_type": "bearer"
        })
    }

    /// Opener that simulates the browser by GETting the callback URL with
    /// the state echoed back and a fixed code.
    fn fake_browser() -> Opener {
        Box::new(|url: &str| {
            let parsed = reqwest::Url::parse(url).unwrap();
            let state = parsed
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.to_string())
                .unwrap();
            let redirect = parsed
                .query_pairs()
                .find(|(k, _)| k == "redirect_uri")
                .map(|(_, v)| v.to_string())
                .unwrap();
            tokio::spawn(async move {
                let callback = format!("{redirect}?code=authcode123&state={state}");
                let _ = reqwest::get(&callback).await;
            });
        })
    }

    #[tokio::test]
    async fn valid_token_is_reused_without_network() {
        let store = HealthStore::open_in_memory().unwrap();
        store
            .save_credential(
                "whoop",
                &Credential {
                    access_token: "tok".into(),
                    refresh_token: Some("r".into()),
                    scope: None,
                    token_type: None,
                    expires_at: Utc::now() + Duration::hours(1),
                },
            )
            .unwrap();

        // Token endpoint that must never be hit.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mgr = TokenManager::new(store, settings(&server.uri(), 18761), "whoop");
        assert_eq!(mgr.get_access_token().await.unwrap(), "tok");
        assert_eq!(mgr.get_access_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn expired_token_refreshes_and_persists() {
        let store = HealthStore::open_in_memory().unwrap();
        store
            .save_credential(
                "whoop",
                &Credential {
                    access_token: "stale".into(),
                    refresh_token: Some("refresh1".into()),
                    scope: None,
                    token_type: None,
                    expires_at: Utc::now() + Duration::seconds(5),
                },
            )
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", "refresh2")))
            .expect(1)
            .mount(&server)
            .await;

        let mgr = TokenManager::new(store.clone(), settings(&server.uri(), 18762), "whoop");
        assert_eq!(mgr.get_access_token().await.unwrap(), "fresh");

        let persisted = store.load_latest_credential("whoop").unwrap().unwrap();
        assert_eq!(persisted.access_token, "fresh");
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh2"));
    }

    #[tokio::test]
    async fn refresh_without_new_refresh_token_keeps_old_one() {
        let store = HealthStore::open_in_memory().unwrap();
        store
            .save_credential(
                "whoop",
                &Credential {
                    access_token: "stale".into(),
                    refresh_token: Some("keepme".into()),
                    scope: None,
                    token_type: None,
                    expires_at: Utc::now() - Duration::hours(1),
                },
            )
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mgr = TokenManager::new(store.clone(), settings(&server.uri(), 18763), "whoop");
        mgr.get_access_token().await.unwrap();

        let persisted = store.load_latest_credential("whoop").unwrap().unwrap();
        assert_eq!(persisted.refresh_token.as_deref(), Some("keepme"));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let store = HealthStore::open_in_memory().unwrap();
        store
            .save_credential(
                "whoop",
                &Credential {
                    access_token: "stale".into(),
                    refresh_token: Some("r1".into()),
                    scope: None,
                    token_type: None,
                    expires_at: Utc::now() - Duration::hours(1),
                },
            )
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("fresh", "r2")))
            .expect(1)
            .mount(&server)
            .await;

        let mgr = Arc::new(TokenManager::new(
            store,
            settings(&server.uri(), 18764),
            "whoop",
        ));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.get_access_token().await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "fresh");
        }
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_authorization() {
        let store = HealthStore::open_in_memory().unwrap();
        store
            .save_credential(
                "whoop",
                &Credential {
                    access_token: "stale".into(),
                    refresh_token: Some("dead".into()),
                    scope: None,
                    token_type: None,
                    expires_at: Utc::now() - Duration::hours(1),
                },
            )
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=authcode123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("granted", "r9")))
            .expect(1)
            .mount(&server)
            .await;

        let mgr = TokenManager::new(store.clone(), settings(&server.uri(), 18765), "whoop")
            .with_opener(fake_browser());
        assert_eq!(mgr.get_access_token().await.unwrap(), "granted");

        let persisted = store.load_latest_credential("whoop").unwrap().unwrap();
        assert_eq!(persisted.access_token, "granted");
    }

    #[tokio::test]
    async fn authorization_times_out_without_callback() {
        let store = HealthStore::open_in_memory().unwrap();
        let server = MockServer::start().await;

        let mut s = settings(&server.uri(), 18766);
        s.auth_timeout_secs = 1;
        // Opener does nothing, so the callback never arrives.
        let mgr = TokenManager::new(store, s, "whoop").with_opener(Box::new(|_| {}));

        match mgr.get_access_token().await {
            Err(IngestError::AuthorizationTimeout(1)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mismatched_state_is_ignored() {
        let store = HealthStore::open_in_memory().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("granted", "r1")))
            .expect(1)
            .mount(&server)
            .await;

        // First a forged callback with the wrong state, then the real one.
        let opener: Opener = Box::new(|url: &str| {
            let parsed = reqwest::Url::parse(url).unwrap();
            let state = parsed
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.to_string())
                .unwrap();
            let redirect = parsed
                .query_pairs()
                .find(|(k, _)| k == "redirect_uri")
                .map(|(_, v)| v.to_string())
                .unwrap();
            tokio::spawn(async move {
                let forged = format!("{redirect}?code=evil&state=wrong");
                let resp = reqwest::get(&forged).await.unwrap();
                assert_eq!(resp.status(), 400);
                let real = format!("{redirect}?code=authcode123&state={state}");
                let _ = reqwest::get(&real).await;
            });
        });

        let mgr =
            TokenManager::new(store, settings(&server.uri(), 18767), "whoop").with_opener(opener);
        assert_eq!(mgr.get_access_token().await.unwrap(), "granted");
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_in_memory_credential() {
        let store = HealthStore::open_in_memory().unwrap();
        // Simulate a broken credential store: loads and saves both fail.
        store.execute_batch("DROP TABLE oauth_credentials").unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/oauth2/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("granted", "r1")))
            .expect(1)
            .mount(&server)
            .await;

        let mgr = TokenManager::new(store, settings(&server.uri(), 18769), "whoop")
            .with_opener(fake_browser());
        assert_eq!(mgr.get_access_token().await.unwrap(), "granted");
        // Subsequent calls serve the in-memory credential without re-authorizing.
        assert_eq!(mgr.get_access_token().await.unwrap(), "granted");
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_listening() {
        let store = HealthStore::open_in_memory().unwrap();
        let mut s = settings("http://127.0.0.1:1", 18768);
        s.client_id = None;

        let mgr = TokenManager::new(store, s, "whoop");
        match mgr.get_access_token().await {
            Err(IngestError::MissingClientCredentials) => {}
            other => panic!("expected missing credentials, got {other:?}"),
        }
    }
}
