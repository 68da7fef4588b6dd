use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{CloudBackend, CodeExchange};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::provider::Provider;
use crate::redirect::RedirectBuilder;
use crate::session::OAuthStateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationTarget {
    pub path: String,
    pub delay_ms: u64,
}

impl NavigationTarget {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct NavigationConfig {
    pub success_path: String,
    pub fallback_path: String,
    pub success_delay_ms: u64,
    pub error_delay_ms: u64,
}

impl NavigationConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            success_path: config.oauth_success_path.clone(),
            fallback_path: config.oauth_fallback_path.clone(),
            success_delay_ms: config.oauth_success_delay_ms,
            error_delay_ms: config.oauth_error_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Loading,
    Success,
    Error,
}

#[derive(Debug, Serialize)]
pub struct CallbackOutcome {
    pub provider: String,
    pub status: CallbackStatus,
    pub message: String,
    pub navigate: NavigationTarget,
    #[serde(skip)]
    pub error: Option<AppError>,
}

impl CallbackOutcome {
    pub fn is_success(&self) -> bool {
        self.status == CallbackStatus::Success
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackQuery {
    pub fn parse(query: &str) -> Self {
        let query = query.trim_start_matches('?');
        let mut parsed = Self::default();
        let pairs = Url::parse("http://callback.invalid/")
            .map(|mut url| {
                url.set_query(Some(query));
                url.query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for (key, value) in pairs {
            let value = Some(value).filter(|v| !v.trim().is_empty());
            match key.as_str() {
                "code" if parsed.code.is_none() => parsed.code = value,
                "state" if parsed.state.is_none() => parsed.state = value,
                "error" if parsed.error.is_none() => parsed.error = value,
                "error_description" if parsed.error_description.is_none() => {
                    parsed.error_description = value
                }
                _ => {}
            }
        }
        parsed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackRequest {
    pub provider: String,
    pub query: CallbackQuery,
}

impl CallbackRequest {
    pub fn parse(url: &str) -> AppResult<Self> {
        let base = Url::parse("http://callback.invalid/").map_err(|err| {
            AppError::Config(format!("failed to build callback base URL: {err}"))
        })?;
        let parsed = base
            .join(url.trim())
            .map_err(|err| AppError::MalformedCallback(format!("unparseable callback URL: {err}")))?;
        let segments = parsed
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect::<Vec<_>>())
            .unwrap_or_default();
        let provider = match segments.as_slice() {
            ["auth", provider, "callback"] => provider.to_string(),
            _ => {
                return Err(AppError::MalformedCallback(format!(
                    "unexpected callback path {}",
                    parsed.path()
                )))
            }
        };
        Ok(Self {
            provider,
            query: CallbackQuery::parse(parsed.query().unwrap_or_default()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkStart {
    pub provider: Provider,
    pub authorization_url: String,
    pub redirect_uri: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OAuthFlow {
    backend: Arc<dyn CloudBackend>,
    states: OAuthStateStore,
    redirects: RedirectBuilder,
    navigation: NavigationConfig,
}

impl OAuthFlow {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        states: OAuthStateStore,
        redirects: RedirectBuilder,
        navigation: NavigationConfig,
    ) -> Self {
        Self {
            backend,
            states,
            redirects,
            navigation,
        }
    }

    pub async fn begin_link(&self, provider: Provider) -> AppResult<LinkStart> {
        let pending = self.states.issue(provider)?;
        let redirect_uri = self.redirects.callback_uri(provider);
        match self
            .backend
            .authorization_url(provider, &pending.state, &redirect_uri)
            .await
        {
            Ok(authorization_url) => {
                info!(
                    target: "oauth_link",
                    provider = provider.as_slug(),
                    "link started; redirecting to provider"
                );
                Ok(LinkStart {
                    provider,
                    authorization_url,
                    redirect_uri,
                    expires_at: pending.expires_at,
                })
            }
            Err(err) => {
                if let Err(cleanup) = self.states.consume(provider) {
                    warn!(
                        target: "oauth_link",
                        provider = provider.as_slug(),
                        error = %cleanup,
                        "failed to discard unused oauth state"
                    );
                }
                warn!(
                    target: "oauth_link",
                    provider = provider.as_slug(),
                    error = %err,
                    "failed to fetch authorization url"
                );
                Err(err)
            }
        }
    }

    pub fn callback(&self, provider: &str, query: &str) -> CallbackAttempt {
        self.attempt(provider.to_string(), CallbackQuery::parse(query))
    }

    pub fn callback_from_request(&self, request: CallbackRequest) -> CallbackAttempt {
        self.attempt(request.provider, request.query)
    }

    pub fn failed(&self, provider: String, err: AppError) -> CallbackOutcome {
        warn!(
            target: "oauth_callback",
            provider = %provider,
            error = %err,
            "oauth callback failed"
        );
        CallbackOutcome {
            provider,
            status: CallbackStatus::Error,
            message: err.to_string(),
            navigate: NavigationTarget {
                path: self.navigation.fallback_path.clone(),
                delay_ms: self.navigation.error_delay_ms,
            },
            error: Some(err),
        }
    }

    fn attempt(&self, provider: String, query: CallbackQuery) -> CallbackAttempt {
        CallbackAttempt {
            flow: self.clone(),
            provider,
            query,
            status: CallbackStatus::Loading,
        }
    }
}

pub struct CallbackAttempt {
    flow: OAuthFlow,
    provider: String,
    query: CallbackQuery,
    status: CallbackStatus,
}

impl CallbackAttempt {
    pub fn status(&self) -> CallbackStatus {
        self.status
    }

    pub async fn run(self, cancel: &CancellationToken) -> CallbackOutcome {
        match self.execute(cancel).await {
            Ok(provider) => {
                info!(
                    target: "oauth_callback",
                    provider = provider.as_slug(),
                    "provider linked"
                );
                let navigation = &self.flow.navigation;
                CallbackOutcome {
                    provider: self.provider,
                    status: CallbackStatus::Success,
                    message: format!("{} connected successfully.", provider.display_name()),
                    navigate: NavigationTarget {
                        path: navigation.success_path.clone(),
                        delay_ms: navigation.success_delay_ms,
                    },
                    error: None,
                }
            }
            Err(err) => self.flow.failed(self.provider, err),
        }
    }

    async fn execute(&self, cancel: &CancellationToken) -> AppResult<Provider> {
        let provider = Provider::from_slug(&self.provider).ok_or_else(|| {
            AppError::MalformedCallback(format!("unknown provider {}", self.provider))
        })?;

        // The pending state is single-use whatever this callback turns out to be.
        let stored = self.flow.states.consume(provider)?;

        if let Some(error) = &self.query.error {
            let message = match &self.query.error_description {
                Some(description) => format!("{error} ({description})"),
                None => error.clone(),
            };
            return Err(AppError::ProviderDenied(message));
        }

        let (code, state) = match (&self.query.code, &self.query.state) {
            (Some(code), Some(state)) => (code.clone(), state.clone()),
            (None, _) => return Err(AppError::MalformedCallback("missing code".into())),
            (_, None) => return Err(AppError::MalformedCallback("missing state".into())),
        };

        let state_matches = stored.state.as_deref() == Some(state.as_str());
        let provider_matches = stored.provider.as_deref() == Some(provider.as_slug());
        if !state_matches || !provider_matches {
            return Err(AppError::StateMismatch);
        }

        let exchange = CodeExchange {
            code,
            state,
            redirect_uri: self.flow.redirects.callback_uri(provider),
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            result = self.flow.backend.exchange_code(provider, &exchange) => result,
        };
        match result {
            Ok(()) => Ok(provider),
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(err) => Err(AppError::ExchangeFailed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FilePage;
    use crate::session::{MemorySessionStore, SessionStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingBackend {
        exchanges: Mutex<Vec<(Provider, CodeExchange)>>,
        fail_exchange: bool,
        fail_authorize: bool,
        stall_exchange: bool,
        entered: Notify,
    }

    struct GatedSession {
        inner: MemorySessionStore,
        gate: Barrier,
    }

    impl SessionStore for GatedSession {
        fn get(&self, key: &str) -> AppResult<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> AppResult<()> {
            self.inner.set(key, value, expires_at)
        }

        fn remove(&self, key: &str) -> AppResult<Option<String>> {
            if key.starts_with("oauth_state_") {
                self.gate.wait();
            }
            self.inner.remove(key)
        }
    }

    #[async_trait]
    impl CloudBackend for RecordingBackend {
        async fn authorization_url(
            &self,
            provider: Provider,
            state: &str,
            redirect_uri: &str,
        ) -> AppResult<String> {
            if self.fail_authorize {
                return Err(AppError::Api {
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(format!(
                "https://{}.example.com/oauth?state={state}&redirect_uri={redirect_uri}",
                provider.as_slug()
            ))
        }

        async fn exchange_code(&self, provider: Provider, exchange: &CodeExchange) -> AppResult<()> {
            self.exchanges.lock().push((provider, exchange.clone()));
            self.entered.notify_one();
            if self.stall_exchange {
                std::future::pending::<()>().await;
            }
            if self.fail_exchange {
                Err(AppError::Api {
                    status: 400,
                    message: "invalid_grant".into(),
                })
            } else {
                Ok(())
            }
        }

        async fn list_files(
            &self,
            _provider: Provider,
            _folder_id: Option<&str>,
            _page_token: Option<&str>,
        ) -> AppResult<FilePage> {
            Ok(FilePage::default())
        }

        async fn import_file(
            &self,
            _provider: Provider,
            _file_id: &str,
            _project_id: Option<&str>,
        ) -> AppResult<()> {
            Ok(())
        }
    }

    fn flow_over(backend: Arc<RecordingBackend>, store: Arc<dyn SessionStore>) -> OAuthFlow {
        let states = OAuthStateStore::new(store, 600);
        let redirects = RedirectBuilder::new("http://127.0.0.1:3000", "localhost").unwrap();
        let navigation = NavigationConfig::from_config(&AppConfig::for_tests());
        OAuthFlow::new(backend, states, redirects, navigation)
    }

    fn flow_with(backend: Arc<RecordingBackend>) -> (OAuthFlow, MemorySessionStore) {
        let session = MemorySessionStore::new();
        (flow_over(backend, Arc::new(session.clone())), session)
    }

    fn seed(session: &MemorySessionStore, provider: &str, state: &str) {
        let expires = Utc::now() + chrono::Duration::minutes(10);
        session
            .set(&format!("oauth_state_{provider}"), state.into(), expires)
            .unwrap();
        session
            .set(&format!("oauth_provider_{provider}"), provider.into(), expires)
            .unwrap();
    }

    #[tokio::test]
    async fn completes_exchange_once_and_clears_state() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "dropbox", "xyz");

        let attempt = flow.callback("dropbox", "?code=abc&state=xyz");
        assert_eq!(attempt.status(), CallbackStatus::Loading);
        let outcome = attempt.run(&CancellationToken::new()).await;

        assert_eq!(outcome.status, CallbackStatus::Success);
        assert_eq!(outcome.navigate.path, "/dashboard");
        assert_eq!(outcome.navigate.delay_ms, 2_000);
        let exchanges = backend.exchanges.lock();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].0, Provider::Dropbox);
        assert_eq!(
            exchanges[0].1,
            CodeExchange {
                code: "abc".into(),
                state: "xyz".into(),
                redirect_uri: "http://localhost:3000/auth/dropbox/callback".into(),
            }
        );
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn mismatched_state_never_exchanges() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "dropbox", "expected");

        let outcome = flow
            .callback("dropbox", "code=abc&state=forged")
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, CallbackStatus::Error);
        assert!(matches!(outcome.error, Some(AppError::StateMismatch)));
        assert!(backend.exchanges.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_session_reports_invalid_state() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, _session) = flow_with(backend.clone());

        let outcome = flow
            .callback("dropbox", "code=abc&state=xyz")
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, CallbackStatus::Error);
        assert!(outcome.message.contains("invalid OAuth state"));
        assert_eq!(outcome.navigate.path, "/settings");
        assert_eq!(outcome.navigate.delay_ms, 3_000);
        assert!(backend.exchanges.lock().is_empty());
    }

    #[tokio::test]
    async fn stored_provider_must_match_path_provider() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        let expires = Utc::now() + chrono::Duration::minutes(10);
        session
            .set("oauth_state_dropbox", "xyz".into(), expires)
            .unwrap();
        session
            .set("oauth_provider_dropbox", "google_drive".into(), expires)
            .unwrap();

        let outcome = flow
            .callback("dropbox", "code=abc&state=xyz")
            .run(&CancellationToken::new())
            .await;

        assert!(matches!(outcome.error, Some(AppError::StateMismatch)));
        assert!(backend.exchanges.lock().is_empty());
    }

    #[tokio::test]
    async fn replayed_callback_fails_state_check() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "dropbox", "xyz");
        let cancel = CancellationToken::new();

        let first = flow.callback("dropbox", "code=abc&state=xyz").run(&cancel).await;
        let second = flow.callback("dropbox", "code=abc&state=xyz").run(&cancel).await;

        assert!(first.is_success());
        assert!(matches!(second.error, Some(AppError::StateMismatch)));
        assert_eq!(backend.exchanges.lock().len(), 1);
    }

    #[tokio::test]
    async fn provider_denial_is_reported_and_consumes_state() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "onedrive", "xyz");

        let outcome = flow
            .callback(
                "onedrive",
                "error=access_denied&error_description=User%20cancelled&state=xyz",
            )
            .run(&CancellationToken::new())
            .await;

        assert!(matches!(outcome.error, Some(AppError::ProviderDenied(_))));
        assert!(outcome.message.contains("User cancelled"));
        assert!(session.is_empty());
        assert!(backend.exchanges.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_parameters_are_malformed() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "dropbox", "xyz");

        let outcome = flow
            .callback("dropbox", "state=xyz&code=")
            .run(&CancellationToken::new())
            .await;
        assert!(matches!(outcome.error, Some(AppError::MalformedCallback(_))));

        let outcome = flow
            .callback("icloud", "code=abc&state=xyz")
            .run(&CancellationToken::new())
            .await;
        assert!(matches!(outcome.error, Some(AppError::MalformedCallback(_))));
        assert!(backend.exchanges.lock().is_empty());
    }

    #[tokio::test]
    async fn exchange_failure_is_terminal_without_retry() {
        let backend = Arc::new(RecordingBackend {
            fail_exchange: true,
            ..Default::default()
        });
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "google_drive", "xyz");

        let outcome = flow
            .callback("google_drive", "code=abc&state=xyz")
            .run(&CancellationToken::new())
            .await;

        assert_eq!(outcome.status, CallbackStatus::Error);
        assert!(matches!(outcome.error, Some(AppError::ExchangeFailed(_))));
        assert!(outcome.message.contains("invalid_grant"));
        assert_eq!(backend.exchanges.lock().len(), 1);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn cancelled_scope_skips_exchange_result() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "dropbox", "xyz");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = flow.callback("dropbox", "code=abc&state=xyz").run(&cancel).await;

        assert!(matches!(outcome.error, Some(AppError::Cancelled)));
        assert!(backend.exchanges.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelling_during_exchange_drops_result() {
        let backend = Arc::new(RecordingBackend {
            stall_exchange: true,
            ..Default::default()
        });
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "dropbox", "xyz");
        let cancel = CancellationToken::new();

        let attempt = flow.callback("dropbox", "code=abc&state=xyz");
        let (outcome, ()) = tokio::join!(attempt.run(&cancel), async {
            backend.entered.notified().await;
            cancel.cancel();
        });

        assert_eq!(outcome.status, CallbackStatus::Error);
        assert!(matches!(outcome.error, Some(AppError::Cancelled)));
        assert_eq!(backend.exchanges.lock().len(), 1);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn expired_state_never_exchanges() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        let expired = Utc::now() - chrono::Duration::seconds(1);
        session
            .set("oauth_state_dropbox", "xyz".into(), expired)
            .unwrap();
        session
            .set("oauth_provider_dropbox", "dropbox".into(), expired)
            .unwrap();

        let outcome = flow
            .callback("dropbox", "code=abc&state=xyz")
            .run(&CancellationToken::new())
            .await;

        assert!(matches!(outcome.error, Some(AppError::StateMismatch)));
        assert!(backend.exchanges.lock().is_empty());
    }

    #[tokio::test]
    async fn provider_aliases_are_not_callback_paths() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());
        seed(&session, "google_drive", "xyz");

        let outcome = flow
            .callback("google", "code=abc&state=xyz")
            .run(&CancellationToken::new())
            .await;

        assert!(matches!(outcome.error, Some(AppError::MalformedCallback(_))));
        assert!(backend.exchanges.lock().is_empty());
        assert_eq!(session.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callbacks_spend_state_once() {
        let backend = Arc::new(RecordingBackend::default());
        let inner = MemorySessionStore::new();
        seed(&inner, "dropbox", "xyz");
        let flow = flow_over(
            backend.clone(),
            Arc::new(GatedSession {
                inner: inner.clone(),
                gate: Barrier::new(2),
            }),
        );

        let tasks = (0..2)
            .map(|_| {
                let flow = flow.clone();
                tokio::spawn(async move {
                    flow.callback("dropbox", "code=abc&state=xyz")
                        .run(&CancellationToken::new())
                        .await
                })
            })
            .collect::<Vec<_>>();
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o.error, Some(AppError::StateMismatch))));
        assert_eq!(backend.exchanges.lock().len(), 1);
        assert!(inner.is_empty());
    }

    #[tokio::test]
    async fn begin_link_issues_state_for_callback() {
        let backend = Arc::new(RecordingBackend::default());
        let (flow, session) = flow_with(backend.clone());

        let start = flow.begin_link(Provider::Dropbox).await.unwrap();
        assert_eq!(
            start.redirect_uri,
            "http://localhost:3000/auth/dropbox/callback"
        );
        let state = session.get("oauth_state_dropbox").unwrap().unwrap();
        assert!(start.authorization_url.contains(&state));

        let outcome = flow
            .callback("dropbox", &format!("code=abc&state={state}"))
            .run(&CancellationToken::new())
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn begin_link_failure_discards_state() {
        let backend = Arc::new(RecordingBackend {
            fail_authorize: true,
            ..Default::default()
        });
        let (flow, session) = flow_with(backend);

        assert!(flow.begin_link(Provider::OneDrive).await.is_err());
        assert!(session.is_empty());
    }

    #[test]
    fn parses_callback_urls() {
        let request =
            CallbackRequest::parse("/auth/dropbox/callback?code=abc&state=xyz").unwrap();
        assert_eq!(request.provider, "dropbox");
        assert_eq!(request.query.code.as_deref(), Some("abc"));
        assert_eq!(request.query.state.as_deref(), Some("xyz"));
        assert_eq!(request.query.error, None);

        let absolute = CallbackRequest::parse(
            "https://app.example.com/auth/google_drive/callback?error=access_denied",
        )
        .unwrap();
        assert_eq!(absolute.provider, "google_drive");
        assert_eq!(absolute.query.error.as_deref(), Some("access_denied"));

        assert!(matches!(
            CallbackRequest::parse("/oauth/dropbox?code=abc"),
            Err(AppError::MalformedCallback(_))
        ));
    }
}
