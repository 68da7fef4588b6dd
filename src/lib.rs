mod backend;
mod browser;
mod config;
mod db;
mod errors;
mod history;
mod oauth;
mod provider;
mod redirect;
mod session;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use backend::{CloudBackend, CloudFile, CodeExchange, FilePage, HttpCloudBackend};
pub use browser::{BrowserView, CloudFileBrowser, ImportOutcome};
pub use config::{AppConfig, PublicAppConfig};
pub use db::{bootstrap, DatabaseBootstrap, DatabaseContext};
pub use errors::{AppError, AppResult};
pub use history::{CachedComment, ConversationMessage, HistoryCache, HistoryKind};
pub use oauth::{
    CallbackAttempt, CallbackOutcome, CallbackQuery, CallbackRequest, CallbackStatus, LinkStart,
    NavigationConfig, NavigationTarget, OAuthFlow,
};
pub use provider::Provider;
pub use redirect::RedirectBuilder;
pub use session::{MemorySessionStore, OAuthStateStore, PendingState, SessionStore, StoredState};

pub struct CloudLinkApp {
    config: AppConfig,
    backend: Arc<dyn CloudBackend>,
    oauth: OAuthFlow,
    history: HistoryCache,
    cache_recovered: bool,
}

impl CloudLinkApp {
    pub fn initialize<P: AsRef<Path>>(config: AppConfig, data_dir: P) -> AppResult<Self> {
        init_tracing();
        let backend: Arc<dyn CloudBackend> = Arc::new(HttpCloudBackend::new(&config)?);
        let session: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            recovered,
        } = bootstrap(data_dir, &config.database_file_name)?;
        info!(
            target: "cloud_link",
            cache = %path.display(),
            recovered,
            "cloud link initialized"
        );
        Self::with_parts(config, backend, session, connection, recovered)
    }

    pub fn with_parts(
        config: AppConfig,
        backend: Arc<dyn CloudBackend>,
        session: Arc<dyn SessionStore>,
        connection: rusqlite::Connection,
        cache_recovered: bool,
    ) -> AppResult<Self> {
        let states = OAuthStateStore::new(session, config.oauth_state_ttl_secs);
        let redirects = RedirectBuilder::new(&config.app_origin, &config.loopback_host)?;
        let oauth = OAuthFlow::new(
            Arc::clone(&backend),
            states,
            redirects,
            NavigationConfig::from_config(&config),
        );
        let history = HistoryCache::new(
            Arc::new(Mutex::new(connection)),
            config.history_max_entries,
        );
        Ok(Self {
            config,
            backend,
            oauth,
            history,
            cache_recovered,
        })
    }

    pub fn config(&self) -> PublicAppConfig {
        self.config.public_profile()
    }

    pub fn cache_recovered(&self) -> bool {
        self.cache_recovered
    }

    pub async fn begin_link(&self, provider: Provider) -> AppResult<LinkStart> {
        self.oauth.begin_link(provider).await
    }

    pub async fn handle_callback(&self, url: &str, cancel: &CancellationToken) -> CallbackOutcome {
        match CallbackRequest::parse(url) {
            Ok(request) => self.oauth.callback_from_request(request).run(cancel).await,
            Err(err) => self.oauth.failed(String::new(), err),
        }
    }

    pub fn oauth(&self) -> &OAuthFlow {
        &self.oauth
    }

    pub fn file_browser(&self, provider: Provider) -> CloudFileBrowser {
        CloudFileBrowser::new(provider, Arc::clone(&self.backend))
    }

    pub fn history(&self) -> &HistoryCache {
        &self.history
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,cloud_link_lib=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
