use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CloudBackend, CloudFile, FilePage};
use crate::errors::{AppError, AppResult};
use crate::provider::Provider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(CloudFile),
    NotSelected,
    AlreadyImporting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrowserView {
    pub is_open: bool,
    pub project_id: Option<String>,
    pub current_folder: Option<String>,
    pub can_go_back: bool,
    pub files: Vec<CloudFile>,
    pub has_more: bool,
    pub loading: bool,
    pub selected: Option<String>,
    pub importing: Vec<String>,
}

#[derive(Default)]
struct BrowserState {
    is_open: bool,
    session: u64,
    project_id: Option<String>,
    current_folder: Option<String>,
    ancestors: Vec<Option<String>>,
    files: Vec<CloudFile>,
    next_page_token: Option<String>,
    selected: Option<String>,
    importing: HashSet<String>,
    loading: bool,
    list_seq: u64,
    cancel: CancellationToken,
}

impl BrowserState {
    fn reset(&mut self) {
        self.cancel.cancel();
        self.is_open = false;
        self.session += 1;
        self.project_id = None;
        self.current_folder = None;
        self.ancestors.clear();
        self.files.clear();
        self.next_page_token = None;
        self.selected = None;
        self.importing.clear();
        self.loading = false;
    }
}

struct ListTicket {
    seq: u64,
    session: u64,
    folder: Option<String>,
    cursor: Option<String>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct CloudFileBrowser {
    provider: Provider,
    backend: Arc<dyn CloudBackend>,
    state: Arc<Mutex<BrowserState>>,
}

impl CloudFileBrowser {
    pub fn new(provider: Provider, backend: Arc<dyn CloudBackend>) -> Self {
        Self {
            provider,
            backend,
            state: Arc::new(Mutex::new(BrowserState::default())),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub async fn open(&self, project_id: Option<String>) -> AppResult<bool> {
        {
            let mut state = self.state.lock();
            state.reset();
            state.is_open = true;
            state.project_id = project_id;
            state.cancel = CancellationToken::new();
        }
        debug!(
            target: "cloud_browser",
            provider = self.provider.as_slug(),
            "browser opened"
        );
        self.refresh().await
    }

    pub fn close(&self) {
        self.state.lock().reset();
        debug!(
            target: "cloud_browser",
            provider = self.provider.as_slug(),
            "browser closed"
        );
    }

    pub fn view(&self) -> BrowserView {
        let state = self.state.lock();
        let mut importing = state.importing.iter().cloned().collect::<Vec<_>>();
        importing.sort();
        BrowserView {
            is_open: state.is_open,
            project_id: state.project_id.clone(),
            current_folder: state.current_folder.clone(),
            can_go_back: !state.ancestors.is_empty(),
            files: state.files.clone(),
            has_more: state.next_page_token.is_some(),
            loading: state.loading,
            selected: state.selected.clone(),
            importing,
        }
    }

    pub async fn refresh(&self) -> AppResult<bool> {
        let ticket = {
            let mut state = self.state.lock();
            if !state.is_open {
                return Ok(false);
            }
            Self::issue_ticket(&mut state, None)
        };
        self.run_listing(ticket).await
    }

    pub async fn load_more(&self) -> AppResult<bool> {
        let ticket = {
            let mut state = self.state.lock();
            if !state.is_open || state.loading {
                return Ok(false);
            }
            match state.next_page_token.clone() {
                Some(cursor) => Self::issue_ticket(&mut state, Some(cursor)),
                None => return Ok(false),
            }
        };
        self.run_listing(ticket).await
    }

    pub async fn enter(&self, entry: &CloudFile) -> AppResult<bool> {
        let ticket = {
            let mut state = self.state.lock();
            if !state.is_open || !entry.is_folder {
                return Ok(false);
            }
            let previous = state.current_folder.replace(entry.id.clone());
            state.ancestors.push(previous);
            state.next_page_token = None;
            state.selected = None;
            Self::issue_ticket(&mut state, None)
        };
        debug!(
            target: "cloud_browser",
            provider = self.provider.as_slug(),
            folder = %entry.id,
            "entering folder"
        );
        self.run_listing(ticket).await?;
        Ok(true)
    }

    pub async fn back(&self) -> AppResult<bool> {
        let ticket = {
            let mut state = self.state.lock();
            if !state.is_open {
                return Ok(false);
            }
            let parent = match state.ancestors.pop() {
                Some(parent) => parent,
                None => return Ok(false),
            };
            state.current_folder = parent;
            state.next_page_token = None;
            state.selected = None;
            Self::issue_ticket(&mut state, None)
        };
        self.run_listing(ticket).await?;
        Ok(true)
    }

    pub fn select(&self, entry: &CloudFile) -> Option<String> {
        let mut state = self.state.lock();
        if !state.is_open || !entry.is_importable() {
            return state.selected.clone();
        }
        if state.selected.as_deref() == Some(entry.id.as_str()) {
            state.selected = None;
        } else {
            state.selected = Some(entry.id.clone());
        }
        state.selected.clone()
    }

    pub async fn import(&self, entry: &CloudFile) -> AppResult<ImportOutcome> {
        let (session, project_id, cancel) = {
            let mut state = self.state.lock();
            if !state.is_open
                || !entry.is_importable()
                || state.selected.as_deref() != Some(entry.id.as_str())
            {
                return Ok(ImportOutcome::NotSelected);
            }
            if !state.importing.insert(entry.id.clone()) {
                return Ok(ImportOutcome::AlreadyImporting);
            }
            (state.session, state.project_id.clone(), state.cancel.clone())
        };

        info!(
            target: "cloud_browser",
            provider = self.provider.as_slug(),
            file_id = %entry.id,
            "importing file"
        );
        let result = cancellable(
            &cancel,
            self.backend
                .import_file(self.provider, &entry.id, project_id.as_deref()),
        )
        .await;

        let mut state = self.state.lock();
        if state.session != session {
            return Err(AppError::Cancelled);
        }
        state.importing.remove(&entry.id);
        match result {
            Ok(()) => {
                state.reset();
                info!(
                    target: "cloud_browser",
                    provider = self.provider.as_slug(),
                    file_id = %entry.id,
                    "file imported"
                );
                Ok(ImportOutcome::Imported(entry.clone()))
            }
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(err) => {
                warn!(
                    target: "cloud_browser",
                    provider = self.provider.as_slug(),
                    file_id = %entry.id,
                    error = %err,
                    "import failed"
                );
                Err(AppError::ImportFailed(err.to_string()))
            }
        }
    }

    fn issue_ticket(state: &mut BrowserState, cursor: Option<String>) -> ListTicket {
        state.list_seq += 1;
        state.loading = true;
        ListTicket {
            seq: state.list_seq,
            session: state.session,
            folder: state.current_folder.clone(),
            cursor,
            cancel: state.cancel.clone(),
        }
    }

    async fn run_listing(&self, ticket: ListTicket) -> AppResult<bool> {
        let result = cancellable(
            &ticket.cancel,
            self.backend.list_files(
                self.provider,
                ticket.folder.as_deref(),
                ticket.cursor.as_deref(),
            ),
        )
        .await;

        let mut state = self.state.lock();
        if state.session != ticket.session || state.list_seq != ticket.seq {
            debug!(
                target: "cloud_browser",
                provider = self.provider.as_slug(),
                seq = ticket.seq,
                latest = state.list_seq,
                "dropping superseded listing response"
            );
            return Ok(false);
        }
        state.loading = false;

        match result {
            Ok(page) => {
                apply_page(&mut state, page, ticket.cursor.is_some());
                Ok(true)
            }
            Err(AppError::Cancelled) => Ok(false),
            Err(err) => {
                warn!(
                    target: "cloud_browser",
                    provider = self.provider.as_slug(),
                    error = %err,
                    "listing failed"
                );
                Err(AppError::ListFailed(err.to_string()))
            }
        }
    }
}

fn apply_page(state: &mut BrowserState, page: FilePage, append: bool) {
    let FilePage {
        files,
        next_page_token,
    } = page;
    // An empty follow-up page that still carries a cursor ends pagination.
    let next_page_token = if append && files.is_empty() && next_page_token.is_some() {
        warn!(
            target: "cloud_browser",
            "empty page returned with a continuation token; treating listing as complete"
        );
        None
    } else {
        next_page_token
    };
    if append {
        state.files.extend(files);
    } else {
        state.files = files;
    }
    state.next_page_token = next_page_token;
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        result = request => result,
    }
}
