use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::provider::Provider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub size: Option<u64>,
}

impl CloudFile {
    pub fn file(id: impl Into<String>, name: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_folder: false,
            size,
        }
    }

    pub fn folder(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_folder: true,
            size: None,
        }
    }

    pub fn is_importable(&self) -> bool {
        !self.is_folder
    }

    fn normalized(mut self) -> Self {
        if self.is_folder {
            self.size = None;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<CloudFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl FilePage {
    pub fn has_more(&self) -> bool {
        self.next_page_token.is_some()
    }

    fn normalized(self) -> Self {
        Self {
            files: self.files.into_iter().map(CloudFile::normalized).collect(),
            next_page_token: self.next_page_token.filter(|token| !token.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeExchange {
    pub code: String,
    pub state: String,
    pub redirect_uri: String,
}

#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn authorization_url(
        &self,
        provider: Provider,
        state: &str,
        redirect_uri: &str,
    ) -> AppResult<String>;

    async fn exchange_code(&self, provider: Provider, exchange: &CodeExchange) -> AppResult<()>;

    async fn list_files(
        &self,
        provider: Provider,
        folder_id: Option<&str>,
        page_token: Option<&str>,
    ) -> AppResult<FilePage>;

    async fn import_file(
        &self,
        provider: Provider,
        file_id: &str,
        project_id: Option<&str>,
    ) -> AppResult<()>;
}

#[derive(Clone)]
pub struct HttpCloudBackend {
    http: Client,
    base_url: Url,
    token: Option<SecretString>,
}

#[derive(Deserialize)]
struct AuthorizationUrlResponse {
    authorization_url: String,
}

#[derive(Serialize)]
struct ImportRequest<'a> {
    file_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
}

impl HttpCloudBackend {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let base_url = Url::parse(config.api_base_url.trim_end_matches('/')).map_err(|err| {
            AppError::Config(format!(
                "invalid backend base URL {}: {err}",
                config.api_base_url
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "backend base URL must be absolute: {}",
                config.api_base_url
            )));
        }
        let http = Client::builder()
            .user_agent(concat!("cloud-link/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url,
            token: config.api_token.clone(),
        })
    }

    fn endpoint(&self, provider: Provider, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| AppError::Config("invalid backend base URL".into()))?;
            path.pop_if_empty().push("cloud").push(provider.as_slug());
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> AppResult<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AppError::Api {
            status: status.as_u16(),
            message: extract_error_message(&body)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
        })
    }
}

#[async_trait]
impl CloudBackend for HttpCloudBackend {
    async fn authorization_url(
        &self,
        provider: Provider,
        state: &str,
        redirect_uri: &str,
    ) -> AppResult<String> {
        let url = self.endpoint(provider, &["authorize"])?;
        let request = self
            .http
            .get(url)
            .query(&[("state", state), ("redirect_uri", redirect_uri)]);
        let body: AuthorizationUrlResponse = self.send(request).await?.json().await?;
        Ok(body.authorization_url)
    }

    async fn exchange_code(&self, provider: Provider, exchange: &CodeExchange) -> AppResult<()> {
        let url = self.endpoint(provider, &["oauth", "exchange"])?;
        self.send(self.http.post(url).json(exchange)).await?;
        debug!(
            target: "cloud_backend",
            provider = provider.as_slug(),
            "authorization code exchanged"
        );
        Ok(())
    }

    async fn list_files(
        &self,
        provider: Provider,
        folder_id: Option<&str>,
        page_token: Option<&str>,
    ) -> AppResult<FilePage> {
        let mut url = self.endpoint(provider, &["files"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(folder_id) = folder_id {
                query.append_pair("folder_id", folder_id);
            }
            if let Some(page_token) = page_token {
                query.append_pair("page_token", page_token);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        let page: FilePage = self.send(self.http.get(url)).await?.json().await?;
        Ok(page.normalized())
    }

    async fn import_file(
        &self,
        provider: Provider,
        file_id: &str,
        project_id: Option<&str>,
    ) -> AppResult<()> {
        let url = self.endpoint(provider, &["import"])?;
        let payload = ImportRequest {
            file_id,
            project_id,
        };
        self.send(self.http.post(url).json(&payload)).await?;
        Ok(())
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => ["detail", "error", "message"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .or_else(|| Some(trimmed.to_string())),
        Err(_) => Some(trimmed.chars().take(200).collect()),
    }
}
