use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    GoogleDrive,
    Dropbox,
    #[serde(rename = "onedrive")]
    OneDrive,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::GoogleDrive, Provider::Dropbox, Provider::OneDrive];

    pub fn as_slug(&self) -> &'static str {
        match self {
            Provider::GoogleDrive => "google_drive",
            Provider::Dropbox => "dropbox",
            Provider::OneDrive => "onedrive",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::GoogleDrive => "Google Drive",
            Provider::Dropbox => "Dropbox",
            Provider::OneDrive => "OneDrive",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google_drive" | "google-drive" | "google" => Ok(Provider::GoogleDrive),
            "dropbox" => Ok(Provider::Dropbox),
            "onedrive" | "one_drive" => Ok(Provider::OneDrive),
            _ => Err(AppError::UnknownProvider(value.to_string())),
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Provider::ALL
            .into_iter()
            .find(|provider| provider.as_slug() == slug)
    }

    pub fn callback_path(&self) -> String {
        format!("/auth/{}/callback", self.as_slug())
    }

    pub(crate) fn state_key(&self) -> String {
        format!("oauth_state_{}", self.as_slug())
    }

    pub(crate) fn provider_key(&self) -> String {
        format!("oauth_provider_{}", self.as_slug())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_slug())
    }
}

impl FromStr for Provider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::parse(s)
    }
}
