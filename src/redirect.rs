use std::net::{Ipv4Addr, Ipv6Addr};

use reqwest::Url;

use crate::errors::{AppError, AppResult};
use crate::provider::Provider;

#[derive(Debug, Clone)]
pub struct RedirectBuilder {
    origin: Url,
}

impl RedirectBuilder {
    pub fn new(origin: &str, canonical_loopback_host: &str) -> AppResult<Self> {
        let mut origin = Url::parse(origin)
            .map_err(|err| AppError::Config(format!("invalid app origin {origin}: {err}")))?;
        if origin.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "app origin must be an absolute http(s) URL: {origin}"
            )));
        }
        if origin.host_str().map(is_loopback_host).unwrap_or(false) {
            origin.set_host(Some(canonical_loopback_host)).map_err(|err| {
                AppError::Config(format!(
                    "invalid canonical loopback host {canonical_loopback_host}: {err}"
                ))
            })?;
        }
        origin.set_path("");
        origin.set_query(None);
        origin.set_fragment(None);
        Ok(Self { origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn callback_uri(&self, provider: Provider) -> String {
        let mut url = self.origin.clone();
        url.set_path(&provider.callback_path());
        url.to_string()
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return ip.is_loopback();
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<Ipv6Addr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
