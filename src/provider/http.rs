//! HTTP plumbing shared by the provider backends

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::pacing::RateLimitBudget;
use crate::provider::ProviderError;

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build a client with our user agent and an overall request timeout
pub fn client(timeout: Duration) -> Result<Client> {
    let client = Client::builder().user_agent(USER_AGENT).timeout(timeout).build()?;
    Ok(client)
}

/// Raw response after the transport succeeded
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn budget(&self) -> Option<RateLimitBudget> {
        parse_budget(&self.headers)
    }

    pub fn json<T: DeserializeOwned>(&self, what: &str) -> std::result::Result<T, ProviderError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ProviderError::transport(format!("Unexpected response for {}: {}", what, e)))
    }
}

/// Send a request and read the whole body
pub async fn send(request: RequestBuilder) -> std::result::Result<RawResponse, ProviderError> {
    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(transport)?;
    Ok(RawResponse { status, headers, body })
}

pub fn transport(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::transport("request timed out")
    } else if error.is_connect() {
        ProviderError::transport(format!("could not connect: {}", error))
    } else {
        ProviderError::transport(error.to_string())
    }
}

/// `base` with each segment appended and percent-encoded
pub fn url(base: &str, segments: &[&str]) -> std::result::Result<Url, ProviderError> {
    let mut url = Url::parse(base).map_err(|e| ProviderError::transport(format!("Invalid URL {}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| ProviderError::transport(format!("URL cannot take a path: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    header_str(headers, name)?.parse().ok()
}

/// Budget from `x-ratelimit-*` headers; all three must be present
pub fn parse_budget(headers: &HeaderMap) -> Option<RateLimitBudget> {
    let limit = header_i64(headers, "x-ratelimit-limit")?;
    let remaining = header_i64(headers, "x-ratelimit-remaining")?;
    let reset_at = DateTime::from_timestamp(header_i64(headers, "x-ratelimit-reset")?, 0)?;
    Some(RateLimitBudget {
        remaining,
        limit,
        reset_at,
    })
}

/// Reset time from `x-ratelimit-reset` (epoch seconds) or `retry-after` (seconds)
pub fn parse_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    if let Some(epoch) = header_i64(headers, "x-ratelimit-reset") {
        return DateTime::from_timestamp(epoch, 0);
    }
    let seconds = header_i64(headers, "retry-after")?;
    Some(Utc::now() + TimeDelta::seconds(seconds))
}

/// Rate limit error carrying whatever the headers told us
pub fn rate_limited(headers: &HeaderMap) -> ProviderError {
    ProviderError::RateLimited {
        reset_at: parse_reset(headers),
        budget: parse_budget(headers),
    }
}

/// True when the headers say the budget is spent
pub fn budget_exhausted(headers: &HeaderMap) -> bool {
    header_i64(headers, "x-ratelimit-remaining") == Some(0)
}
