use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

/// How a request proves who it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth<'a> {
    None,
    /// Sent as the `key` query parameter.
    ApiKeyQuery(&'a str),
    Bearer(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The outbound HTTP calls the engine needs. Transport failures (connect,
/// timeout, body read) are errors; any HTTP status is a reply.
pub trait HttpTransport: Send + Sync {
    fn post_json(
        &self,
        url: &str,
        auth: Auth<'_>,
        payload: &Value,
        timeout: Duration,
    ) -> Result<HttpReply>;

    fn get(&self, url: &str, auth: Auth<'_>, timeout: Duration) -> Result<HttpReply>;
}

pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for ReqwestTransport {
    fn post_json(
        &self,
        url: &str,
        auth: Auth<'_>,
        payload: &Value,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let request = apply_auth(self.http.post(url), auth)
            .timeout(timeout)
            .json(payload);
        read_reply(url, request.send())
    }

    fn get(&self, url: &str, auth: Auth<'_>, timeout: Duration) -> Result<HttpReply> {
        let request = apply_auth(self.http.get(url), auth).timeout(timeout);
        read_reply(url, request.send())
    }
}

fn apply_auth(
    builder: reqwest::blocking::RequestBuilder,
    auth: Auth<'_>,
) -> reqwest::blocking::RequestBuilder {
    match auth {
        Auth::None => builder,
        Auth::ApiKeyQuery(key) => builder.query(&[("key", key)]),
        Auth::Bearer(token) => builder.bearer_auth(token),
    }
}

// reqwest errors embed the full URL, query string included, so the URL is
// stripped before the error leaves this module.
fn read_reply(
    url: &str,
    sent: reqwest::Result<reqwest::blocking::Response>,
) -> Result<HttpReply> {
    let response = sent
        .map_err(|err| anyhow::Error::new(err.without_url()))
        .with_context(|| format!("request failed ({url})"))?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response
        .bytes()
        .map_err(|err| anyhow::Error::new(err.without_url()))
        .with_context(|| format!("response body read failed ({url})"))?
        .to_vec();
    Ok(HttpReply {
        status,
        content_type,
        body,
    })
}

/// Waits between retries and polls.
pub trait Pause: Send + Sync {
    fn pause(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
