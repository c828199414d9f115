//! Retrying HTTP client and pagination for the WHOOP API.

use async_stream::try_stream;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::auth::TokenManager;
use crate::error::{IngestError, Result};
use crate::source::RecordStream;

/// The API rejects page sizes above this.
pub const MAX_PAGE_SIZE: u32 = 25;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

pub struct WhoopClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl WhoopClient {
    pub fn new(base_url: String, tokens: Arc<TokenManager>, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            retry,
        }
    }

    /// Issue one API request with retry.
    ///
    /// 429 and 5xx responses are retried with exponential backoff (a
    /// parseable `Retry-After` overrides the computed delay for 429).
    /// A 401 triggers exactly one forced token refresh before the request
    /// is retried; a second 401 is surfaced as an API error. Any other
    /// non-2xx status fails immediately.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut delay = self.retry.base_delay;
        let mut refreshed = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let token = self.tokens.get_access_token().await?;
            let resp = self
                .http
                .request(method.clone(), &url)
                .query(params)
                .bearer_auth(&token)
                .send()
                .await?;
            let status = resp.status();

            if status.is_success() {
                let body = resp.text().await?;
                if body.trim().is_empty() {
                    return Ok(Value::Object(Default::default()));
                }
                return Ok(serde_json::from_str(&body)?);
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                tracing::info!(path, "401 from API, forcing token refresh");
                self.tokens.force_refresh().await?;
                refreshed = true;
                // The single post-refresh retry does not count against the
                // backoff budget.
                attempt -= 1;
                continue;
            }

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt < self.retry.max_attempts {
                let wait = if status == StatusCode::TOO_MANY_REQUESTS {
                    retry_after(&resp).unwrap_or(delay)
                } else {
                    delay
                };
                tracing::warn!(
                    path,
                    status = status.as_u16(),
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "retrying API request"
                );
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(self.retry.max_delay);
                continue;
            }

            if retryable {
                return Err(IngestError::RequestFailed {
                    method: method.to_string(),
                    path: path.to_string(),
                    attempts: self.retry.max_attempts,
                });
            }

            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::Api {
                status: status.as_u16(),
                body,
            });
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, &[]).await
    }

    /// Stream every record of a paginated collection, following the
    /// continuation token until the API stops returning one.
    pub fn fetch_paginated<'a>(
        &'a self,
        path: &'a str,
        start: Option<String>,
        end: Option<String>,
        page_size: u32,
    ) -> RecordStream<'a> {
        Box::pin(try_stream! {
            let limit = page_size.min(MAX_PAGE_SIZE);
            let mut next_token: Option<String> = None;

            loop {
                let mut params: Vec<(String, String)> =
                    vec![("limit".to_string(), limit.to_string())];
                if let Some(s) = &start {
                    params.push(("start".to_string(), s.clone()));
                }
                if let Some(e) = &end {
                    params.push(("end".to_string(), e.clone()));
                }
                if let Some(t) = &next_token {
                    params.push(("nextToken".to_string(), t.clone()));
                }

                let page = self.request(Method::GET, path, &params).await?;

                if let Some(records) = page.get("records").and_then(Value::as_array) {
                    for record in records {
                        yield record.clone();
                    }
                }

                next_token = page
                    .get("next_token")
                    .or_else(|| page.get("nextToken"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if next_token.is_none() {
                    break;
                }
            }
        })
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
