//! reqwest-backed refinORE client.
//!
//! Base URL: `https://automine.refinore.com/api` (configurable)
//! Auth: `x-api-key` for `rsk_*` keys, `Authorization: Bearer` otherwise.
//! Selected once at construction.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::wire::{self, Envelope};
use super::{Endpoint, EventStream, MiningApi, RawEvent, RetryPolicy, SseDecoder};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::types::{
    BalanceVector, Credentials, ReloadRequest, RoundResult, RoundSnapshot, SessionConfig,
    SessionHandle, SessionSnapshot, SessionSummary, StopSummary,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://automine.refinore.com/api";

const USER_AGENT: &str = concat!("automine/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest response body excerpt that ever reaches the logs.
const MAX_LOGGED_BODY: usize = 512;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RefinoreClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    auth_header: (HeaderName, HeaderValue),
    retry: RetryPolicy,
    explicit_tiles_field: String,
}

impl RefinoreClient {
    pub fn new(base_url: &str, credentials: Credentials, retry: RetryPolicy) -> Result<Self> {
        // No client-wide timeout: it would cut the SSE stream. Each request
        // sets its own.
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client for refinORE")?;

        let (name, value) = credentials.header();
        let mut value =
            HeaderValue::from_str(&value).context("Credential is not a valid header value")?;
        value.set_sensitive(true);
        let auth_header = (HeaderName::from_static(name), value);
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            auth_header,
            retry,
            explicit_tiles_field: "tile_ids".to_string(),
        })
    }

    pub fn from_config(
        api: &ApiConfig,
        credentials: Credentials,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self::new(&api.base_url, credentials, retry)?
            .with_explicit_tiles_field(&api.explicit_tiles_field))
    }

    /// Field name under which `/mining/start-strategy` expects tile ids.
    pub fn with_explicit_tiles_field(mut self, field: &str) -> Self {
        self.explicit_tiles_field = field.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    // -- Internal helpers ------------------------------------------------

    /// One HTTP exchange. Returns the body of a 2xx response.
    async fn send_once(
        &self,
        endpoint: Endpoint,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        request_id: Option<&str>,
    ) -> Result<String, ApiError> {
        let (name, value) = &self.auth_header;
        let mut req = self
            .http
            .request(endpoint.method(), self.url(endpoint))
            .header(name.clone(), value.clone())
            .timeout(self.retry.request_timeout);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(id) = request_id {
            req = req.header("x-request-id", id);
        }

        let resp = req.send().await.map_err(|e| self.network_error(endpoint, &e))?;
        let status = resp.status();
        if status.is_success() {
            return resp.text().await.map_err(|e| ApiError::Transient {
                endpoint,
                message: format!("reading body: {}", self.credentials.redact(&e.to_string())),
                sent: true,
            });
        }

        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(
            endpoint,
            status.as_u16(),
            retry_after,
            &self.scrub(&text),
        ))
    }

    /// Run `send_once` under the retry policy.
    ///
    /// Reads retry on `RateLimited`/`Transient`. Writes only retry when the
    /// failure proves the server did not act on the request.
    async fn call(
        &self,
        endpoint: Endpoint,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<String, ApiError> {
        let deadline = Instant::now() + self.retry.total_deadline;
        // Same id on every resend so the backend can collapse duplicates.
        let request_id = endpoint.is_write().then(|| Uuid::new_v4().to_string());
        let mut attempt: u32 = 0;

        loop {
            let err = match self
                .send_once(endpoint, query, body, request_id.as_deref())
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            attempt += 1;
            let may_retry = if endpoint.is_write() {
                err.is_safe_to_resend()
            } else {
                err.is_retryable()
            };
            if !may_retry || attempt >= self.retry.max_attempts {
                return Err(err);
            }

            let delay = self.retry.delay_for(attempt - 1, &err);
            if Instant::now() + delay > deadline {
                debug!(endpoint = %endpoint, attempt, "Retry deadline exhausted");
                return Err(err);
            }
            warn!(
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying refinORE call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// `call` followed by decoding into `T`.
    async fn call_json<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<T, ApiError> {
        let text = self.call(endpoint, query, body).await?;
        wire::decode::<T>(&text).map_err(|detail| {
            let excerpt = self.scrub(&text);
            warn!(
                endpoint = %endpoint,
                body = %excerpt,
                error = %detail,
                "Unexpected response shape"
            );
            ApiError::ProtocolMismatch { endpoint, detail }
        })
    }

    fn network_error(&self, endpoint: Endpoint, e: &reqwest::Error) -> ApiError {
        ApiError::Transient {
            endpoint,
            message: self.credentials.redact(&e.to_string()),
            // A connect or builder failure means nothing was written.
            sent: !(e.is_connect() || e.is_builder()),
        }
    }

    /// Redact the credential and cap the length of a body before logging.
    fn scrub(&self, text: &str) -> String {
        truncate(&self.credentials.redact(text), MAX_LOGGED_BODY)
    }

    async fn start_with(
        &self,
        endpoint: Endpoint,
        cfg: &SessionConfig,
        tiles: Option<&[u8]>,
    ) -> Result<SessionHandle, ApiError> {
        let body = wire::session_body(cfg, tiles, &self.explicit_tiles_field);
        let dto: Envelope<wire::HandleDto> = self.call_json(endpoint, &[], Some(&body)).await?;
        Ok(dto.into_inner().into())
    }
}

// ---------------------------------------------------------------------------
// MiningApi implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl MiningApi for RefinoreClient {
    async fn start(&self, cfg: &SessionConfig) -> Result<SessionHandle, ApiError> {
        self.start_with(Endpoint::Start, cfg, None).await
    }

    async fn start_explicit(
        &self,
        cfg: &SessionConfig,
        tiles: &[u8],
    ) -> Result<SessionHandle, ApiError> {
        self.start_with(Endpoint::StartStrategy, cfg, Some(tiles)).await
    }

    async fn stop(&self) -> Result<StopSummary, ApiError> {
        let body = serde_json::json!({});
        let dto: Envelope<wire::StopDto> = self.call_json(Endpoint::Stop, &[], Some(&body)).await?;
        Ok(dto.into_inner().into())
    }

    async fn reload(&self, req: &ReloadRequest) -> Result<SessionHandle, ApiError> {
        let body =
            wire::session_body(&req.config, req.tiles.tile_ids(), &self.explicit_tiles_field);
        let dto: Envelope<wire::HandleDto> =
            self.call_json(Endpoint::Reload, &[], Some(&body)).await?;
        Ok(dto.into_inner().into())
    }

    async fn current_session(&self) -> Result<SessionSnapshot, ApiError> {
        let dto: Envelope<wire::SessionDto> = self.call_json(Endpoint::Session, &[], None).await?;
        Ok(dto.into_inner().into())
    }

    async fn current_round(&self) -> Result<RoundSnapshot, ApiError> {
        let dto: Envelope<wire::RoundDto> =
            self.call_json(Endpoint::CurrentRound, &[], None).await?;
        RoundSnapshot::try_from(dto.into_inner()).map_err(|detail| ApiError::ProtocolMismatch {
            endpoint: Endpoint::CurrentRound,
            detail,
        })
    }

    async fn session_rounds(&self, since: Option<u64>) -> Result<Vec<RoundResult>, ApiError> {
        let query: Vec<(&str, String)> =
            since.map(|s| ("since", s.to_string())).into_iter().collect();
        let dto: Envelope<Vec<wire::RoundResultDto>> =
            self.call_json(Endpoint::SessionRounds, &query, None).await?;
        let mut rounds: Vec<RoundResult> = dto.into_inner().into_iter().map(Into::into).collect();
        // The backend does not promise an order or that it honours `since`.
        if let Some(since) = since {
            rounds.retain(|r| r.round_number >= since);
        }
        rounds.sort_by_key(|r| r.round_number);
        Ok(rounds)
    }

    async fn balances(&self) -> Result<BalanceVector, ApiError> {
        let dto: Envelope<wire::BalanceDto> = self.call_json(Endpoint::Balance, &[], None).await?;
        Ok(dto.into_inner().into())
    }

    async fn history(&self, limit: u32) -> Result<Vec<SessionSummary>, ApiError> {
        let query = [("limit", limit.to_string())];
        let dto: Envelope<Vec<wire::HistoryDto>> =
            self.call_json(Endpoint::History, &query, None).await?;
        Ok(dto.into_inner().into_iter().map(Into::into).collect())
    }

    async fn events(&self) -> Result<EventStream, ApiError> {
        let endpoint = Endpoint::Events;
        let (name, value) = &self.auth_header;
        let resp = self
            .http
            .get(self.url(endpoint))
            .header(name.clone(), value.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| self.network_error(endpoint, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            let body = self.scrub(&text);
            return Err(classify_status(endpoint, status.as_u16(), retry_after, &body));
        }
        debug!("SSE stream connected");

        let state = (
            resp.bytes_stream().boxed(),
            SseDecoder::new(),
            VecDeque::<RawEvent>::new(),
        );
        let events = stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (bytes, decoder, pending)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        let err = ApiError::Transient {
                            endpoint: Endpoint::Events,
                            message: e.to_string(),
                            sent: true,
                        };
                        return Some((Err(err), (bytes, decoder, pending)));
                    }
                    None => return None,
                }
            }
        });
        Ok(events.boxed())
    }
}

// ---------------------------------------------------------------------------
// Classification helpers
// ---------------------------------------------------------------------------

/// Map a non-2xx status to an error kind.
pub fn classify_status(
    endpoint: Endpoint,
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> ApiError {
    match status {
        401 => ApiError::AuthExpired { endpoint },
        404 => ApiError::NotFound { endpoint },
        429 => ApiError::RateLimited {
            endpoint,
            retry_after,
        },
        500..=599 => ApiError::Transient {
            endpoint,
            message: format!("HTTP {status}: {body}"),
            sent: true,
        },
        _ => ApiError::Rejected {
            endpoint,
            status,
            message: body.to_string(),
        },
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}
