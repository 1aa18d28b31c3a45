//! refinORE API transport.
//!
//! Defines the `MiningApi` trait the rest of the crate talks to, and the
//! reqwest-backed `RefinoreClient` that implements it:
//! - request/response calls with status classification and retry/backoff
//! - the `/sse` event stream, decoded into [`RawEvent`]s
//!
//! The controller and ingestor only ever see `dyn MiningApi`, which lets the
//! tests swap in scripted doubles.

pub mod client;
pub mod retry;
pub mod sse;
pub mod wire;

pub use client::RefinoreClient;
pub use retry::RetryPolicy;
pub use sse::{RawEvent, SseDecoder};

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Method;
use serde::Serialize;

use crate::error::ApiError;
use crate::types::{
    BalanceVector, ReloadRequest, RoundResult, RoundSnapshot, SessionConfig, SessionHandle,
    SessionSnapshot, SessionSummary, StopSummary,
};

/// Lazy, non-restartable SSE event sequence.
pub type EventStream = BoxStream<'static, Result<RawEvent, ApiError>>;

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Every backend endpoint the controller consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endpoint {
    Start,
    StartStrategy,
    Stop,
    Reload,
    Session,
    SessionRounds,
    History,
    CurrentRound,
    Balance,
    Events,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Start => "/mining/start",
            Endpoint::StartStrategy => "/mining/start-strategy",
            Endpoint::Stop => "/mining/stop",
            Endpoint::Reload => "/mining/reload-session",
            Endpoint::Session => "/mining/session",
            Endpoint::SessionRounds => "/mining/session-rounds",
            Endpoint::History => "/mining/history",
            Endpoint::CurrentRound => "/rounds/current",
            Endpoint::Balance => "/wallet/balance",
            Endpoint::Events => "/sse",
        }
    }

    pub fn method(&self) -> Method {
        if self.is_write() {
            Method::POST
        } else {
            Method::GET
        }
    }

    /// Session-mutating calls. These are never resent after an ambiguous
    /// failure without reconciling through `current_session`.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Endpoint::Start | Endpoint::StartStrategy | Endpoint::Stop | Endpoint::Reload
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}

// ---------------------------------------------------------------------------
// MiningApi
// ---------------------------------------------------------------------------

/// Abstraction over the refinORE backend.
///
/// Reads retry internally under the client's [`RetryPolicy`]. Writes
/// (`start`, `start_explicit`, `stop`, `reload`) are only resent when the
/// request provably did not reach the server; otherwise the error surfaces
/// and the caller reconciles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MiningApi: Send + Sync {
    /// Begin a session where the backend picks tiles (or random mode).
    async fn start(&self, cfg: &SessionConfig) -> Result<SessionHandle, ApiError>;

    /// Begin a session pinned to `tiles`.
    async fn start_explicit(
        &self,
        cfg: &SessionConfig,
        tiles: &[u8],
    ) -> Result<SessionHandle, ApiError>;

    async fn stop(&self) -> Result<StopSummary, ApiError>;

    async fn reload(&self, req: &ReloadRequest) -> Result<SessionHandle, ApiError>;

    /// The backend's active session. `NotFound` when there is none.
    async fn current_session(&self) -> Result<SessionSnapshot, ApiError>;

    async fn current_round(&self) -> Result<RoundSnapshot, ApiError>;

    /// Finalized rounds of the current session, optionally only those with
    /// `round_number >= since`, ascending.
    async fn session_rounds(&self, since: Option<u64>) -> Result<Vec<RoundResult>, ApiError>;

    async fn balances(&self) -> Result<BalanceVector, ApiError>;

    async fn history(&self, limit: u32) -> Result<Vec<SessionSummary>, ApiError>;

    /// Open the SSE stream. Connection failures are returned here; failures
    /// after the stream is established arrive as stream items.
    async fn events(&self) -> Result<EventStream, ApiError>;
}
