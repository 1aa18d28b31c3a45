//! Scripted refinORE backend for integration testing.
//!
//! Implements `MiningApi` entirely in memory. Tests script the live round,
//! the finalized results and the SSE connections, then inspect the calls
//! the controller and ingestor made.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use automine::error::ApiError;
use automine::transport::{Endpoint, EventStream, MiningApi, RawEvent};
use automine::types::*;

/// One call received by the double.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start(SessionConfig),
    StartExplicit(Vec<u8>),
    Stop,
    Reload(TileChoice),
    CurrentSession,
    CurrentRound,
    SessionRounds(Option<u64>),
    Balances,
    History(u32),
    Events,
}

impl Call {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Call::Start(_) | Call::StartExplicit(_) | Call::Stop | Call::Reload(_)
        )
    }
}

struct Inner {
    session: Option<SessionSnapshot>,
    /// Answers to `current_round`, the last one repeats.
    rounds: VecDeque<RoundSnapshot>,
    results: Vec<RoundResult>,
    /// One entry per SSE connection. Once exhausted the stream stays open
    /// and silent.
    streams: VecDeque<Vec<RawEvent>>,
    balances: BalanceVector,
    fail: Option<fn(Endpoint) -> ApiError>,
    /// Calls to these endpoints are recorded and then never answered.
    stalled: Vec<Endpoint>,
    calls: Vec<Call>,
    next_id: u32,
}

pub struct ScriptedApi {
    inner: Mutex<Inner>,
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedApi {
    /// A backend with no session, 10 SOL in the wallet and nothing scripted.
    pub fn new() -> Self {
        let mut balances = BalanceVector::default();
        balances.amounts.insert(MiningToken::Sol, dec!(10));
        Self {
            inner: Mutex::new(Inner {
                session: None,
                rounds: VecDeque::new(),
                results: Vec::new(),
                streams: VecDeque::new(),
                balances,
                fail: None,
                stalled: Vec::new(),
                calls: Vec::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Hang forever if `endpoint` is stalled.
    async fn gate(&self, call: &Call, endpoint: Endpoint) {
        let stalled = {
            let mut inner = self.lock();
            let stalled = inner.stalled.contains(&endpoint);
            if stalled {
                inner.calls.push(call.clone());
            }
            stalled
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
    }

    /// Record `call` and fail it if a failure is scripted.
    fn enter(&self, call: Call, endpoint: Endpoint) -> Result<MutexGuard<'_, Inner>, ApiError> {
        let mut inner = self.lock();
        inner.calls.push(call);
        let fail = inner.fail;
        match fail {
            Some(fail) => Err(fail(endpoint)),
            None => Ok(inner),
        }
    }

    pub fn push_round(&self, snapshot: RoundSnapshot) {
        self.lock().rounds.push_back(snapshot);
    }

    pub fn push_results(&self, results: impl IntoIterator<Item = RoundResult>) {
        self.lock().results.extend(results);
    }

    pub fn push_stream(&self, events: Vec<RawEvent>) {
        self.lock().streams.push_back(events);
    }

    pub fn set_session(&self, session: Option<SessionSnapshot>) {
        self.lock().session = session;
    }

    /// Every call from now on fails with `fail(endpoint)`.
    pub fn fail_with(&self, fail: fn(Endpoint) -> ApiError) {
        self.lock().fail = Some(fail);
    }

    /// Calls to `endpoint` from now on never complete.
    pub fn stall(&self, endpoint: Endpoint) {
        self.lock().stalled.push(endpoint);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_write).collect()
    }

    pub fn session(&self) -> Option<SessionSnapshot> {
        self.lock().session.clone()
    }

    fn open(inner: &mut Inner, cfg: &SessionConfig, tile_ids: Option<Vec<u8>>) -> SessionHandle {
        let session_id = format!("sess-{}", inner.next_id);
        inner.next_id += 1;
        inner.session = Some(SessionSnapshot {
            session_id: session_id.clone(),
            status: "active".into(),
            sol_per_round: Some(cfg.sol_per_round),
            num_tiles: Some(cfg.num_tiles),
            tile_mode: Some(cfg.tile_selection.mode().to_string()),
            tile_ids,
            mining_token: Some(cfg.mining_token),
            started_at: Some(Utc::now()),
        });
        SessionHandle {
            session_id,
            status: "active".into(),
        }
    }
}

#[async_trait]
impl MiningApi for ScriptedApi {
    async fn start(&self, cfg: &SessionConfig) -> Result<SessionHandle, ApiError> {
        let mut inner = self.enter(Call::Start(cfg.clone()), Endpoint::Start)?;
        Ok(Self::open(&mut inner, cfg, None))
    }

    async fn start_explicit(
        &self,
        cfg: &SessionConfig,
        tiles: &[u8],
    ) -> Result<SessionHandle, ApiError> {
        let mut inner = self.enter(Call::StartExplicit(tiles.to_vec()), Endpoint::StartStrategy)?;
        Ok(Self::open(&mut inner, cfg, Some(tiles.to_vec())))
    }

    async fn stop(&self) -> Result<StopSummary, ApiError> {
        self.gate(&Call::Stop, Endpoint::Stop).await;
        let mut inner = self.enter(Call::Stop, Endpoint::Stop)?;
        match inner.session.take() {
            Some(_) => Ok(StopSummary::default()),
            None => Err(ApiError::NotFound {
                endpoint: Endpoint::Stop,
            }),
        }
    }

    async fn reload(&self, req: &ReloadRequest) -> Result<SessionHandle, ApiError> {
        let mut inner = self.enter(Call::Reload(req.tiles.clone()), Endpoint::Reload)?;
        let session = inner.session.as_mut().ok_or(ApiError::NotFound {
            endpoint: Endpoint::Reload,
        })?;
        session.tile_ids = req.tiles.tile_ids().map(<[u8]>::to_vec);
        Ok(SessionHandle {
            session_id: session.session_id.clone(),
            status: session.status.clone(),
        })
    }

    async fn current_session(&self) -> Result<SessionSnapshot, ApiError> {
        let inner = self.enter(Call::CurrentSession, Endpoint::Session)?;
        inner.session.clone().ok_or(ApiError::NotFound {
            endpoint: Endpoint::Session,
        })
    }

    async fn current_round(&self) -> Result<RoundSnapshot, ApiError> {
        self.gate(&Call::CurrentRound, Endpoint::CurrentRound).await;
        let mut inner = self.enter(Call::CurrentRound, Endpoint::CurrentRound)?;
        let snapshot = if inner.rounds.len() > 1 {
            inner.rounds.pop_front()
        } else {
            inner.rounds.front().cloned()
        };
        snapshot.ok_or(ApiError::NotFound {
            endpoint: Endpoint::CurrentRound,
        })
    }

    async fn session_rounds(&self, since: Option<u64>) -> Result<Vec<RoundResult>, ApiError> {
        self.gate(&Call::SessionRounds(since), Endpoint::SessionRounds).await;
        let inner = self.enter(Call::SessionRounds(since), Endpoint::SessionRounds)?;
        let mut rounds: Vec<RoundResult> = inner
            .results
            .iter()
            .filter(|r| since.map_or(true, |s| r.round_number >= s))
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.round_number);
        Ok(rounds)
    }

    async fn balances(&self) -> Result<BalanceVector, ApiError> {
        let inner = self.enter(Call::Balances, Endpoint::Balance)?;
        Ok(inner.balances.clone())
    }

    async fn history(&self, limit: u32) -> Result<Vec<SessionSummary>, ApiError> {
        let _inner = self.enter(Call::History(limit), Endpoint::History)?;
        Ok(Vec::new())
    }

    async fn events(&self) -> Result<EventStream, ApiError> {
        self.gate(&Call::Events, Endpoint::Events).await;
        let mut inner = self.enter(Call::Events, Endpoint::Events)?;
        Ok(match inner.streams.pop_front() {
            Some(events) => futures::stream::iter(events.into_iter().map(Ok)).boxed(),
            None => futures::stream::pending().boxed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn result(round: u64, won: bool, sol_deployed: Decimal, sol_earned: Decimal) -> RoundResult {
    RoundResult {
        round_number: round,
        won,
        sol_deployed,
        sol_earned,
        ore_earned: Decimal::ZERO,
        tiles_selected: vec![],
        winning_tile: None,
        timestamp: Utc::now(),
    }
}

pub fn loss(round: u64) -> RoundResult {
    result(round, false, dec!(0.01), Decimal::ZERO)
}
