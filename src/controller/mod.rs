//! Mining controller.
//!
//! Owns the session state machine:
//!
//! ```text
//! idle ──start()──▶ starting ──ack──▶ active
//! active ──risk_tripped──▶ pausedByRisk ──resume()──▶ active
//! active ──stop()──▶ stopping ──in-flight RoundEnd──▶ stopped
//! any ──AuthExpired──▶ faulted ──reauthenticate()──▶ idle
//! ```
//!
//! Events are handled one at a time, so the ledger entry for round n is
//! always recorded before the decision for round n+1 is made. The
//! controller is the only place where an error turns into a state change.

pub mod status;

pub use status::{ControllerStatus, FaultInfo, RoundNote, RoundOutcome, StatusHandle};

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ApiError, ControllerError, ErrorKind};
use crate::ingest::MiningEvent;
use crate::storage::LedgerStore;
use crate::strategy::risk::{self, CircuitTrip};
use crate::strategy::{self, Decision, DeployPlan, EvalContext, SkipReason};
use crate::tracker::{Ledger, PendingRound, RoundTracker};
use crate::transport::{Endpoint, MiningApi};
use crate::types::{
    ReloadRequest, RoundResult, RoundSnapshot, SessionConfig, SessionHandle, SessionSnapshot,
    SessionState, StopSummary, TileChoice, WalletView,
};

/// Round notes kept for the status snapshot.
const MAX_NOTES: usize = 100;

/// Why [`MiningController::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown was requested and the session wound down.
    Shutdown,
    Faulted(FaultInfo),
    /// The event source closed.
    SourceClosed,
}

/// A backend session the controller is about to drive.
struct Launched {
    handle: SessionHandle,
    /// Tiles the backend deploys on.
    tiles: TileChoice,
}

impl Launched {
    fn adopted(snap: SessionSnapshot) -> Self {
        let tiles = match snap.tile_ids {
            Some(ids) if !ids.is_empty() => TileChoice::Tiles(ids),
            _ => TileChoice::BackendPicks,
        };
        Self {
            handle: SessionHandle {
                session_id: snap.session_id,
                status: snap.status,
            },
            tiles,
        }
    }
}

/// Writes whose effect on the backend is unknown.
fn outcome_unknown(err: &ApiError) -> bool {
    err.is_ambiguous() || matches!(err, ApiError::ProtocolMismatch { .. })
}

pub struct MiningController<A: MiningApi + ?Sized = dyn MiningApi> {
    api: Arc<A>,
    cfg: ControllerConfig,
    store: Option<LedgerStore>,
    status: StatusHandle,

    state: SessionState,
    session: Option<SessionConfig>,
    session_id: Option<String>,
    /// Tiles the backend currently deploys on. `None` while nothing runs.
    applied_tiles: Option<TileChoice>,
    tracker: RoundTracker,
    wallet: Option<WalletView>,
    /// The risk circuit only counts ledger rounds after this one.
    risk_anchor: Option<u64>,
    paused: Option<(CircuitTrip, Instant)>,
    /// Rounds that started while paused.
    sat_out: BTreeSet<u64>,
    /// Round deployed into whose `RoundEnd` has not arrived.
    in_flight: Option<u64>,
    fault: Option<FaultInfo>,
    notes: VecDeque<RoundNote>,
    mismatches: HashMap<Endpoint, u32>,
    rate_limited_since: Option<Instant>,
    rate_limit_alarm: bool,
}

impl<A: MiningApi + ?Sized> MiningController<A> {
    pub fn new(api: Arc<A>, cfg: ControllerConfig) -> Self {
        let tracker = RoundTracker::new(cfg.ledger_window);
        Self {
            api,
            cfg,
            store: None,
            status: status::new_handle(),
            state: SessionState::Idle,
            session: None,
            session_id: None,
            applied_tiles: None,
            tracker,
            wallet: None,
            risk_anchor: None,
            paused: None,
            sat_out: BTreeSet::new(),
            in_flight: None,
            fault: None,
            notes: VecDeque::new(),
            mismatches: HashMap::new(),
            rate_limited_since: None,
            rate_limit_alarm: false,
        }
    }

    /// Persist the ledger after every append.
    pub fn with_store(mut self, store: LedgerStore) -> Self {
        self.store = Some(store);
        self
    }

    // -- Accessors ---------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn session_config(&self) -> Option<&SessionConfig> {
        self.session.as_ref()
    }

    pub fn tracker(&self) -> &RoundTracker {
        &self.tracker
    }

    pub fn ledger(&self) -> &Ledger {
        self.tracker.ledger()
    }

    pub fn wallet(&self) -> Option<&WalletView> {
        self.wallet.as_ref()
    }

    pub fn fault(&self) -> Option<&FaultInfo> {
        self.fault.as_ref()
    }

    pub fn notes(&self) -> &VecDeque<RoundNote> {
        &self.notes
    }

    pub fn risk_anchor(&self) -> Option<u64> {
        self.risk_anchor
    }

    pub fn paused_by(&self) -> Option<&CircuitTrip> {
        self.paused.as_ref().map(|(trip, _)| trip)
    }

    pub fn rate_limit_alarm(&self) -> bool {
        self.rate_limit_alarm
    }

    // -- Operator commands -------------------------------------------------

    /// Start a session with `cfg`, or adopt the backend's running session
    /// when it already runs `cfg`.
    pub async fn start(&mut self, cfg: SessionConfig) -> Result<SessionHandle, ControllerError> {
        match self.state {
            SessionState::Idle | SessionState::Stopped => {}
            SessionState::Faulted => return Err(self.faulted_error()),
            state => {
                return Err(ControllerError::InvalidTransition {
                    action: "start",
                    state,
                })
            }
        }
        cfg.validate()?;
        if let Some(advice) = cfg.risk_advisory() {
            warn!(config = %cfg, "{advice}");
        }

        info!(config = %cfg, "Starting session");
        let result = self.launch_and_activate(cfg, false).await;
        self.publish().await;
        result
    }

    /// Stop the session. Already stopped (or never started) is a no-op.
    ///
    /// When a round is in flight the controller stays `stopping` until its
    /// `RoundEnd` arrives; [`drain`](Self::drain) finishes the job.
    pub async fn stop(&mut self) -> Result<Option<StopSummary>, ControllerError> {
        let result = self.stop_inner().await;
        self.publish().await;
        result
    }

    async fn stop_inner(&mut self) -> Result<Option<StopSummary>, ControllerError> {
        match self.state {
            SessionState::Idle | SessionState::Stopped | SessionState::Stopping => {
                debug!(state = %self.state, "Stop requested; nothing to do");
                return Ok(None);
            }
            SessionState::Faulted => return Err(self.faulted_error()),
            SessionState::PausedByRisk => {
                // The pause already halted the backend.
                self.paused = None;
                self.finish_stop();
                return Ok(None);
            }
            SessionState::Active | SessionState::Starting => {}
        }

        self.transition(SessionState::Stopping);
        match self.halt_backend().await {
            Ok(summary) => {
                if let Some(s) = &summary {
                    info!(summary = %s, "Backend session stopped");
                }
                if self.in_flight.is_none() {
                    self.finish_stop();
                } else {
                    info!(round = ?self.in_flight, "Waiting for the in-flight round to end");
                }
                Ok(summary)
            }
            Err(e) => {
                self.enter_fault(&e);
                Err(e.into())
            }
        }
    }

    /// Leave `pausedByRisk`: re-issue the start for the same config and
    /// re-anchor the risk circuit at the latest ledger round.
    pub async fn resume(&mut self) -> Result<SessionHandle, ControllerError> {
        let result = self.resume_inner().await;
        self.publish().await;
        result
    }

    async fn resume_inner(&mut self) -> Result<SessionHandle, ControllerError> {
        if self.state == SessionState::Faulted {
            return Err(self.faulted_error());
        }
        let cfg = match (&self.state, &self.session) {
            (SessionState::PausedByRisk, Some(cfg)) => cfg.clone(),
            (state, _) => {
                return Err(ControllerError::InvalidTransition {
                    action: "resume",
                    state: *state,
                })
            }
        };

        let previous_anchor = self.risk_anchor;
        self.risk_anchor = self.tracker.ledger().last_round();
        info!(anchor = ?self.risk_anchor, "Resuming session paused by risk");
        let result = self.launch_and_activate(cfg, true).await;
        if result.is_err() && self.state == SessionState::PausedByRisk {
            self.risk_anchor = previous_anchor;
        }
        result
    }

    /// Swap in a client with fresh credentials. Only valid while faulted;
    /// returns the controller to `idle`.
    pub async fn reauthenticate(&mut self, api: Arc<A>) -> Result<(), ControllerError> {
        if self.state != SessionState::Faulted {
            return Err(ControllerError::InvalidTransition {
                action: "reauthenticate",
                state: self.state,
            });
        }
        self.api = api;
        self.fault = None;
        self.mismatches.clear();
        self.rate_limited_since = None;
        self.rate_limit_alarm = false;
        self.applied_tiles = None;
        self.in_flight = None;
        self.paused = None;
        info!("Credentials refreshed");
        self.transition(SessionState::Idle);
        self.publish().await;
        Ok(())
    }

    // -- Event loop --------------------------------------------------------

    /// Process events until shutdown, a fault, or the source closing. On
    /// shutdown or source close the session is stopped and drained within
    /// the configured grace period.
    pub async fn run(
        &mut self,
        events: &mut mpsc::Receiver<MiningEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunOutcome {
        let mut recheck = interval(Duration::from_secs(self.cfg.pause_recheck_secs.max(1)));
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
        recheck.tick().await;
        self.publish().await;

        let outcome = loop {
            if let Some(fault) = self.fault.clone() {
                break RunOutcome::Faulted(fault);
            }
            if *shutdown.borrow() {
                break RunOutcome::Shutdown;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break RunOutcome::Shutdown;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Event source closed");
                        break RunOutcome::SourceClosed;
                    }
                },
                _ = recheck.tick() => self.recheck().await,
            }
        };

        if !matches!(outcome, RunOutcome::Faulted(_)) {
            info!(state = %self.state, "Controller shutting down");
            self.wind_down(events).await;
        }
        outcome
    }

    /// Stop the session and wait for the in-flight round to end. The whole
    /// wind-down, stop request included, takes at most
    /// `shutdown_grace_secs`.
    pub async fn wind_down(&mut self, events: &mut mpsc::Receiver<MiningEvent>) {
        let grace = Duration::from_secs(self.cfg.shutdown_grace_secs);
        if timeout(grace, self.stop_and_drain(events, grace)).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                state = %self.state,
                "Grace period elapsed during shutdown"
            );
            if self.state == SessionState::Stopping {
                self.finish_stop();
            }
        }
        self.publish().await;
    }

    async fn stop_and_drain(
        &mut self,
        events: &mut mpsc::Receiver<MiningEvent>,
        grace: Duration,
    ) {
        if matches!(
            self.state,
            SessionState::Active | SessionState::PausedByRisk | SessionState::Starting
        ) {
            if let Err(e) = self.stop().await {
                error!(error = %e, "Stop failed during shutdown");
            }
        }
        if self.state == SessionState::Stopping {
            self.drain(events, grace).await;
        }
    }

    /// Keep handling events while `stopping`, up to `grace`.
    pub async fn drain(&mut self, events: &mut mpsc::Receiver<MiningEvent>, grace: Duration) {
        let deadline = sleep(grace);
        tokio::pin!(deadline);
        while self.state == SessionState::Stopping {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        grace_secs = grace.as_secs(),
                        round = ?self.in_flight,
                        "Grace period elapsed before the in-flight round ended"
                    );
                    self.finish_stop();
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Event source closed while draining");
                        self.finish_stop();
                    }
                },
            }
        }
        self.publish().await;
    }

    /// Periodic re-check while paused: resume once the cool-down (if
    /// configured) has elapsed.
    pub async fn recheck(&mut self) {
        if self.state == SessionState::PausedByRisk {
            let since = self.paused.as_ref().map(|(_, at)| *at);
            match (since, self.cfg.risk_cooldown_secs) {
                (Some(at), Some(cooldown)) if at.elapsed() >= Duration::from_secs(cooldown) => {
                    info!(cooldown_secs = cooldown, "Risk cool-down elapsed; resuming");
                    if let Err(e) = self.resume().await {
                        error!(error = %e, "Automatic resume failed");
                    }
                }
                (Some(at), Some(cooldown)) => {
                    let remaining = Duration::from_secs(cooldown).saturating_sub(at.elapsed());
                    debug!(remaining_secs = remaining.as_secs(), "Still paused by risk");
                }
                _ => debug!("Paused by risk; waiting for operator resume"),
            }
        }
        self.publish().await;
    }

    pub async fn handle_event(&mut self, event: MiningEvent) {
        if !matches!(event, MiningEvent::SourceFault(_)) {
            // The source is delivering usable data again.
            self.mismatches.clear();
            self.clear_rate_limit();
        }

        match event {
            MiningEvent::RoundStart(snapshot) => self.on_round_start(snapshot).await,
            MiningEvent::Deployment { round, tiles, sol } => {
                debug!(round, ?tiles, %sol, "Deployment observed");
                if let Some(displaced) = self.tracker.on_deployment(round, &tiles, sol) {
                    self.note_unsettled(displaced);
                }
                if matches!(
                    self.state,
                    SessionState::Active | SessionState::PausedByRisk | SessionState::Stopping
                ) {
                    self.in_flight = Some(round);
                }
            }
            MiningEvent::RoundEnd {
                result,
                reconstructed,
            } => self.on_round_end(result, reconstructed).await,
            MiningEvent::Claim { round, sol, ore } => {
                info!(round, %sol, %ore, "Rewards claimed");
                self.tracker.on_claim(round, sol, ore);
            }
            MiningEvent::BalanceUpdate(balances) => match self.wallet.as_mut() {
                Some(wallet) => wallet.update(balances),
                None => self.wallet = Some(WalletView::at_session_start(balances)),
            },
            MiningEvent::StreamGap {
                from_round,
                to_round,
            } => {
                warn!(from_round, to_round, "Rounds missed by the event stream");
                self.note(from_round, RoundOutcome::Gap { to_round });
            }
            MiningEvent::SourceFault(err) => self.on_api_error(err),
        }
        self.publish().await;
    }

    // -- Round handling ----------------------------------------------------

    async fn on_round_start(&mut self, snapshot: RoundSnapshot) {
        let round = snapshot.round_number;
        debug!(%snapshot, "Round started");
        if let Some(displaced) = self.tracker.on_round_start(snapshot) {
            self.note_unsettled(displaced);
        }

        match self.state {
            SessionState::Active => self.decide_round(round).await,
            SessionState::PausedByRisk => {
                debug!(round, "Paused by risk; ignoring round start");
                self.sat_out.insert(round);
                self.note(round, RoundOutcome::Paused);
            }
            _ => {}
        }
    }

    async fn decide_round(&mut self, round: u64) {
        let decision = {
            let (Some(cfg), Some(snapshot)) = (self.session.as_ref(), self.tracker.snapshot())
            else {
                return;
            };
            let ctx = EvalContext {
                wallet: self.wallet.as_ref(),
                risk_anchor: self.risk_anchor,
            };
            strategy::decide(snapshot, cfg, self.tracker.ledger(), &ctx)
        };

        match decision {
            Decision::Deploy(plan) => self.deploy(plan).await,
            Decision::Skip(reason) => {
                info!(round, reason = reason.code(), detail = %reason, "Skipping round");
                self.note(
                    round,
                    RoundOutcome::Skipped {
                        reason: reason.code().to_string(),
                        detail: reason.to_string(),
                    },
                );
                if let SkipReason::RiskTripped(trip) = reason {
                    self.pause(trip).await;
                }
            }
        }
    }

    async fn deploy(&mut self, plan: DeployPlan) {
        let Some(cfg) = self.session.clone() else {
            return;
        };
        let round = plan.round_number;
        let reload = !cfg.auto_restart || self.applied_tiles.as_ref() != Some(&plan.tiles);

        if reload {
            let req = ReloadRequest {
                config: cfg,
                tiles: plan.tiles.clone(),
            };
            if let Err(e) = self.reload(&req).await {
                error!(round, error = %e, "Reload failed");
                self.enter_fault(&e);
                return;
            }
            self.applied_tiles = Some(plan.tiles.clone());
        }

        info!(
            round,
            sol = %plan.sol_amount,
            tiles = ?plan.tiles.tile_ids(),
            reloaded = reload,
            "Deploying"
        );
        self.in_flight = Some(round);
        self.note(
            round,
            RoundOutcome::Deployed {
                tiles: plan.tiles,
                sol: plan.sol_amount,
                reloaded: reload,
            },
        );
    }

    async fn on_round_end(&mut self, mut result: RoundResult, reconstructed: bool) {
        let round = result.round_number;
        // The backend was halted for these rounds; only an observed
        // deployment makes one count.
        let deployed = self
            .tracker
            .pending()
            .is_some_and(|p| p.round_number == round && p.sol_deployed > Decimal::ZERO);
        if self.sat_out.contains(&round) && !deployed && result.participated() {
            warn!(round, "Ignoring result for a round sat out while paused");
            result.sol_deployed = Decimal::ZERO;
        }
        self.sat_out.retain(|r| *r > round);

        let recorded = match self.tracker.on_round_end(result, reconstructed) {
            Ok(Some(entry)) => {
                info!(
                    round,
                    won = entry.result.won,
                    net_pnl_sol = %entry.result.net_pnl_sol(),
                    reconstructed,
                    "Round recorded"
                );
                true
            }
            Ok(None) => {
                debug!(round, "Round ended without a deployment");
                false
            }
            Err(e) => {
                warn!(round, error = %e, "Ledger rejected round result");
                self.note(
                    round,
                    RoundOutcome::Rejected {
                        reason: e.to_string(),
                    },
                );
                false
            }
        };

        if recorded {
            let agg = self.tracker.ledger().aggregates();
            info!(
                rounds = agg.rounds,
                net_pnl_sol = %agg.net_pnl_sol,
                wins = agg.win_count,
                loss_streak = agg.loss_streak,
                "Ledger updated"
            );
            self.persist();
        }

        if self.in_flight.is_some_and(|r| r <= round) {
            self.in_flight = None;
        }

        match self.state {
            SessionState::Stopping if self.in_flight.is_none() => self.finish_stop(),
            SessionState::Active => self.check_circuit().await,
            _ => {}
        }
    }

    async fn check_circuit(&mut self) {
        let trip = {
            let Some(cfg) = self.session.as_ref() else {
                return;
            };
            let agg = self.tracker.ledger().aggregates_after(self.risk_anchor);
            risk::circuit(cfg, &agg)
        };
        if let Some(trip) = trip {
            self.pause(trip).await;
        }
    }

    /// Enter `pausedByRisk` and halt the backend so it stops auto-deploying.
    async fn pause(&mut self, trip: CircuitTrip) {
        warn!(reason = %trip, "Risk circuit tripped; pausing session");
        self.paused = Some((trip, Instant::now()));
        self.transition(SessionState::PausedByRisk);

        match self.halt_backend().await {
            Ok(Some(summary)) => info!(summary = %summary, "Backend halted for risk pause"),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Failed to halt backend for risk pause");
                self.enter_fault(&e);
            }
        }
    }

    // -- Backend writes ----------------------------------------------------

    async fn launch_and_activate(
        &mut self,
        cfg: SessionConfig,
        keep_ledger: bool,
    ) -> Result<SessionHandle, ControllerError> {
        let previous = self.state;
        self.transition(SessionState::Starting);

        match self.launch(&cfg).await {
            Ok(launched) => {
                let handle = launched.handle.clone();
                self.activate(cfg, launched, keep_ledger);
                Ok(handle)
            }
            Err(ControllerError::Api(e)) => {
                error!(error = %e, "Session start failed");
                self.enter_fault(&e);
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "Session not started");
                self.transition(previous);
                Err(e)
            }
        }
    }

    async fn launch(&mut self, cfg: &SessionConfig) -> Result<Launched, ControllerError> {
        // One active session per account.
        match self.api.current_session().await {
            Ok(snap) if snap.is_active() => {
                if snap.matches(cfg) {
                    info!(session_id = %snap.session_id, "Adopting running session");
                    return Ok(Launched::adopted(snap));
                }
                return Err(ControllerError::SessionConflict {
                    session_id: snap.session_id,
                });
            }
            Ok(_) | Err(ApiError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.capture_wallet().await?;

        let tiles = cfg.start_tiles();
        match self.post_start(cfg, &tiles).await {
            Ok(handle) => Ok(Launched { handle, tiles }),
            Err(e) if outcome_unknown(&e) => {
                warn!(error = %e, "Start outcome unknown; reconciling");
                if let Some(snap) = self.reconcile(|s| s.matches(cfg)).await? {
                    info!(session_id = %snap.session_id, "Start had been applied");
                    return Ok(Launched::adopted(snap));
                }
                info!("No matching session; retrying start once");
                let handle = self.post_start(cfg, &tiles).await?;
                Ok(Launched { handle, tiles })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn post_start(
        &self,
        cfg: &SessionConfig,
        tiles: &TileChoice,
    ) -> Result<SessionHandle, ApiError> {
        match tiles {
            TileChoice::BackendPicks => self.api.start(cfg).await,
            TileChoice::Tiles(ids) => self.api.start_explicit(cfg, ids).await,
        }
    }

    /// Snapshot balances and quotes at session start. Only expired
    /// credentials are fatal; otherwise the liquidity gate stays off until
    /// the next balance update.
    async fn capture_wallet(&mut self) -> Result<(), ApiError> {
        match self.api.balances().await {
            Ok(balances) => {
                self.wallet = Some(WalletView::at_session_start(balances));
                Ok(())
            }
            Err(e @ ApiError::AuthExpired { .. }) => Err(e),
            Err(e) => {
                warn!(error = %e, "Balance snapshot unavailable");
                self.wallet = None;
                Ok(())
            }
        }
    }

    fn activate(&mut self, cfg: SessionConfig, launched: Launched, keep_ledger: bool) {
        let session_id = launched.handle.session_id;
        let same_session = self.session_id.as_deref() == Some(session_id.as_str());

        if !keep_ledger && !same_session {
            self.tracker = RoundTracker::new(self.cfg.ledger_window);
            self.risk_anchor = None;
            self.notes.clear();
        }
        if !keep_ledger && self.tracker.ledger().is_empty() {
            self.restore_ledger(&session_id);
        }

        info!(
            session_id = %session_id,
            tiles = ?launched.tiles.tile_ids(),
            "Session active"
        );
        self.session_id = Some(session_id);
        self.session = Some(cfg);
        self.applied_tiles = Some(launched.tiles);
        self.in_flight = None;
        self.paused = None;
        self.transition(SessionState::Active);
    }

    async fn reload(&mut self, req: &ReloadRequest) -> Result<(), ApiError> {
        let handle = match self.api.reload(req).await {
            Ok(handle) => handle,
            Err(e) if outcome_unknown(&e) => {
                warn!(error = %e, "Reload outcome unknown; reconciling");
                let tiles = &req.tiles;
                if self.reconcile(|s| s.matches_tiles(tiles)).await?.is_some() {
                    return Ok(());
                }
                info!("Reload not applied; retrying once");
                self.api.reload(req).await?
            }
            Err(e) => return Err(e),
        };

        if !handle.session_id.is_empty() && self.session_id.as_deref() != Some(&handle.session_id)
        {
            info!(session_id = %handle.session_id, "Backend moved to a new session");
            self.session_id = Some(handle.session_id);
        }
        Ok(())
    }

    /// POST stop. `Ok(None)` when the backend had no session to stop.
    async fn halt_backend(&mut self) -> Result<Option<StopSummary>, ApiError> {
        let result = match self.api.stop().await {
            Ok(summary) => Ok(Some(summary)),
            Err(ApiError::NotFound { .. }) => Ok(None),
            Err(e) if outcome_unknown(&e) => {
                warn!(error = %e, "Stop outcome unknown; reconciling");
                if self.reconcile(|_| true).await?.is_none() {
                    Ok(None)
                } else {
                    match self.api.stop().await {
                        Ok(summary) => Ok(Some(summary)),
                        Err(ApiError::NotFound { .. }) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            }
            Err(e) => Err(e),
        };
        if result.is_ok() {
            self.applied_tiles = None;
        }
        result
    }

    /// The backend's active session, if it satisfies `pred`.
    async fn reconcile(
        &self,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> Result<Option<SessionSnapshot>, ApiError> {
        match self.api.current_session().await {
            Ok(snap) if snap.is_active() && pred(&snap) => Ok(Some(snap)),
            Ok(_) | Err(ApiError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -- Errors ------------------------------------------------------------

    fn on_api_error(&mut self, err: ApiError) {
        match err.kind() {
            ErrorKind::AuthExpired => self.enter_fault(&err),
            ErrorKind::ProtocolMismatch => {
                let endpoint = err.endpoint();
                let count = self.mismatches.entry(endpoint).or_insert(0);
                *count += 1;
                let count = *count;
                warn!(%endpoint, count, error = %err, "Protocol mismatch");
                if count > self.cfg.protocol_mismatch_limit {
                    self.enter_fault(&err);
                }
            }
            ErrorKind::RateLimited => self.note_rate_limited(&err),
            _ => warn!(error = %err, "Event source error"),
        }
    }

    fn note_rate_limited(&mut self, err: &ApiError) {
        let now = Instant::now();
        let since = *self.rate_limited_since.get_or_insert(now);
        let persisted = now.duration_since(since);
        if !self.rate_limit_alarm
            && persisted >= Duration::from_secs(self.cfg.rate_limit_alarm_secs)
        {
            self.rate_limit_alarm = true;
            error!(
                endpoint = %err.endpoint(),
                persisted_secs = persisted.as_secs(),
                "Rate limiting persists"
            );
        } else {
            debug!(endpoint = %err.endpoint(), "Rate limited");
        }
    }

    fn clear_rate_limit(&mut self) {
        if self.rate_limited_since.take().is_some() && self.rate_limit_alarm {
            info!("Rate limiting cleared");
        }
        self.rate_limit_alarm = false;
    }

    fn enter_fault(&mut self, err: &ApiError) {
        error!(kind = %err.kind(), error = %err, state = %self.state, "Controller faulted");
        self.fault = Some(FaultInfo {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        });
        self.in_flight = None;
        self.paused = None;
        self.transition(SessionState::Faulted);
    }

    fn faulted_error(&self) -> ControllerError {
        match &self.fault {
            Some(f) => ControllerError::Faulted {
                kind: f.kind,
                message: f.message.clone(),
            },
            None => ControllerError::InvalidTransition {
                action: "continue",
                state: self.state,
            },
        }
    }

    // -- Bookkeeping -------------------------------------------------------

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Session state change");
            self.state = next;
        }
    }

    fn finish_stop(&mut self) {
        self.in_flight = None;
        self.applied_tiles = None;
        self.transition(SessionState::Stopped);
        let agg = self.tracker.ledger().aggregates();
        info!(
            rounds = agg.rounds,
            net_pnl_sol = %agg.net_pnl_sol,
            ore_earned = %agg.ore_earned,
            "Session stopped"
        );
    }

    fn note(&mut self, round: u64, outcome: RoundOutcome) {
        if self.notes.len() == MAX_NOTES {
            self.notes.pop_front();
        }
        self.notes.push_back(RoundNote { round, outcome });
    }

    fn note_unsettled(&mut self, displaced: PendingRound) {
        self.note(
            displaced.round_number,
            RoundOutcome::Unsettled {
                sol: displaced.sol_deployed,
            },
        );
    }

    fn restore_ledger(&mut self, session_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load(session_id, self.cfg.ledger_window) {
            Ok(Some(ledger)) => self.tracker.replace_ledger(ledger),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not restore saved ledger"),
        }
    }

    fn persist(&self) {
        let (Some(store), Some(id)) = (&self.store, &self.session_id) else {
            return;
        };
        if let Err(e) = store.save(id, self.tracker.ledger()) {
            error!(error = %e, "Failed to save ledger");
        }
    }

    /// Copy the current state into the shared status snapshot.
    async fn publish(&self) {
        let ledger = self.tracker.ledger();
        let snapshot = ControllerStatus {
            state: self.state,
            session_id: self.session_id.clone(),
            config: self.session.clone(),
            aggregates: ledger.aggregates().clone(),
            recent: ledger.recent(self.cfg.ledger_window).to_vec(),
            round: self.tracker.snapshot().cloned(),
            pending: self.tracker.pending().cloned(),
            claims: self.tracker.claims().clone(),
            notes: self.notes.iter().cloned().collect(),
            paused_by: self.paused.as_ref().map(|(trip, _)| trip.clone()),
            fault: self.fault.clone(),
            rate_limit_alarm: self.rate_limit_alarm,
            updated_at: Utc::now(),
        };
        *self.status.write().await = snapshot;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
