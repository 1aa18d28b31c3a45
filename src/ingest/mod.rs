//! Event ingestion.
//!
//! Turns the SSE stream (or, when SSE is unavailable, polling of
//! `current_round` and `session_rounds`) into one ordered, deduplicated
//! stream of [`MiningEvent`]s on a bounded channel. The controller cannot
//! tell which source produced an event.

pub mod normalize;
pub mod sequencer;

pub use normalize::{normalize, Normalized};
pub use sequencer::{Admission, BackfillRequest, DropReason, Sequencer};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::error::{ApiError, ErrorKind};
use crate::transport::{Endpoint, EventStream, MiningApi, RawEvent, RetryPolicy};
use crate::types::{BalanceVector, RoundResult, RoundSnapshot};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Position of an event within its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    RoundStart,
    Deployment,
    RoundEnd,
    Claim,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningEvent {
    RoundStart(RoundSnapshot),
    Deployment {
        round: u64,
        tiles: Vec<u8>,
        sol: Decimal,
    },
    RoundEnd {
        result: RoundResult,
        /// Filled from `session_rounds` rather than observed live.
        reconstructed: bool,
    },
    Claim {
        round: u64,
        sol: Decimal,
        ore: Decimal,
    },
    BalanceUpdate(BalanceVector),
    /// Rounds `from_round..=to_round` were never observed live.
    StreamGap {
        from_round: u64,
        to_round: u64,
    },
    /// The source hit an error the controller must see.
    SourceFault(ApiError),
}

impl MiningEvent {
    pub fn round(&self) -> Option<u64> {
        match self {
            MiningEvent::RoundStart(s) => Some(s.round_number),
            MiningEvent::Deployment { round, .. } | MiningEvent::Claim { round, .. } => {
                Some(*round)
            }
            MiningEvent::RoundEnd { result, .. } => Some(result.round_number),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            MiningEvent::RoundStart(_) => Some(Phase::RoundStart),
            MiningEvent::Deployment { .. } => Some(Phase::Deployment),
            MiningEvent::RoundEnd { .. } => Some(Phase::RoundEnd),
            MiningEvent::Claim { .. } => Some(Phase::Claim),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MiningEvent::RoundStart(_) => "round_start",
            MiningEvent::Deployment { .. } => "deployment",
            MiningEvent::RoundEnd { .. } => "round_end",
            MiningEvent::Claim { .. } => "claim",
            MiningEvent::BalanceUpdate(_) => "balance_update",
            MiningEvent::StreamGap { .. } => "stream_gap",
            MiningEvent::SourceFault(_) => "source_fault",
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Whether the driver keeps going after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Keep going. From a pump loop: the source ended, reconnect.
    Continue,
    /// Shutdown requested, the consumer went away, or credentials expired.
    Stop,
}

pub struct EventIngestor {
    api: Arc<dyn MiningApi>,
    cfg: IngestConfig,
    retry: RetryPolicy,
    sequencer: Sequencer,
    tx: mpsc::Sender<MiningEvent>,
    shutdown: watch::Receiver<bool>,
}

impl EventIngestor {
    pub fn new(
        api: Arc<dyn MiningApi>,
        cfg: IngestConfig,
        retry: RetryPolicy,
        tx: mpsc::Sender<MiningEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let sequencer = Sequencer::new(cfg.dedup_window);
        Self {
            api,
            cfg,
            retry,
            sequencer,
            tx,
            shutdown,
        }
    }

    /// Spawn the ingestor on the runtime. Returns the consumer end of the
    /// event queue.
    pub fn spawn(
        api: Arc<dyn MiningApi>,
        cfg: IngestConfig,
        retry: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<MiningEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let ingestor = Self::new(api, cfg, retry, tx, shutdown);
        (rx, tokio::spawn(ingestor.run()))
    }

    pub async fn run(mut self) {
        // Consecutive connections that ended (or never opened) without
        // delivering a frame.
        let mut failures: u32 = 0;
        loop {
            if self.stopping() {
                break;
            }

            let api = self.api.clone();
            let Some(connected) = self.guarded(api.events()).await else {
                break;
            };
            match connected {
                Ok(stream) => {
                    info!("Event stream connected");
                    if self.resync().await == Flow::Stop {
                        break;
                    }
                    let (flow, frames) = self.pump_sse(stream).await;
                    if flow == Flow::Stop {
                        break;
                    }
                    if frames > 0 {
                        failures = 0;
                    }
                    failures += 1;
                    warn!(frames, failures, "Event stream disconnected");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "Event stream connect failed");
                    if self.on_source_error(e).await == Flow::Stop {
                        break;
                    }
                }
            }

            if failures >= self.cfg.sse_failures_before_poll {
                info!(
                    secs = self.cfg.poll_fallback_secs,
                    "Falling back to polling"
                );
                if self.poll_for(Duration::from_secs(self.cfg.poll_fallback_secs)).await
                    == Flow::Stop
                {
                    break;
                }
                failures = 0;
                continue;
            }
            let delay = self
                .retry
                .backoff(failures.saturating_sub(1), &mut rand::thread_rng());
            if self.pause(delay).await == Flow::Stop {
                break;
            }
        }
        debug!("Event ingestor stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Await an API call unless shutdown arrives first.
    async fn guarded<T>(
        &mut self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Option<Result<T, ApiError>> {
        tokio::select! {
            _ = self.shutdown.changed() => None,
            result = call => Some(result),
        }
    }

    /// Sleep unless shutdown arrives first.
    async fn pause(&mut self, delay: Duration) -> Flow {
        tokio::select! {
            _ = self.shutdown.changed() => Flow::Stop,
            _ = sleep(delay) => Flow::Continue,
        }
    }

    /// Re-read the live round after (re)connecting so a missed start or a
    /// jump is noticed immediately.
    async fn resync(&mut self) -> Flow {
        let api = self.api.clone();
        match self.guarded(api.current_round()).await {
            None => Flow::Stop,
            Some(Ok(snapshot)) => self.offer(MiningEvent::RoundStart(snapshot)).await,
            Some(Err(e)) => self.on_source_error(e).await,
        }
    }

    /// Forward frames until the stream ends. Also returns how many frames
    /// arrived.
    async fn pump_sse(&mut self, mut stream: EventStream) -> (Flow, u64) {
        let mut frames = 0;
        loop {
            let item = tokio::select! {
                _ = self.shutdown.changed() => return (Flow::Stop, frames),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(raw)) => {
                    frames += 1;
                    if self.handle_raw(raw).await == Flow::Stop {
                        return (Flow::Stop, frames);
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Event stream error");
                    return (Flow::Continue, frames);
                }
                None => return (Flow::Continue, frames),
            }
        }
    }

    async fn handle_raw(&mut self, raw: RawEvent) -> Flow {
        match normalize(&raw) {
            Normalized::Event(event) => self.offer(event).await,
            Normalized::RoundStartHint(round) => {
                let api = self.api.clone();
                let Some(fetched) = self.guarded(api.current_round()).await else {
                    return Flow::Stop;
                };
                self.on_hinted_round(round, fetched).await
            }
            Normalized::Ignored => {
                debug!(event = %raw.event, "Ignoring event");
                Flow::Continue
            }
            Normalized::Malformed(detail) => {
                let err = ApiError::ProtocolMismatch {
                    endpoint: Endpoint::Events,
                    detail,
                };
                self.on_source_error(err).await
            }
        }
    }

    async fn on_hinted_round(
        &mut self,
        round: u64,
        fetched: Result<RoundSnapshot, ApiError>,
    ) -> Flow {
        match fetched {
            Ok(snapshot) if snapshot.round_number >= round => {
                self.offer(MiningEvent::RoundStart(snapshot)).await
            }
            Ok(snapshot) => {
                warn!(
                    announced = round,
                    current = snapshot.round_number,
                    "Round snapshot lags the announced round"
                );
                Flow::Continue
            }
            Err(e) => self.on_source_error(e).await,
        }
    }

    /// Poll `current_round` and `session_rounds` for `duration`.
    async fn poll_for(&mut self, duration: Duration) -> Flow {
        let until = Instant::now() + duration;
        let mut round_tick = interval(Duration::from_millis(self.cfg.poll_round_ms.max(1)));
        round_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut results_tick =
            interval(Duration::from_secs(self.cfg.poll_session_rounds_secs.max(1)));
        results_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Flow::Stop,
                _ = sleep_until(until) => return Flow::Continue,
                _ = round_tick.tick() => {
                    let api = self.api.clone();
                    let flow = match self.guarded(api.current_round()).await {
                        None => Flow::Stop,
                        Some(Ok(snapshot)) => self.offer(MiningEvent::RoundStart(snapshot)).await,
                        Some(Err(e)) => self.on_source_error(e).await,
                    };
                    if flow == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                _ = results_tick.tick() => {
                    // Unsettled rounds ride along with the regular poll.
                    let since = self
                        .sequencer
                        .oldest_unsettled()
                        .into_iter()
                        .chain(self.sequencer.last_started())
                        .min();
                    let api = self.api.clone();
                    match self.guarded(api.session_rounds(since)).await {
                        None => return Flow::Stop,
                        Some(Ok(results)) => {
                            for result in results {
                                let reconstructed =
                                    self.sequencer.is_unsettled(result.round_number);
                                let event = MiningEvent::RoundEnd { result, reconstructed };
                                if self.offer(event).await == Flow::Stop {
                                    return Flow::Stop;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            if self.on_source_error(e).await == Flow::Stop {
                                return Flow::Stop;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run `event` through the sequencer and forward whatever it releases.
    async fn offer(&mut self, event: MiningEvent) -> Flow {
        let kind = event.kind();
        let round = event.round();
        let started = matches!(event, MiningEvent::RoundStart(_));
        let flow = match self.sequencer.admit(event) {
            Admission::Emit(e) => self.send(e).await,
            Admission::Backfill(req) => self.backfill(req).await,
            Admission::Drop(DropReason::Duplicate) => {
                debug!(kind, round, "Duplicate event suppressed");
                return Flow::Continue;
            }
            Admission::Drop(reason) => {
                warn!(kind, round, %reason, "Dropping event");
                return Flow::Continue;
            }
        };
        if flow == Flow::Continue && started {
            return self.settle_unsettled().await;
        }
        flow
    }

    async fn backfill(&mut self, req: BackfillRequest) -> Flow {
        warn!(
            from = req.from_round,
            to = req.to_round,
            next = req.held.round_number,
            "Backfilling rounds without a result"
        );
        let api = self.api.clone();
        let results = match self.guarded(api.session_rounds(Some(req.from_round))).await {
            None => return Flow::Stop,
            Some(Ok(r)) => r,
            Some(Err(e)) => {
                error!(error = %e, "Backfill fetch failed; only deployed rounds stay open");
                if self.on_source_error(e).await == Flow::Stop {
                    return Flow::Stop;
                }
                Vec::new()
            }
        };
        for e in self.sequencer.complete_backfill(req, results) {
            if self.send(e).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Re-fetch results for rounds a backfill left unsettled. Runs at each
    /// new round.
    async fn settle_unsettled(&mut self) -> Flow {
        let Some(since) = self.sequencer.oldest_unsettled() else {
            return Flow::Continue;
        };
        let api = self.api.clone();
        let results = match self.guarded(api.session_rounds(Some(since))).await {
            None => return Flow::Stop,
            Some(Ok(r)) => r,
            Some(Err(e)) => return self.on_source_error(e).await,
        };
        for result in results {
            let round = result.round_number;
            if !self.sequencer.is_unsettled(round) {
                continue;
            }
            let event = MiningEvent::RoundEnd {
                result,
                reconstructed: true,
            };
            if let Admission::Emit(e) = self.sequencer.admit(event) {
                info!(round, "Late result for an unsettled round");
                if self.send(e).await == Flow::Stop {
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    /// Forward a source error. Expired credentials end ingestion.
    async fn on_source_error(&mut self, err: ApiError) -> Flow {
        let fatal = err.kind() == ErrorKind::AuthExpired;
        if self.send(MiningEvent::SourceFault(err)).await == Flow::Stop || fatal {
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn send(&mut self, event: MiningEvent) -> Flow {
        match self.tx.send(event).await {
            Ok(()) => Flow::Continue,
            Err(_) => {
                debug!("Event consumer dropped");
                Flow::Stop
            }
        }
    }
}
