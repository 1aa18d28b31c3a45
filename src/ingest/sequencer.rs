//! Event ordering, duplicate suppression and gap detection.
//!
//! The sequencer is synchronous and does no I/O. When a `RoundStart` leaves
//! earlier rounds without a `RoundEnd`, `admit` holds the start back and
//! asks the driver to fetch those rounds; `complete_backfill` then releases
//! the reconstructed `RoundEnd`s followed by the held start.
//!
//! A round the session deployed into that the backend has not settled yet
//! stays *unsettled*: its `RoundEnd` is still accepted when it turns up
//! later, live or from a re-fetch.

use std::collections::BTreeSet;
use std::fmt;

use tracing::warn;

use super::{MiningEvent, Phase};
use crate::types::{RoundResult, RoundSnapshot};

/// What to do with an incoming event.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Emit(MiningEvent),
    Backfill(BackfillRequest),
    Drop(DropReason),
}

/// Rounds `from_round..=to_round` need their results before `held` is
/// released.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillRequest {
    pub from_round: u64,
    pub to_round: u64,
    /// Rounds never observed at all, reported as a `StreamGap`.
    pub gap: Option<(u64, u64)>,
    pub held: RoundSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    OutOfOrder { round: u64, phase: Phase },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Duplicate => f.write_str("duplicate"),
            DropReason::OutOfOrder { round, phase } => {
                write!(f, "out of order (cursor at round {round} {phase:?})")
            }
        }
    }
}

/// Key for duplicate suppression. Deployments can legitimately repeat
/// within a round, so their payload is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeenKey {
    round: u64,
    phase: Phase,
    detail: String,
}

#[derive(Debug)]
pub struct Sequencer {
    /// Position of the last ordered event released.
    cursor: Option<(u64, Phase)>,
    last_started: Option<u64>,
    ended: BTreeSet<u64>,
    /// Rounds with an observed deployment.
    participated: BTreeSet<u64>,
    /// Participated rounds a backfill did not return.
    unsettled: BTreeSet<u64>,
    seen: BTreeSet<SeenKey>,
    window: u64,
}

impl Sequencer {
    pub fn new(window: u64) -> Self {
        Self {
            cursor: None,
            last_started: None,
            ended: BTreeSet::new(),
            participated: BTreeSet::new(),
            unsettled: BTreeSet::new(),
            seen: BTreeSet::new(),
            window: window.max(2),
        }
    }

    pub fn last_started(&self) -> Option<u64> {
        self.last_started
    }

    pub fn cursor(&self) -> Option<(u64, Phase)> {
        self.cursor
    }

    /// Oldest round still waiting for its result.
    pub fn oldest_unsettled(&self) -> Option<u64> {
        self.unsettled.first().copied()
    }

    pub fn is_unsettled(&self, round: u64) -> bool {
        self.unsettled.contains(&round)
    }

    pub fn admit(&mut self, event: MiningEvent) -> Admission {
        let (round, phase) = match (event.round(), event.phase()) {
            (Some(r), Some(p)) => (r, p),
            // Unordered events (balances, faults) pass straight through.
            _ => return Admission::Emit(event),
        };

        let key = seen_key(&event, round, phase);
        if self.seen.contains(&key) || (phase == Phase::RoundEnd && self.ended.contains(&round)) {
            return Admission::Drop(DropReason::Duplicate);
        }
        if phase == Phase::RoundEnd && self.unsettled.remove(&round) {
            // Late settlement: released out of band, the cursor stays put.
            self.seen.insert(key);
            self.ended.insert(round);
            return Admission::Emit(event);
        }
        if let Some((c_round, c_phase)) = self.cursor {
            let behind = round < c_round || (round == c_round && phase < c_phase);
            if behind {
                return Admission::Drop(DropReason::OutOfOrder {
                    round: c_round,
                    phase: c_phase,
                });
            }
        }

        if let MiningEvent::RoundStart(snapshot) = &event {
            if let Some(req) = self.backfill_for(snapshot) {
                return Admission::Backfill(req);
            }
        }

        self.record(key, round, phase);
        Admission::Emit(event)
    }

    /// Release a held round start. `results` are whatever the backend
    /// returned for the range. Of the rounds it did not return, those with
    /// an observed deployment become unsettled; the rest are treated as not
    /// played.
    pub fn complete_backfill(
        &mut self,
        req: BackfillRequest,
        mut results: Vec<RoundResult>,
    ) -> Vec<MiningEvent> {
        let mut out = Vec::new();
        if let Some((from_round, to_round)) = req.gap {
            out.push(MiningEvent::StreamGap {
                from_round,
                to_round,
            });
        }

        results.retain(|r| (req.from_round..=req.to_round).contains(&r.round_number));
        results.sort_by_key(|r| r.round_number);
        results.dedup_by_key(|r| r.round_number);

        for result in results {
            if self.ended.contains(&result.round_number) {
                continue;
            }
            let round = result.round_number;
            let event = MiningEvent::RoundEnd {
                result,
                reconstructed: true,
            };
            let key = seen_key(&event, round, Phase::RoundEnd);
            self.record(key, round, Phase::RoundEnd);
            out.push(event);
        }
        for round in req.from_round..=req.to_round {
            if !self.ended.contains(&round) && self.participated.contains(&round) {
                warn!(round, "Backend has not settled a round we deployed into");
                self.unsettled.insert(round);
            }
        }

        let start = MiningEvent::RoundStart(req.held);
        let round = start.round().unwrap_or(req.to_round + 1);
        let key = seen_key(&start, round, Phase::RoundStart);
        self.record(key, round, Phase::RoundStart);
        out.push(start);
        out
    }

    fn backfill_for(&self, snapshot: &RoundSnapshot) -> Option<BackfillRequest> {
        let m = snapshot.round_number;
        let base = self
            .last_started
            .or_else(|| self.ended.iter().next_back().copied())?;
        if m <= base {
            return None;
        }

        let missing: Vec<u64> = (base..m).filter(|r| !self.ended.contains(r)).collect();
        let (&from_round, &to_round) = (missing.first()?, missing.last()?);
        let gap = (m > base + 1).then(|| (base + 1, m - 1));
        Some(BackfillRequest {
            from_round,
            to_round,
            gap,
            held: snapshot.clone(),
        })
    }

    fn record(&mut self, key: SeenKey, round: u64, phase: Phase) {
        self.seen.insert(key);
        match phase {
            Phase::RoundStart => {
                self.last_started = Some(self.last_started.map_or(round, |s| s.max(round)));
            }
            Phase::Deployment => {
                self.participated.insert(round);
            }
            Phase::RoundEnd => {
                self.ended.insert(round);
            }
            Phase::Claim => {}
        }
        self.cursor = Some((round, phase));
        self.prune(round);
    }

    fn prune(&mut self, round: u64) {
        let floor = round.saturating_sub(self.window);
        self.seen.retain(|k| k.round >= floor);
        self.ended.retain(|r| *r >= floor);
        self.participated.retain(|r| *r >= floor);
        while let Some(&oldest) = self.unsettled.first() {
            if oldest >= floor {
                break;
            }
            warn!(round = oldest, "Giving up on a round the backend never settled");
            self.unsettled.remove(&oldest);
        }
    }
}

fn seen_key(event: &MiningEvent, round: u64, phase: Phase) -> SeenKey {
    let detail = match event {
        MiningEvent::Deployment { tiles, sol, .. } => format!("{tiles:?}@{}", sol.normalize()),
        _ => String::new(),
    };
    SeenKey {
        round,
        phase,
        detail,
    }
}
