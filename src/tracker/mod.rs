//! Round tracker.
//!
//! Holds the latest [`RoundSnapshot`], the deployment accumulated for the
//! round in flight, the session [`Ledger`], and claim totals.

pub mod ledger;

pub use ledger::{Ledger, LedgerAggregates, LedgerEntry};

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::types::{RoundResult, RoundSnapshot};

/// Deployment observed for the round in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRound {
    pub round_number: u64,
    pub sol_deployed: Decimal,
    pub tiles: Vec<u8>,
}

impl PendingRound {
    fn open(round_number: u64) -> Self {
        Self {
            round_number,
            sol_deployed: Decimal::ZERO,
            tiles: Vec::new(),
        }
    }
}

/// Claimed rewards. Kept apart from the ledger: claims settle earnings the
/// ledger already counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimTotals {
    pub count: u64,
    pub sol: Decimal,
    pub ore: Decimal,
    pub last_round: Option<u64>,
}

/// Displaced deployments kept while their result is outstanding.
const MAX_UNSETTLED: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct RoundTracker {
    snapshot: Option<RoundSnapshot>,
    pending: Option<PendingRound>,
    /// Deployed rounds displaced by a newer round before their `RoundEnd`.
    unsettled: BTreeMap<u64, PendingRound>,
    ledger: Ledger,
    claims: ClaimTotals,
}

impl RoundTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            ledger: Ledger::new(window_size),
            ..Self::default()
        }
    }

    pub fn with_ledger(ledger: Ledger) -> Self {
        Self {
            ledger,
            ..Self::default()
        }
    }

    /// Open the next round. Returns the previous pending round when it had
    /// a deployment and no result yet; it is kept until its result arrives.
    pub fn on_round_start(&mut self, snapshot: RoundSnapshot) -> Option<PendingRound> {
        let displaced = self.open(snapshot.round_number);
        self.snapshot = Some(snapshot);
        displaced
    }

    pub fn on_deployment(
        &mut self,
        round: u64,
        tiles: &[u8],
        sol: Decimal,
    ) -> Option<PendingRound> {
        let displaced = if self.pending.as_ref().map(|p| p.round_number) != Some(round) {
            self.open(round)
        } else {
            None
        };
        if let Some(pending) = self.pending.as_mut() {
            pending.sol_deployed += sol;
            for t in tiles {
                if !pending.tiles.contains(t) {
                    pending.tiles.push(*t);
                }
            }
        }
        displaced
    }

    fn open(&mut self, round: u64) -> Option<PendingRound> {
        let previous = self.pending.replace(PendingRound::open(round))?;
        if previous.round_number == round || previous.sol_deployed.is_zero() {
            return None;
        }
        warn!(
            round = previous.round_number,
            sol = %previous.sol_deployed,
            "Round replaced before its result arrived"
        );
        if self.unsettled.len() == MAX_UNSETTLED {
            self.unsettled.pop_first();
        }
        self.unsettled.insert(previous.round_number, previous.clone());
        Some(previous)
    }

    /// Finalize a round. Returns the new ledger entry, or `None` when the
    /// session did not participate.
    pub fn on_round_end(
        &mut self,
        mut result: RoundResult,
        reconstructed: bool,
    ) -> Result<Option<&LedgerEntry>, LedgerError> {
        let round = result.round_number;
        let late = self.unsettled.remove(&round);
        let settles_late = late.is_some();
        let pending = if self.pending.as_ref().is_some_and(|p| p.round_number == round) {
            self.pending.take()
        } else {
            late
        };

        // Some payloads omit what we deployed; the pending entry has it.
        if let Some(p) = pending {
            if result.sol_deployed.is_zero() {
                result.sol_deployed = p.sol_deployed;
            }
            if result.tiles_selected.is_empty() {
                result.tiles_selected = p.tiles;
            }
        }

        if !result.participated() {
            debug!(round = result.round_number, "Round ended without participation");
            return Ok(None);
        }
        if settles_late && self.ledger.last_round().is_some_and(|last| round < last) {
            return self.ledger.insert_late(result, reconstructed).map(Some);
        }
        self.ledger.append(result, reconstructed).map(Some)
    }

    pub fn on_claim(&mut self, round: u64, sol: Decimal, ore: Decimal) {
        self.claims.count += 1;
        self.claims.sol += sol;
        self.claims.ore += ore;
        self.claims.last_round = Some(round);
    }

    pub fn snapshot(&self) -> Option<&RoundSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingRound> {
        self.pending.as_ref()
    }

    pub fn unsettled(&self) -> impl Iterator<Item = &PendingRound> {
        self.unsettled.values()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn claims(&self) -> &ClaimTotals {
        &self.claims
    }

    /// Swap in a ledger restored from disk or rebuilt from the backend.
    pub fn replace_ledger(&mut self, ledger: Ledger) {
        self.ledger = ledger;
    }
}
