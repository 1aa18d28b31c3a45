//! Append-only per-session round log and P&L aggregates.
//!
//! Aggregates are maintained incrementally on append and can always be
//! recomputed from the log; the two must agree exactly.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::types::RoundResult;

pub const DEFAULT_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// Entries and aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub result: RoundResult,
    /// Filled from `session_rounds` after a stream gap rather than observed live.
    pub reconstructed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAggregates {
    pub rounds: u64,
    pub sol_deployed: Decimal,
    pub sol_earned: Decimal,
    pub net_pnl_sol: Decimal,
    pub ore_earned: Decimal,
    pub win_count: u64,
    /// Trailing consecutive losses.
    pub loss_streak: u32,
    pub peak_net_pnl_sol: Decimal,
    /// Largest drop of `net_pnl_sol` below its running peak (peak starts at 0).
    pub max_drawdown_sol: Decimal,
}

impl LedgerAggregates {
    fn apply(&mut self, r: &RoundResult) {
        self.rounds += 1;
        self.sol_deployed += r.sol_deployed;
        self.sol_earned += r.sol_earned;
        self.ore_earned += r.ore_earned;
        self.net_pnl_sol += r.net_pnl_sol();

        if r.won {
            self.win_count += 1;
            self.loss_streak = 0;
        } else {
            self.loss_streak += 1;
        }

        self.peak_net_pnl_sol = self.peak_net_pnl_sol.max(self.net_pnl_sol);
        self.max_drawdown_sol = self
            .max_drawdown_sol
            .max(self.peak_net_pnl_sol - self.net_pnl_sol);
    }

    /// Fold a sequence of results from zero.
    pub fn over<'a>(results: impl IntoIterator<Item = &'a RoundResult>) -> Self {
        let mut agg = Self::default();
        for r in results {
            agg.apply(r);
        }
        agg
    }

    pub fn win_rate(&self) -> f64 {
        if self.rounds == 0 {
            0.0
        } else {
            self.win_count as f64 / self.rounds as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    window: VecDeque<RoundResult>,
    window_size: usize,
    aggregates: LedgerAggregates,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl Ledger {
    pub fn new(window_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            aggregates: LedgerAggregates::default(),
        }
    }

    /// Append a finalized round. Round numbers must strictly increase.
    pub fn append(
        &mut self,
        result: RoundResult,
        reconstructed: bool,
    ) -> Result<&LedgerEntry, LedgerError> {
        if let Some(last) = self.last_round() {
            if result.round_number == last {
                return Err(LedgerError::Duplicate { round: last });
            }
            if result.round_number < last {
                return Err(LedgerError::OutOfOrder {
                    last,
                    round: result.round_number,
                });
            }
        }

        self.aggregates.apply(&result);
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(result.clone());
        self.entries.push(LedgerEntry {
            result,
            reconstructed,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Record a round the backend settled after later rounds were already
    /// appended. The entry goes in round order and aggregates are rebuilt,
    /// so they still equal a fold over the log.
    pub fn insert_late(
        &mut self,
        result: RoundResult,
        reconstructed: bool,
    ) -> Result<&LedgerEntry, LedgerError> {
        let round = result.round_number;
        let at = match self
            .entries
            .binary_search_by_key(&round, |e| e.result.round_number)
        {
            Ok(_) => return Err(LedgerError::Duplicate { round }),
            Err(at) if at == self.entries.len() => return self.append(result, reconstructed),
            Err(at) => at,
        };

        self.entries.insert(
            at,
            LedgerEntry {
                result,
                reconstructed,
            },
        );
        self.aggregates = self.recompute();
        let skip = self.entries.len().saturating_sub(self.window_size);
        self.window = self.entries[skip..].iter().map(|e| e.result.clone()).collect();
        Ok(&self.entries[at])
    }

    /// Rebuild from persisted entries, re-checking order.
    pub fn from_entries(
        entries: Vec<LedgerEntry>,
        window_size: usize,
    ) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(window_size);
        for e in entries {
            ledger.append(e.result, e.reconstructed)?;
        }
        Ok(ledger)
    }

    /// Build a ledger from backend per-round results, as `session_rounds`
    /// returns them. Rounds the session sat out are not entries.
    pub fn from_session_rounds(
        mut results: Vec<RoundResult>,
        window_size: usize,
    ) -> Result<Self, LedgerError> {
        results.sort_by_key(|r| r.round_number);
        let mut ledger = Self::new(window_size);
        for r in results.into_iter().filter(RoundResult::participated) {
            ledger.append(r, false)?;
        }
        Ok(ledger)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> &[LedgerEntry] {
        &self.entries[self.entries.len().saturating_sub(n)..]
    }

    /// The most recent `window_size` results, oldest first.
    pub fn window(&self) -> &VecDeque<RoundResult> {
        &self.window
    }

    pub fn aggregates(&self) -> &LedgerAggregates {
        &self.aggregates
    }

    pub fn last_round(&self) -> Option<u64> {
        self.entries.last().map(|e| e.result.round_number)
    }

    pub fn contains(&self, round: u64) -> bool {
        self.entries
            .binary_search_by_key(&round, |e| e.result.round_number)
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aggregates recomputed from the log.
    pub fn recompute(&self) -> LedgerAggregates {
        LedgerAggregates::over(self.entries.iter().map(|e| &e.result))
    }

    pub fn is_consistent(&self) -> bool {
        self.recompute() == self.aggregates
    }

    /// Aggregates over entries strictly after `anchor`. With no anchor this
    /// equals [`Ledger::aggregates`].
    pub fn aggregates_after(&self, anchor: Option<u64>) -> LedgerAggregates {
        match anchor {
            None => self.aggregates.clone(),
            Some(a) => LedgerAggregates::over(
                self.entries
                    .iter()
                    .map(|e| &e.result)
                    .filter(|r| r.round_number > a),
            ),
        }
    }
}
