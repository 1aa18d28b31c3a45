//! Risk circuit.
//!
//! Trips when the trailing loss streak reaches `max_loss_streak` or net P&L
//! falls to `-stop_loss_sol`. Both limits are optional. The controller
//! evaluates the circuit over ledger rounds after its risk anchor, so a
//! resumed session starts with a clean slate.

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::tracker::LedgerAggregates;
use crate::types::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CircuitTrip {
    LossStreak { streak: u32, limit: u32 },
    StopLoss { net_pnl_sol: Decimal, limit_sol: Decimal },
}

impl fmt::Display for CircuitTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitTrip::LossStreak { streak, limit } => {
                write!(f, "loss streak {streak} reached limit {limit}")
            }
            CircuitTrip::StopLoss {
                net_pnl_sol,
                limit_sol,
            } => write!(f, "net P&L {net_pnl_sol} SOL hit stop loss -{limit_sol} SOL"),
        }
    }
}

/// Check the circuit against `agg`. Loss streak is checked first.
pub fn circuit(cfg: &SessionConfig, agg: &LedgerAggregates) -> Option<CircuitTrip> {
    if let Some(limit) = cfg.max_loss_streak {
        if agg.loss_streak >= limit {
            return Some(CircuitTrip::LossStreak {
                streak: agg.loss_streak,
                limit,
            });
        }
    }
    if let Some(limit) = cfg.stop_loss_sol {
        if agg.net_pnl_sol <= -limit {
            return Some(CircuitTrip::StopLoss {
                net_pnl_sol: agg.net_pnl_sol,
                limit_sol: limit,
            });
        }
    }
    None
}
