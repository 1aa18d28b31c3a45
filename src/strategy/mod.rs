//! Strategy evaluator: per-round deploy/skip gating and tile selection.
//!
//! `decide` is a pure function of its inputs: no I/O, no clock, no shared
//! state. Gates run in order and the first failure is the skip reason:
//!
//! 1. EV gate
//! 2. motherlode gate (`motherlode_only` sessions)
//! 3. risk circuit
//! 4. liquidity gate

pub mod risk;
pub mod tiles;

use std::fmt;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::tracker::Ledger;
use crate::types::{RoundSnapshot, SessionConfig, TileChoice, WalletView};
use risk::CircuitTrip;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployPlan {
    pub round_number: u64,
    pub tiles: TileChoice,
    /// Total SOL for the round, spread over the tiles by the backend.
    pub sol_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    EvBelowThreshold { ev_pct: Decimal, threshold_pct: Decimal },
    MotherlodeBelowFloor { motherlode_sol: Decimal, floor_sol: Decimal },
    RiskTripped(CircuitTrip),
    InsufficientBalance { available_sol: Decimal, required_sol: Decimal },
}

impl SkipReason {
    /// Stable code recorded against the round.
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::EvBelowThreshold { .. } => "ev_below_threshold",
            SkipReason::MotherlodeBelowFloor { .. } => "motherlode_below_floor",
            SkipReason::RiskTripped(_) => "risk_tripped",
            SkipReason::InsufficientBalance { .. } => "insufficient_balance",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EvBelowThreshold {
                ev_pct,
                threshold_pct,
            } => write!(f, "EV {ev_pct}% below threshold {threshold_pct}%"),
            SkipReason::MotherlodeBelowFloor {
                motherlode_sol,
                floor_sol,
            } => write!(f, "motherlode {motherlode_sol} SOL below floor {floor_sol} SOL"),
            SkipReason::RiskTripped(trip) => write!(f, "risk circuit: {trip}"),
            SkipReason::InsufficientBalance {
                available_sol,
                required_sol,
            } => write!(f, "balance {available_sol} SOL below {required_sol} SOL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Decision {
    Skip(SkipReason),
    Deploy(DeployPlan),
}

impl Decision {
    pub fn is_deploy(&self) -> bool {
        matches!(self, Decision::Deploy(_))
    }

    /// The circuit trip, when this decision should pause the session.
    pub fn risk_trip(&self) -> Option<&CircuitTrip> {
        match self {
            Decision::Skip(SkipReason::RiskTripped(trip)) => Some(trip),
            _ => None,
        }
    }
}

/// Inputs to `decide` beyond the round, config and ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext<'a> {
    /// Latest wallet view. `None` skips the liquidity gate.
    pub wallet: Option<&'a WalletView>,
    /// The risk circuit only counts ledger rounds after this one.
    pub risk_anchor: Option<u64>,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub fn decide(
    snapshot: &RoundSnapshot,
    cfg: &SessionConfig,
    ledger: &Ledger,
    ctx: &EvalContext<'_>,
) -> Decision {
    // 1. EV gate
    if snapshot.ev_estimate_pct < cfg.ev_threshold {
        return Decision::Skip(SkipReason::EvBelowThreshold {
            ev_pct: snapshot.ev_estimate_pct,
            threshold_pct: cfg.ev_threshold,
        });
    }

    // 2. Motherlode gate
    if cfg.motherlode_only {
        let floor = cfg.risk_tolerance.motherlode_floor();
        if snapshot.motherlode_sol < floor {
            return Decision::Skip(SkipReason::MotherlodeBelowFloor {
                motherlode_sol: snapshot.motherlode_sol,
                floor_sol: floor,
            });
        }
    }

    // 3. Risk circuit
    let agg = ledger.aggregates_after(ctx.risk_anchor);
    if let Some(trip) = risk::circuit(cfg, &agg) {
        return Decision::Skip(SkipReason::RiskTripped(trip));
    }

    // 4. Liquidity gate: only when both the balance and a start quote are known.
    if let Some(wallet) = ctx.wallet {
        let token = cfg.mining_token;
        if wallet.balances.amounts.contains_key(&token) {
            if let Some(available) = wallet.sol_equivalent(token) {
                if available < cfg.sol_per_round {
                    return Decision::Skip(SkipReason::InsufficientBalance {
                        available_sol: available,
                        required_sol: cfg.sol_per_round,
                    });
                }
            }
        }
    }

    Decision::Deploy(DeployPlan {
        round_number: snapshot.round_number,
        tiles: tiles::select(cfg, snapshot.round_number),
        sol_amount: cfg.sol_per_round,
    })
}
