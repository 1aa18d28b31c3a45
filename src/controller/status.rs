//! Read-only status snapshot published by the controller.
//!
//! External readers (status endpoint, CLI) only ever see a copy taken under
//! a short-lived lock, never the controller's live state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::ErrorKind;
use crate::strategy::risk::CircuitTrip;
use crate::tracker::{ClaimTotals, LedgerAggregates, LedgerEntry, PendingRound};
use crate::types::{RoundSnapshot, SessionConfig, SessionState, TileChoice};

pub type StatusHandle = Arc<RwLock<ControllerStatus>>;

/// Why the controller faulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What the controller did at a round start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    Deployed { tiles: TileChoice, sol: Decimal, reloaded: bool },
    Skipped { reason: String, detail: String },
    /// Round started while paused by the risk circuit.
    Paused,
    /// Rounds up to `to_round` were never seen live; their results were
    /// reconstructed from `session_rounds`.
    Gap { to_round: u64 },
    /// A newer round began before this deployed round had a result.
    Unsettled { sol: Decimal },
    /// The ledger refused the round's result.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundNote {
    pub round: u64,
    #[serde(flatten)]
    pub outcome: RoundOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub config: Option<SessionConfig>,
    pub aggregates: LedgerAggregates,
    /// Most recent ledger entries, at most the ledger window.
    pub recent: Vec<LedgerEntry>,
    pub round: Option<RoundSnapshot>,
    pub pending: Option<PendingRound>,
    pub claims: ClaimTotals,
    pub notes: Vec<RoundNote>,
    pub paused_by: Option<CircuitTrip>,
    pub fault: Option<FaultInfo>,
    /// Rate limiting has persisted past the alarm threshold.
    pub rate_limit_alarm: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            config: None,
            aggregates: LedgerAggregates::default(),
            recent: Vec::new(),
            round: None,
            pending: None,
            claims: ClaimTotals::default(),
            notes: Vec::new(),
            paused_by: None,
            fault: None,
            rate_limit_alarm: false,
            updated_at: Utc::now(),
        }
    }
}

pub fn new_handle() -> StatusHandle {
    Arc::new(RwLock::new(ControllerStatus::default()))
}
