//! Status API route handlers.
//!
//! All endpoints return JSON built from the controller's published
//! snapshot. Handlers hold the read lock only long enough to copy what they
//! need.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::controller::{FaultInfo, RoundNote, StatusHandle};
use crate::strategy::risk::CircuitTrip;
use crate::tracker::{ClaimTotals, LedgerAggregates, LedgerEntry, PendingRound};
use crate::types::{RoundSnapshot, SessionConfig, SessionState};

/// Entries returned by `/api/ledger` when no limit is given.
const DEFAULT_LEDGER_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub status: StatusHandle,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(status: StatusHandle) -> Self {
        Self {
            status,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub config: Option<SessionConfig>,
    pub aggregates: LedgerAggregates,
    pub win_rate: f64,
    pub claims: ClaimTotals,
    pub last_note: Option<RoundNote>,
    pub paused_by: Option<CircuitTrip>,
    pub fault: Option<FaultInfo>,
    pub rate_limit_alarm: bool,
    pub uptime_secs: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerResponse {
    pub total_entries: usize,
    pub aggregates: LedgerAggregates,
    /// Most recent entries, oldest first. Bounded by the ledger window.
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundResponse {
    pub round: RoundSnapshot,
    pub pending: Option<PendingRound>,
    pub deployed_sol: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.status.read().await;
    Json(StatusResponse {
        state: status.state,
        session_id: status.session_id.clone(),
        config: status.config.clone(),
        aggregates: status.aggregates.clone(),
        win_rate: status.aggregates.win_rate(),
        claims: status.claims.clone(),
        last_note: status.notes.last().cloned(),
        paused_by: status.paused_by.clone(),
        fault: status.fault.clone(),
        rate_limit_alarm: status.rate_limit_alarm,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        updated_at: status.updated_at,
    })
}

/// GET /api/ledger?limit=N
pub async fn get_ledger(
    State(state): State<AppState>,
    Query(q): Query<LedgerQuery>,
) -> Json<LedgerResponse> {
    let status = state.status.read().await;
    let limit = q.limit.unwrap_or(DEFAULT_LEDGER_LIMIT);
    let start = status.recent.len().saturating_sub(limit);
    Json(LedgerResponse {
        total_entries: status.aggregates.rounds as usize,
        aggregates: status.aggregates.clone(),
        entries: status.recent[start..].to_vec(),
    })
}

/// GET /api/round. 404 until the first round has been seen.
pub async fn get_round(
    State(state): State<AppState>,
) -> Result<Json<RoundResponse>, StatusCode> {
    let status = state.status.read().await;
    let round = status.round.clone().ok_or(StatusCode::NOT_FOUND)?;
    let pending = status
        .pending
        .clone()
        .filter(|p| p.round_number == round.round_number);
    let deployed_sol = pending.as_ref().map_or(Decimal::ZERO, |p| p.sol_deployed);
    Ok(Json(RoundResponse {
        round,
        pending,
        deployed_sol,
    }))
}

/// GET /api/notes
pub async fn get_notes(State(state): State<AppState>) -> Json<Vec<RoundNote>> {
    let status = state.status.read().await;
    Json(status.notes.clone())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::status::new_handle;
    use crate::controller::RoundOutcome;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_get_status_idle() {
        let state = Arc::new(DashboardState::new(new_handle()));
        let Json(resp) = get_status(State(state)).await;
        assert_eq!(resp.state, SessionState::Idle);
        assert_eq!(resp.win_rate, 0.0);
        assert!(resp.last_note.is_none());
    }

    #[tokio::test]
    async fn test_get_status_reports_last_note() {
        let handle = new_handle();
        handle.write().await.notes.push(RoundNote {
            round: 12,
            outcome: RoundOutcome::Skipped {
                reason: "ev_below_threshold".into(),
                detail: "EV 5% below threshold 10%".into(),
            },
        });
        let state = Arc::new(DashboardState::new(handle));
        let Json(resp) = get_status(State(state)).await;
        assert_eq!(resp.last_note.map(|n| n.round), Some(12));
    }

    #[tokio::test]
    async fn test_get_round_missing() {
        let state = Arc::new(DashboardState::new(new_handle()));
        assert_eq!(get_round(State(state)).await.err(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_get_round_with_pending() {
        let handle = new_handle();
        {
            let mut s = handle.write().await;
            s.round = Some(RoundSnapshot::new(77, dec!(4)));
            s.pending = Some(PendingRound {
                round_number: 77,
                sol_deployed: dec!(0.01),
                tiles: vec![3],
            });
        }
        let state = Arc::new(DashboardState::new(handle));
        let Json(resp) = get_round(State(state)).await.unwrap();
        assert_eq!(resp.round.round_number, 77);
        assert_eq!(resp.deployed_sol, dec!(0.01));
    }
}
