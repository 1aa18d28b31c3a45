//! Wire DTOs for the refinORE JSON API.
//!
//! The backend is inconsistent about casing and envelopes, so every DTO
//! accepts the snake_case name plus the camelCase and legacy spellings seen
//! in the field. Unknown fields are ignored. A missing required field is a
//! decode error, which the client reports as `ProtocolMismatch`.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{
    empty_grid, BalanceVector, MiningToken, RiskTolerance, RoundResult, RoundSnapshot,
    RoundStatus, SessionConfig, SessionHandle, SessionSnapshot, SessionSummary, StopSummary,
    TileState, GRID_TILES,
};

/// Parse `body` as `T`, returning a short description on failure.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, String> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// A payload that may or may not be wrapped in a single-key object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Wrapped {
        #[serde(
            alias = "data",
            alias = "session",
            alias = "round",
            alias = "result",
            alias = "rounds",
            alias = "sessions",
            alias = "history"
        )]
        inner: T,
    },
    Bare(T),
}

impl<T> Envelope<T> {
    pub fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { inner } | Envelope::Bare(inner) => inner,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SessionBody {
    sol_per_round: Decimal,
    num_tiles: u8,
    risk_tolerance: RiskTolerance,
    mining_token: MiningToken,
    tile_selection_mode: &'static str,
    auto_restart: bool,
    frequency: &'static str,
    ev_threshold: Decimal,
    motherlode_only: bool,
}

/// JSON body for start, start-strategy and reload. `tiles`, when present,
/// is written under `tiles_field`.
pub fn session_body(
    cfg: &SessionConfig,
    tiles: Option<&[u8]>,
    tiles_field: &str,
) -> serde_json::Value {
    let body = SessionBody {
        sol_per_round: cfg.sol_per_round,
        num_tiles: cfg.num_tiles,
        risk_tolerance: cfg.risk_tolerance,
        mining_token: cfg.mining_token,
        tile_selection_mode: cfg.tile_selection.mode(),
        auto_restart: cfg.auto_restart,
        frequency: cfg.frequency.as_str(),
        ev_threshold: cfg.ev_threshold,
        motherlode_only: cfg.motherlode_only,
    };
    let mut value = serde_json::to_value(body).unwrap_or_else(|_| serde_json::json!({}));
    if let (Some(tiles), Some(map)) = (tiles, value.as_object_mut()) {
        map.insert(tiles_field.to_string(), serde_json::json!(tiles));
    }
    value
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Deserialize)]
pub struct HandleDto {
    #[serde(alias = "sessionId", alias = "id")]
    session_id: String,
    #[serde(default = "default_status")]
    status: String,
}

impl From<HandleDto> for SessionHandle {
    fn from(dto: HandleDto) -> Self {
        SessionHandle {
            session_id: dto.session_id,
            status: dto.status,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionDto {
    #[serde(alias = "sessionId", alias = "id")]
    session_id: String,
    #[serde(default = "default_status")]
    status: String,
    #[serde(default, alias = "solPerRound", alias = "sol_amount", alias = "solAmount")]
    sol_per_round: Option<Decimal>,
    #[serde(default, alias = "numTiles", alias = "num_squares")]
    num_tiles: Option<u8>,
    #[serde(default, alias = "tileSelectionMode", alias = "tile_mode")]
    tile_selection_mode: Option<String>,
    #[serde(default, alias = "tileIds", alias = "custom_tiles")]
    tile_ids: Option<Vec<u8>>,
    #[serde(default, alias = "miningToken")]
    mining_token: Option<String>,
    #[serde(default, alias = "startedAt")]
    started_at: Option<DateTime<Utc>>,
}

impl From<SessionDto> for SessionSnapshot {
    fn from(dto: SessionDto) -> Self {
        SessionSnapshot {
            session_id: dto.session_id,
            status: dto.status,
            sol_per_round: dto.sol_per_round,
            num_tiles: dto.num_tiles,
            tile_mode: dto.tile_selection_mode,
            tile_ids: dto.tile_ids,
            mining_token: dto
                .mining_token
                .as_deref()
                .and_then(|t| MiningToken::from_str(t).ok()),
            started_at: dto.started_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StopDto {
    #[serde(default, alias = "roundsPlayed", alias = "rounds")]
    rounds_played: u32,
    #[serde(default, alias = "solDeployed", alias = "total_deployed")]
    sol_deployed: Decimal,
    #[serde(default, alias = "solEarned", alias = "total_earned")]
    sol_earned: Decimal,
    #[serde(default, alias = "oreEarned")]
    ore_earned: Decimal,
    #[serde(default, alias = "netPnlSol", alias = "net_pnl")]
    net_pnl_sol: Option<Decimal>,
}

impl From<StopDto> for StopSummary {
    fn from(dto: StopDto) -> Self {
        StopSummary {
            rounds_played: dto.rounds_played,
            sol_deployed: dto.sol_deployed,
            sol_earned: dto.sol_earned,
            ore_earned: dto.ore_earned,
            net_pnl_sol: dto
                .net_pnl_sol
                .unwrap_or(dto.sol_earned - dto.sol_deployed),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryDto {
    #[serde(alias = "sessionId", alias = "id")]
    session_id: String,
    #[serde(default, alias = "startedAt")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "endedAt")]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "roundsPlayed", alias = "rounds")]
    rounds_played: u32,
    #[serde(default, alias = "netPnlSol", alias = "net_pnl")]
    net_pnl_sol: Decimal,
}

impl From<HistoryDto> for SessionSummary {
    fn from(dto: HistoryDto) -> Self {
        SessionSummary {
            session_id: dto.session_id,
            started_at: dto.started_at,
            ended_at: dto.ended_at,
            rounds_played: dto.rounds_played,
            net_pnl_sol: dto.net_pnl_sol,
        }
    }
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TileDto {
    #[serde(alias = "tile", alias = "square")]
    id: u8,
    #[serde(default, alias = "solDeployed", alias = "deployed")]
    sol_deployed: Decimal,
    #[serde(default, alias = "numMiners", alias = "miners")]
    num_miners: u32,
}

#[derive(Debug, Deserialize)]
pub struct RoundDto {
    #[serde(alias = "roundNumber", alias = "round", alias = "round_id", alias = "roundId")]
    round_number: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "timeRemainingSec", alias = "time_remaining")]
    time_remaining_sec: Option<u64>,
    #[serde(default, alias = "totalSolDeployed", alias = "total_deployed")]
    total_sol_deployed: Option<Decimal>,
    #[serde(default, alias = "numMiners")]
    num_miners: Option<u32>,
    #[serde(default, alias = "motherlodeSol", alias = "motherlode")]
    motherlode_sol: Option<Decimal>,
    #[serde(alias = "evEstimatePct", alias = "ev", alias = "ev_pct")]
    ev_estimate_pct: Decimal,
    #[serde(default, alias = "squares")]
    tiles: Option<Vec<TileDto>>,
}

impl TryFrom<RoundDto> for RoundSnapshot {
    type Error = String;

    fn try_from(dto: RoundDto) -> Result<Self, Self::Error> {
        let status = match dto.status.as_deref() {
            Some(s) => RoundStatus::from_str(s)?,
            None => RoundStatus::Active,
        };

        let mut tiles = empty_grid();
        for t in dto.tiles.unwrap_or_default() {
            if t.id < GRID_TILES {
                tiles[t.id as usize] = TileState {
                    id: t.id,
                    sol_deployed: t.sol_deployed,
                    num_miners: t.num_miners,
                };
            }
        }

        let total = dto
            .total_sol_deployed
            .unwrap_or_else(|| tiles.iter().map(|t| t.sol_deployed).sum());

        Ok(RoundSnapshot {
            round_number: dto.round_number,
            status,
            time_remaining_sec: dto.time_remaining_sec.unwrap_or(0),
            total_sol_deployed: total,
            num_miners: dto.num_miners.unwrap_or(0),
            motherlode_sol: dto.motherlode_sol.unwrap_or(Decimal::ZERO),
            ev_estimate_pct: dto.ev_estimate_pct,
            tiles,
        })
    }
}

/// Just the round number, for events that carry nothing else.
#[derive(Debug, Deserialize)]
pub struct RoundRef {
    #[serde(alias = "roundNumber", alias = "round", alias = "round_id", alias = "roundId")]
    pub round_number: u64,
}

#[derive(Debug, Deserialize)]
pub struct RoundResultDto {
    #[serde(alias = "roundNumber", alias = "round", alias = "round_id", alias = "roundId")]
    round_number: u64,
    #[serde(default)]
    won: Option<bool>,
    #[serde(default, alias = "solDeployed", alias = "deployed")]
    sol_deployed: Decimal,
    #[serde(default, alias = "solEarned", alias = "sol_won", alias = "reward")]
    sol_earned: Decimal,
    #[serde(default, alias = "oreEarned", alias = "ore")]
    ore_earned: Decimal,
    #[serde(default, alias = "tilesSelected", alias = "tiles", alias = "tile_ids")]
    tiles_selected: Vec<u8>,
    #[serde(default, alias = "winningTile", alias = "winning_square")]
    winning_tile: Option<u8>,
    #[serde(default, alias = "endedAt", alias = "ended_at")]
    timestamp: Option<DateTime<Utc>>,
}

impl From<RoundResultDto> for RoundResult {
    fn from(dto: RoundResultDto) -> Self {
        // Older payloads omit `won`; infer it from the winning tile or payout.
        let won = dto.won.unwrap_or_else(|| match dto.winning_tile {
            Some(w) if !dto.tiles_selected.is_empty() => dto.tiles_selected.contains(&w),
            _ => dto.sol_earned > Decimal::ZERO,
        });
        RoundResult {
            round_number: dto.round_number,
            won,
            sol_deployed: dto.sol_deployed,
            sol_earned: dto.sol_earned,
            ore_earned: dto.ore_earned,
            tiles_selected: dto.tiles_selected,
            winning_tile: dto.winning_tile,
            timestamp: dto.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeploymentDto {
    #[serde(alias = "roundNumber", alias = "round", alias = "round_id", alias = "roundId")]
    pub round_number: u64,
    #[serde(default, alias = "tile_ids", alias = "tileIds", alias = "squares")]
    pub tiles: Vec<u8>,
    #[serde(default, alias = "sol_amount", alias = "solAmount", alias = "amount")]
    pub sol: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ClaimDto {
    #[serde(alias = "roundNumber", alias = "round", alias = "round_id", alias = "roundId")]
    pub round_number: u64,
    #[serde(default, alias = "sol_claimed", alias = "solClaimed")]
    pub sol: Decimal,
    #[serde(default, alias = "ore_claimed", alias = "oreClaimed")]
    pub ore: Decimal,
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BalanceDto {
    Structured {
        balances: BTreeMap<String, serde_json::Value>,
        #[serde(default, alias = "solQuotes", alias = "quotes", alias = "prices_sol")]
        sol_quotes: BTreeMap<String, serde_json::Value>,
    },
    Flat(BTreeMap<String, serde_json::Value>),
}

impl From<BalanceDto> for BalanceVector {
    fn from(dto: BalanceDto) -> Self {
        let (balances, quotes) = match dto {
            BalanceDto::Structured {
                balances,
                sol_quotes,
            } => (balances, sol_quotes),
            BalanceDto::Flat(balances) => (balances, BTreeMap::new()),
        };
        BalanceVector {
            amounts: token_map(balances),
            sol_quotes: token_map(quotes),
        }
    }
}

/// Keep the entries whose key is a known token and whose value is numeric.
fn token_map(raw: BTreeMap<String, serde_json::Value>) -> BTreeMap<MiningToken, Decimal> {
    raw.into_iter()
        .filter_map(|(k, v)| {
            let token = MiningToken::from_str(&k).ok()?;
            Some((token, value_to_decimal(&v)?))
        })
        .collect()
}

fn value_to_decimal(v: &serde_json::Value) -> Option<Decimal> {
    let text = match v {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}
