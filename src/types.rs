//! Shared types for the mining controller.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that transport, ingest, strategy,
//! and controller modules can depend on them without circular references.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ConfigInvalid;

/// Number of tiles on the 5×5 grid. Tile ids are `0..GRID_TILES`.
pub const GRID_TILES: u8 = 25;

/// Per-round SOL bounds accepted by the backend.
pub const MIN_SOL_PER_ROUND: Decimal = dec!(0.001);
pub const MAX_SOL_PER_ROUND: Decimal = dec!(1.0);

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Bearer secret for the refinORE API, tagged by flavor at load time.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// `rsk_*` keys, sent as `x-api-key`.
    ApiKey(SecretString),
    /// Legacy tokens, sent as `Authorization: Bearer`.
    Bearer(SecretString),
}

impl Credentials {
    pub const API_KEY_PREFIX: &'static str = "rsk_";

    /// Pick the flavor from the key prefix.
    pub fn from_secret(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with(Self::API_KEY_PREFIX) {
            Credentials::ApiKey(SecretString::new(raw))
        } else {
            Credentials::Bearer(SecretString::new(raw))
        }
    }

    /// Header name and value to attach to every request.
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Credentials::ApiKey(s) => ("x-api-key", s.expose_secret().clone()),
            Credentials::Bearer(s) => ("authorization", format!("Bearer {}", s.expose_secret())),
        }
    }

    /// Replace every occurrence of the secret in `text`.
    pub fn redact(&self, text: &str) -> String {
        let secret = match self {
            Credentials::ApiKey(s) | Credentials::Bearer(s) => s.expose_secret(),
        };
        if secret.is_empty() {
            return text.to_string();
        }
        text.replace(secret.as_str(), "[REDACTED]")
    }
}

// ---------------------------------------------------------------------------
// Session configuration enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

impl RiskTolerance {
    /// Minimum motherlode (SOL) for `motherlode_only` sessions.
    pub fn motherlode_floor(&self) -> Decimal {
        match self {
            RiskTolerance::Low => dec!(100),
            RiskTolerance::Medium => dec!(50),
            RiskTolerance::High => dec!(20),
        }
    }

    /// Typical tile counts for this tolerance. Fewer tiles means a lower
    /// hit rate with a larger share per win.
    pub fn tile_bounds(&self) -> RangeInclusive<u8> {
        match self {
            RiskTolerance::Low => 13..=GRID_TILES,
            RiskTolerance::Medium => 5..=GRID_TILES,
            RiskTolerance::High => 1..=GRID_TILES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTolerance::Low => "low",
            RiskTolerance::Medium => "medium",
            RiskTolerance::High => "high",
        }
    }
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTolerance {
    type Err = ConfigInvalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskTolerance::Low),
            "medium" | "med" => Ok(RiskTolerance::Medium),
            "high" => Ok(RiskTolerance::High),
            _ => Err(ConfigInvalid(format!("unknown risk tolerance: {s}"))),
        }
    }
}

/// Token the session spends each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MiningToken {
    #[serde(rename = "SOL")]
    Sol,
    #[serde(rename = "USDC")]
    Usdc,
    #[serde(rename = "ORE")]
    Ore,
    #[serde(rename = "stORE")]
    Store,
    #[serde(rename = "SKR")]
    Skr,
}

impl MiningToken {
    pub const ALL: &'static [MiningToken] = &[
        MiningToken::Sol,
        MiningToken::Usdc,
        MiningToken::Ore,
        MiningToken::Store,
        MiningToken::Skr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MiningToken::Sol => "SOL",
            MiningToken::Usdc => "USDC",
            MiningToken::Ore => "ORE",
            MiningToken::Store => "stORE",
            MiningToken::Skr => "SKR",
        }
    }
}

impl fmt::Display for MiningToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MiningToken {
    type Err = ConfigInvalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sol" => Ok(MiningToken::Sol),
            "usdc" => Ok(MiningToken::Usdc),
            "ore" => Ok(MiningToken::Ore),
            "store" => Ok(MiningToken::Store),
            "skr" => Ok(MiningToken::Skr),
            _ => Err(ConfigInvalid(format!("unknown mining token: {s}"))),
        }
    }
}

/// How tiles are chosen for each deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileSelection {
    /// Backend picks the tiles.
    Optimal,
    /// Seeded by the round number, picked locally.
    Random,
    /// Pinned tile ids.
    Explicit(Vec<u8>),
}

impl TileSelection {
    /// Value of the `tile_selection_mode` wire field.
    pub fn mode(&self) -> &'static str {
        match self {
            TileSelection::Optimal => "optimal",
            TileSelection::Random => "random",
            TileSelection::Explicit(_) => "custom",
        }
    }
}

impl fmt::Display for TileSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileSelection::Explicit(tiles) => write!(f, "explicit{tiles:?}"),
            other => f.write_str(other.mode()),
        }
    }
}

/// Parses `optimal`, `random`, or a comma-separated tile list.
impl FromStr for TileSelection {
    type Err = ConfigInvalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "optimal" => Ok(TileSelection::Optimal),
            "random" => Ok(TileSelection::Random),
            list => {
                let tiles = list
                    .split(',')
                    .map(|t| t.trim().parse::<u8>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ConfigInvalid(format!("unknown tile selection: {s}")))?;
                Ok(TileSelection::Explicit(tiles))
            }
        }
    }
}

/// Deployment cadence. The backend only documents `every_round`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    EveryRound,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        "every_round"
    }
}

impl FromStr for Frequency {
    type Err = ConfigInvalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "every_round" => Ok(Frequency::EveryRound),
            other => Err(ConfigInvalid(format!("unsupported frequency: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Immutable per-session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub sol_per_round: Decimal,
    pub num_tiles: u8,
    pub risk_tolerance: RiskTolerance,
    pub mining_token: MiningToken,
    pub tile_selection: TileSelection,
    pub auto_restart: bool,
    pub frequency: Frequency,
    /// Skip rounds whose EV estimate (percent) is below this.
    pub ev_threshold: Decimal,
    pub motherlode_only: bool,
    pub stop_loss_sol: Option<Decimal>,
    pub max_loss_streak: Option<u32>,
}

impl SessionConfig {
    /// A config with the default policy: medium risk, SOL, optimal tiles,
    /// auto-restart, no EV floor and no circuit limits.
    pub fn new(sol_per_round: Decimal, num_tiles: u8) -> Self {
        Self {
            sol_per_round,
            num_tiles,
            risk_tolerance: RiskTolerance::Medium,
            mining_token: MiningToken::Sol,
            tile_selection: TileSelection::Optimal,
            auto_restart: true,
            frequency: Frequency::EveryRound,
            ev_threshold: Decimal::ZERO,
            motherlode_only: false,
            stop_loss_sol: None,
            max_loss_streak: None,
        }
    }

    /// Structural validation. A session never leaves `idle` with a config
    /// that fails this.
    pub fn validate(&self) -> Result<(), ConfigInvalid> {
        if self.sol_per_round < MIN_SOL_PER_ROUND || self.sol_per_round > MAX_SOL_PER_ROUND {
            return Err(ConfigInvalid(format!(
                "sol_per_round {} outside [{MIN_SOL_PER_ROUND}, {MAX_SOL_PER_ROUND}]",
                self.sol_per_round
            )));
        }
        if self.num_tiles == 0 || self.num_tiles > GRID_TILES {
            return Err(ConfigInvalid(format!(
                "num_tiles {} outside [1, {GRID_TILES}]",
                self.num_tiles
            )));
        }

        if let TileSelection::Explicit(tiles) = &self.tile_selection {
            if tiles.len() != self.num_tiles as usize {
                return Err(ConfigInvalid(format!(
                    "explicit tile list has {} ids but num_tiles is {}",
                    tiles.len(),
                    self.num_tiles
                )));
            }
            let distinct: BTreeSet<u8> = tiles.iter().copied().collect();
            if distinct.len() != tiles.len() {
                return Err(ConfigInvalid("explicit tile ids must be distinct".into()));
            }
            if let Some(bad) = tiles.iter().find(|t| **t >= GRID_TILES) {
                return Err(ConfigInvalid(format!("tile id {bad} outside [0, 24]")));
            }
        }

        if let Some(limit) = self.stop_loss_sol {
            if limit <= Decimal::ZERO {
                return Err(ConfigInvalid("stop_loss_sol must be positive".into()));
            }
        }
        if self.max_loss_streak == Some(0) {
            return Err(ConfigInvalid("max_loss_streak must be positive".into()));
        }
        Ok(())
    }

    /// Warning for a tile count outside the usual range for the chosen risk
    /// tolerance. Such configs are still valid.
    pub fn risk_advisory(&self) -> Option<String> {
        let bounds = self.risk_tolerance.tile_bounds();
        (!bounds.contains(&self.num_tiles)).then(|| {
            format!(
                "{} tiles is unusual for {} risk (typical {}-{})",
                self.num_tiles,
                self.risk_tolerance,
                bounds.start(),
                bounds.end()
            )
        })
    }

    /// Tile set sent with the initial start request.
    pub fn start_tiles(&self) -> TileChoice {
        match &self.tile_selection {
            TileSelection::Explicit(tiles) => TileChoice::Tiles(tiles.clone()),
            _ => TileChoice::BackendPicks,
        }
    }
}

impl fmt::Display for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/round x{} tiles ({}) | risk={} | ev>={}% | auto_restart={}",
            self.sol_per_round,
            self.mining_token,
            self.num_tiles,
            self.tile_selection,
            self.risk_tolerance,
            self.ev_threshold,
            self.auto_restart,
        )
    }
}

/// Concrete tiles attached to a start or reload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileChoice {
    /// Omit tile ids; the backend picks.
    BackendPicks,
    Tiles(Vec<u8>),
}

impl TileChoice {
    pub fn tile_ids(&self) -> Option<&[u8]> {
        match self {
            TileChoice::BackendPicks => None,
            TileChoice::Tiles(t) => Some(t),
        }
    }
}

/// Body of a reload: the session config plus the tiles for the next round.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadRequest {
    pub config: SessionConfig,
    pub tiles: TileChoice,
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Active,
    Settling,
    Finalized,
}

impl FromStr for RoundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" | "open" => Ok(RoundStatus::Active),
            "settling" | "pending" => Ok(RoundStatus::Settling),
            "finalized" | "final" | "closed" => Ok(RoundStatus::Finalized),
            other => Err(format!("unknown round status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileState {
    pub id: u8,
    pub sol_deployed: Decimal,
    pub num_miners: u32,
}

/// Live view of the current round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_number: u64,
    pub status: RoundStatus,
    pub time_remaining_sec: u64,
    pub total_sol_deployed: Decimal,
    pub num_miners: u32,
    pub motherlode_sol: Decimal,
    /// Backend EV estimate, in percent.
    pub ev_estimate_pct: Decimal,
    /// Always `GRID_TILES` entries, ordered by id.
    pub tiles: Vec<TileState>,
}

impl RoundSnapshot {
    /// An active round with an empty grid.
    pub fn new(round_number: u64, ev_estimate_pct: Decimal) -> Self {
        Self {
            round_number,
            status: RoundStatus::Active,
            time_remaining_sec: 60,
            total_sol_deployed: Decimal::ZERO,
            num_miners: 0,
            motherlode_sol: Decimal::ZERO,
            ev_estimate_pct,
            tiles: empty_grid(),
        }
    }

    pub fn with_motherlode(mut self, motherlode_sol: Decimal) -> Self {
        self.motherlode_sol = motherlode_sol;
        self
    }
}

impl fmt::Display for RoundSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "round #{} [{:?}] {}s left | deployed={} SOL | miners={} | motherlode={} SOL | ev={}%",
            self.round_number,
            self.status,
            self.time_remaining_sec,
            self.total_sol_deployed,
            self.num_miners,
            self.motherlode_sol,
            self.ev_estimate_pct,
        )
    }
}

/// A grid of `GRID_TILES` tiles with nothing deployed.
pub fn empty_grid() -> Vec<TileState> {
    (0..GRID_TILES)
        .map(|id| TileState {
            id,
            sol_deployed: Decimal::ZERO,
            num_miners: 0,
        })
        .collect()
}

/// Outcome of one finalized round for this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_number: u64,
    pub won: bool,
    pub sol_deployed: Decimal,
    pub sol_earned: Decimal,
    pub ore_earned: Decimal,
    pub tiles_selected: Vec<u8>,
    pub winning_tile: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl RoundResult {
    pub fn net_pnl_sol(&self) -> Decimal {
        self.sol_earned - self.sol_deployed
    }

    /// Whether the session had anything on the grid this round.
    pub fn participated(&self) -> bool {
        self.sol_deployed > Decimal::ZERO
    }
}

impl fmt::Display for RoundResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pnl = self.net_pnl_sol();
        let sign = if pnl >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "round #{} {} | deployed={} earned={} ({sign}{pnl}) ore={} | winning_tile={:?}",
            self.round_number,
            if self.won { "WON" } else { "lost" },
            self.sol_deployed,
            self.sol_earned,
            self.ore_earned,
            self.winning_tile,
        )
    }
}

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// Multi-token wallet balances, with optional SOL quotes per token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceVector {
    pub amounts: BTreeMap<MiningToken, Decimal>,
    /// Price of one unit of the token in SOL, when the backend reports it.
    pub sol_quotes: BTreeMap<MiningToken, Decimal>,
}

impl BalanceVector {
    pub fn amount(&self, token: MiningToken) -> Decimal {
        self.amounts.get(&token).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn quote(&self, token: MiningToken) -> Option<Decimal> {
        match token {
            MiningToken::Sol => Some(Decimal::ONE),
            other => self.sol_quotes.get(&other).copied(),
        }
    }
}

/// Latest balances plus the quote captured at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletView {
    pub balances: BalanceVector,
    pub start_quote: BTreeMap<MiningToken, Decimal>,
}

impl WalletView {
    /// Freeze the quotes in `balances` as the session-start quote.
    pub fn at_session_start(balances: BalanceVector) -> Self {
        let start_quote = MiningToken::ALL
            .iter()
            .filter_map(|t| balances.quote(*t).map(|q| (*t, q)))
            .collect();
        Self {
            balances,
            start_quote,
        }
    }

    /// Replace balances; the start quote is kept.
    pub fn update(&mut self, balances: BalanceVector) {
        self.balances = balances;
    }

    /// Balance of `token` converted to SOL at the session-start quote.
    /// `None` if the token was never quoted.
    pub fn sol_equivalent(&self, token: MiningToken) -> Option<Decimal> {
        let quote = self.start_quote.get(&token)?;
        Some(self.balances.amount(token) * quote)
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Controller-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    PausedByRisk,
    Stopping,
    Stopped,
    Faulted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Faulted
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::PausedByRisk => "pausedByRisk",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Acknowledgement of a start or reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub status: String,
}

/// Backend view of the active session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: String,
    pub sol_per_round: Option<Decimal>,
    pub num_tiles: Option<u8>,
    pub tile_mode: Option<String>,
    pub tile_ids: Option<Vec<u8>>,
    pub mining_token: Option<MiningToken>,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status.to_lowercase().as_str(),
            "active" | "running" | "mining" | "started"
        )
    }

    /// Whether this backend session runs `cfg`. Fields the backend did not
    /// report are not compared.
    pub fn matches(&self, cfg: &SessionConfig) -> bool {
        self.sol_per_round.map_or(true, |s| s == cfg.sol_per_round)
            && self.num_tiles.map_or(true, |n| n == cfg.num_tiles)
            && self.mining_token.map_or(true, |t| t == cfg.mining_token)
            && self
                .tile_mode
                .as_deref()
                .map_or(true, |m| m.eq_ignore_ascii_case(cfg.tile_selection.mode()))
            && match &cfg.tile_selection {
                TileSelection::Explicit(tiles) => {
                    self.matches_tiles(&TileChoice::Tiles(tiles.clone()))
                }
                _ => true,
            }
    }

    /// Whether the backend already deploys on `tiles`.
    pub fn matches_tiles(&self, tiles: &TileChoice) -> bool {
        match (tiles, &self.tile_ids) {
            (TileChoice::BackendPicks, None) => true,
            (TileChoice::BackendPicks, Some(ids)) => ids.is_empty(),
            (TileChoice::Tiles(want), Some(have)) => {
                let want: BTreeSet<u8> = want.iter().copied().collect();
                let have: BTreeSet<u8> = have.iter().copied().collect();
                want == have
            }
            (TileChoice::Tiles(_), None) => false,
        }
    }
}

/// Totals reported by the backend when a session stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSummary {
    pub rounds_played: u32,
    pub sol_deployed: Decimal,
    pub sol_earned: Decimal,
    pub ore_earned: Decimal,
    pub net_pnl_sol: Decimal,
}

impl fmt::Display for StopSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rounds | deployed={} SOL | earned={} SOL | ore={} | net={} SOL",
            self.rounds_played,
            self.sol_deployed,
            self.sol_earned,
            self.ore_earned,
            self.net_pnl_sol
        )
    }
}

/// One prior session from `/mining/history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub rounds_played: u32,
    pub net_pnl_sol: Decimal,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
