//! Raw SSE event → [`MiningEvent`].

use serde_json::Value;

use super::MiningEvent;
use crate::transport::wire::{self, Envelope};
use crate::transport::RawEvent;
use crate::types::{BalanceVector, RoundResult, RoundSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Event(MiningEvent),
    /// `round_start` carried only the round number; fetch the snapshot.
    RoundStartHint(u64),
    /// Keep-alives and kinds we do not consume.
    Ignored,
    Malformed(String),
}

pub fn normalize(raw: &RawEvent) -> Normalized {
    let (kind, payload) = match resolve_kind(raw) {
        Some(pair) => pair,
        None => return Normalized::Ignored,
    };

    match kind.as_str() {
        "roundstart" | "roundstarted" | "newround" => {
            match wire::decode::<Envelope<wire::RoundDto>>(&payload) {
                Ok(dto) => match RoundSnapshot::try_from(dto.into_inner()) {
                    Ok(snap) => Normalized::Event(MiningEvent::RoundStart(snap)),
                    Err(e) => Normalized::Malformed(e),
                },
                Err(_) => match wire::decode::<Envelope<wire::RoundRef>>(&payload) {
                    Ok(r) => Normalized::RoundStartHint(r.into_inner().round_number),
                    Err(e) => Normalized::Malformed(format!("round_start: {e}")),
                },
            }
        }
        "roundend" | "roundended" | "roundresult" => {
            match wire::decode::<Envelope<wire::RoundResultDto>>(&payload) {
                Ok(dto) => Normalized::Event(MiningEvent::RoundEnd {
                    result: RoundResult::from(dto.into_inner()),
                    reconstructed: false,
                }),
                Err(e) => Normalized::Malformed(format!("round_end: {e}")),
            }
        }
        "deployment" | "deploy" | "deployed" => {
            match wire::decode::<Envelope<wire::DeploymentDto>>(&payload) {
                Ok(dto) => {
                    let d = dto.into_inner();
                    Normalized::Event(MiningEvent::Deployment {
                        round: d.round_number,
                        tiles: d.tiles,
                        sol: d.sol,
                    })
                }
                Err(e) => Normalized::Malformed(format!("deployment: {e}")),
            }
        }
        "claim" | "claimed" => match wire::decode::<Envelope<wire::ClaimDto>>(&payload) {
            Ok(dto) => {
                let c = dto.into_inner();
                Normalized::Event(MiningEvent::Claim {
                    round: c.round_number,
                    sol: c.sol,
                    ore: c.ore,
                })
            }
            Err(e) => Normalized::Malformed(format!("claim: {e}")),
        },
        "balanceupdate" | "balance" => {
            match wire::decode::<Envelope<wire::BalanceDto>>(&payload) {
                Ok(dto) => Normalized::Event(MiningEvent::BalanceUpdate(BalanceVector::from(
                    dto.into_inner(),
                ))),
                Err(e) => Normalized::Malformed(format!("balance_update: {e}")),
            }
        }
        _ => Normalized::Ignored,
    }
}

/// Event kind in canonical form (lowercase, no separators) plus the JSON
/// payload. Unnamed events carry their kind in a `type` or `event` field.
fn resolve_kind(raw: &RawEvent) -> Option<(String, String)> {
    if raw.event != "message" {
        return Some((canonical(&raw.event), raw.data.clone()));
    }
    let value: Value = serde_json::from_str(&raw.data).ok()?;
    let kind = value
        .get("type")
        .or_else(|| value.get("event"))
        .and_then(Value::as_str)?;
    let payload = value.get("data").unwrap_or(&value).to_string();
    Some((canonical(kind), payload))
}

fn canonical(kind: &str) -> String {
    kind.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}
