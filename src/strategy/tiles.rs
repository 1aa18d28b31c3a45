//! Tile selection.

use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::types::{SessionConfig, TileChoice, TileSelection, GRID_TILES};

/// Tiles to deploy on for `round`.
pub fn select(cfg: &SessionConfig, round: u64) -> TileChoice {
    match &cfg.tile_selection {
        TileSelection::Optimal => TileChoice::BackendPicks,
        TileSelection::Random => TileChoice::Tiles(random_tiles(round, cfg.num_tiles)),
        TileSelection::Explicit(tiles) => TileChoice::Tiles(tiles.clone()),
    }
}

/// `count` distinct tile ids, sorted, drawn from a generator seeded with the
/// round number. ChaCha output is stable across platforms and releases.
pub fn random_tiles(round: u64, count: u8) -> Vec<u8> {
    let count = count.min(GRID_TILES) as usize;
    let mut rng = ChaCha8Rng::seed_from_u64(round);
    let mut tiles: Vec<u8> = index::sample(&mut rng, GRID_TILES as usize, count)
        .into_iter()
        .map(|i| i as u8)
        .collect();
    tiles.sort_unstable();
    tiles
}
