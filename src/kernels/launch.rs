//! Launch-geometry derivation.
//!
//! Grid and group sizes are computed from the output tensor shape at graph
//! compile time, never hand-tuned per model. Conv tiles are sized from the
//! kernel extent and the device's fast-memory budget per compute group.

use serde::{Deserialize, Serialize};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Largest square output tile a compute group will cover.
const MAX_TILE: usize = 16;

/// Smallest tile edge considered worth keeping before the planner starts
/// trading channel-block size instead.
const MIN_PREFERRED_TILE: usize = 4;

/// Work-group geometry for one kernel launch: `grid` counts groups per
/// axis, `block` counts threads per group, `shared_mem_bytes` is the fast
/// memory each group stages its operands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    /// One thread per element, groups of `block_size`.
    pub fn auto_1d(len: usize, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        LaunchConfig {
            grid: [ceil_div(len.max(1), block_size) as u32, 1, 1],
            block: [block_size as u32, 1, 1],
            shared_mem_bytes: 0,
        }
    }

    /// One thread per spatial output element, 16x16 groups, one grid layer
    /// per channel.
    pub fn auto_2d(channels: usize, out_h: usize, out_w: usize) -> Self {
        LaunchConfig {
            grid: [
                ceil_div(out_w.max(1), 16) as u32,
                ceil_div(out_h.max(1), 16) as u32,
                channels.max(1) as u32,
            ],
            block: [16, 16, 1],
            shared_mem_bytes: 0,
        }
    }

    /// Tiled conv geometry: a group covers one output tile of one output
    /// channel and stages the matching input patch plus weight window.
    pub fn for_conv(out_channels: usize, out_h: usize, out_w: usize, tile: &ConvTile) -> Self {
        LaunchConfig {
            grid: [
                ceil_div(out_w.max(1), tile.tile_w) as u32,
                ceil_div(out_h.max(1), tile.tile_h) as u32,
                out_channels.max(1) as u32,
            ],
            block: [tile.tile_w as u32, tile.tile_h as u32, 1],
            shared_mem_bytes: tile.shared_bytes as u32,
        }
    }

    pub fn threads_per_group(&self) -> usize {
        self.block.iter().map(|&b| b as usize).product()
    }

    pub fn group_count(&self) -> usize {
        self.grid.iter().map(|&g| g as usize).product()
    }
}

/// Conv tiling decision: output tile extent per group, the input-channel
/// block staged at a time, and the resulting input-patch extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTile {
    pub tile_h: usize,
    pub tile_w: usize,
    pub c_block: usize,
    pub patch_h: usize,
    pub patch_w: usize,
    pub shared_bytes: usize,
}

/// Picks the conv tile for a `kernel`x`kernel` window at `stride` over
/// `in_channels` channels, given `shared_limit` bytes of fast memory per
/// group.
///
/// The input patch for a `t`x`t` output tile spans `(t-1)*stride + kernel`
/// per side. Channel blocks are halved until some tile of at least
/// [`MIN_PREFERRED_TILE`] fits; if not even a 1x1 tile over one channel
/// fits the budget, the minimal tile is returned and the device decides
/// whether to accept the launch.
pub fn plan_conv_tile(
    kernel: usize,
    stride: usize,
    in_channels: usize,
    shared_limit: usize,
) -> ConvTile {
    let mut c_block = in_channels.max(1);
    let chosen = loop {
        let fit = (1..=MAX_TILE)
            .rev()
            .find(|&t| tile_bytes(t, kernel, stride, c_block) <= shared_limit);
        match fit {
            Some(t) if t >= MIN_PREFERRED_TILE || c_block == 1 => break Some((t, c_block)),
            _ if c_block == 1 => break None,
            _ => c_block = (c_block + 1) / 2,
        }
    };
    let (tile, c_block) = chosen.unwrap_or((1, 1));
    let patch = (tile - 1) * stride + kernel;
    ConvTile {
        tile_h: tile,
        tile_w: tile,
        c_block,
        patch_h: patch,
        patch_w: patch,
        shared_bytes: tile_bytes(tile, kernel, stride, c_block),
    }
}

fn tile_bytes(tile: usize, kernel: usize, stride: usize, c_block: usize) -> usize {
    let patch = (tile - 1) * stride + kernel;
    (patch * patch + kernel * kernel) * c_block * F32_BYTES
}

pub(crate) fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_tile_fits_budget() {
        for &(k, s, c) in &[(1, 1, 3), (3, 1, 3), (3, 2, 16), (5, 1, 64), (7, 2, 128)] {
            let tile = plan_conv_tile(k, s, c, 48 * 1024);
            assert!(
                tile.shared_bytes <= 48 * 1024,
                "tile {:?} exceeds budget for k={k} s={s} c={c}",
                tile
            );
            assert_eq!(tile.patch_h, (tile.tile_h - 1) * s + k);
        }
    }

    #[test]
    fn conv_tile_shrinks_with_budget() {
        let big = plan_conv_tile(3, 1, 32, 64 * 1024);
        let small = plan_conv_tile(3, 1, 32, 2 * 1024);
        assert!(small.tile_h * small.tile_w * small.c_block <= big.tile_h * big.tile_w * big.c_block);
        assert!(small.shared_bytes <= 2 * 1024);
    }

    #[test]
    fn conv_tile_is_deterministic() {
        let a = plan_conv_tile(3, 1, 8, 48 * 1024);
        let b = plan_conv_tile(3, 1, 8, 48 * 1024);
        assert_eq!(a, b);
    }

    #[test]
    fn minimal_tile_survives_tiny_budget() {
        let tile = plan_conv_tile(3, 1, 4, 1);
        assert_eq!((tile.tile_h, tile.tile_w, tile.c_block), (1, 1, 1));
    }

    #[test]
    fn auto_1d_covers_all_elements() {
        let cfg = LaunchConfig::auto_1d(1000, 256);
        assert!(cfg.grid[0] as usize * cfg.block[0] as usize >= 1000);
        assert_eq!(cfg.threads_per_group(), 256);
    }
}
