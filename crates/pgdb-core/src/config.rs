//! Tunables shared by every binary: frame thresholds, relay branching
//! factor, varprint caps, and front-end history depth. Each binary's own
//! `clap::Parser` struct `#[command(flatten)]`s this group.

use clap::Args;

use crate::coordinator::VarprintLimits;
use crate::transport::FrameConfig;

#[derive(Debug, Clone, Args)]
pub struct CoreConfig {
    /// Messages larger than this many bytes are zstd-compressed instead of split.
    #[arg(long, default_value_t = 64 * 1024)]
    pub frame_compress_threshold: usize,

    /// Messages larger than this many bytes (and not compressed) are split
    /// into multi-header/multi-payload frames.
    #[arg(long, default_value_t = 16 * 1024)]
    pub frame_split_threshold: usize,

    /// Size of each chunk when a message is split.
    #[arg(long, default_value_t = 8 * 1024)]
    pub frame_chunk_size: usize,

    /// zstd compression level used for oversized frames.
    #[arg(long, default_value_t = 3)]
    pub zstd_level: i32,

    /// Maximum number of direct children per relay node.
    #[arg(long, default_value_t = 32)]
    pub relay_branching_factor: usize,

    /// Maximum depth a varprint DFS descends before pruning, except along
    /// the branch leading to the requested name.
    #[arg(long, default_value_t = 5)]
    pub varprint_max_depth: usize,

    /// Maximum children a single varprint DFS level expands before setting
    /// `more_children` on the parent.
    #[arg(long, default_value_t = 60)]
    pub varprint_max_children: usize,

    /// Above this many siblings reported by GDB, a level is not expanded
    /// further regardless of depth.
    #[arg(long, default_value_t = 128)]
    pub varprint_max_siblings: usize,

    /// Number of past aggregated batches the front-end keeps for `expand`.
    #[arg(long, default_value_t = 64)]
    pub history_length: usize,

    /// Number of MPI ranks assigned to each back-end host.
    #[arg(long, default_value_t = 1)]
    pub ranks_per_backend: i64,

    /// A relay flushes its aggregation barrier after this many
    /// milliseconds even if not every expected child has reported.
    #[arg(long, default_value_t = 250)]
    pub relay_barrier_timeout_ms: u64,

    /// A back-end that has heard nothing on its parent stream for this
    /// many seconds self-terminates.
    #[arg(long, default_value_t = 30)]
    pub backend_grace_period_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            frame_compress_threshold: 64 * 1024,
            frame_split_threshold: 16 * 1024,
            frame_chunk_size: 8 * 1024,
            zstd_level: 3,
            relay_branching_factor: 32,
            varprint_max_depth: 5,
            varprint_max_children: 60,
            varprint_max_siblings: 128,
            history_length: 64,
            ranks_per_backend: 1,
            relay_barrier_timeout_ms: 250,
            backend_grace_period_secs: 30,
        }
    }
}

impl CoreConfig {
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            compress_threshold: self.frame_compress_threshold,
            split_threshold: self.frame_split_threshold,
            chunk_size: self.frame_chunk_size,
            zstd_level: self.zstd_level,
        }
    }

    pub fn varprint_limits(&self) -> VarprintLimits {
        VarprintLimits {
            max_depth: self.varprint_max_depth,
            max_children: self.varprint_max_children,
            max_siblings: self.varprint_max_siblings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_frame_and_varprint_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.frame_config().compress_threshold, FrameConfig::default().compress_threshold);
        assert_eq!(cfg.varprint_limits().max_children, VarprintLimits::default().max_children);
    }
}
