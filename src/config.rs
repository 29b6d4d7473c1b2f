//! Process-wide configuration, consolidating the constants that the original
//! recovery scripts scattered across modules into one threaded record.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tunable thresholds and resource limits shared by every component.
///
/// Built with [`EngineConfig::default`], then optionally overridden by a
/// `virex.toml` file beside the binary, then by environment variables
/// (`VIREX_FFMPEG_DIR`, `VIREX_WORKERS`), then by CLI flags — in that order,
/// each later source winning over the former.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunks larger than this are rejected as corrupt (10 MiB).
    pub max_reasonable_chunk_size: u64,
    /// Chunks at or below this size are rejected as corrupt (16 bytes).
    pub min_reasonable_chunk_size: u64,
    /// Recovered clip shorter than this many seconds falls back to a still image.
    pub slack_image_threshold_sec: f64,
    /// Gap (in bytes) tolerated between a damage point and the next good signature.
    pub unknown_gap_min: u64,
    /// Absolute byte budget reserved at the tail of an image for protective sectors.
    pub tail_abs: u64,
    /// Fraction of image size reserved at the tail when `tail_abs` does not apply.
    pub tail_ratio: f64,
    /// Sector size assumed when the image source does not report one.
    pub sector_size: u64,
    /// Bounded worker-pool size; `0` means compute from CPU count.
    pub worker_count: usize,
    /// Directory containing the external transcoder binaries, if known ahead of time.
    pub ffmpeg_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_reasonable_chunk_size: 10 * 1024 * 1024,
            min_reasonable_chunk_size: 16,
            slack_image_threshold_sec: 1.0,
            unknown_gap_min: 1024,
            tail_abs: 4 * 1024 * 1024,
            tail_ratio: 0.005,
            sector_size: 512,
            worker_count: 0,
            ffmpeg_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load the base config, apply an optional `virex.toml` next to `exe_dir`,
    /// then apply environment variable overrides.
    pub fn load(exe_dir: Option<&std::path::Path>) -> Self {
        let mut cfg = EngineConfig::default();

        if let Some(dir) = exe_dir {
            let toml_path = dir.join("virex.toml");
            if let Ok(text) = std::fs::read_to_string(&toml_path) {
                match toml::from_str::<EngineConfig>(&text) {
                    Ok(parsed) => cfg = parsed,
                    Err(e) => log::warn!("ignoring malformed {}: {e}", toml_path.display()),
                }
            }
        }

        if let Ok(dir) = std::env::var("VIREX_FFMPEG_DIR") {
            cfg.ffmpeg_dir = Some(PathBuf::from(dir));
        }
        if let Ok(workers) = std::env::var("VIREX_WORKERS") {
            if let Ok(n) = workers.parse() {
                cfg.worker_count = n;
            }
        }
        cfg
    }

    /// Resolve the worker-pool size per the §5 formula, honoring an explicit override.
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        let cpus = num_cpus::get();
        2.max(4.min(cpus.div_ceil(2)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_count_is_bounded() {
        let cfg = EngineConfig::default();
        let n = cfg.resolved_worker_count();
        assert!((2..=4).contains(&n));
    }

    #[test]
    fn explicit_worker_count_wins() {
        let cfg = EngineConfig { worker_count: 7, ..EngineConfig::default() };
        assert_eq!(cfg.resolved_worker_count(), 7);
    }
}
