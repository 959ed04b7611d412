//! Compression selection.
//!
//! The configured algorithm is resolved to the effective one: when the
//! external tool is missing the archive falls back to in-process gzip.

use crate::config::{CompressionAlgorithm, CompressionMode, TuningConfig};
use crate::process::CommandRunner;
use std::path::PathBuf;
use tracing::{info, warn};

/// Level used when the requested one is outside the algorithm's range.
pub const FALLBACK_LEVEL: i32 = 6;

/// Resolved compression settings for one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionPlan {
    pub requested: CompressionAlgorithm,
    pub effective: CompressionAlgorithm,
    pub level: i32,
    /// 0 = let the compressor decide
    pub threads: u32,
    pub mode: CompressionMode,
    /// Resolved external program, `None` for in-process compression
    pub program: Option<PathBuf>,
}

/// Supported level range, inclusive.
pub fn level_range(algorithm: CompressionAlgorithm) -> (i32, i32) {
    match algorithm {
        CompressionAlgorithm::None => (0, 0),
        CompressionAlgorithm::Gzip | CompressionAlgorithm::Pigz | CompressionAlgorithm::Bzip2 => (1, 9),
        CompressionAlgorithm::Xz | CompressionAlgorithm::Lzma => (0, 9),
        CompressionAlgorithm::Zstd => (1, 22),
    }
}

/// Level implied by a compression mode.
pub fn mode_level(algorithm: CompressionAlgorithm, mode: CompressionMode) -> i32 {
    match (algorithm, mode) {
        (CompressionAlgorithm::None, _) => 0,
        (_, CompressionMode::Fast) => 1,
        (CompressionAlgorithm::Zstd, CompressionMode::Standard) => 3,
        (CompressionAlgorithm::Zstd, CompressionMode::Maximum) => 19,
        (CompressionAlgorithm::Zstd, CompressionMode::Ultra) => 22,
        (_, CompressionMode::Standard) => 6,
        (_, CompressionMode::Maximum | CompressionMode::Ultra) => 9,
    }
}

/// Clamp `level` to the algorithm's range; out-of-range input becomes 6.
pub fn clamp_level(algorithm: CompressionAlgorithm, level: i32) -> i32 {
    let (min, max) = level_range(algorithm);
    if algorithm == CompressionAlgorithm::None {
        return 0;
    }
    if (min..=max).contains(&level) {
        level
    } else {
        FALLBACK_LEVEL
    }
}

impl CompressionPlan {
    /// Build a plan without probing for tools.
    pub fn new(
        algorithm: CompressionAlgorithm,
        level: Option<i32>,
        mode: CompressionMode,
        threads: u32,
    ) -> Self {
        let level = level.unwrap_or_else(|| mode_level(algorithm, mode));
        Self {
            requested: algorithm,
            effective: algorithm,
            level: clamp_level(algorithm, level),
            threads,
            mode,
            program: None,
        }
    }

    pub fn from_tuning(tuning: &TuningConfig) -> Self {
        Self::new(
            tuning.compression,
            tuning.compression_level,
            tuning.compression_mode,
            tuning.compression_threads,
        )
    }

    /// Locate the external tool, falling back to in-process gzip without it.
    pub fn resolve(mut self, runner: &dyn CommandRunner) -> Self {
        let Some(binary) = self.effective.binary() else {
            return self;
        };
        match runner.locate(binary) {
            Some(path) => {
                info!(
                    "Using {} ({}) level {} for compression",
                    self.effective,
                    path.display(),
                    self.level
                );
                self.program = Some(path);
            }
            None => {
                warn!(
                    "{} not found in PATH, falling back to in-process gzip",
                    binary
                );
                let requested_level = self.level;
                self.effective = CompressionAlgorithm::Gzip;
                self.level = clamp_level(CompressionAlgorithm::Gzip, requested_level);
                self.program = None;
            }
        }
        self
    }

    pub fn fell_back(&self) -> bool {
        self.requested != self.effective
    }

    /// True when compression happens in this process.
    pub fn in_process(&self) -> bool {
        self.program.is_none()
    }

    fn extreme(&self) -> bool {
        matches!(self.effective, CompressionAlgorithm::Xz | CompressionAlgorithm::Lzma)
            && matches!(self.mode, CompressionMode::Maximum | CompressionMode::Ultra)
    }

    /// Arguments for the external compressor, reading stdin and writing stdout.
    pub fn args(&self) -> Vec<String> {
        let level = format!("-{}", self.level);
        let mut args = Vec::new();
        match self.effective {
            CompressionAlgorithm::None | CompressionAlgorithm::Gzip => {}
            CompressionAlgorithm::Xz => {
                args.push(level);
                if self.threads > 0 {
                    args.push(format!("-T{}", self.threads));
                }
                if self.extreme() {
                    args.push("--extreme".to_string());
                }
                args.push("-c".to_string());
            }
            CompressionAlgorithm::Lzma => {
                args.push(level);
                if self.extreme() {
                    args.push("--extreme".to_string());
                }
                args.push("-c".to_string());
            }
            CompressionAlgorithm::Zstd => {
                if self.level > 19 {
                    args.push("--ultra".to_string());
                }
                args.push(level);
                if self.threads > 0 {
                    args.push(format!("-T{}", self.threads));
                }
                args.push("-q".to_string());
                args.push("-c".to_string());
            }
            CompressionAlgorithm::Pigz => {
                args.push(level);
                if self.threads > 0 {
                    args.push("-p".to_string());
                    args.push(self.threads.to_string());
                }
                args.push("-c".to_string());
            }
            CompressionAlgorithm::Bzip2 => {
                args.push(level);
                args.push("-c".to_string());
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeRunner;

    #[test]
    fn test_xz_ultra_arguments() {
        let plan = CompressionPlan::new(CompressionAlgorithm::Xz, Some(9), CompressionMode::Ultra, 2);
        assert_eq!(plan.args(), vec!["-9", "-T2", "--extreme", "-c"]);
    }

    #[test]
    fn test_mode_levels() {
        let plan = |a, m| CompressionPlan::new(a, None, m, 0);
        assert_eq!(plan(CompressionAlgorithm::Gzip, CompressionMode::Fast).level, 1);
        assert_eq!(plan(CompressionAlgorithm::Zstd, CompressionMode::Standard).level, 3);
        assert_eq!(plan(CompressionAlgorithm::Zstd, CompressionMode::Maximum).level, 19);
        assert_eq!(
            plan(CompressionAlgorithm::Zstd, CompressionMode::Ultra).args(),
            vec!["--ultra", "-22", "-q", "-c"]
        );
        assert_eq!(
            plan(CompressionAlgorithm::Lzma, CompressionMode::Maximum).args(),
            vec!["-9", "--extreme", "-c"]
        );
        assert_eq!(plan(CompressionAlgorithm::Xz, CompressionMode::Standard).args(), vec!["-6", "-c"]);
    }

    #[test]
    fn test_out_of_range_level_defaults_to_six() {
        assert_eq!(clamp_level(CompressionAlgorithm::Gzip, 12), 6);
        assert_eq!(clamp_level(CompressionAlgorithm::Zstd, 12), 12);
        assert_eq!(clamp_level(CompressionAlgorithm::Bzip2, 0), 6);
        assert_eq!(clamp_level(CompressionAlgorithm::None, 9), 0);
    }

    #[test]
    fn test_pigz_threads() {
        let plan = CompressionPlan::new(CompressionAlgorithm::Pigz, Some(9), CompressionMode::Standard, 4);
        assert_eq!(plan.args(), vec!["-9", "-p", "4", "-c"]);
    }

    #[test]
    fn test_missing_tool_falls_back_to_gzip() {
        let runner = FakeRunner::new();
        runner.respond_any("zstd", FakeRunner::ok("")).hide("zstd");
        let plan = CompressionPlan::new(CompressionAlgorithm::Zstd, Some(19), CompressionMode::Maximum, 0)
            .resolve(&runner);
        assert_eq!(plan.requested, CompressionAlgorithm::Zstd);
        assert_eq!(plan.effective, CompressionAlgorithm::Gzip);
        assert_eq!(plan.level, 6);
        assert!(plan.fell_back());
        assert!(plan.in_process());
    }

    #[test]
    fn test_present_tool_is_kept() {
        let runner = FakeRunner::new();
        runner.respond_any("xz", FakeRunner::ok(""));
        let plan = CompressionPlan::new(CompressionAlgorithm::Xz, None, CompressionMode::Fast, 0)
            .resolve(&runner);
        assert_eq!(plan.effective, CompressionAlgorithm::Xz);
        assert_eq!(plan.program, Some(PathBuf::from("/usr/bin/xz")));
    }
}
