#![forbid(unsafe_code)]
//! Error types for FrankenFX.
//!
//! # Error Taxonomy
//!
//! FrankenFX uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffx-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `FfxError` | `ffx-error` (this crate) | Pipeline and CLI-facing errors |
//!
//! `ffx-error` is independent of `ffx-types` and `ffx-ondisk`. The conversion
//! from `ParseError` to `FfxError` lives in `ffx-core`, which depends on both.
//!
//! ## Fatal vs. recoverable
//!
//! An extraction run either completes or aborts before any record is
//! written. Only fatal conditions travel as `Err(FfxError)`; recoverable
//! per-structure problems (an out-of-range group pointer, a malformed
//! directory block) are collected as warnings next to the records instead.
//! Some variants are still classified recoverable because the walkers build
//! them internally before downgrading them to warnings.
//!
//! | Variant | Severity |
//! |---------|----------|
//! | `Io` | fatal |
//! | `OutOfBounds` | fatal |
//! | `Format` | fatal |
//! | `Parse` | fatal |
//! | `InvalidSuperblock` | fatal |
//! | `Corruption` | recoverable |

use thiserror::Error;

/// How an error affects the extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The whole run aborts; no output stream is considered valid.
    Fatal,
    /// Only the affected structure is skipped.
    Recoverable,
}

/// Unified error type for all FrankenFX operations.
#[derive(Debug, Error)]
pub enum FfxError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fixed-offset read fell outside the image.
    #[error("read out of bounds: offset={offset} len={len} image_len={image_len}")]
    OutOfBounds { offset: u64, len: usize, image_len: u64 },

    /// The image structure is fundamentally wrong.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string representation of a `ParseError` from `ffx-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// Superblock validation failed; every violated invariant is listed.
    #[error("invalid superblock: {}", violations.join("; "))]
    InvalidSuperblock { violations: Vec<String> },

    /// Metadata inside a single structure is inconsistent.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },
}

impl FfxError {
    /// Classify this error for exit-code plumbing.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its severity is assigned.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Io(_)
            | Self::OutOfBounds { .. }
            | Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidSuperblock { .. } => Severity::Fatal,
            Self::Corruption { .. } => Severity::Recoverable,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Result alias using `FfxError`.
pub type Result<T> = std::result::Result<T, FfxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_covers_all_variants() {
        let cases: Vec<(FfxError, Severity)> = vec![
            (FfxError::Io(std::io::Error::other("test")), Severity::Fatal),
            (
                FfxError::OutOfBounds {
                    offset: 0,
                    len: 1,
                    image_len: 0,
                },
                Severity::Fatal,
            ),
            (FfxError::Format("test".into()), Severity::Fatal),
            (FfxError::Parse("test".into()), Severity::Fatal),
            (
                FfxError::InvalidSuperblock {
                    violations: vec!["bad magic".into()],
                },
                Severity::Fatal,
            ),
            (
                FfxError::Corruption {
                    block: 7,
                    detail: "rec_len 0".into(),
                },
                Severity::Recoverable,
            ),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.severity(), *expected, "wrong severity for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let err = FfxError::Corruption {
            block: 42,
            detail: "zero entry length".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: zero entry length"
        );
        assert!(!err.is_fatal());

        let sb = FfxError::InvalidSuperblock {
            violations: vec![
                "Superblock - invalid magic: 1234".into(),
                "Superblock - 100 blocks, 30 blocks/group".into(),
            ],
        };
        assert_eq!(
            sb.to_string(),
            "invalid superblock: Superblock - invalid magic: 1234; Superblock - 100 blocks, 30 blocks/group"
        );
        assert!(sb.is_fatal());

        let oob = FfxError::OutOfBounds {
            offset: 4096,
            len: 1024,
            image_len: 2048,
        };
        assert_eq!(
            oob.to_string(),
            "read out of bounds: offset=4096 len=1024 image_len=2048"
        );
    }
}
