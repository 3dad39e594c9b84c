//! Artifact compression.
//!
//! Ported from the teacher's `compression` module: a small algorithm enum,
//! a threshold below which compression is skipped, and stats that track
//! how much was actually saved. Only gzip and deflate survive here — the
//! teacher's brotli/zstd/lz4 options aren't named by anything this crate
//! needs.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compression subsystem failures.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Underlying I/O failure while running an encoder/decoder.
    #[error("compression I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decompression was asked to operate on a payload that doesn't match
    /// the algorithm tag it was stored with.
    #[error("invalid compressed payload for algorithm {algorithm:?}")]
    InvalidInput {
        /// Algorithm the caller claimed the payload was compressed with.
        algorithm: CompressionAlgorithm,
    },
}

/// Result type for the compression subsystem.
pub type Result<T> = std::result::Result<T, CompressionError>;

/// Supported compression algorithms. `None` is a valid, explicit choice:
/// it means "store the artifact as-is."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Store artifacts uncompressed.
    None,
    /// RFC 1952 gzip.
    Gzip,
    /// RFC 1951 raw deflate.
    Deflate,
}

/// Outcome of a single compress operation, kept for stats aggregation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Byte length before compression.
    pub original_bytes: usize,
    /// Byte length after compression (equals `original_bytes` if skipped).
    pub compressed_bytes: usize,
    /// Whether compression actually ran (false if under threshold or
    /// algorithm is `None`).
    pub applied: bool,
}

impl CompressionStats {
    /// Fraction of bytes saved, in `[0.0, 1.0]`. Zero if compression did
    /// not run or the input was empty.
    pub fn ratio(&self) -> f64 {
        if !self.applied || self.original_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.compressed_bytes as f64 / self.original_bytes as f64)
    }
}

/// Compress `data` with `algorithm` if `data.len() >= threshold_bytes`;
/// otherwise return it unchanged. The returned stats record whether
/// compression actually ran.
pub fn compress(
    data: &[u8],
    algorithm: CompressionAlgorithm,
    threshold_bytes: usize,
) -> Result<(Vec<u8>, CompressionStats)> {
    if algorithm == CompressionAlgorithm::None || data.len() < threshold_bytes {
        return Ok((
            data.to_vec(),
            CompressionStats {
                original_bytes: data.len(),
                compressed_bytes: data.len(),
                applied: false,
            },
        ));
    }

    let compressed = match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        CompressionAlgorithm::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()?
        }
        CompressionAlgorithm::None => unreachable!("handled above"),
    };

    let stats = CompressionStats {
        original_bytes: data.len(),
        compressed_bytes: compressed.len(),
        applied: true,
    };
    Ok((compressed, stats))
}

/// Inverse of [`compress`]. `algorithm` must match what the payload was
/// compressed with; `None` is a pass-through.
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| CompressionError::InvalidInput { algorithm })?;
            Ok(out)
        }
        CompressionAlgorithm::Deflate => {
            let mut decoder = DeflateDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| CompressionError::InvalidInput { algorithm })?;
            Ok(out)
        }
    }
}

/// Running totals across every [`compress`] call that passed through it,
/// so callers can report an aggregate compression ratio instead of only
/// a per-artifact one. Grounded on the teacher's `PoolStats`-style
/// atomic-counter accumulators in `database/connection_pool.rs`.
#[derive(Debug, Default)]
pub struct CompressionStatsTracker {
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
    artifacts_compressed: AtomicU64,
    artifacts_seen: AtomicU64,
}

impl CompressionStatsTracker {
    /// Build a tracker with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a single [`compress`] outcome into the running totals.
    pub fn record(&self, stats: &CompressionStats) {
        self.artifacts_seen.fetch_add(1, Ordering::Relaxed);
        self.original_bytes
            .fetch_add(stats.original_bytes as u64, Ordering::Relaxed);
        self.compressed_bytes
            .fetch_add(stats.compressed_bytes as u64, Ordering::Relaxed);
        if stats.applied {
            self.artifacts_compressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot the running totals as a single [`CompressionStats`],
    /// `applied` true if at least one artifact was actually compressed.
    pub fn totals(&self) -> CompressionStats {
        CompressionStats {
            original_bytes: self.original_bytes.load(Ordering::Relaxed) as usize,
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed) as usize,
            applied: self.artifacts_compressed.load(Ordering::Relaxed) > 0,
        }
    }

    /// Aggregate bytes-saved ratio across every recorded artifact, in
    /// `[0.0, 1.0]`. Zero if nothing has been recorded yet.
    pub fn average_ratio(&self) -> f64 {
        self.totals().ratio()
    }

    /// How many artifacts have been recorded.
    pub fn artifacts_seen(&self) -> u64 {
        self.artifacts_seen.load(Ordering::Relaxed)
    }

    /// How many of those artifacts were actually compressed (as opposed
    /// to skipped for being under threshold or using `None`).
    pub fn artifacts_compressed(&self) -> u64 {
        self.artifacts_compressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_is_not_compressed() {
        let data = b"small";
        let (out, stats) = compress(data, CompressionAlgorithm::Gzip, 1024).unwrap();
        assert_eq!(out, data);
        assert!(!stats.applied);
        assert_eq!(stats.ratio(), 0.0);
    }

    #[test]
    fn none_algorithm_never_compresses() {
        let data = vec![0u8; 4096];
        let (out, stats) = compress(&data, CompressionAlgorithm::None, 0).unwrap();
        assert_eq!(out, data);
        assert!(!stats.applied);
    }

    #[test]
    fn gzip_round_trips_above_threshold() {
        let data = vec![7u8; 4096];
        let (compressed, stats) = compress(&data, CompressionAlgorithm::Gzip, 1024).unwrap();
        assert!(stats.applied);
        assert!(compressed.len() < data.len());
        let restored = decompress(&compressed, CompressionAlgorithm::Gzip).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn deflate_round_trips_above_threshold() {
        let data = vec![3u8; 8192];
        let (compressed, stats) = compress(&data, CompressionAlgorithm::Deflate, 1024).unwrap();
        assert!(stats.applied);
        let restored = decompress(&compressed, CompressionAlgorithm::Deflate).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn decompress_rejects_mismatched_algorithm() {
        let data = vec![9u8; 4096];
        let (compressed, _) = compress(&data, CompressionAlgorithm::Gzip, 1024).unwrap();
        let err = decompress(&compressed, CompressionAlgorithm::Deflate).unwrap_err();
        assert!(matches!(err, CompressionError::InvalidInput { .. }));
    }

    #[test]
    fn tracker_averages_ratio_across_several_artifacts() {
        let tracker = CompressionStatsTracker::new();

        let (_, below) = compress(b"tiny", CompressionAlgorithm::Gzip, 1024).unwrap();
        tracker.record(&below);

        let data = vec![1u8; 4096];
        let (_, above) = compress(&data, CompressionAlgorithm::Gzip, 1024).unwrap();
        tracker.record(&above);

        assert_eq!(tracker.artifacts_seen(), 2);
        assert_eq!(tracker.artifacts_compressed(), 1);
        assert!(tracker.average_ratio() > 0.0);
        assert!(tracker.totals().applied);
    }

    #[test]
    fn tracker_with_nothing_recorded_has_zero_ratio() {
        let tracker = CompressionStatsTracker::new();
        assert_eq!(tracker.average_ratio(), 0.0);
        assert_eq!(tracker.artifacts_seen(), 0);
    }
}
