/// Device-mapper linear/error tables
use crate::config::types::{Result, StressError};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const SECTOR_SIZE: u64 = 512;

/// What a sector range maps to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentTarget {
    /// Pass-through to `device` starting at `offset` sectors
    Linear { device: PathBuf, offset: u64 },
    /// Every I/O in the range fails
    Error,
}

/// One `[start, start + length)` range of the mapped device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: u64,
    pub length: u64,
    pub target: SegmentTarget,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Three-segment table: normal / error / normal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTable {
    pub total_sectors: u64,
    pub segments: [Segment; 3],
}

/// Build the normal/error/normal table over `device`.
///
/// Segments are contiguous, non-overlapping and cover `[0, total_sectors)`.
pub fn build_error_table(
    device: &Path,
    total_sectors: u64,
    error_start: u64,
    error_len: u64,
) -> Result<ErrorTable> {
    let error_end = error_start
        .checked_add(error_len)
        .ok_or_else(|| StressError::Mapping("error segment overflows u64".to_string()))?;
    if error_end > total_sectors {
        return Err(StressError::Mapping(format!(
            "error segment [{}, {}) exceeds device of {} sectors",
            error_start, error_end, total_sectors
        )));
    }

    Ok(ErrorTable {
        total_sectors,
        segments: [
            Segment {
                start: 0,
                length: error_start,
                target: SegmentTarget::Linear {
                    device: device.to_path_buf(),
                    offset: 0,
                },
            },
            Segment {
                start: error_start,
                length: error_len,
                target: SegmentTarget::Error,
            },
            Segment {
                start: error_end,
                length: total_sectors - error_end,
                target: SegmentTarget::Linear {
                    device: device.to_path_buf(),
                    offset: error_end,
                },
            },
        ],
    })
}

impl ErrorTable {
    /// `[start, length)` of the error segment in sectors
    pub fn error_range(&self) -> (u64, u64) {
        (self.segments[1].start, self.segments[1].length)
    }

    /// dmsetup table text; empty segments are skipped since dm rejects them
    pub fn render(&self) -> String {
        let mut out = String::new();
        for segment in self.segments.iter().filter(|s| s.length > 0) {
            match &segment.target {
                SegmentTarget::Linear { device, offset } => {
                    let _ = writeln!(
                        out,
                        "{} {} linear {} {}",
                        segment.start,
                        segment.length,
                        device.display(),
                        offset
                    );
                }
                SegmentTarget::Error => {
                    let _ = writeln!(out, "{} {} error", segment.start, segment.length);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(table: &ErrorTable) {
        let mut cursor = 0;
        for segment in &table.segments {
            assert_eq!(segment.start, cursor, "segments must be contiguous");
            cursor = segment.end();
        }
        assert_eq!(cursor, table.total_sectors);
        let sum: u64 = table.segments.iter().map(|s| s.length).sum();
        assert_eq!(sum, table.total_sectors);
    }

    #[test]
    fn segments_cover_device_exactly() {
        let dev = Path::new("/dev/loop0");
        for total in [1u64, 8, 2048, 2_097_152] {
            for start in [0, total / 3, total / 2, total] {
                for len in [0, 1, total / 4, total - start] {
                    if start + len > total {
                        continue;
                    }
                    let table = build_error_table(dev, total, start, len).unwrap();
                    assert_covers(&table);
                    assert_eq!(table.error_range(), (start, len));
                }
            }
        }
    }

    #[test]
    fn tail_linear_segment_offsets_past_error_range() {
        let table = build_error_table(Path::new("/dev/loop4"), 1000, 100, 50).unwrap();
        assert_eq!(
            table.segments[2].target,
            SegmentTarget::Linear {
                device: PathBuf::from("/dev/loop4"),
                offset: 150
            }
        );
    }

    #[test]
    fn render_produces_dm_table() {
        let table = build_error_table(Path::new("/dev/loop4"), 1000, 100, 50).unwrap();
        assert_eq!(
            table.render(),
            "0 100 linear /dev/loop4 0\n100 50 error\n150 850 linear /dev/loop4 150\n"
        );
    }

    #[test]
    fn render_skips_empty_segments() {
        let table = build_error_table(Path::new("/dev/loop4"), 1000, 0, 1000).unwrap();
        assert_eq!(table.render(), "0 1000 error\n");
    }

    #[test]
    fn oversized_error_segment_is_rejected() {
        assert!(matches!(
            build_error_table(Path::new("/dev/loop0"), 100, 90, 20),
            Err(StressError::Mapping(_))
        ));
        assert!(build_error_table(Path::new("/dev/loop0"), 100, u64::MAX, 2).is_err());
    }
}
