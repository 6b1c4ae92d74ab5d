//! Field-correction calibration: host millimeters -> galvo units.
//!
//! Grounded on `balor.Cal.Cal`: a `.cor` text file of sampled
//! `(mm_x, mm_y) -> (galvo_x, galvo_y)` correspondences, interpolated with a
//! scattered-data radial basis function and cached since geometry producers
//! query the same neighborhood of points densely.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::error::{Error, Result};

/// One sampled calibration point.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    mm_x: f64,
    mm_y: f64,
    galvo_x: u16,
    galvo_y: u16,
}

/// Minimum LRU capacity (SPEC_FULL §4.6: "a small LRU cache (>= 2048
/// entries)").
const MIN_CACHE_CAPACITY: usize = 2048;

/// Key used to quantize (x, y) mm coordinates for the interpolation cache.
/// `f64` is not `Hash`/`Eq`; coordinates are quantized to 1/1000 mm, well
/// below the board's mechanical resolution.
fn cache_key(x: f64, y: f64) -> (i64, i64) {
    ((x * 1000.0).round() as i64, (y * 1000.0).round() as i64)
}

/// Maps host-space (mm) coordinates to galvo-space (16-bit) coordinates.
///
/// Either [`Calibration::identity`] (no distortion correction, integer
/// rounding only) or [`Calibration::from_cor_str`] (interpolated from a
/// sampled `.cor` table).
pub struct Calibration {
    samples: Vec<Sample>,
    envelope: Option<(f64, f64, f64, f64)>,
    cache: Mutex<LruCache<(i64, i64), (u16, u16)>>,
}

impl Calibration {
    /// No correction: passthrough with integer rounding, `(x_mm, y_mm)`
    /// maps to `(round(x_mm), round(y_mm))` clamped to `u16`.
    pub fn identity() -> Self {
        Calibration {
            samples: Vec::new(),
            envelope: None,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(MIN_CACHE_CAPACITY).unwrap())),
        }
    }

    /// Parse a `.cor` file: whitespace-separated rows of `mm_x mm_y _ _
    /// galvo_x_hex galvo_y_hex`. The envelope is taken from the first and
    /// last row, matching the original tool's convention that `.cor` files
    /// are generated in scan order.
    pub fn from_cor_str(text: &str) -> Result<Self> {
        let mut samples = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return Err(Error::InvalidCalibration {
                    reason: format!("line {}: expected at least 6 fields, got {}", lineno + 1, fields.len()),
                });
            }
            let parse_f64 = |s: &str| {
                s.parse::<f64>().map_err(|e| Error::InvalidCalibration {
                    reason: format!("line {}: bad float {s:?}: {e}", lineno + 1),
                })
            };
            let parse_hex = |s: &str| {
                u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| {
                    Error::InvalidCalibration { reason: format!("line {}: bad hex {s:?}: {e}", lineno + 1) }
                })
            };
            samples.push(Sample {
                mm_x: parse_f64(fields[0])?,
                mm_y: parse_f64(fields[1])?,
                galvo_x: parse_hex(fields[4])?,
                galvo_y: parse_hex(fields[5])?,
            });
        }
        if samples.is_empty() {
            return Err(Error::InvalidCalibration { reason: "no samples found".to_string() });
        }
        let first = samples.first().unwrap();
        let last = samples.last().unwrap();
        let envelope = (
            first.mm_x.min(last.mm_x),
            first.mm_x.max(last.mm_x),
            first.mm_y.min(last.mm_y),
            first.mm_y.max(last.mm_y),
        );
        Ok(Calibration {
            samples,
            envelope: Some(envelope),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(MIN_CACHE_CAPACITY).unwrap())),
        })
    }

    /// `(x_min, x_max, y_min, y_max)` envelope, if this calibration was
    /// loaded from samples. `None` for [`Calibration::identity`].
    pub fn envelope(&self) -> Option<(f64, f64, f64, f64)> {
        self.envelope
    }

    /// Map a host-space point to galvo units.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfEnvelope`] if this calibration has sample bounds and
    /// `(x_mm, y_mm)` falls outside them.
    pub fn interpolate(&self, x_mm: f64, y_mm: f64) -> Result<(u16, u16)> {
        if let Some((x_min, x_max, y_min, y_max)) = self.envelope {
            if x_mm < x_min || x_mm > x_max || y_mm < y_min || y_mm > y_max {
                return Err(Error::OutOfEnvelope {
                    x: x_mm,
                    y: y_mm,
                    x_min,
                    x_max,
                    y_min,
                    y_max,
                });
            }
        }

        if self.samples.is_empty() {
            let clamp = |v: f64| v.round().clamp(0.0, u16::MAX as f64) as u16;
            return Ok((clamp(x_mm), clamp(y_mm)));
        }

        let key = cache_key(x_mm, y_mm);
        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return Ok(*hit);
        }

        let result = self.interpolate_rbf(x_mm, y_mm);
        self.cache.lock().unwrap().put(key, result);
        Ok(result)
    }

    /// Inverse-distance-weighted radial basis interpolation: each sample
    /// contributes `1 / (distance^2 + epsilon)`, normalized. Degenerates to
    /// an exact hit when `(x_mm, y_mm)` coincides with a sample.
    fn interpolate_rbf(&self, x_mm: f64, y_mm: f64) -> (u16, u16) {
        const EPSILON: f64 = 1e-9;
        let mut weight_sum = 0.0;
        let mut x_sum = 0.0;
        let mut y_sum = 0.0;
        for s in &self.samples {
            let dx = s.mm_x - x_mm;
            let dy = s.mm_y - y_mm;
            let dist_sq = dx * dx + dy * dy;
            if dist_sq < EPSILON {
                return (s.galvo_x, s.galvo_y);
            }
            let w = 1.0 / dist_sq;
            weight_sum += w;
            x_sum += w * s.galvo_x as f64;
            y_sum += w * s.galvo_y as f64;
        }
        let clamp = |v: f64| v.round().clamp(0.0, u16::MAX as f64) as u16;
        (clamp(x_sum / weight_sum), clamp(y_sum / weight_sum))
    }
}

/// Opaque 65x65 field-correction table (5 bytes/entry, 4225 entries) the
/// board ingests during init. The core never interprets individual entries;
/// it only moves the bytes.
#[derive(Debug, Clone)]
pub struct CorrectionTable {
    entries: Vec<[u8; 5]>,
}

/// Grid dimension of the correction table (65x65 = 4225 entries).
pub const CORRECTION_TABLE_DIM: usize = 65;
/// Total entry count of the correction table.
pub const CORRECTION_TABLE_LEN: usize = CORRECTION_TABLE_DIM * CORRECTION_TABLE_DIM;

impl CorrectionTable {
    /// An all-zero table: valid, and equivalent to no correction.
    pub fn identity() -> Self {
        CorrectionTable { entries: vec![[0u8; 5]; CORRECTION_TABLE_LEN] }
    }

    /// Build from exactly [`CORRECTION_TABLE_LEN`] entries.
    pub fn from_entries(entries: Vec<[u8; 5]>) -> Result<Self> {
        if entries.len() != CORRECTION_TABLE_LEN {
            return Err(Error::InvalidCalibration {
                reason: format!(
                    "correction table must have {CORRECTION_TABLE_LEN} entries, got {}",
                    entries.len()
                ),
            });
        }
        Ok(CorrectionTable { entries })
    }

    /// Entries in upload order (row-major).
    pub fn entries(&self) -> &[[u8; 5]] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rounds_with_no_center_offset() {
        let cal = Calibration::identity();
        assert_eq!(cal.interpolate(0.0, 0.0).unwrap(), (0, 0));
        assert_eq!(cal.interpolate(0x9000 as f64, 0x7000 as f64).unwrap(), (0x9000, 0x7000));
    }

    #[test]
    fn interpolate_exact_hit_matches_sample() {
        let text = "0.0 0.0 0 0 8000 8000\n10.0 0.0 0 0 9000 8000\n\
                     0.0 10.0 0 0 8000 9000\n10.0 10.0 0 0 9000 9000\n";
        let cal = Calibration::from_cor_str(text).unwrap();
        assert_eq!(cal.interpolate(0.0, 0.0).unwrap(), (0x8000, 0x8000));
        assert_eq!(cal.interpolate(10.0, 10.0).unwrap(), (0x9000, 0x9000));
    }

    #[test]
    fn interpolate_rejects_out_of_envelope() {
        let text = "0.0 0.0 0 0 8000 8000\n10.0 10.0 0 0 9000 9000\n";
        let cal = Calibration::from_cor_str(text).unwrap();
        assert!(matches!(cal.interpolate(20.0, 20.0), Err(Error::OutOfEnvelope { .. })));
    }

    #[test]
    fn correction_table_rejects_wrong_length() {
        assert!(CorrectionTable::from_entries(vec![[0u8; 5]; 10]).is_err());
        assert_eq!(CorrectionTable::identity().entries().len(), CORRECTION_TABLE_LEN);
    }
}
