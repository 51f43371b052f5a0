//! Median sampling of the soil probe.

use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::warn;

/// Delay after each raw read.
pub const SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Raw moisture count in dry air.
pub const DEFAULT_RAW_DRY: f32 = 605.0;
/// Raw moisture count in saturated soil.
pub const DEFAULT_RAW_WET: f32 = 500.0;

/// Upper bound on samples per pass, enforced by config validation.
pub const MAX_SAMPLES: usize = 64;

/// Soil probe: a temperature sensor and a capacitive moisture sensor, both
/// on the switched sensor rail.
pub trait SoilProbe {
    fn read_temperature_c(&mut self) -> Result<f32>;
    /// Raw ADC count; lower means wetter.
    fn read_moisture_raw(&mut self) -> Result<f32>;
}

/// Take `count` readings `SETTLE_DELAY` apart and return their median.
///
/// Failed reads are logged and left out.  A pass with no usable reading
/// (including `count == 0`) yields `0.0`.
pub async fn sample_median<F>(mut read: F, count: usize) -> f32
where
    F: FnMut() -> Result<f32>,
{
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        match read() {
            Ok(v) if v.is_finite() => samples.push(v),
            Ok(v) => warn!(sample = i, value = v, "discarding non-finite reading"),
            Err(e) => warn!(sample = i, "sensor read failed: {e:#}"),
        }
        sleep(SETTLE_DELAY).await;
    }
    median(&mut samples).unwrap_or(0.0)
}

/// Median of `values`, sorting in place.  Even lengths average the two
/// middle values.
pub fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Map a raw moisture count onto 0–100 % with a two-point calibration.
pub fn moisture_percent(raw: f32, raw_dry: f32, raw_wet: f32) -> f32 {
    let span = raw_dry - raw_wet;
    if span == 0.0 {
        return 0.0;
    }
    ((raw_dry - raw) / span * 100.0).clamp(0.0, 100.0)
}

// ===========================================================================
// Tests
// ===========================================================================
