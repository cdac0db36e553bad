//! Moisture sensor module
//!
//! Calibration constants, raw reading conversion, and the averaged read taken
//! once per wake. The probe reports "dryness": higher raw values mean drier
//! soil, so the percentage is inverted.

use embedded_hal_async::delay::DelayNs;

use crate::error::SensorError;

/// Top of the instrument range (10-bit converter).
pub const SENSOR_MAX_RAW: u16 = 1023;

// Calibration constants from sensor calibration routine (10-bit units)
pub const SENSOR_WET: u16 = 350; // raw value with the probe in water (100% moisture)
pub const SENSOR_DRY: u16 = 850; // raw value with the probe in air (0% moisture)

// Dryness hysteresis points; the default thresholds are these run through `normalize`
pub const DRYNESS_LOW: u16 = 600; // below: too wet
pub const DRYNESS_HIGH: u16 = 700; // above: too dry

/// Raw samples averaged into one reading.
pub const SAMPLES_PER_READING: usize = 3;

/// Raw-unit end points of the linear moisture scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Calibration {
    /// Raw value that maps to 100%
    pub min: u16,
    /// Raw value that maps to 0%
    pub max: u16,
}

impl Calibration {
    pub const DEFAULT: Self = Self {
        min: SENSOR_WET,
        max: SENSOR_DRY,
    };

    /// Returns `None` unless `min < max`.
    pub const fn new(min: u16, max: u16) -> Option<Self> {
        if min < max {
            Some(Self { min, max })
        } else {
            None
        }
    }

    pub const fn percent(&self, raw: u16) -> u8 {
        normalize(raw, self.min, self.max)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Convert a raw reading to moisture percentage (0-100%)
///
/// The raw value is clamped into the calibration window, then
/// `100 - (clamped - min) * 100 / (max - min)` is evaluated in integers. The
/// truncating division must stay exactly like this: deployed threshold
/// settings were chosen against these numbers.
pub const fn normalize(raw: u16, calibration_min: u16, calibration_max: u16) -> u8 {
    if calibration_max <= calibration_min {
        // Degenerate window: everything at or below the single point is wet.
        return if raw <= calibration_min { 100 } else { 0 };
    }

    let clamped = if raw < calibration_min {
        calibration_min
    } else if raw > calibration_max {
        calibration_max
    } else {
        raw
    };

    let offset = (clamped - calibration_min) as u32;
    let span = (calibration_max - calibration_min) as u32;
    (100 - offset * 100 / span) as u8
}

/// Integer-truncated mean of raw samples. `None` for an empty slice.
pub fn average_raw(samples: &[u16]) -> Option<u16> {
    if samples.is_empty() {
        return None;
    }
    let sum: u32 = samples.iter().map(|&s| s as u32).sum();
    Some((sum / samples.len() as u32) as u16)
}

/// Source of raw dryness samples in the 10-bit instrument range.
pub trait MoistureProbe {
    fn read_raw(&mut self) -> Result<u16, SensorError>;
}

/// One averaged, normalized reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorReading {
    /// Moisture percentage (0-100%)
    pub percent: u8,
    /// Mean raw value (0-1023)
    pub raw: u16,
}

/// Take [`SAMPLES_PER_READING`] samples `spacing_ms` apart and normalize their
/// mean. Failed samples are dropped from the mean; only a window with no
/// successful sample is an error.
pub async fn sample_averaged<P, D>(
    probe: &mut P,
    delay: &mut D,
    calibration: Calibration,
    spacing_ms: u32,
) -> Result<SensorReading, SensorError>
where
    P: MoistureProbe,
    D: DelayNs,
{
    let mut samples = heapless::Vec::<u16, SAMPLES_PER_READING>::new();

    for i in 0..SAMPLES_PER_READING {
        match probe.read_raw() {
            Ok(raw) => {
                // capacity equals the loop bound
                let _ = samples.push(raw.min(SENSOR_MAX_RAW));
            }
            Err(e) => warn!("sensor: sample {} failed: {:?}", i, e),
        }
        if i + 1 < SAMPLES_PER_READING {
            delay.delay_ms(spacing_ms).await;
        }
    }

    let Some(raw) = average_raw(&samples) else {
        error!("sensor: no usable samples this wake");
        return Err(SensorError::NoSamples);
    };

    let percent = calibration.percent(raw);
    info!(
        "sensor: moisture={}% (raw={}, samples={})",
        percent,
        raw,
        samples.len()
    );
    Ok(SensorReading { percent, raw })
}
