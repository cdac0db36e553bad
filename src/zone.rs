//! Moisture zones and the remotely adjustable threshold pair.

use crate::sensor::{Calibration, DRYNESS_HIGH, DRYNESS_LOW};

/// Classifier output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Zone {
    TooDry,
    Normal,
    TooWet,
}

impl Zone {
    /// Indicator test order.
    pub const SEQUENCE: [Zone; 3] = [Zone::TooDry, Zone::TooWet, Zone::Normal];
}

/// `percent <= too_dry_ceiling` is dry, `percent >= too_wet_floor` is wet.
///
/// `too_dry_ceiling < too_wet_floor` is expected but not enforced; see
/// [`classify`] for how an inverted pair behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThresholdPair {
    pub too_dry_ceiling: u8,
    pub too_wet_floor: u8,
}

impl ThresholdPair {
    pub const fn new(too_dry_ceiling: u8, too_wet_floor: u8) -> Self {
        Self {
            too_dry_ceiling,
            too_wet_floor,
        }
    }

    /// Map the dryness hysteresis points through the calibration.
    pub const fn from_calibration(calibration: Calibration) -> Self {
        Self {
            too_dry_ceiling: calibration.percent(DRYNESS_HIGH),
            too_wet_floor: calibration.percent(DRYNESS_LOW),
        }
    }

    pub const fn is_well_ordered(&self) -> bool {
        self.too_dry_ceiling < self.too_wet_floor
    }
}

impl Default for ThresholdPair {
    fn default() -> Self {
        Self::from_calibration(Calibration::DEFAULT)
    }
}

/// Dry is checked before wet, so on overlapping thresholds `TooDry` wins.
pub fn classify(percent: u8, thresholds: ThresholdPair) -> Zone {
    if percent <= thresholds.too_dry_ceiling {
        Zone::TooDry
    } else if percent >= thresholds.too_wet_floor {
        Zone::TooWet
    } else {
        Zone::Normal
    }
}
