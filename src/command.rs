//! Remote control commands.
//!
//! The first byte of an inbound control message selects the command; the rest
//! are positional arguments. There is no escaping and no length prefix beyond
//! what MQTT already gives us.
//!
//! | Code | Command    | Arguments                   |
//! |------|------------|-----------------------------|
//! | `a`  | keep awake | none                        |
//! | `s`  | sleep now  | none                        |
//! | `t`  | run test   | none                        |
//! | `r`  | set range  | `DDWW`: dry ceiling, wet floor, two digits each |

use crate::controller::DeviceState;
use crate::zone::ThresholdPair;

pub const KEEP_AWAKE: u8 = b'a';
pub const SLEEP_NOW: u8 = b's';
pub const RUN_TEST: u8 = b't';
pub const SET_RANGE: u8 = b'r';

const DRY_FIELD: core::ops::Range<usize> = 1..3;
const WET_FIELD: core::ops::Range<usize> = 3..5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    KeepAwake,
    SleepNow,
    RunTest,
    SetRange(ThresholdPair),
    Unknown(u8),
}

impl Command {
    /// `None` only for an empty payload; unrecognized codes come back as
    /// [`Command::Unknown`].
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (&code, _) = payload.split_first()?;
        let command = match code {
            KEEP_AWAKE => Command::KeepAwake,
            SLEEP_NOW => Command::SleepNow,
            RUN_TEST => Command::RunTest,
            SET_RANGE => Command::SetRange(ThresholdPair::new(
                parse_field(payload, DRY_FIELD),
                parse_field(payload, WET_FIELD),
            )),
            other => Command::Unknown(other),
        };
        Some(command)
    }
}

/// Leading decimal digits of a fixed-width field, 0 when there are none.
/// Bytes past the end of the payload read as an empty field.
fn parse_field(payload: &[u8], field: core::ops::Range<usize>) -> u8 {
    let start = field.start.min(payload.len());
    let end = field.end.min(payload.len());
    payload[start..end]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u8, |acc, b| acc.saturating_mul(10).saturating_add(b - b'0'))
}

/// What the controller has to do after a command was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Effect {
    None,
    /// Commit the record and enter deep sleep
    SleepNow,
    /// Cycle the indicators and take a diagnostic reading
    RunTest,
    /// Publish the new range
    RangeChanged(ThresholdPair),
}

/// Apply a command to the volatile device state.
pub fn apply(command: Command, device: &mut DeviceState) -> Effect {
    match command {
        Command::KeepAwake => {
            if !device.session.stay_awake_override {
                info!("cmd: keep awake");
                device.session.stay_awake_override = true;
            }
            Effect::None
        }
        Command::SleepNow => {
            if device.session.stay_awake_override {
                info!("cmd: sleep now");
                device.session.stay_awake_override = false;
                Effect::SleepNow
            } else {
                debug!("cmd: sleep ignored, node is not held awake");
                Effect::None
            }
        }
        Command::RunTest => Effect::RunTest,
        Command::SetRange(thresholds) => {
            if !thresholds.is_well_ordered() {
                warn!(
                    "cmd: inverted range dry<={} wet>={}, dry wins on overlap",
                    thresholds.too_dry_ceiling, thresholds.too_wet_floor
                );
            }
            device.thresholds = thresholds;
            info!(
                "cmd: range set to dry<={}% wet>={}%",
                thresholds.too_dry_ceiling, thresholds.too_wet_floor
            );
            Effect::RangeChanged(thresholds)
        }
        Command::Unknown(code) => {
            warn!("cmd: unknown command code {=u8:#x}, ignored", code);
            Effect::None
        }
    }
}
