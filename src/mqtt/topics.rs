//! Topic and payload formatting.
//!
//! Broker-side subscribers match these strings byte for byte; every builder
//! here has a test pinning its exact output.

use core::fmt::Write;
use heapless::String;

use crate::zone::ThresholdPair;

// Topic leaves, one per purpose
pub const MOISTURE: &str = "moisture";
pub const RANGE: &str = "range";
pub const TEST: &str = "test";
pub const UPDATE: &str = "update";
pub const CONTROL: &str = "control";

/// Update readiness markers
pub const UPDATE_PENDING: &[u8] = b"No";
pub const UPDATE_READY: &[u8] = b"yes";

/// Test-complete marker carries no payload
pub const TEST_COMPLETE: &[u8] = b"";

pub type Topic = String<64>;

/// Build a device topic
/// Format: {prefix}/{device_id}/{leaf}
pub fn build_topic(prefix: &str, device_id: &str, leaf: &str) -> Topic {
    let mut topic = String::new();
    if write!(topic, "{}/{}/{}", prefix, device_id, leaf).is_err() {
        warn!("mqtt: topic for '{}' truncated", leaf);
    }
    topic
}

/// All topics of one device, built once per wake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub moisture: Topic,
    pub range: Topic,
    pub test: Topic,
    pub update: Topic,
    pub control: Topic,
}

impl Topics {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        Self {
            moisture: build_topic(prefix, device_id, MOISTURE),
            range: build_topic(prefix, device_id, RANGE),
            test: build_topic(prefix, device_id, TEST),
            update: build_topic(prefix, device_id, UPDATE),
            control: build_topic(prefix, device_id, CONTROL),
        }
    }
}

/// Moisture percentage as a plain decimal string
pub fn moisture_payload(percent: u8) -> String<4> {
    let mut payload = String::new();
    // three digits always fit
    write!(payload, "{}", percent).ok();
    payload
}

/// Human-readable threshold report
/// Format: "From: DD% to: DD%"
pub fn range_payload(thresholds: &ThresholdPair) -> String<24> {
    let mut payload = String::new();
    write!(
        payload,
        "From: {:02}% to: {:02}%",
        thresholds.too_dry_ceiling, thresholds.too_wet_floor
    )
    .ok();
    payload
}
