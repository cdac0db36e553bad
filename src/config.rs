//! Compile-time settings and the runtime tunables of the duty cycle.

use core::time::Duration;

use crate::sensor::Calibration;

// Device identifier embedded in every topic path
// TODO: derive from the eFuse MAC suffix so several nodes can share one image
pub const DEVICE_ID: &str = "sentry-01";
pub const TOPIC_PREFIX: &str = "soil";

// MQTT Configuration
pub const MQTT_KEEP_ALIVE_SECS: u16 = 60;
pub const MQTT_SESSION_EXPIRY_SECS: u32 = 0; // every wake starts a clean session
pub const MQTT_PING_INTERVAL_SECS: u64 = 30;
// Broker host and port fall back to these unless local_secrets provides them
pub const DEFAULT_BROKER_HOST: &str = "192.168.0.245";
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// When a wake turns into a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReportPolicy {
    /// A change strictly greater than this many points is reported
    pub max_drift_points: u8,
    /// Liveness ceiling: report at least every this many wakes
    pub max_cycles_without_report: u16,
}

impl ReportPolicy {
    pub const DEFAULT: Self = Self {
        max_drift_points: 5,
        max_cycles_without_report: 3,
    };
}

impl Default for ReportPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Wi-Fi station credentials.
#[derive(Clone, Copy, Debug)]
pub struct WifiCredentials {
    pub ssid: &'static str,
    pub password: &'static str,
}

/// Runtime tunables of one node.
#[derive(Clone, Copy, Debug)]
pub struct NodeConfig {
    pub policy: ReportPolicy,
    pub calibration: Calibration,
    pub wifi: WifiCredentials,
    /// Deep sleep length between wakes
    pub sleep_period: Duration,
    /// How long a reporting wake stays reachable before sleeping
    pub session_hold: Duration,
    /// Pause between awake-loop iterations
    pub poll_interval: Duration,
    /// Fixed wait between broker connection attempts
    pub reconnect_backoff: Duration,
    /// Wi-Fi association budget; running out restarts the device
    pub provisioning_timeout: Duration,
    /// Gap between the averaged raw samples
    pub sample_spacing: Duration,
    /// On and off time of each LED during the indicator test
    pub indicator_step: Duration,
}

impl NodeConfig {
    pub const fn new(wifi: WifiCredentials) -> Self {
        Self {
            policy: ReportPolicy::DEFAULT,
            calibration: Calibration::DEFAULT,
            wifi,
            sleep_period: Duration::from_secs(60 * 60),
            session_hold: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
            reconnect_backoff: Duration::from_secs(5),
            provisioning_timeout: Duration::from_secs(30),
            sample_spacing: Duration::from_millis(50),
            indicator_step: Duration::from_millis(500),
        }
    }

    /// Awake-loop iterations that make up one hold window (at least one).
    pub fn hold_iterations(&self) -> u32 {
        let poll = self.poll_interval.as_millis().max(1);
        let iterations = self.session_hold.as_millis().div_ceil(poll);
        iterations.clamp(1, u32::MAX as u128) as u32
    }
}

/// Millisecond delay argument, saturating at `u32::MAX`.
pub(crate) fn delay_ms(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}
