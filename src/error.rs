//! Error types shared by the sensor and broker session code.
//!
//! None of these ever escape a wake cycle: the controller logs them and picks
//! the next state (retry, skip the report, or sleep).

/// Probe read failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// A single ADC conversion did not complete
    AdcReadFailed,
    /// Every sample in an averaging window failed
    NoSamples,
}

/// Unified error type for broker session lifecycle stages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    /// The network stack has not been brought up this wake
    NetworkDown,
    /// DNS resolution failed (no addresses or query error)
    DnsResolutionFailed,
    /// DNS returned no addresses
    DnsNoAddresses,
    /// Failed to parse broker host as IP address (when DNS fallback is needed)
    InvalidIpAddress,
    /// TCP connection failed
    TcpConnectionFailed,
    /// MQTT CONNECT handshake was refused or timed out
    MqttConnectFailed,
    /// SUBSCRIBE to the control topic failed
    SubscribeFailed,
    /// A PUBLISH could not be delivered
    PublishFailed,
    /// Reading an inbound packet failed
    ReceiveFailed,
    /// PINGREQ/PINGRESP exchange failed
    KeepaliveFailed,
}
