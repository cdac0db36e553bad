//! MQTT client abstraction and rust-mqtt integration.
//!
//! The controller talks to the broker only through [`Connector`],
//! [`RemoteLink`] and [`MqttPublish`]. The rust-mqtt/embassy-net
//! implementation below is feature-gated so the duty-cycle logic builds and
//! tests without a network stack.

use crate::error::SessionError;
use crate::event::Event;

// ----------------------------------------------------------------------------
// MQTT abstraction (crate-agnostic)
// ----------------------------------------------------------------------------

/// MQTT QoS mapping for a minimal, crate-agnostic publish interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqQos {
    /// QoS 0 — At most once
    AtMostOnce,
    /// QoS 1 — At least once
    AtLeastOnce,
}

/// Minimal MQTT publish trait to decouple app code from a specific client crate.
#[allow(async_fn_in_trait)]
pub trait MqttPublish {
    type Err;
    /// Publish a binary payload to `topic` with the given QoS and retain flag.
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: MqQos,
        retain: bool,
    ) -> Result<(), Self::Err>;
}

/// A connected broker session, serviced from the awake loop.
#[allow(async_fn_in_trait)]
pub trait RemoteLink: MqttPublish {
    /// Check for one inbound control message without blocking past a short
    /// receive window.
    async fn poll(&mut self) -> Result<Event, Self::Err>;

    /// Keep the session alive. Cheap when no ping is due.
    async fn keepalive(&mut self) -> Result<(), Self::Err>;
}

/// Opens broker sessions. Each session borrows the connector (socket and
/// packet buffers) until it is dropped, so at most one is alive at a time.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Link<'a>: RemoteLink
    where
        Self: 'a;

    async fn connect(&mut self) -> Result<Self::Link<'_>, SessionError>;
}

// ----------------------------------------------------------------------------
// rust-mqtt Transport Adapter (feature-gated)
// ----------------------------------------------------------------------------

#[cfg(feature = "mqtt")]
pub use self::session::*;

#[cfg(feature = "mqtt")]
mod session {
    use embassy_net::Stack;
    use embassy_time::{Duration, Instant, with_timeout};
    use embedded_io_async::{ErrorType, Read, Write as IoWrite};
    use rust_mqtt::client::client::MqttClient;
    use rust_mqtt::packet::v5::publish_packet::QualityOfService;
    use rust_mqtt::packet::v5::reason_codes::ReasonCode;
    use rust_mqtt::utils::rng_generator::CountingRng;

    use super::{Connector, MqQos, MqttPublish, RemoteLink};
    use crate::command::Command;
    use crate::config::MQTT_PING_INTERVAL_SECS;
    use crate::error::SessionError;
    use crate::event::Event;
    use crate::mqtt::topics::Topic;

    // Socket and packet buffers; control messages are a few bytes and a
    // report is well under 100
    const TCP_BUFFER_LEN: usize = 1024;
    const MQTT_BUFFER_LEN: usize = 512;

    // Upper bound on one poll of the inbound stream
    const RECEIVE_WINDOW_MS: u64 = 20;

    const DNS_FAILURE_THRESHOLD: u8 = 5;

    /// Transport adapter wrapping embassy_net::tcp::TcpSocket for rust-mqtt client.
    /// Implements embedded_io_async traits required by rust-mqtt v0.3.
    pub struct EmbassyNetTransport<'a> {
        socket: embassy_net::tcp::TcpSocket<'a>,
    }

    impl<'a> EmbassyNetTransport<'a> {
        /// Create a new transport from an embassy-net TCP socket.
        pub fn new(socket: embassy_net::tcp::TcpSocket<'a>) -> Self {
            Self { socket }
        }
    }

    impl<'a> ErrorType for EmbassyNetTransport<'a> {
        type Error = embassy_net::tcp::Error;
    }

    impl<'a> Read for EmbassyNetTransport<'a> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.socket.read(buf).await
        }
    }

    impl<'a> IoWrite for EmbassyNetTransport<'a> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.socket.write(buf).await
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            self.socket.flush().await
        }
    }

    /// Interpret MQTT v5 reason codes (CONNACK, SUBACK, PUBACK) for better error
    /// diagnostics. Returns a human-readable description of the reason code.
    pub fn interpret_reason_code(reason: &ReasonCode) -> &'static str {
        match *reason {
            ReasonCode::Success => "Success",
            ReasonCode::UnspecifiedError => "Unspecified error",
            ReasonCode::MalformedPacket => "Malformed packet",
            ReasonCode::ProtocolError => "Protocol error",
            ReasonCode::ImplementationSpecificError => "Implementation specific error",
            ReasonCode::UnsupportedProtocolVersion => "Unsupported protocol version",
            ReasonCode::ClientIdNotValid => "Client identifier not valid",
            ReasonCode::BadUserNameOrPassword => "Bad username or password",
            ReasonCode::NotAuthorized => "Not authorized",
            ReasonCode::ServerUnavailable => "Server unavailable",
            ReasonCode::ServerBusy => "Server busy",
            ReasonCode::Banned => "Client banned",
            ReasonCode::TopicNameInvalid => "Topic name invalid",
            ReasonCode::PacketTooLarge => "Packet too large",
            ReasonCode::QuotaExceeded => "Quota exceeded",
            ReasonCode::PayloadFormatInvalid => "Payload format invalid",
            ReasonCode::RetainNotSupported => "Retain not supported",
            ReasonCode::QoSNotSupported => "QoS not supported",
            ReasonCode::UseAnotherServer => "Use another server",
            ReasonCode::ServerMoved => "Server moved",
            ReasonCode::ConnectionRateExceeded => "Connection rate exceeded",
            _ => "Unknown reason code",
        }
    }

    /// Broker address and credentials.
    #[derive(Clone, Copy, Debug)]
    pub struct BrokerSettings {
        pub host: &'static str,
        pub port: u16,
        pub client_id: &'static str,
        pub username: &'static str,
        pub password: &'static str,
        pub keep_alive_secs: u16,
        pub session_expiry_secs: u32,
    }

    /// Buffers that must outlive the socket and the client of one session.
    pub struct SessionBuffers {
        tcp_rx: [u8; TCP_BUFFER_LEN],
        tcp_tx: [u8; TCP_BUFFER_LEN],
        mqtt_recv: [u8; MQTT_BUFFER_LEN],
        mqtt_write: [u8; MQTT_BUFFER_LEN],
    }

    impl SessionBuffers {
        pub const fn new() -> Self {
            Self {
                tcp_rx: [0; TCP_BUFFER_LEN],
                tcp_tx: [0; TCP_BUFFER_LEN],
                mqtt_recv: [0; MQTT_BUFFER_LEN],
                mqtt_write: [0; MQTT_BUFFER_LEN],
            }
        }
    }

    impl Default for SessionBuffers {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Resolves the MQTT broker hostname to an IPv4 address
    ///
    /// After 5 consecutive DNS failures the hostname is parsed as an IP
    /// address instead, so a broker configured by IP keeps working when DNS
    /// is down.
    async fn resolve_broker_address(
        stack: &Stack<'static>,
        broker_host: &str,
        dns_failure_count: &mut u8,
    ) -> Result<smoltcp::wire::Ipv4Address, SessionError> {
        info!("mqtt: resolving broker hostname '{}'...", broker_host);

        let failure = match stack
            .dns_query(broker_host, embassy_net::dns::DnsQueryType::A)
            .await
        {
            Ok(addrs) => match addrs.first() {
                Some(addr) => {
                    info!("mqtt: resolved '{}' to {}", broker_host, addr);
                    *dns_failure_count = 0;
                    let smoltcp::wire::IpAddress::Ipv4(ipv4) = *addr;
                    return Ok(ipv4);
                }
                None => {
                    error!("mqtt: DNS resolution returned no addresses");
                    SessionError::DnsNoAddresses
                }
            },
            Err(e) => {
                error!("mqtt: DNS resolution failed: {:?}", e);
                SessionError::DnsResolutionFailed
            }
        };

        *dns_failure_count = dns_failure_count.saturating_add(1);
        if *dns_failure_count < DNS_FAILURE_THRESHOLD {
            return Err(failure);
        }

        warn!(
            "mqtt: DNS failed {} times, attempting to parse '{}' as IP address",
            dns_failure_count, broker_host
        );
        match broker_host.parse::<smoltcp::wire::Ipv4Address>() {
            Ok(ip) => {
                info!("mqtt: using IP address directly: {}", ip);
                *dns_failure_count = 0;
                Ok(ip)
            }
            Err(_) => {
                error!(
                    "mqtt: '{}' is not a valid IP address, cannot fallback",
                    broker_host
                );
                Err(SessionError::InvalidIpAddress)
            }
        }
    }

    /// Establishes a TCP connection to the MQTT broker (10 s timeout).
    async fn establish_tcp_connection<'a>(
        stack: &Stack<'static>,
        broker_addr: smoltcp::wire::Ipv4Address,
        broker_port: u16,
        tcp_rx_buffer: &'a mut [u8],
        tcp_tx_buffer: &'a mut [u8],
    ) -> Result<embassy_net::tcp::TcpSocket<'a>, SessionError> {
        let mut tcp_socket = embassy_net::tcp::TcpSocket::new(*stack, tcp_rx_buffer, tcp_tx_buffer);
        tcp_socket.set_timeout(Some(Duration::from_secs(10)));

        info!("mqtt: connecting TCP to {}:{}...", broker_addr, broker_port);
        match tcp_socket.connect((broker_addr, broker_port)).await {
            Ok(()) => {
                info!("mqtt: TCP connected");
                Ok(tcp_socket)
            }
            Err(e) => {
                error!("mqtt: TCP connection failed: {:?}", e);
                Err(SessionError::TcpConnectionFailed)
            }
        }
    }

    /// Initialize rust-mqtt client and perform the CONNECT handshake.
    async fn init_rust_mqtt_client<'a>(
        transport: EmbassyNetTransport<'a>,
        settings: &BrokerSettings,
        recv_buffer: &'a mut [u8],
        write_buffer: &'a mut [u8],
    ) -> Result<MqttClient<'a, EmbassyNetTransport<'a>, 5, CountingRng>, ReasonCode> {
        use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
        use rust_mqtt::packet::v5::property::Property;

        let mut client_config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(0));
        client_config.add_client_id(settings.client_id);
        client_config.keep_alive = settings.keep_alive_secs;
        client_config.add_property(Property::SessionExpiryInterval(settings.session_expiry_secs));

        if !settings.username.is_empty() {
            client_config.add_username(settings.username);
            if !settings.password.is_empty() {
                client_config.add_password(settings.password);
            }
        }

        let recv_len = recv_buffer.len();
        let write_len = write_buffer.len();
        let mut client = MqttClient::<_, 5, _>::new(
            transport,
            write_buffer,
            write_len,
            recv_buffer,
            recv_len,
            client_config,
        );

        client.connect_to_broker().await?;
        Ok(client)
    }

    /// Opens rust-mqtt sessions over embassy-net and subscribes each one to
    /// the device control topic.
    pub struct BrokerConnector<'d> {
        stack: Stack<'static>,
        settings: BrokerSettings,
        control_topic: Topic,
        buffers: &'d mut SessionBuffers,
        dns_failure_count: u8,
    }

    impl<'d> BrokerConnector<'d> {
        pub fn new(
            stack: Stack<'static>,
            settings: BrokerSettings,
            control_topic: Topic,
            buffers: &'d mut SessionBuffers,
        ) -> Self {
            Self {
                stack,
                settings,
                control_topic,
                buffers,
                dns_failure_count: 0,
            }
        }
    }

    impl Connector for BrokerConnector<'_> {
        type Link<'a>
            = BrokerSession<'a>
        where
            Self: 'a;

        async fn connect(&mut self) -> Result<BrokerSession<'_>, SessionError> {
            let Self {
                stack,
                settings,
                control_topic,
                buffers,
                dns_failure_count,
            } = self;

            let broker_addr = resolve_broker_address(stack, settings.host, dns_failure_count).await?;

            let SessionBuffers {
                tcp_rx,
                tcp_tx,
                mqtt_recv,
                mqtt_write,
            } = &mut **buffers;
            let socket =
                establish_tcp_connection(stack, broker_addr, settings.port, tcp_rx, tcp_tx).await?;

            let mut client = init_rust_mqtt_client(
                EmbassyNetTransport::new(socket),
                settings,
                mqtt_recv,
                mqtt_write,
            )
            .await
            .map_err(|e| {
                error!(
                    "mqtt: MQTT connection failed - reason: {}",
                    interpret_reason_code(&e)
                );
                match e {
                    ReasonCode::BadUserNameOrPassword => {
                        error!("mqtt: Check MQTT_USERNAME and MQTT_PASSWORD configuration");
                    }
                    ReasonCode::NotAuthorized => {
                        error!("mqtt: Client not authorized - check broker ACL configuration");
                    }
                    ReasonCode::ServerUnavailable | ReasonCode::ServerBusy => {
                        warn!("mqtt: Broker temporarily unavailable, will retry");
                    }
                    _ => {}
                }
                SessionError::MqttConnectFailed
            })?;
            info!("mqtt: connected successfully (MQTT v5)");

            client
                .subscribe_to_topic(control_topic.as_str())
                .await
                .map_err(|e| {
                    error!(
                        "mqtt: subscribe to '{}' failed: {}",
                        control_topic.as_str(),
                        interpret_reason_code(&e)
                    );
                    SessionError::SubscribeFailed
                })?;
            info!("mqtt: listening on '{}'", control_topic.as_str());

            Ok(BrokerSession {
                client,
                last_ping: Instant::now(),
            })
        }
    }

    /// One live rust-mqtt session.
    pub struct BrokerSession<'a> {
        client: MqttClient<'a, EmbassyNetTransport<'a>, 5, CountingRng>,
        last_ping: Instant,
    }

    impl MqttPublish for BrokerSession<'_> {
        type Err = SessionError;

        async fn publish(
            &mut self,
            topic: &str,
            payload: &[u8],
            qos: MqQos,
            retain: bool,
        ) -> Result<(), Self::Err> {
            let mqtt_qos = match qos {
                MqQos::AtMostOnce => QualityOfService::QoS0,
                MqQos::AtLeastOnce => QualityOfService::QoS1,
            };
            info!(
                "mqtt: publishing to channel='{}' len={} {} retain={}",
                topic,
                payload.len(),
                qos,
                retain
            );

            match self.client.send_message(topic, payload, mqtt_qos, retain).await {
                Ok(()) => Ok(()),
                // published, just nobody listening
                Err(ReasonCode::NoMatchingSubscribers) => Ok(()),
                Err(e) => {
                    error!(
                        "mqtt: publish to '{}' failed: {}",
                        topic,
                        interpret_reason_code(&e)
                    );
                    Err(SessionError::PublishFailed)
                }
            }
        }
    }

    impl RemoteLink for BrokerSession<'_> {
        async fn poll(&mut self) -> Result<Event, Self::Err> {
            // receive_message is not documented as cancel-safe. A timeout
            // mid-packet leaves the stream out of frame; the next receive
            // fails and the controller reconnects, losing that one message.
            let received = with_timeout(
                Duration::from_millis(RECEIVE_WINDOW_MS),
                self.client.receive_message(),
            )
            .await;

            match received {
                Err(_timeout) => Ok(Event::NoEvent),
                Ok(Ok((topic, payload))) => {
                    debug!("mqtt: {} byte(s) on '{}'", payload.len(), topic);
                    Ok(Command::parse(payload).map_or(Event::NoEvent, Event::CommandReceived))
                }
                Ok(Err(e)) => {
                    error!("mqtt: receive failed: {}", interpret_reason_code(&e));
                    Err(SessionError::ReceiveFailed)
                }
            }
        }

        async fn keepalive(&mut self) -> Result<(), Self::Err> {
            if self.last_ping.elapsed() < Duration::from_secs(MQTT_PING_INTERVAL_SECS) {
                return Ok(());
            }
            self.client.send_ping().await.map_err(|e| {
                warn!("mqtt: keepalive failed: {}", interpret_reason_code(&e));
                SessionError::KeepaliveFailed
            })?;
            self.last_ping = Instant::now();
            Ok(())
        }
    }
}
