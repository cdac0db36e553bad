//! Whole wake cycles against scripted hardware and a scripted broker.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use embassy_futures::block_on;
use embedded_hal_async::delay::DelayNs;

use soil_sentry::command::Command;
use soil_sentry::config::{DEVICE_ID, NodeConfig, TOPIC_PREFIX, WifiCredentials};
use soil_sentry::controller::{Controller, CycleOutcome};
use soil_sentry::cycle_state::{PersistentCycleState, RECORD_LEN};
use soil_sentry::error::{SensorError, SessionError};
use soil_sentry::event::Event;
use soil_sentry::indicator::Indicator;
use soil_sentry::mqtt::{Connector, MqQos, MqttPublish, RemoteLink, Topics};
use soil_sentry::network::Connectivity;
use soil_sentry::sensor::MoistureProbe;
use soil_sentry::update::{NoUpdates, UpdateChannel};
use soil_sentry::zone::{ThresholdPair, Zone};

// normalize(raw, 350, 850) = 100 - (raw - 350) * 100 / 500
const RAW_40: u16 = 650;
const RAW_42: u16 = 640;
const RAW_46: u16 = 620;

fn topic(leaf: &str) -> String {
    format!("{TOPIC_PREFIX}/{DEVICE_ID}/{leaf}")
}

fn node_config() -> NodeConfig {
    let mut cfg = NodeConfig::new(WifiCredentials {
        ssid: "garden",
        password: "hunter2",
    });
    // three awake-loop iterations per hold window
    cfg.session_hold = Duration::from_millis(150);
    cfg
}

fn stored(last: u8, cycles: u16) -> [u8; RECORD_LEN] {
    PersistentCycleState {
        last_reported_percent: last,
        cycles_since_report: cycles,
    }
    .encode()
}

fn decoded(scratch: &[u8; RECORD_LEN]) -> PersistentCycleState {
    PersistentCycleState::decode(scratch).expect("record should be valid")
}

struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

/// Every millisecond wait, in order.
#[derive(Clone, Default)]
struct RecordingDelay(Rc<RefCell<Vec<u32>>>);

impl RecordingDelay {
    fn waits(&self) -> Vec<u32> {
        self.0.borrow().clone()
    }
}

impl DelayNs for RecordingDelay {
    async fn delay_ns(&mut self, _ns: u32) {}

    async fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().push(ms);
    }
}

struct FixedProbe(Option<u16>);

impl MoistureProbe for FixedProbe {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        self.0.ok_or(SensorError::AdcReadFailed)
    }
}

/// Scripted samples; `None` is a failed read.
struct FlakySensor(VecDeque<Option<u16>>);

impl MoistureProbe for FlakySensor {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        self.0
            .pop_front()
            .flatten()
            .ok_or(SensorError::AdcReadFailed)
    }
}

/// `Some(zone)` for show, `None` for clear.
#[derive(Clone, Default)]
struct RecordingIndicator(Rc<RefCell<Vec<Option<Zone>>>>);

impl RecordingIndicator {
    fn shown(&self) -> Vec<Zone> {
        self.0.borrow().iter().flatten().copied().collect()
    }
}

impl Indicator for RecordingIndicator {
    fn show(&mut self, zone: Zone) {
        self.0.borrow_mut().push(Some(zone));
    }

    fn clear(&mut self) {
        self.0.borrow_mut().push(None);
    }
}

struct Network {
    joins: usize,
    available: bool,
}

impl Network {
    fn up() -> Self {
        Self {
            joins: 0,
            available: true,
        }
    }

    fn down() -> Self {
        Self {
            joins: 0,
            available: false,
        }
    }
}

impl Connectivity for Network {
    async fn try_connect(&mut self, ssid: &str, password: &str, _timeout: Duration) -> bool {
        assert_eq!((ssid, password), ("garden", "hunter2"));
        self.joins += 1;
        self.available
    }
}

#[derive(Default)]
struct SessionScript {
    inbound: VecDeque<Event>,
    /// The nth poll of this session fails
    lose_on_poll: Option<usize>,
}

impl SessionScript {
    fn receiving(payloads: &[&[u8]]) -> Self {
        Self {
            inbound: payloads
                .iter()
                .map(|p| Command::parse(p).map_or(Event::NoEvent, Event::CommandReceived))
                .collect(),
            lose_on_poll: None,
        }
    }
}

#[derive(Default)]
struct Broker {
    refuse: usize,
    sessions: VecDeque<SessionScript>,
    attempts: usize,
    polls: usize,
    published: Vec<(String, Vec<u8>, MqQos)>,
}

impl Broker {
    fn with_sessions(sessions: impl IntoIterator<Item = SessionScript>) -> Self {
        Self {
            sessions: sessions.into_iter().collect(),
            ..Self::default()
        }
    }

    fn on(&self, leaf: &str) -> Vec<String> {
        let topic = topic(leaf);
        self.published
            .iter()
            .filter(|(t, _, _)| *t == topic)
            .map(|(_, p, _)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    fn qos_on(&self, leaf: &str) -> Vec<MqQos> {
        let topic = topic(leaf);
        self.published
            .iter()
            .filter(|(t, _, _)| *t == topic)
            .map(|(_, _, q)| *q)
            .collect()
    }
}

struct Link<'a> {
    broker: &'a mut Broker,
    script: SessionScript,
    polls: usize,
}

impl MqttPublish for Link<'_> {
    type Err = SessionError;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: MqQos,
        retain: bool,
    ) -> Result<(), SessionError> {
        assert!(!retain);
        self.broker
            .published
            .push((topic.to_owned(), payload.to_vec(), qos));
        Ok(())
    }
}

impl RemoteLink for Link<'_> {
    async fn poll(&mut self) -> Result<Event, SessionError> {
        self.polls += 1;
        self.broker.polls += 1;
        if self.script.lose_on_poll == Some(self.polls) {
            return Err(SessionError::ReceiveFailed);
        }
        Ok(self.script.inbound.pop_front().unwrap_or(Event::NoEvent))
    }

    async fn keepalive(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

impl Connector for Broker {
    type Link<'a>
        = Link<'a>
    where
        Self: 'a;

    async fn connect(&mut self) -> Result<Link<'_>, SessionError> {
        self.attempts += 1;
        if self.refuse > 0 {
            self.refuse -= 1;
            return Err(SessionError::TcpConnectionFailed);
        }
        let script = self.sessions.pop_front().unwrap_or_default();
        Ok(Link {
            broker: self,
            script,
            polls: 0,
        })
    }
}

/// Install runs for a fixed number of service calls.
struct Installing(Rc<Cell<u32>>);

impl UpdateChannel for Installing {
    fn service_once(&mut self) -> Event {
        let left = self.0.get();
        if left == 0 {
            return Event::NoEvent;
        }
        self.0.set(left - 1);
        Event::UpdateProgress(100 - (left.min(100) as u8))
    }

    fn install_in_progress(&self) -> bool {
        self.0.get() > 0
    }
}

fn wake_with<U: UpdateChannel>(
    scratch: &mut [u8; RECORD_LEN],
    raw: Option<u16>,
    indicator: RecordingIndicator,
    updates: U,
    network: &mut Network,
    broker: &mut Broker,
) -> (CycleOutcome, ThresholdPair) {
    let mut controller = Controller::new(
        node_config(),
        Topics::new(TOPIC_PREFIX, DEVICE_ID),
        scratch,
        FixedProbe(raw),
        indicator,
        updates,
        NoDelay,
    );
    let outcome = block_on(controller.run(network, broker));
    (outcome, controller.device().thresholds)
}

fn wake(
    scratch: &mut [u8; RECORD_LEN],
    raw: u16,
    network: &mut Network,
    broker: &mut Broker,
) -> CycleOutcome {
    wake_with(
        scratch,
        Some(raw),
        RecordingIndicator::default(),
        NoUpdates,
        network,
        broker,
    )
    .0
}

/// Like [`wake`], returning every wait the controller made.
fn timed_wake(
    scratch: &mut [u8; RECORD_LEN],
    raw: u16,
    network: &mut Network,
    broker: &mut Broker,
) -> (CycleOutcome, Vec<u32>) {
    let delay = RecordingDelay::default();
    let mut controller = Controller::new(
        node_config(),
        Topics::new(TOPIC_PREFIX, DEVICE_ID),
        scratch,
        FixedProbe(Some(raw)),
        RecordingIndicator::default(),
        NoUpdates,
        delay.clone(),
    );
    let outcome = block_on(controller.run(network, broker));
    (outcome, delay.waits())
}

const HOUR: CycleOutcome = CycleOutcome::Sleep(Duration::from_secs(3600));

#[test]
fn first_boot_reports_and_runs_the_self_test() {
    let mut scratch = [0u8; RECORD_LEN];
    let indicator = RecordingIndicator::default();
    let mut network = Network::up();
    let mut broker = Broker::default();

    let (outcome, _) = wake_with(
        &mut scratch,
        Some(RAW_40),
        indicator.clone(),
        NoUpdates,
        &mut network,
        &mut broker,
    );

    assert_eq!(outcome, HOUR);
    assert_eq!(network.joins, 1);
    assert_eq!(broker.on("update"), ["No"]);
    assert_eq!(broker.on("moisture"), ["40"]);
    assert_eq!(broker.on("range"), ["From: 30% to: 50%"]);
    assert_eq!(
        indicator.shown(),
        [Zone::TooDry, Zone::TooWet, Zone::Normal, Zone::Normal]
    );
    assert_eq!(indicator.0.borrow().last(), Some(&None));
    assert_eq!(
        decoded(&scratch),
        PersistentCycleState {
            last_reported_percent: 40,
            cycles_since_report: 0,
        }
    );
}

#[test]
fn quiet_wake_never_touches_the_network() {
    let mut scratch = stored(40, 0);
    let mut network = Network::up();
    let mut broker = Broker::default();

    assert_eq!(wake(&mut scratch, RAW_42, &mut network, &mut broker), HOUR);

    assert_eq!(network.joins, 0);
    assert_eq!(broker.attempts, 0);
    assert_eq!(
        decoded(&scratch),
        PersistentCycleState {
            last_reported_percent: 42,
            cycles_since_report: 1,
        }
    );
}

#[test]
fn drift_past_tolerance_reports() {
    let mut scratch = stored(40, 0);
    let mut network = Network::up();
    let mut broker = Broker::default();

    wake(&mut scratch, RAW_46, &mut network, &mut broker);

    assert_eq!(broker.on("moisture"), ["46"]);
    assert_eq!(decoded(&scratch).cycles_since_report, 0);
}

#[test]
fn steady_reading_reports_every_third_wake() {
    let mut scratch = stored(40, 0);
    let mut network = Network::up();
    let mut broker = Broker::default();

    let mut reported_on = Vec::new();
    for n in 1..=6 {
        let before = broker.on("moisture").len();
        wake(&mut scratch, RAW_40, &mut network, &mut broker);
        if broker.on("moisture").len() > before {
            reported_on.push(n);
        }
    }

    assert_eq!(reported_on, [3, 6]);
    assert_eq!(network.joins, 2);
}

#[test]
fn keep_awake_holds_until_sleep_command() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([SessionScript::receiving(&[
        b"a", b"", b"", b"", b"", b"", b"s",
    ])]);

    assert_eq!(wake(&mut scratch, RAW_40, &mut network, &mut broker), HOUR);

    assert_eq!(broker.polls, 7);
    assert_eq!(broker.on("update"), ["No", "yes"]);
}

#[test]
fn sleep_command_without_hold_is_ignored() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([SessionScript::receiving(&[b"s"])]);

    wake(&mut scratch, RAW_40, &mut network, &mut broker);

    // the session still runs its full hold window
    assert_eq!(broker.polls, 3);
    assert_eq!(broker.on("update"), ["No"]);
}

#[test]
fn range_command_republishes_the_range() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([SessionScript::receiving(&[b"r4055"])]);

    let (outcome, thresholds) = wake_with(
        &mut scratch,
        Some(RAW_40),
        RecordingIndicator::default(),
        NoUpdates,
        &mut network,
        &mut broker,
    );

    assert_eq!(outcome, HOUR);
    assert_eq!(thresholds, ThresholdPair::new(40, 55));
    assert_eq!(
        broker.on("range"),
        ["From: 30% to: 50%", "From: 40% to: 55%"]
    );
}

#[test]
fn test_command_cycles_the_leds_and_signals_done() {
    let mut scratch = stored(40, 2);
    let indicator = RecordingIndicator::default();
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([SessionScript::receiving(&[b"t"])]);

    wake_with(
        &mut scratch,
        Some(RAW_40),
        indicator.clone(),
        NoUpdates,
        &mut network,
        &mut broker,
    );

    assert_eq!(broker.on("test"), [""]);
    assert_eq!(
        indicator.shown(),
        [
            Zone::Normal,
            Zone::TooDry,
            Zone::TooWet,
            Zone::Normal,
            Zone::Normal
        ]
    );
    // the diagnostic reading does not count as a wake
    assert_eq!(decoded(&scratch).cycles_since_report, 0);
}

#[test]
fn unknown_command_changes_nothing() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([SessionScript::receiving(&[b"x99"])]);

    let (outcome, thresholds) = wake_with(
        &mut scratch,
        Some(RAW_40),
        RecordingIndicator::default(),
        NoUpdates,
        &mut network,
        &mut broker,
    );

    assert_eq!(outcome, HOUR);
    assert_eq!(thresholds, ThresholdPair::default());
    assert_eq!(broker.polls, 3);
}

#[test]
fn install_in_progress_defers_sleep() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::default();
    let remaining = Rc::new(Cell::new(10));

    let (outcome, _) = wake_with(
        &mut scratch,
        Some(RAW_40),
        RecordingIndicator::default(),
        Installing(remaining.clone()),
        &mut network,
        &mut broker,
    );

    assert_eq!(outcome, HOUR);
    assert_eq!(remaining.get(), 0);
    assert_eq!(broker.polls, 10);
}

#[test]
fn sleep_command_waits_for_install_to_finish() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([SessionScript::receiving(&[b"a", b"s"])]);
    let remaining = Rc::new(Cell::new(5));

    wake_with(
        &mut scratch,
        Some(RAW_40),
        RecordingIndicator::default(),
        Installing(remaining.clone()),
        &mut network,
        &mut broker,
    );

    assert_eq!(remaining.get(), 0);
    assert_eq!(broker.polls, 5);
}

#[test]
fn lost_session_reconnects_without_republishing_the_reading() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([
        SessionScript {
            lose_on_poll: Some(1),
            ..SessionScript::default()
        },
        SessionScript::default(),
    ]);
    broker.refuse = 1;

    assert_eq!(wake(&mut scratch, RAW_40, &mut network, &mut broker), HOUR);

    assert_eq!(broker.attempts, 3);
    assert_eq!(network.joins, 1);
    assert_eq!(broker.on("moisture"), ["40"]);
    assert_eq!(broker.on("range"), ["From: 30% to: 50%"]);
    assert_eq!(broker.on("update"), ["No", "No"]);
}

#[test]
fn refused_connects_back_off_between_attempts() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::default();
    broker.refuse = 2;

    let (outcome, waits) = timed_wake(&mut scratch, RAW_40, &mut network, &mut broker);

    assert_eq!(outcome, HOUR);
    assert_eq!(broker.attempts, 3);
    // sample spacing, two backoffs, then the hold window's poll pauses
    assert_eq!(waits, [50, 50, 5000, 5000, 50, 50]);
}

#[test]
fn first_boot_paces_the_self_test_and_samples() {
    let mut scratch = [0u8; RECORD_LEN];
    let mut network = Network::up();
    let mut broker = Broker::default();

    let (_, waits) = timed_wake(&mut scratch, RAW_40, &mut network, &mut broker);

    assert_eq!(
        waits,
        [500, 500, 500, 500, 500, 500, 50, 50, 50, 50]
    );
}

#[test]
fn keep_awake_survives_a_reconnect() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([
        SessionScript {
            lose_on_poll: Some(2),
            ..SessionScript::receiving(&[b"a"])
        },
        SessionScript::receiving(&[b"", b"", b"", b"", b"s"]),
    ]);

    assert_eq!(wake(&mut scratch, RAW_40, &mut network, &mut broker), HOUR);

    assert_eq!(broker.attempts, 2);
    // the second session is still held past its window and obeys `s`
    assert_eq!(broker.polls, 2 + 5);
    assert_eq!(broker.on("update"), ["No", "No", "yes"]);
    assert_eq!(broker.on("moisture"), ["40"]);
}

#[test]
fn readings_are_acknowledged_and_markers_are_not() {
    let mut scratch = stored(40, 2);
    let mut network = Network::up();
    let mut broker = Broker::with_sessions([SessionScript::receiving(&[b"t", b"r4055"])]);

    wake(&mut scratch, RAW_40, &mut network, &mut broker);

    assert_eq!(broker.qos_on("moisture"), [MqQos::AtLeastOnce]);
    assert_eq!(broker.qos_on("range"), [MqQos::AtLeastOnce; 2]);
    assert_eq!(broker.qos_on("update"), [MqQos::AtMostOnce]);
    assert_eq!(broker.qos_on("test"), [MqQos::AtMostOnce]);
}

#[test]
fn partial_sample_failure_still_reports() {
    let mut scratch = stored(40, 0);
    let mut network = Network::up();
    let mut broker = Broker::default();
    let mut controller = Controller::new(
        node_config(),
        Topics::new(TOPIC_PREFIX, DEVICE_ID),
        &mut scratch,
        FlakySensor(VecDeque::from([None, Some(RAW_46), Some(RAW_46)])),
        RecordingIndicator::default(),
        NoUpdates,
        NoDelay,
    );

    assert_eq!(block_on(controller.run(&mut network, &mut broker)), HOUR);
    drop(controller);

    // the failed sample is left out of the mean
    assert_eq!(broker.on("moisture"), ["46"]);
    assert_eq!(decoded(&scratch).last_reported_percent, 46);
}

#[test]
fn provisioning_timeout_restarts_with_the_record_committed() {
    let mut scratch = stored(40, 2);
    let mut network = Network::down();
    let mut broker = Broker::default();

    assert_eq!(
        wake(&mut scratch, RAW_40, &mut network, &mut broker),
        CycleOutcome::Restart
    );

    assert_eq!(broker.attempts, 0);
    assert_eq!(
        decoded(&scratch),
        PersistentCycleState {
            last_reported_percent: 40,
            cycles_since_report: 0,
        }
    );
}

#[test]
fn failed_sampling_keeps_the_record_and_sleeps() {
    let mut scratch = stored(40, 1);
    let mut network = Network::up();
    let mut broker = Broker::default();

    let (outcome, _) = wake_with(
        &mut scratch,
        None,
        RecordingIndicator::default(),
        NoUpdates,
        &mut network,
        &mut broker,
    );

    assert_eq!(outcome, HOUR);
    assert_eq!(network.joins, 0);
    assert_eq!(scratch, stored(40, 1));
}

#[test]
fn corrupted_record_is_treated_as_first_boot() {
    let mut scratch = stored(40, 0);
    scratch[5] ^= 0x01;
    let mut network = Network::up();
    let mut broker = Broker::default();

    wake(&mut scratch, RAW_40, &mut network, &mut broker);

    assert_eq!(broker.on("moisture"), ["40"]);
    assert_eq!(decoded(&scratch).cycles_since_report, 0);
}
