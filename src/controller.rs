//! Duty-cycle controller.
//!
//! ```text
//!  (deep sleep) ──wake──▶ DECIDING ──skip────────────────────────────────▶ (deep sleep)
//!                            │
//!                         report
//!                            ▼
//!                        REPORTING ──▶ AWAKE SESSION ──hold elapsed / `s`──▶ (deep sleep)
//!                                         │     ▲
//!                                         └─`a`─┘  held until `s`
//! ```
//!
//! The record is written back to scratch memory before every path that can
//! end in sleep or restart. From the controller's point of view deep sleep is
//! an uncontrolled reset, so anything not committed by then is lost.

use core::time::Duration;

use embedded_hal_async::delay::DelayNs;

use crate::command::{self, Effect};
use crate::config::{NodeConfig, delay_ms};
use crate::cycle_state::{CycleStore, Decision, PersistentCycleState, ScratchMemory};
use crate::event::Event;
use crate::indicator::{self, Indicator};
use crate::mqtt::client::{Connector, MqQos, MqttPublish, RemoteLink};
use crate::mqtt::topics::{self, Topics};
use crate::network::Connectivity;
use crate::sensor::{MoistureProbe, SensorReading, sample_averaged};
use crate::update::UpdateChannel;
use crate::zone::{ThresholdPair, classify};

/// Flags that live for one awake session only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AwakeSession {
    /// Set by `a`, cleared by `s`
    pub stay_awake_override: bool,
    /// The threshold range went out during this session
    pub range_reported: bool,
}

/// Volatile state that remote commands may change. Lost on sleep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceState {
    pub thresholds: ThresholdPair,
    pub session: AwakeSession,
}

/// How a wake cycle ends. Both variants halt execution; the board code
/// performs the transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Deep sleep with a timer wakeup after the given period
    Sleep(Duration),
    /// Full restart (network provisioning timed out)
    Restart,
}

/// Why an awake session returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionEnd {
    Sleep,
    LinkLost,
}

enum Wake {
    Report(SensorReading),
    Sleep,
}

pub struct Controller<P, I, S, U, D> {
    config: NodeConfig,
    topics: Topics,
    device: DeviceState,
    store: CycleStore<S>,
    record: PersistentCycleState,
    /// Reading decided for this wake but not yet published
    pending: Option<SensorReading>,
    probe: P,
    indicator: I,
    updates: U,
    delay: D,
}

impl<P, I, S, U, D> Controller<P, I, S, U, D>
where
    P: MoistureProbe,
    I: Indicator,
    S: ScratchMemory,
    U: UpdateChannel,
    D: DelayNs,
{
    pub fn new(
        config: NodeConfig,
        topics: Topics,
        scratch: S,
        probe: P,
        indicator: I,
        updates: U,
        delay: D,
    ) -> Self {
        Self {
            record: PersistentCycleState::first_boot(&config.policy),
            config,
            topics,
            device: DeviceState::default(),
            store: CycleStore::new(scratch),
            pending: None,
            probe,
            indicator,
            updates,
            delay,
        }
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    /// Run one complete wake cycle and return how it ends.
    ///
    /// Quiet wakes never touch `network` or `connector`. A reporting wake
    /// joins the network (giving up means restart), then keeps opening
    /// broker sessions with a fixed backoff until one of them ends in sleep.
    pub async fn run<N, C>(&mut self, network: &mut N, connector: &mut C) -> CycleOutcome
    where
        N: Connectivity,
        C: Connector,
    {
        let reading = match self.wake().await {
            Wake::Sleep => return self.sleep(),
            Wake::Report(reading) => reading,
        };

        let wifi = self.config.wifi;
        if !network
            .try_connect(wifi.ssid, wifi.password, self.config.provisioning_timeout)
            .await
        {
            error!(
                "wifi: could not join '{}' within {}ms, restarting",
                wifi.ssid,
                delay_ms(self.config.provisioning_timeout)
            );
            self.commit();
            self.indicator.clear();
            return CycleOutcome::Restart;
        }

        self.pending = Some(reading);
        let backoff_ms = delay_ms(self.config.reconnect_backoff);

        // The device has nothing useful to do offline, so this never gives up.
        loop {
            match connector.connect().await {
                Ok(mut link) => match self.awake_session(&mut link).await {
                    SessionEnd::Sleep => return self.sleep(),
                    SessionEnd::LinkLost => {
                        warn!("mqtt: session lost, reconnecting in {}ms", backoff_ms)
                    }
                },
                Err(e) => warn!("mqtt: connect failed: {:?}, retrying in {}ms", e, backoff_ms),
            }
            self.delay.delay_ms(backoff_ms).await;
        }
    }

    /// Load, sample, decide, persist.
    async fn wake(&mut self) -> Wake {
        self.device.session = AwakeSession::default();

        self.record = match self.store.load() {
            Some(record) => record,
            None => {
                info!("cycle: no valid record, first boot");
                indicator::self_test(
                    &mut self.indicator,
                    &mut self.delay,
                    delay_ms(self.config.indicator_step),
                )
                .await;
                PersistentCycleState::first_boot(&self.config.policy)
            }
        };
        debug!(
            "cycle: loaded last={}% cycles={}",
            self.record.last_reported_percent, self.record.cycles_since_report
        );

        let reading = match sample_averaged(
            &mut self.probe,
            &mut self.delay,
            self.config.calibration,
            delay_ms(self.config.sample_spacing),
        )
        .await
        {
            Ok(reading) => reading,
            Err(e) => {
                warn!("cycle: no reading this wake ({:?}), going back to sleep", e);
                self.commit();
                return Wake::Sleep;
            }
        };

        let decision = self.record.advance(reading.percent, &self.config.policy);
        self.commit();

        match decision {
            Decision::Skip => {
                info!(
                    "cycle: {}% unchanged enough, skip ({} of {})",
                    reading.percent,
                    self.record.cycles_since_report,
                    self.config.policy.max_cycles_without_report
                );
                Wake::Sleep
            }
            Decision::Report => {
                let zone = classify(reading.percent, self.device.thresholds);
                info!("cycle: reporting {}% ({})", reading.percent, zone);
                self.indicator.show(zone);
                Wake::Report(reading)
            }
        }
    }

    /// Publish what this wake owes, then service the link until the session
    /// is allowed to end.
    pub async fn awake_session<L: RemoteLink>(&mut self, link: &mut L) -> SessionEnd {
        if self
            .publish(link, Leaf::Update, topics::UPDATE_PENDING)
            .await
            .is_err()
        {
            return SessionEnd::LinkLost;
        }

        if let Some(reading) = self.pending {
            let payload = topics::moisture_payload(reading.percent);
            if self
                .publish(link, Leaf::Moisture, payload.as_bytes())
                .await
                .is_err()
            {
                return SessionEnd::LinkLost;
            }
            self.pending = None;
        }

        if !self.device.session.range_reported {
            let payload = topics::range_payload(&self.device.thresholds);
            if self.publish(link, Leaf::Range, payload.as_bytes()).await.is_err() {
                return SessionEnd::LinkLost;
            }
            self.device.session.range_reported = true;
        }

        let hold = self.config.hold_iterations();
        let poll_ms = delay_ms(self.config.poll_interval);
        let mut iterations: u32 = 0;
        let mut sleep_requested = false;
        let mut ready_announced = false;

        loop {
            if link.keepalive().await.is_err() {
                return SessionEnd::LinkLost;
            }

            let inbound = match link.poll().await {
                Ok(event) => event,
                Err(_) => return SessionEnd::LinkLost,
            };
            match self.dispatch(inbound, link).await {
                Ok(requested) => sleep_requested |= requested,
                Err(_) => return SessionEnd::LinkLost,
            }

            let update = self.updates.service_once();
            match self.dispatch(update, link).await {
                Ok(requested) => sleep_requested |= requested,
                Err(_) => return SessionEnd::LinkLost,
            }

            iterations = iterations.saturating_add(1);
            let hold_elapsed = iterations >= hold;
            let held = self.device.session.stay_awake_override;

            if self.updates.install_in_progress() {
                debug!("cycle: update installing, sleep deferred");
            } else if sleep_requested || (hold_elapsed && !held) {
                return SessionEnd::Sleep;
            }

            if hold_elapsed && held && !ready_announced {
                if self
                    .publish(link, Leaf::Update, topics::UPDATE_READY)
                    .await
                    .is_err()
                {
                    return SessionEnd::LinkLost;
                }
                ready_announced = true;
            }

            self.delay.delay_ms(poll_ms).await;
        }
    }

    /// Act on one polled event. `Ok(true)` asks the session to end in sleep.
    async fn dispatch<L: MqttPublish>(&mut self, event: Event, link: &mut L) -> Result<bool, L::Err> {
        let command = match event {
            Event::NoEvent => return Ok(false),
            Event::UpdateProgress(percent) => {
                info!("update: {}%", percent);
                return Ok(false);
            }
            Event::CommandReceived(command) => command,
        };

        debug!("cmd: received {:?}", command);
        match command::apply(command, &mut self.device) {
            Effect::None => Ok(false),
            Effect::SleepNow => {
                self.commit();
                Ok(true)
            }
            Effect::RunTest => {
                self.run_test(link).await?;
                Ok(false)
            }
            Effect::RangeChanged(thresholds) => {
                let payload = topics::range_payload(&thresholds);
                self.publish(link, Leaf::Range, payload.as_bytes()).await?;
                self.device.session.range_reported = true;
                Ok(false)
            }
        }
    }

    /// Cycle the indicators, take one diagnostic reading, signal completion.
    async fn run_test<L: MqttPublish>(&mut self, link: &mut L) -> Result<(), L::Err> {
        info!("cmd: running indicator test");
        indicator::self_test(
            &mut self.indicator,
            &mut self.delay,
            delay_ms(self.config.indicator_step),
        )
        .await;

        match sample_averaged(
            &mut self.probe,
            &mut self.delay,
            self.config.calibration,
            delay_ms(self.config.sample_spacing),
        )
        .await
        {
            Ok(reading) => {
                let zone = classify(reading.percent, self.device.thresholds);
                info!(
                    "cmd: test reading {}% (raw={}) {}",
                    reading.percent, reading.raw, zone
                );
                self.indicator.show(zone);
            }
            Err(e) => warn!("cmd: test reading failed: {:?}", e),
        }

        self.publish(link, Leaf::Test, topics::TEST_COMPLETE).await
    }

    async fn publish<L: MqttPublish>(
        &self,
        link: &mut L,
        leaf: Leaf,
        payload: &[u8],
    ) -> Result<(), L::Err> {
        // Markers go out at QoS 0: the client drops inbound publishes while
        // it waits for a PUBACK.
        let (topic, qos) = match leaf {
            Leaf::Moisture => (&self.topics.moisture, MqQos::AtLeastOnce),
            Leaf::Range => (&self.topics.range, MqQos::AtLeastOnce),
            Leaf::Test => (&self.topics.test, MqQos::AtMostOnce),
            Leaf::Update => (&self.topics.update, MqQos::AtMostOnce),
        };
        link.publish(topic.as_str(), payload, qos, false).await
    }

    fn commit(&mut self) {
        self.store.save(&self.record);
    }

    fn sleep(&mut self) -> CycleOutcome {
        self.commit();
        self.indicator.clear();
        info!(
            "cycle: sleeping {}s (last={}%, cycles={})",
            self.config.sleep_period.as_secs(),
            self.record.last_reported_percent,
            self.record.cycles_since_report
        );
        CycleOutcome::Sleep(self.config.sleep_period)
    }
}

#[derive(Clone, Copy)]
enum Leaf {
    Moisture,
    Range,
    Test,
    Update,
}
