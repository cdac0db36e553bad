//! XIAO ESP32-C6 adapters for the controller's collaborators.

use core::cell::OnceCell;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use alloc::boxed::Box;
use embassy_executor::Spawner;
use embassy_net::{Config as NetConfig, Runner, Stack, StackResources};
use embassy_time::{Timer, with_timeout};
use esp_hal::analog::adc::{Adc, AdcPin};
use esp_hal::peripherals::WIFI;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice};
use static_cell::StaticCell;

use crate::config::delay_ms;
use crate::cycle_state::{RECORD_LEN, ScratchMemory};
use crate::error::{SensorError, SessionError};
use crate::mqtt::topics::Topic;
use crate::mqtt::{BrokerConnector, BrokerSession, BrokerSettings, Connector, SessionBuffers};
use crate::network::Connectivity;
use crate::sensor::MoistureProbe;

pub type MoistureAdc = Adc<'static, esp_hal::peripherals::ADC1<'static>, esp_hal::Blocking>;
pub type MoistureAdcPin =
    AdcPin<esp_hal::peripherals::GPIO0<'static>, esp_hal::peripherals::ADC1<'static>>;

// The C6 converts to 12 bits; calibration is in the 10-bit range of the probe
const ADC_SCALE_SHIFT: u16 = 2;
// read_oneshot reports WouldBlock until the conversion it started finishes
const ADC_POLL_LIMIT: u32 = 10_000;

/// Capacitive probe on A0 (GPIO0), powered from 3V3.
pub struct AdcProbe {
    adc: MoistureAdc,
    pin: MoistureAdcPin,
}

impl AdcProbe {
    pub fn new(adc: MoistureAdc, pin: MoistureAdcPin) -> Self {
        Self { adc, pin }
    }
}

impl MoistureProbe for AdcProbe {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        for _ in 0..ADC_POLL_LIMIT {
            if let Ok(raw) = self.adc.read_oneshot(&mut self.pin) {
                return Ok(raw >> ADC_SCALE_SHIFT);
            }
        }
        error!("sensor: ADC read failed");
        Err(SensorError::AdcReadFailed)
    }
}

// Survives deep sleep; garbage after power loss, which the checksum catches
#[esp_hal::ram(unstable(rtc_fast, persistent))]
static mut CYCLE_RECORD: [u8; RECORD_LEN] = [0; RECORD_LEN];

static SCRATCH_TAKEN: AtomicBool = AtomicBool::new(false);

/// Handle on the RTC fast memory slot holding the cycle record.
pub struct RtcScratch {
    slot: &'static mut [u8; RECORD_LEN],
}

impl RtcScratch {
    /// Returns the handle once; later calls get `None`.
    pub fn take() -> Option<Self> {
        if SCRATCH_TAKEN.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: the flag above hands out at most one reference
        let slot = unsafe { &mut *core::ptr::addr_of_mut!(CYCLE_RECORD) };
        Some(Self { slot })
    }
}

impl ScratchMemory for RtcScratch {
    fn read(&self, buf: &mut [u8; RECORD_LEN]) {
        buf.copy_from_slice(self.slot);
    }

    fn write(&mut self, buf: &[u8; RECORD_LEN]) {
        self.slot.copy_from_slice(buf);
    }
}

const LINK_POLL_MS: u64 = 100;

// embassy-net stack resources (DHCP, DNS, MQTT)
static STACK_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
static SESSION_BUFFERS: StaticCell<SessionBuffers> = StaticCell::new();

/// Set once the radio is up; read by [`DeferredBroker`].
pub type StackSlot = OnceCell<Stack<'static>>;

#[embassy_executor::task]
async fn embassy_net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

/// Wi-Fi station plus the embassy-net stack riding on it.
///
/// Nothing is powered until the first [`Connectivity::try_connect`]; quiet
/// wakes leave the radio off.
pub struct WifiConnectivity {
    spawner: Spawner,
    wifi: Option<WIFI<'static>>,
    controller: Option<WifiController<'static>>,
    stack_slot: &'static StackSlot,
}

impl WifiConnectivity {
    pub fn new(spawner: Spawner, wifi: WIFI<'static>, stack_slot: &'static StackSlot) -> Self {
        Self {
            spawner,
            wifi: Some(wifi),
            controller: None,
            stack_slot,
        }
    }

    /// Start the radio, the Wi-Fi driver and the DHCP stack. Runs at most once;
    /// a failure leaves the node without a network for the rest of the wake.
    fn bring_up(&mut self) -> bool {
        if self.controller.is_some() {
            return true;
        }
        let Some(wifi) = self.wifi.take() else {
            return false;
        };

        let radio_init = match esp_radio::init() {
            Ok(radio_init) => radio_init,
            Err(e) => {
                error!("esp_radio init failed: {:?}", e);
                return false;
            }
        };
        let radio_init: &'static _ = Box::leak(Box::new(radio_init));
        let (controller, ifaces) = match esp_radio::wifi::new(radio_init, wifi, Default::default()) {
            Ok(v) => v,
            Err(e) => {
                error!("wifi new() failed: {:?}", e);
                return false;
            }
        };

        let (stack, runner) = embassy_net::new(
            ifaces.sta,
            NetConfig::dhcpv4(Default::default()),
            STACK_RESOURCES.init(StackResources::new()),
            embassy_time::Instant::now().as_ticks(),
        );
        if self.spawner.spawn(embassy_net_task(runner)).is_err() {
            error!("network: could not spawn the embassy-net runner");
            return false;
        }
        let _ = self.stack_slot.set(stack);
        self.controller = Some(controller);
        info!("network: embassy-net stack initialized with DHCP");
        true
    }

    async fn wait_until_up(controller: &WifiController<'static>, stack: Stack<'static>) {
        loop {
            if controller.is_connected().unwrap_or(false) {
                info!("wifi: connected!");
                break;
            }
            Timer::after_millis(LINK_POLL_MS).await;
        }

        info!("network: waiting for DHCP IP assignment...");
        loop {
            if stack.is_config_up()
                && let Some(config) = stack.config_v4()
            {
                info!(
                    "network: DHCP assigned IP: {}, gateway: {}",
                    config.address, config.gateway
                );
                break;
            }
            Timer::after_millis(LINK_POLL_MS).await;
        }
    }
}

impl Connectivity for WifiConnectivity {
    async fn try_connect(&mut self, ssid: &str, password: &str, timeout: Duration) -> bool {
        if ssid.is_empty() {
            warn!("wifi: set WIFI_SSID/WIFI_PASS env vars at build time to enable STA connection");
            return false;
        }
        if !self.bring_up() {
            return false;
        }
        let (Some(controller), Some(stack)) = (self.controller.as_mut(), self.stack_slot.get())
        else {
            return false;
        };
        let stack = *stack;

        let client = ClientConfig::default()
            .with_ssid(ssid.into())
            .with_password(password.into());
        if let Err(e) = controller.set_config(&ModeConfig::Client(client)) {
            error!("wifi set_config failed: {:?}", e);
            return false;
        }
        if let Err(e) = controller.start() {
            error!("wifi start failed: {:?}", e);
            return false;
        }
        info!("wifi: started STA mode");

        if let Err(e) = controller.connect() {
            error!("wifi connect failed: {:?}", e);
            return false;
        }
        info!("wifi: connecting to '{}'...", ssid);

        let budget = embassy_time::Duration::from_millis(u64::from(delay_ms(timeout)));
        with_timeout(budget, Self::wait_until_up(controller, stack))
            .await
            .is_ok()
    }
}

/// [`BrokerConnector`] built on first use, once [`WifiConnectivity`] has put
/// a stack in the shared slot.
pub struct DeferredBroker {
    stack_slot: &'static StackSlot,
    settings: BrokerSettings,
    control_topic: Topic,
    inner: Option<BrokerConnector<'static>>,
}

impl DeferredBroker {
    pub fn new(stack_slot: &'static StackSlot, settings: BrokerSettings, control_topic: Topic) -> Self {
        Self {
            stack_slot,
            settings,
            control_topic,
            inner: None,
        }
    }
}

impl Connector for DeferredBroker {
    type Link<'a>
        = BrokerSession<'a>
    where
        Self: 'a;

    async fn connect(&mut self) -> Result<BrokerSession<'_>, SessionError> {
        if self.inner.is_none() {
            let Some(stack) = self.stack_slot.get().copied() else {
                return Err(SessionError::NetworkDown);
            };
            self.inner = Some(BrokerConnector::new(
                stack,
                self.settings,
                self.control_topic.clone(),
                SESSION_BUFFERS.init(SessionBuffers::new()),
            ));
        }
        match self.inner.as_mut() {
            Some(inner) => inner.connect().await,
            None => Err(SessionError::NetworkDown),
        }
    }
}
