#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use defmt::{error, info};
use embassy_executor::Spawner;
use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use esp_hal::rtc_cntl::{Rtc, reset_reason, wakeup_cause};
use esp_hal::system::Cpu;
use esp_hal::timer::timg::TimerGroup;
use panic_rtt_target as _;
use static_cell::StaticCell;

use soil_sentry::board::{AdcProbe, DeferredBroker, RtcScratch, StackSlot, WifiConnectivity};
use soil_sentry::config::{
    DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT, DEVICE_ID, MQTT_KEEP_ALIVE_SECS,
    MQTT_SESSION_EXPIRY_SECS, NodeConfig, TOPIC_PREFIX, WifiCredentials,
};
use soil_sentry::controller::{Controller, CycleOutcome};
use soil_sentry::indicator::LedIndicator;
use soil_sentry::mqtt::{BrokerSettings, Topics};
use soil_sentry::update::NoUpdates;

// Optional local secrets support
#[cfg(feature = "local_secrets")]
mod secrets;
#[cfg(feature = "local_secrets")]
use secrets::{
    MQTT_BROKER_HOST as LOCAL_MQTT_BROKER_HOST, MQTT_BROKER_PORT as LOCAL_MQTT_BROKER_PORT,
    MQTT_PASSWORD as LOCAL_MQTT_PASSWORD, MQTT_USERNAME as LOCAL_MQTT_USERNAME,
    WIFI_PASS as LOCAL_PASS, WIFI_SSID as LOCAL_SSID,
};

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

// Filled by the first Wi-Fi join of a reporting wake
static STACK_SLOT: StaticCell<StackSlot> = StaticCell::new();

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_defmt!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);
    info!(
        "boot: reset_reason={:?} wakeup_cause={:?}",
        defmt::Debug2Format(&reset_reason(Cpu::ProCpu)),
        defmt::Debug2Format(&wakeup_cause())
    );

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_interrupt =
        esp_hal::interrupt::software::SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_interrupt.software_interrupt0);

    let mut rtc = Rtc::new(peripherals.LPWR);

    // Credentials source options:
    // - Preferred: create a local, Git-ignored `src/bin/secrets.rs` with WIFI_SSID, WIFI_PASS,
    //   MQTT_BROKER_HOST, MQTT_BROKER_PORT, MQTT_USERNAME and MQTT_PASSWORD,
    //   and build with `--features local_secrets`.
    // - Fallback: compile-time env vars `WIFI_SSID` / `WIFI_PASS`, default broker, no auth.
    #[cfg(feature = "local_secrets")]
    let (ssid, pass) = (LOCAL_SSID, LOCAL_PASS);
    #[cfg(not(feature = "local_secrets"))]
    let (ssid, pass) = (
        option_env!("WIFI_SSID").unwrap_or(""),
        option_env!("WIFI_PASS").unwrap_or(""),
    );

    #[cfg(feature = "local_secrets")]
    let (broker_host, broker_port, mqtt_username, mqtt_password) = (
        LOCAL_MQTT_BROKER_HOST,
        LOCAL_MQTT_BROKER_PORT,
        LOCAL_MQTT_USERNAME,
        LOCAL_MQTT_PASSWORD,
    );
    #[cfg(not(feature = "local_secrets"))]
    let (broker_host, broker_port, mqtt_username, mqtt_password) =
        (DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT, "", "");

    // Common-anode RGB LED on D1/D3/D2, high = off
    let indicator = LedIndicator::new(
        Output::new(peripherals.GPIO1, Level::High, OutputConfig::default()),
        Output::new(peripherals.GPIO21, Level::High, OutputConfig::default()),
        Output::new(peripherals.GPIO2, Level::High, OutputConfig::default()),
    );

    // Set up ADC1 on pin A0 (XIAO ESP32-C6: A0 = GPIO0). Power the sensor from 3V3, not 5V.
    let mut adc1_cfg = AdcConfig::new();
    let a0 = adc1_cfg.enable_pin(peripherals.GPIO0, Attenuation::_6dB);
    let probe = AdcProbe::new(Adc::new(peripherals.ADC1, adc1_cfg), a0);

    let Some(scratch) = RtcScratch::take() else {
        error!("boot: RTC scratch already claimed");
        esp_hal::system::software_reset();
    };

    let topics = Topics::new(TOPIC_PREFIX, DEVICE_ID);
    let settings = BrokerSettings {
        host: broker_host,
        port: broker_port,
        client_id: DEVICE_ID,
        username: mqtt_username,
        password: mqtt_password,
        keep_alive_secs: MQTT_KEEP_ALIVE_SECS,
        session_expiry_secs: MQTT_SESSION_EXPIRY_SECS,
    };
    info!(
        "mqtt: broker {}:{}, client ID {}",
        settings.host, settings.port, settings.client_id
    );
    // The radio stays off unless this wake reports
    let stack_slot: &'static StackSlot = STACK_SLOT.init(StackSlot::new());
    let mut connector = DeferredBroker::new(stack_slot, settings, topics.control.clone());
    let mut network = WifiConnectivity::new(spawner, peripherals.WIFI, stack_slot);

    let node = NodeConfig::new(WifiCredentials {
        ssid,
        password: pass,
    });
    let mut controller = Controller::new(
        node,
        topics,
        scratch,
        probe,
        indicator,
        NoUpdates,
        embassy_time::Delay,
    );

    match controller.run(&mut network, &mut connector).await {
        CycleOutcome::Sleep(period) => {
            let timer = TimerWakeupSource::new(period);
            rtc.sleep_deep(&[&timer])
        }
        CycleOutcome::Restart => esp_hal::system::software_reset(),
    }
}
