//! Zone indicator: one LED per zone on a common-anode RGB LED.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;

use crate::zone::Zone;

// Common-anode RGB LED: a low GPIO lights the segment
pub const LED_ACTIVE_LOW: bool = true;

/// Output showing the current zone.
pub trait Indicator {
    /// Light the zone and switch the others off.
    fn show(&mut self, zone: Zone);
    /// Everything off.
    fn clear(&mut self);
}

#[inline]
fn set_with_polarity<P: OutputPin>(pin: &mut P, on: bool) {
    let high = on != LED_ACTIVE_LOW;
    // GPIO writes on the ESP32 are infallible; other pins just stay as they were
    let _ = if high { pin.set_high() } else { pin.set_low() };
}

/// Red = too dry, blue = too wet, green = normal.
pub struct LedIndicator<D, W, N> {
    too_dry: D,
    too_wet: W,
    normal: N,
}

impl<D: OutputPin, W: OutputPin, N: OutputPin> LedIndicator<D, W, N> {
    /// Takes the pins and switches all of them off.
    pub fn new(too_dry: D, too_wet: W, normal: N) -> Self {
        let mut indicator = Self {
            too_dry,
            too_wet,
            normal,
        };
        indicator.clear();
        indicator
    }
}

impl<D: OutputPin, W: OutputPin, N: OutputPin> Indicator for LedIndicator<D, W, N> {
    fn show(&mut self, zone: Zone) {
        set_with_polarity(&mut self.too_dry, zone == Zone::TooDry);
        set_with_polarity(&mut self.too_wet, zone == Zone::TooWet);
        set_with_polarity(&mut self.normal, zone == Zone::Normal);
    }

    fn clear(&mut self) {
        set_with_polarity(&mut self.too_dry, false);
        set_with_polarity(&mut self.too_wet, false);
        set_with_polarity(&mut self.normal, false);
    }
}

/// Light each zone for `step_ms`, with `step_ms` dark in between.
pub async fn self_test<I: Indicator, D: DelayNs>(indicator: &mut I, delay: &mut D, step_ms: u32) {
    for zone in Zone::SEQUENCE {
        indicator.show(zone);
        delay.delay_ms(step_ms).await;
        indicator.clear();
        delay.delay_ms(step_ms).await;
    }
}
