//! Firmware update channel seen from the duty cycle.
//!
//! Image transfer is someone else's job; the controller only services the
//! channel once per awake-loop iteration and refuses to sleep while an
//! install is running.

use crate::event::Event;

pub trait UpdateChannel {
    /// One non-blocking poll. Returns [`Event::UpdateProgress`] while an
    /// image is being received.
    fn service_once(&mut self) -> Event;

    fn install_in_progress(&self) -> bool;
}

/// Channel for builds without an update transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoUpdates;

impl UpdateChannel for NoUpdates {
    fn service_once(&mut self) -> Event {
        Event::NoEvent
    }

    fn install_in_progress(&self) -> bool {
        false
    }
}
