//! Results of one non-blocking poll of the remote link or update channel.

use crate::command::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    NoEvent,
    CommandReceived(Command),
    /// Firmware install progress in percent
    UpdateProgress(u8),
}
