//! Duty-cycle core for a battery-powered soil moisture node.
//!
//! Every wake the [`controller::Controller`] loads the checksum-guarded record
//! kept in RTC scratch memory, samples the probe, and decides whether the new
//! reading is worth a network round-trip. Quiet cycles go straight back to
//! deep sleep; reporting cycles connect, publish, and hold a short awake
//! session in which remote commands can change thresholds or keep the node
//! awake.
//!
//! Everything hardware-specific lives behind small traits so the decision
//! logic runs (and is tested) on the host. The `firmware` feature adds the
//! esp-hal adapters used by the `soil-sentry` binary.

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "firmware")]
extern crate alloc;

#[macro_use]
mod fmt;

pub mod command;
pub mod config;
pub mod controller;
pub mod cycle_state;
pub mod error;
pub mod event;
pub mod indicator;
pub mod mqtt;
pub mod network;
pub mod sensor;
pub mod update;
pub mod zone;

#[cfg(feature = "firmware")]
pub mod board;
