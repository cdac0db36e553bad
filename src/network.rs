//! Link-layer connectivity collaborator.

use core::time::Duration;

#[allow(async_fn_in_trait)]
pub trait Connectivity {
    /// Join the network, giving up after `timeout`. A `false` here is fatal
    /// for the wake: the controller answers it with a restart.
    async fn try_connect(&mut self, ssid: &str, password: &str, timeout: Duration) -> bool;
}
