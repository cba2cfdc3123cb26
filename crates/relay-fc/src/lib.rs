pub mod mav;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod modes;
pub mod state;

use anyhow::Result;
use mavlink::common::{MavMessage, HEARTBEAT_DATA};
use mavlink::MavHeader;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    /// Link descriptor, e.g. `udp:0.0.0.0:14550`, `tcp:127.0.0.1:5760`,
    /// `serial:/dev/ttyACM0:57600`.
    pub endpoint: String,

    /// How long startup waits for the first vehicle heartbeat.
    pub heartbeat_timeout_s: u64,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            endpoint: "udp:0.0.0.0:14550".into(),
            heartbeat_timeout_s: 30,
            sys_id: 255,
            comp_id: 190,
        }
    }
}

/// The vehicle side of the gateway.
///
/// `FcLink` is the MAVLink implementation; the command machine and the
/// gateway loop only see this trait.
#[allow(async_fn_in_trait)]
pub trait VehicleLink {
    /// Waits up to `timeout` for the next inbound message. `None` on timeout.
    async fn next_message(&mut self, timeout: Duration) -> Option<(MavHeader, MavMessage)>;

    /// Mirrors a heartbeat into the link (target ids, mode table) and returns
    /// the vehicle's current mode name if the heartbeat came from the vehicle.
    fn observe_heartbeat(&mut self, hdr: &MavHeader, hb: &HEARTBEAT_DATA) -> Option<String>;

    /// Commands the first candidate present in the vehicle's mode table.
    /// Returns the matched name, or `None` if no candidate is supported.
    fn set_mode(&mut self, candidates: &[&str]) -> Result<Option<String>>;

    /// Position-only setpoint (velocity, acceleration and yaw ignored).
    fn send_position_target(&mut self, lat: f64, lon: f64, alt_m: f64) -> Result<()>;
}
