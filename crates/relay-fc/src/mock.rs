//! In-memory `VehicleLink` for host tests.

use anyhow::Result;
use mavlink::common::{MavMessage, HEARTBEAT_DATA};
use mavlink::MavHeader;
use std::collections::VecDeque;
use std::time::Duration;

use crate::mav::is_vehicle;
use crate::modes::{Firmware, ModeTable};
use crate::VehicleLink;

pub struct MockLink {
    table: ModeTable,
    pub inbound: VecDeque<(MavHeader, MavMessage)>,
    /// Every mode actually commanded, in order.
    pub commanded: Vec<String>,
    pub setpoints: Vec<(f64, f64, f64)>,
    pub fail_sends: bool,
}

impl MockLink {
    /// Vehicle advertising the full table of `firmware`.
    pub fn new(firmware: Firmware) -> Self {
        Self {
            table: ModeTable::for_firmware(firmware),
            inbound: VecDeque::new(),
            commanded: Vec::new(),
            setpoints: Vec::new(),
            fail_sends: false,
        }
    }

    /// ArduCopter vehicle that only accepts the listed modes.
    pub fn with_modes(modes: &[&str]) -> Self {
        let mut link = Self::new(Firmware::ArduCopter);
        let keep: Vec<String> = modes.iter().map(|m| m.to_ascii_uppercase()).collect();
        link.table.retain(|n| keep.iter().any(|k| k == n));
        link
    }

    pub fn push(&mut self, msg: MavMessage) {
        let hdr = MavHeader { system_id: 1, component_id: 1, sequence: 0 };
        self.inbound.push_back((hdr, msg));
    }

    pub fn last_mode(&self) -> Option<&str> {
        self.commanded.last().map(String::as_str)
    }
}

impl VehicleLink for MockLink {
    async fn next_message(&mut self, _timeout: Duration) -> Option<(MavHeader, MavMessage)> {
        self.inbound.pop_front()
    }

    fn observe_heartbeat(&mut self, _hdr: &MavHeader, hb: &HEARTBEAT_DATA) -> Option<String> {
        if !is_vehicle(hb) {
            return None;
        }
        self.table.name_of(hb.custom_mode).map(str::to_string)
    }

    fn set_mode(&mut self, candidates: &[&str]) -> Result<Option<String>> {
        anyhow::ensure!(!self.fail_sends, "mock link down");
        let hit = self.table.resolve(candidates).map(|(name, _)| name);
        if let Some(m) = &hit {
            self.commanded.push(m.clone());
        }
        Ok(hit)
    }

    fn send_position_target(&mut self, lat: f64, lon: f64, alt_m: f64) -> Result<()> {
        anyhow::ensure!(!self.fail_sends, "mock link down");
        self.setpoints.push((lat, lon, alt_m));
        Ok(())
    }
}
