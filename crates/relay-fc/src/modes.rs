//! Flight mode tables.
//!
//! The live table is picked from the vehicle's heartbeat (autopilot +
//! airframe type). Names are stored uppercase; lookups normalize the
//! candidate before comparing.

use mavlink::common::{MavAutopilot, MavType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomMode {
    /// ArduPilot: plain mode number.
    ArduPilot(u32),
    /// PX4: main mode in byte 2, sub mode in byte 3.
    Px4 { main: u8, sub: u8 },
}

impl CustomMode {
    pub fn to_custom_mode(self) -> u32 {
        match self {
            CustomMode::ArduPilot(n) => n,
            CustomMode::Px4 { main, sub } => (u32::from(main) << 16) | (u32::from(sub) << 24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    ArduCopter,
    ArduPlane,
    ArduRover,
    ArduSub,
    Px4,
}

impl Firmware {
    pub fn detect(autopilot: MavAutopilot, mavtype: MavType) -> Self {
        if autopilot == MavAutopilot::MAV_AUTOPILOT_PX4 {
            return Firmware::Px4;
        }
        match mavtype {
            MavType::MAV_TYPE_FIXED_WING => Firmware::ArduPlane,
            MavType::MAV_TYPE_GROUND_ROVER | MavType::MAV_TYPE_SURFACE_BOAT => Firmware::ArduRover,
            MavType::MAV_TYPE_SUBMARINE => Firmware::ArduSub,
            _ => Firmware::ArduCopter,
        }
    }
}

const PX4_AUTO: u8 = 4;

const COPTER: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("LOITER", 5),
    ("RTL", 6),
    ("CIRCLE", 7),
    ("LAND", 9),
    ("DRIFT", 11),
    ("SPORT", 13),
    ("FLIP", 14),
    ("AUTOTUNE", 15),
    ("POSHOLD", 16),
    ("BRAKE", 17),
    ("THROW", 18),
    ("AVOID_ADSB", 19),
    ("GUIDED_NOGPS", 20),
    ("SMART_RTL", 21),
    ("FLOWHOLD", 22),
    ("FOLLOW", 23),
    ("ZIGZAG", 24),
    ("SYSTEMID", 25),
    ("AUTOROTATE", 26),
    ("AUTO_RTL", 27),
];

const PLANE: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("CIRCLE", 1),
    ("STABILIZE", 2),
    ("TRAINING", 3),
    ("ACRO", 4),
    ("FBWA", 5),
    ("FBWB", 6),
    ("CRUISE", 7),
    ("AUTOTUNE", 8),
    ("AUTO", 10),
    ("RTL", 11),
    ("LOITER", 12),
    ("TAKEOFF", 13),
    ("AVOID_ADSB", 14),
    ("GUIDED", 15),
    ("QSTABILIZE", 17),
    ("QHOVER", 18),
    ("QLOITER", 19),
    ("QLAND", 20),
    ("QRTL", 21),
    ("QAUTOTUNE", 22),
    ("QACRO", 23),
    ("THERMAL", 24),
];

const ROVER: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("ACRO", 1),
    ("STEERING", 3),
    ("HOLD", 4),
    ("LOITER", 5),
    ("FOLLOW", 6),
    ("SIMPLE", 7),
    ("AUTO", 10),
    ("RTL", 11),
    ("SMART_RTL", 12),
    ("GUIDED", 15),
];

const SUB: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("CIRCLE", 7),
    ("SURFACE", 9),
    ("POSHOLD", 16),
    ("MANUAL", 19),
];

// (name, main, sub)
const PX4: &[(&str, u8, u8)] = &[
    ("MANUAL", 1, 0),
    ("ALTCTL", 2, 0),
    ("POSCTL", 3, 0),
    ("READY", PX4_AUTO, 1),
    ("TAKEOFF", PX4_AUTO, 2),
    ("LOITER", PX4_AUTO, 3),
    ("HOLD", PX4_AUTO, 3),
    ("MISSION", PX4_AUTO, 4),
    ("AUTO", PX4_AUTO, 4),
    ("RTL", PX4_AUTO, 5),
    ("LAND", PX4_AUTO, 6),
    ("RTGS", PX4_AUTO, 7),
    ("FOLLOWME", PX4_AUTO, 8),
    ("PRECLAND", PX4_AUTO, 9),
    ("ACRO", 5, 0),
    ("OFFBOARD", 6, 0),
    ("STABILIZED", 7, 0),
    ("RATTITUDE", 8, 0),
];

#[derive(Debug, Clone)]
pub struct ModeTable {
    firmware: Firmware,
    modes: Vec<(String, CustomMode)>,
}

impl ModeTable {
    pub fn for_firmware(firmware: Firmware) -> Self {
        let ardu = |t: &[(&str, u32)]| {
            t.iter()
                .map(|(n, m)| (n.to_string(), CustomMode::ArduPilot(*m)))
                .collect::<Vec<_>>()
        };
        let modes = match firmware {
            Firmware::ArduCopter => ardu(COPTER),
            Firmware::ArduPlane => ardu(PLANE),
            Firmware::ArduRover => ardu(ROVER),
            Firmware::ArduSub => ardu(SUB),
            Firmware::Px4 => PX4
                .iter()
                .map(|(n, main, sub)| (n.to_string(), CustomMode::Px4 { main: *main, sub: *sub }))
                .collect(),
        };
        Self { firmware, modes }
    }

    pub fn firmware(&self) -> Firmware {
        self.firmware
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modes.iter().map(|(n, _)| n.as_str())
    }

    pub fn get(&self, name: &str) -> Option<CustomMode> {
        let key = name.trim().to_ascii_uppercase();
        self.modes.iter().find(|(n, _)| *n == key).map(|(_, m)| *m)
    }

    /// First candidate (in preference order) that exists in the table.
    pub fn resolve(&self, candidates: &[&str]) -> Option<(String, CustomMode)> {
        candidates.iter().find_map(|c| {
            let key = c.trim().to_ascii_uppercase();
            self.get(&key).map(|m| (key, m))
        })
    }

    /// Reverse lookup of a heartbeat `custom_mode`.
    pub fn name_of(&self, custom_mode: u32) -> Option<&str> {
        let exact = self.modes.iter().find(|(_, m)| m.to_custom_mode() == custom_mode);
        let hit = match (exact, self.firmware) {
            (Some(hit), _) => Some(hit),
            // PX4 only defines sub modes under AUTO; ignore stray sub bytes elsewhere
            (None, Firmware::Px4) => {
                let main = ((custom_mode >> 16) & 0xff) as u8;
                self.modes.iter().find(|(_, m)| {
                    matches!(*m, CustomMode::Px4 { main: mm, .. } if mm == main && main != PX4_AUTO)
                })
            }
            (None, _) => None,
        };
        hit.map(|(n, _)| n.as_str())
    }

    /// Drops every mode `keep` rejects.
    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.modes.retain(|(n, _)| keep(n));
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self::for_firmware(Firmware::ArduCopter)
    }
}
