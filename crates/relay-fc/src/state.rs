use mavlink::common::{GLOBAL_POSITION_INT_DATA, VFR_HUD_DATA};
use tracing::debug;

/// GLOBAL_POSITION_INT.hdg value meaning "unknown".
pub const HEADING_UNKNOWN: u16 = u16::MAX;

pub use relay_proto::telemetry::TelemetryState;

/// lat/lon in degE7, alt in mm, hdg in cdeg, vx/vy in cm/s.
pub fn apply_global_position_int(state: &mut TelemetryState, m: &GLOBAL_POSITION_INT_DATA) {
    let lat = f64::from(m.lat) / 1e7;
    let lon = f64::from(m.lon) / 1e7;
    let alt = f64::from(m.alt) / 1000.0;
    if !(lat.is_finite() && lon.is_finite() && alt.is_finite()) {
        debug!("fc: GLOBAL_POSITION_INT with non-finite position ignored");
        return;
    }
    state.lat = Some(lat);
    state.lon = Some(lon);
    state.altitude_m = Some(alt);

    if m.hdg != HEADING_UNKNOWN {
        state.heading_deg = Some(f64::from(m.hdg) / 100.0);
    }

    let vx = f64::from(m.vx);
    let vy = f64::from(m.vy);
    let speed = (vx * vx + vy * vy).sqrt() / 100.0;
    if speed.is_finite() {
        state.speed_mps = Some(speed);
    }
}

/// Overwrites heading/groundspeed (last writer wins).
pub fn apply_vfr_hud(state: &mut TelemetryState, m: &VFR_HUD_DATA) {
    state.heading_deg = Some(f64::from(m.heading));
    if m.groundspeed.is_finite() {
        state.speed_mps = Some(f64::from(m.groundspeed));
    } else {
        debug!("fc: VFR_HUD groundspeed not finite, ignored");
    }
}
