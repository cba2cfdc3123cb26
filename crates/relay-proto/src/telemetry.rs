use serde::{Deserialize, Serialize};

/// Last-known vehicle facts, filled in by the MAVLink decoders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryState {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub altitude_m: Option<f64>,
    pub heading_deg: Option<f64>,
    pub speed_mps: Option<f64>,
}

impl TelemetryState {
    /// Position is complete; nothing downstream acts on telemetry before this.
    pub fn ready(&self) -> bool {
        self.lat.is_some() && self.lon.is_some() && self.altitude_m.is_some()
    }

    pub fn position(&self) -> Option<(f64, f64, f64)> {
        Some((self.lat?, self.lon?, self.altitude_m?))
    }
}

/// Body of `POST /v1/telemetry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub drone_id: String,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub heading_deg: f64,
    pub speed_mps: f64,
    /// RFC3339, UTC
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}
