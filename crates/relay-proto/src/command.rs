use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
}

/// Directive payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    /// Hold position (loiter) for `duration_secs`.
    Hold {
        #[serde(default)]
        duration_secs: f64,
    },
    Resume,
    AltitudeChange { target_altitude_m: f64 },
    Reroute {
        #[serde(default)]
        waypoints: Vec<Waypoint>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

impl CommandType {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandType::Hold { .. } => "HOLD",
            CommandType::Resume => "RESUME",
            CommandType::AltitudeChange { .. } => "ALTITUDE_CHANGE",
            CommandType::Reroute { .. } => "REROUTE",
            CommandType::Unsupported => "UNSUPPORTED",
        }
    }
}

/// Envelope returned by `GET /v1/commands/next`.
///
/// `command_type` is kept raw so a directive that fails to parse still
/// reaches the dispatcher with its id and advertised kind.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub command_type: serde_json::Value,
}

impl Command {
    /// Command id, if present and non-blank.
    pub fn id(&self) -> Option<&str> {
        self.command_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// `type` tag as sent by the coordinator.
    pub fn raw_kind(&self) -> &str {
        self.command_type
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing>")
    }

    pub fn directive(&self) -> Result<CommandType, serde_json::Error> {
        CommandType::deserialize(&self.command_type)
    }
}
