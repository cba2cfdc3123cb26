pub mod geo;
pub mod machine;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    /// Horizontal distance at which a waypoint counts as reached.
    pub arrival_threshold_m: f64,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self { arrival_threshold_m: 5.0 }
    }
}
