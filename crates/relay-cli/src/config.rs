use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use relay_fc::FcConfig;
use relay_nav::NavConfig;
use relay_uplink::{doctor as uplink_doctor, CoordinatorConfig};

pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub coordinator: CoordinatorConfig,
    pub mavlink: FcConfig,
    pub nav: NavConfig,
    pub timing: TimingCfg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingCfg {
    pub telemetry_hz: f64,
    pub command_hz: f64,
    /// Pause after a failed telemetry send.
    pub send_failure_cooldown_s: f64,
}

impl Default for TimingCfg {
    fn default() -> Self {
        Self { telemetry_hz: 5.0, command_hz: 1.0, send_failure_cooldown_s: 1.0 }
    }
}

impl TimingCfg {
    pub fn send_interval(&self) -> Duration {
        interval_from_hz(self.telemetry_hz, DEFAULT_SEND_INTERVAL)
    }

    pub fn poll_interval(&self) -> Duration {
        interval_from_hz(self.command_hz, DEFAULT_POLL_INTERVAL)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.send_failure_cooldown_s).unwrap_or(Duration::from_secs(1))
    }
}

/// Minimum spacing between calls for a rate in Hz. Rates that would divide
/// by zero or spin fall back to `fallback`.
pub fn interval_from_hz(hz: f64, fallback: Duration) -> Duration {
    if !hz.is_finite() || hz <= 0.0 {
        return fallback;
    }
    match Duration::try_from_secs_f64(1.0 / hz) {
        Ok(d) if !d.is_zero() => d,
        _ => fallback,
    }
}

/// Defaults, then the optional TOML file, then the process environment.
pub fn load(path: Option<&str>) -> Result<GatewayConfig> {
    let mut cfg = match path {
        Some(p) => {
            let s = std::fs::read_to_string(p).with_context(|| format!("read config {}", p))?;
            toml::from_str(&s).context("parse config toml")?
        }
        None => GatewayConfig::default(),
    };
    apply_env(&mut cfg, |k| std::env::var(k).ok())?;
    Ok(cfg)
}

/// Overrides fields from environment-style variables read through `get`.
/// Empty values count as unset.
pub fn apply_env<F>(cfg: &mut GatewayConfig, get: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let c = &mut cfg.coordinator;
    if let Some(v) = var("ATC_SERVER_URL") {
        c.server_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = var("ATC_DRONE_ID") {
        c.drone_id = v;
    }
    set_opt(&mut c.owner_id, var("ATC_OWNER_ID"));
    set_opt(&mut c.registration_token, var("ATC_REGISTRATION_TOKEN"));
    set_opt(&mut c.session_token, var("ATC_SESSION_TOKEN"));
    set_opt(&mut c.ca_cert, var("ATC_CA_CERT"));
    if let Some(v) = var("ATC_TLS_INSECURE") {
        c.tls_insecure = parse_bool("ATC_TLS_INSECURE", &v)?;
    }
    if let Some(v) = var("ATC_ENV") {
        c.environment = v;
    }
    parse_into(&mut c.http_timeout_s, "ATC_HTTP_TIMEOUT_S", var("ATC_HTTP_TIMEOUT_S"))?;

    let m = &mut cfg.mavlink;
    if let Some(v) = var("MAVLINK_ENDPOINT") {
        m.endpoint = v;
    }
    parse_into(&mut m.heartbeat_timeout_s, "MAVLINK_HEARTBEAT_TIMEOUT_S", var("MAVLINK_HEARTBEAT_TIMEOUT_S"))?;
    parse_into(&mut m.sys_id, "MAVLINK_SYS_ID", var("MAVLINK_SYS_ID"))?;
    parse_into(&mut m.comp_id, "MAVLINK_COMP_ID", var("MAVLINK_COMP_ID"))?;

    parse_into(&mut cfg.nav.arrival_threshold_m, "ATC_ARRIVAL_THRESHOLD_M", var("ATC_ARRIVAL_THRESHOLD_M"))?;
    parse_into(&mut cfg.timing.telemetry_hz, "ATC_TELEMETRY_HZ", var("ATC_TELEMETRY_HZ"))?;
    parse_into(&mut cfg.timing.command_hz, "ATC_COMMAND_HZ", var("ATC_COMMAND_HZ"))?;
    Ok(())
}

fn set_opt(slot: &mut Option<String>, v: Option<String>) {
    if v.is_some() {
        *slot = v;
    }
}

fn parse_into<T>(slot: &mut T, key: &str, v: Option<String>) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(v) = v {
        *slot = v.parse().with_context(|| format!("{}={:?}", key, v))?;
    }
    Ok(())
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{}={:?} is not a boolean", key, other),
    }
}

/// Startup/doctor preflight. Every failure here is a configuration error.
pub fn validate(cfg: &GatewayConfig) -> Result<()> {
    uplink_doctor::check_config(&cfg.coordinator)?;
    relay_fc::mav::connection_url(&cfg.mavlink.endpoint).context("mavlink.endpoint")?;
    let t = cfg.nav.arrival_threshold_m;
    anyhow::ensure!(t.is_finite() && t > 0.0, "nav.arrival_threshold_m must be > 0 (got {})", t);
    anyhow::ensure!(cfg.mavlink.heartbeat_timeout_s > 0, "mavlink.heartbeat_timeout_s must be > 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.coordinator.server_url, "http://localhost:3000");
        assert_eq!(cfg.coordinator.drone_id, "DRONE0001");
        assert_eq!(cfg.mavlink.endpoint, "udp:0.0.0.0:14550");
        assert_eq!(cfg.nav.arrival_threshold_m, 5.0);
        assert_eq!(cfg.timing.send_interval(), Duration::from_millis(200));
        assert_eq!(cfg.timing.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn rate_fallbacks() {
        let d = Duration::from_secs(7);
        assert_eq!(interval_from_hz(0.0, d), d);
        assert_eq!(interval_from_hz(-2.0, d), d);
        assert_eq!(interval_from_hz(f64::NAN, d), d);
        assert_eq!(interval_from_hz(f64::INFINITY, d), d);
        assert_eq!(interval_from_hz(4.0, d), Duration::from_millis(250));
    }

    #[test]
    fn toml_sections_override_defaults() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            [coordinator]
            server_url = "https://atc.example"
            registration_token = "reg"

            [mavlink]
            endpoint = "tcp:127.0.0.1:5760"

            [timing]
            telemetry_hz = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.coordinator.server_url, "https://atc.example");
        assert_eq!(cfg.coordinator.drone_id, "DRONE0001");
        assert_eq!(cfg.mavlink.endpoint, "tcp:127.0.0.1:5760");
        assert_eq!(cfg.mavlink.sys_id, 255);
        assert_eq!(cfg.timing.send_interval(), Duration::from_millis(500));
        assert_eq!(cfg.timing.command_hz, 1.0);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = GatewayConfig::default();
        cfg.coordinator.owner_id = Some("from-file".into());
        apply_env(
            &mut cfg,
            env(&[
                ("ATC_SERVER_URL", "https://atc.example/"),
                ("ATC_DRONE_ID", " D42 "),
                ("ATC_OWNER_ID", ""),
                ("ATC_SESSION_TOKEN", "sess"),
                ("ATC_TLS_INSECURE", "yes"),
                ("ATC_TELEMETRY_HZ", "10"),
                ("MAVLINK_SYS_ID", "254"),
                ("ATC_ARRIVAL_THRESHOLD_M", "2.5"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.coordinator.server_url, "https://atc.example");
        assert_eq!(cfg.coordinator.drone_id, "D42");
        assert_eq!(cfg.coordinator.owner_id.as_deref(), Some("from-file"));
        assert_eq!(cfg.coordinator.session_token.as_deref(), Some("sess"));
        assert!(cfg.coordinator.tls_insecure);
        assert_eq!(cfg.timing.telemetry_hz, 10.0);
        assert_eq!(cfg.mavlink.sys_id, 254);
        assert_eq!(cfg.nav.arrival_threshold_m, 2.5);
    }

    #[test]
    fn unparsable_env_value_is_an_error() {
        let mut cfg = GatewayConfig::default();
        assert!(apply_env(&mut cfg, env(&[("MAVLINK_SYS_ID", "300")])).is_err());
        assert!(apply_env(&mut cfg, env(&[("ATC_TLS_INSECURE", "maybe")])).is_err());
    }

    #[test]
    fn validate_requires_credentials_and_sane_threshold() {
        let mut cfg = GatewayConfig::default();
        assert!(validate(&cfg).is_err());

        cfg.coordinator.registration_token = Some("reg".into());
        validate(&cfg).unwrap();

        cfg.nav.arrival_threshold_m = 0.0;
        assert!(validate(&cfg).is_err());
        cfg.nav.arrival_threshold_m = 5.0;

        cfg.mavlink.endpoint = "carrier-pigeon:1".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn insecure_tls_refused_in_production() {
        let mut cfg = GatewayConfig::default();
        apply_env(
            &mut cfg,
            env(&[("ATC_SESSION_TOKEN", "s"), ("ATC_TLS_INSECURE", "1"), ("ATC_ENV", "production")]),
        )
        .unwrap();
        assert!(validate(&cfg).is_err());
    }
}
