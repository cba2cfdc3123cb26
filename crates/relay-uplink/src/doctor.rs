use crate::error::CoordinatorError;
use crate::CoordinatorConfig;

fn ensure(cond: bool, msg: impl Into<String>) -> Result<(), CoordinatorError> {
    if cond {
        Ok(())
    } else {
        Err(CoordinatorError::Configuration(msg.into()))
    }
}

pub fn is_production(environment: &str) -> bool {
    matches!(environment.trim().to_ascii_lowercase().as_str(), "production" | "prod")
}

pub fn check_config(cfg: &CoordinatorConfig) -> Result<(), CoordinatorError> {
    let url = cfg.server_url.trim();
    ensure(
        url.starts_with("http://") || url.starts_with("https://"),
        format!("coordinator.server_url must be http(s): {}", url),
    )?;
    ensure(!cfg.drone_id.trim().is_empty(), "coordinator.drone_id is empty")?;
    ensure(
        cfg.session_token.is_some() || cfg.registration_token.is_some(),
        "set ATC_SESSION_TOKEN or ATC_REGISTRATION_TOKEN",
    )?;
    ensure(
        cfg.http_timeout_s.is_finite() && cfg.http_timeout_s > 0.0,
        "coordinator.http_timeout_s must be > 0",
    )?;
    ensure(
        !(cfg.tls_insecure && is_production(&cfg.environment)),
        format!("refusing insecure TLS in environment '{}'", cfg.environment),
    )?;
    Ok(())
}
