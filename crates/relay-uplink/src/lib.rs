pub mod doctor;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod transport;

use relay_proto::command::Command;
use relay_proto::session::{AckRequest, RegisterRequest, RegisterResponse};
use relay_proto::telemetry::{TelemetryReport, TelemetryState};
use serde::Deserialize;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub use error::CoordinatorError;
use transport::{ApiRequest, ApiResponse, Auth, HttpTransport, Method, ReqwestTransport};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub server_url: String,
    pub drone_id: String,
    pub owner_id: Option<String>,
    /// Pre-shared credential used to (re-)register for a session.
    pub registration_token: Option<String>,
    /// Optional session obtained out of band.
    pub session_token: Option<String>,
    pub http_timeout_s: f64,
    /// Skip certificate verification. Refused in production.
    pub tls_insecure: bool,
    /// Extra PEM root for private coordinators.
    pub ca_cert: Option<String>,
    /// Deployment tag, e.g. `dev`, `staging`, `production`.
    pub environment: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".into(),
            drone_id: "DRONE0001".into(),
            owner_id: None,
            registration_token: None,
            session_token: None,
            http_timeout_s: 5.0,
            tls_insecure: false,
            ca_cert: None,
            environment: "dev".into(),
        }
    }
}

/// Bearer credential issued by the coordinator.
#[derive(Clone, PartialEq, Eq)]
pub struct Session(String);

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Session(<redacted>)")
    }
}

const OK_TELEMETRY: &[u16] = &[200, 202];
const OK_POLL: &[u16] = &[200, 204];
const OK_ACK: &[u16] = &[200, 201];

pub struct CoordinatorClient<T = ReqwestTransport> {
    transport: T,
    drone_id: String,
    owner_id: Option<String>,
    registration_token: Option<String>,
    session: Option<Session>,
}

impl CoordinatorClient<ReqwestTransport> {
    pub fn new(cfg: &CoordinatorConfig) -> Result<Self, CoordinatorError> {
        doctor::check_config(cfg)?;
        if cfg.tls_insecure {
            warn!("coordinator: TLS certificate verification DISABLED");
        }
        Ok(Self::with_transport(cfg, ReqwestTransport::new(cfg)?))
    }
}

impl<T: HttpTransport> CoordinatorClient<T> {
    pub fn with_transport(cfg: &CoordinatorConfig, transport: T) -> Self {
        Self {
            transport,
            drone_id: cfg.drone_id.clone(),
            owner_id: cfg.owner_id.clone(),
            registration_token: cfg.registration_token.clone(),
            session: cfg.session_token.clone().map(Session),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Held session, or a fresh one from registration.
    pub async fn ensure_session(&mut self) -> Result<Session, CoordinatorError> {
        if let Some(s) = &self.session {
            return Ok(s.clone());
        }
        let Some(reg) = self.registration_token.clone() else {
            return Err(CoordinatorError::Configuration(
                "no session and no registration token configured".into(),
            ));
        };

        let body = RegisterRequest { drone_id: self.drone_id.clone(), owner_id: self.owner_id.clone() };
        let req = ApiRequest {
            method: Method::Post,
            path: "/v1/drones/register",
            query: Vec::new(),
            auth: Auth::Registration(reg),
            body: Some(to_json(&body)?),
        };
        let resp = self.transport.execute(&req).await?;
        if resp.status != 201 {
            return Err(CoordinatorError::upstream("register", resp.status, &resp.body));
        }

        let parsed: RegisterResponse = serde_json::from_str(&resp.body)
            .map_err(|e| CoordinatorError::InvalidResponse(format!("register: {}", e)))?;
        let token = parsed
            .session_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CoordinatorError::InvalidResponse("register response missing session_token".into()))?;

        info!("coordinator: registered drone_id={}", self.drone_id);
        let session = Session(token);
        self.session = Some(session.clone());
        Ok(session)
    }

    pub async fn send_telemetry(&mut self, state: &TelemetryState) -> Result<(), CoordinatorError> {
        let Some((lat, lon, altitude_m)) = state.position() else {
            return Err(CoordinatorError::NotReady);
        };
        let report = TelemetryReport {
            drone_id: self.drone_id.clone(),
            lat,
            lon,
            altitude_m,
            heading_deg: state.heading_deg.unwrap_or(0.0),
            speed_mps: state.speed_mps.unwrap_or(0.0),
            timestamp: now_rfc3339(),
            owner_id: self.owner_id.clone(),
        };
        let body = to_json(&report)?;

        self.authed("telemetry", OK_TELEMETRY, |auth| ApiRequest {
            method: Method::Post,
            path: "/v1/telemetry",
            query: Vec::new(),
            auth,
            body: Some(body.clone()),
        })
        .await?;
        Ok(())
    }

    /// At most one pending directive for this vehicle.
    pub async fn poll_next_command(&mut self) -> Result<Option<Command>, CoordinatorError> {
        let drone_id = self.drone_id.clone();
        let resp = self
            .authed("poll", OK_POLL, |auth| ApiRequest {
                method: Method::Get,
                path: "/v1/commands/next",
                query: vec![("drone_id", drone_id.clone())],
                auth,
                body: None,
            })
            .await?;

        let text = resp.body.trim();
        if resp.status == 204 || text.is_empty() || text == "null" {
            return Ok(None);
        }
        let cmd: Command = serde_json::from_str(text)
            .map_err(|e| CoordinatorError::InvalidResponse(format!("command: {}", e)))?;
        if cmd.command_id.is_none() && cmd.command_type.is_null() {
            return Ok(None);
        }
        debug!("coordinator: command {:?} kind={}", cmd.command_id, cmd.raw_kind());
        Ok(Some(cmd))
    }

    /// Only call once the directive has been applied to the vehicle.
    pub async fn ack(&mut self, command_id: &str) -> Result<(), CoordinatorError> {
        let body = to_json(&AckRequest { command_id: command_id.to_string() })?;
        self.authed("ack", OK_ACK, |auth| ApiRequest {
            method: Method::Post,
            path: "/v1/commands/ack",
            query: Vec::new(),
            auth,
            body: Some(body.clone()),
        })
        .await?;
        Ok(())
    }

    /// Runs an authenticated call. On 401/403 with a registration token the
    /// session is dropped and the call is retried exactly once.
    async fn authed<F>(
        &mut self,
        op: &'static str,
        ok: &[u16],
        build: F,
    ) -> Result<ApiResponse, CoordinatorError>
    where
        F: Fn(Auth) -> ApiRequest,
    {
        let session = self.ensure_session().await?;
        let resp = self.transport.execute(&build(Auth::Bearer(session.0))).await?;

        if is_auth_status(resp.status) && self.registration_token.is_some() {
            warn!("coordinator: {} rejected (HTTP {}); re-registering", op, resp.status);
            self.session = None;
            let session = self.ensure_session().await?;
            let retry = self.transport.execute(&build(Auth::Bearer(session.0))).await?;
            return self.check(op, ok, retry);
        }
        self.check(op, ok, resp)
    }

    fn check(&mut self, op: &'static str, ok: &[u16], resp: ApiResponse) -> Result<ApiResponse, CoordinatorError> {
        if ok.contains(&resp.status) {
            return Ok(resp);
        }
        if is_auth_status(resp.status) {
            self.session = None;
        }
        Err(CoordinatorError::upstream(op, resp.status, &resp.body))
    }
}

fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

fn to_json<S: serde::Serialize>(v: &S) -> Result<serde_json::Value, CoordinatorError> {
    serde_json::to_value(v).map_err(|e| CoordinatorError::Encode(e.to_string()))
}

pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;

    fn cfg(session: Option<&str>, reg: Option<&str>) -> CoordinatorConfig {
        CoordinatorConfig {
            session_token: session.map(str::to_string),
            registration_token: reg.map(str::to_string),
            owner_id: Some("owner-7".into()),
            ..Default::default()
        }
    }

    fn ready_state() -> TelemetryState {
        TelemetryState {
            lat: Some(34.0),
            lon: Some(-118.0),
            altitude_m: Some(50.0),
            heading_deg: None,
            speed_mps: Some(3.5),
        }
    }

    #[tokio::test]
    async fn ensure_session_registers_once() {
        let t = ScriptedTransport::new(vec![(201, r#"{"session_token":" tok-1 "}"#)]);
        let mut c = CoordinatorClient::with_transport(&cfg(None, Some("reg")), t);

        assert_eq!(c.ensure_session().await.unwrap().as_str(), "tok-1");
        assert_eq!(c.ensure_session().await.unwrap().as_str(), "tok-1");

        let reqs = c.transport().requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].auth, Auth::Registration("reg".into()));
        let body = reqs[0].body.as_ref().unwrap();
        assert_eq!(body["drone_id"], "DRONE0001");
        assert_eq!(body["owner_id"], "owner-7");
    }

    #[tokio::test]
    async fn ensure_session_without_credentials_is_configuration_error() {
        let mut c = CoordinatorClient::with_transport(&cfg(None, None), ScriptedTransport::default());
        assert!(matches!(c.ensure_session().await, Err(CoordinatorError::Configuration(_))));
        assert!(c.transport().requests().is_empty());
    }

    #[tokio::test]
    async fn register_requires_201_and_token() {
        let t = ScriptedTransport::new(vec![(200, r#"{"session_token":"t"}"#)]);
        let mut c = CoordinatorClient::with_transport(&cfg(None, Some("reg")), t);
        assert!(matches!(
            c.ensure_session().await,
            Err(CoordinatorError::Upstream { status: 200, .. })
        ));

        let t = ScriptedTransport::new(vec![(201, r#"{"session_token":"  "}"#)]);
        let mut c = CoordinatorClient::with_transport(&cfg(None, Some("reg")), t);
        assert!(matches!(c.ensure_session().await, Err(CoordinatorError::InvalidResponse(_))));
        assert!(c.session().is_none());
    }

    #[tokio::test]
    async fn telemetry_before_ready_makes_no_call() {
        let mut c = CoordinatorClient::with_transport(&cfg(Some("s"), None), ScriptedTransport::default());
        let mut st = ready_state();
        st.altitude_m = None;
        assert!(matches!(c.send_telemetry(&st).await, Err(CoordinatorError::NotReady)));
        assert!(c.transport().requests().is_empty());
    }

    #[tokio::test]
    async fn telemetry_payload_and_bearer() {
        let t = ScriptedTransport::new(vec![(202, "")]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("sess"), None), t);
        c.send_telemetry(&ready_state()).await.unwrap();

        let reqs = c.transport().requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].path, "/v1/telemetry");
        assert_eq!(reqs[0].auth, Auth::Bearer("sess".into()));
        let body = reqs[0].body.as_ref().unwrap();
        assert_eq!(body["lat"], 34.0);
        assert_eq!(body["altitude_m"], 50.0);
        assert_eq!(body["heading_deg"], 0.0);
        assert_eq!(body["speed_mps"], 3.5);
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn auth_rejection_then_success_retries_once() {
        let t = ScriptedTransport::new(vec![
            (401, "expired"),
            (201, r#"{"session_token":"fresh"}"#),
            (200, ""),
        ]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("stale"), Some("reg")), t);
        c.send_telemetry(&ready_state()).await.unwrap();

        let t = c.transport();
        assert_eq!(t.calls_to("/v1/telemetry"), 2);
        assert_eq!(t.calls_to("/v1/drones/register"), 1);
        let reqs = t.requests();
        assert_eq!(reqs[0].auth, Auth::Bearer("stale".into()));
        assert_eq!(reqs[2].auth, Auth::Bearer("fresh".into()));
        assert_eq!(c.session().unwrap().as_str(), "fresh");
    }

    #[tokio::test]
    async fn second_rejection_surfaces_and_clears_session() {
        let t = ScriptedTransport::new(vec![
            (401, ""),
            (201, r#"{"session_token":"fresh"}"#),
            (403, "still no"),
        ]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("stale"), Some("reg")), t);
        let err = c.send_telemetry(&ready_state()).await.unwrap_err();
        assert!(err.is_auth_rejection());
        assert!(c.session().is_none());
        assert_eq!(c.transport().calls_to("/v1/telemetry"), 2);
    }

    #[tokio::test]
    async fn rejection_without_registration_token_is_not_retried() {
        let t = ScriptedTransport::new(vec![(401, "")]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("s"), None), t);
        let err = c.ack("c1").await.unwrap_err();
        assert!(err.is_auth_rejection());
        assert_eq!(c.transport().requests().len(), 1);
        assert!(c.session().is_none());
    }

    #[tokio::test]
    async fn server_error_is_upstream_and_keeps_session() {
        let t = ScriptedTransport::new(vec![(503, "maintenance")]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("s"), Some("reg")), t);
        match c.send_telemetry(&ready_state()).await {
            Err(CoordinatorError::Upstream { op, status, body }) => {
                assert_eq!(op, "telemetry");
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(c.session().is_some());
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let t = ScriptedTransport::default();
        t.fail(CoordinatorError::Transport("connection refused".into()));
        let mut c = CoordinatorClient::with_transport(&cfg(Some("s"), Some("reg")), t);
        assert!(matches!(
            c.send_telemetry(&ready_state()).await,
            Err(CoordinatorError::Transport(_))
        ));
        assert_eq!(c.transport().requests().len(), 1);
    }

    #[tokio::test]
    async fn poll_handles_empty_and_directive_bodies() {
        let t = ScriptedTransport::new(vec![
            (204, ""),
            (200, "null"),
            (200, "{}"),
            (200, r#"{"command_id":"c9","command_type":{"type":"RESUME"}}"#),
        ]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("s"), None), t);
        assert!(c.poll_next_command().await.unwrap().is_none());
        assert!(c.poll_next_command().await.unwrap().is_none());
        assert!(c.poll_next_command().await.unwrap().is_none());
        let cmd = c.poll_next_command().await.unwrap().unwrap();
        assert_eq!(cmd.id(), Some("c9"));

        let reqs = c.transport().requests();
        assert_eq!(reqs[0].method, Method::Get);
        assert_eq!(reqs[0].query, vec![("drone_id", "DRONE0001".to_string())]);
    }

    #[tokio::test]
    async fn poll_rejects_garbage() {
        let t = ScriptedTransport::new(vec![(200, "<html>")]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("s"), None), t);
        assert!(matches!(c.poll_next_command().await, Err(CoordinatorError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn ack_posts_command_id() {
        let t = ScriptedTransport::new(vec![(201, "")]);
        let mut c = CoordinatorClient::with_transport(&cfg(Some("s"), None), t);
        c.ack("c1").await.unwrap();
        let reqs = c.transport().requests();
        assert_eq!(reqs[0].path, "/v1/commands/ack");
        assert_eq!(reqs[0].body.as_ref().unwrap()["command_id"], "c1");
    }

    #[test]
    fn unencodable_body_is_an_encode_error() {
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "pair keys are not JSON object keys");
        assert!(matches!(to_json(&bad), Err(CoordinatorError::Encode(_))));
    }

    #[test]
    fn session_debug_is_redacted() {
        assert_eq!(format!("{:?}", Session::new("secret")), "Session(<redacted>)");
    }

    #[test]
    fn timestamp_is_second_precision_utc() {
        let ts = now_rfc3339();
        assert!(ts.ends_with('Z'), "{ts}");
        assert!(!ts.contains('.'), "{ts}");
    }
}
