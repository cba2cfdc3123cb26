use reqwest::{Certificate, Client};
use std::time::Duration;

use crate::error::CoordinatorError;
use crate::CoordinatorConfig;

pub const REGISTRATION_HEADER: &str = "X-Registration-Token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Registration(String),
    Bearer(String),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: &'static str,
    pub query: Vec<(&'static str, String)>,
    pub auth: Auth,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// One HTTP exchange with the coordinator. Transport-level failures map to
/// `CoordinatorError::Transport`; any status code is a successful exchange.
#[allow(async_fn_in_trait)]
pub trait HttpTransport {
    async fn execute(&self, req: &ApiRequest) -> Result<ApiResponse, CoordinatorError>;
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(cfg: &CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let timeout = Duration::try_from_secs_f64(cfg.http_timeout_s).map_err(|_| {
            CoordinatorError::Configuration(format!("http_timeout_s out of range: {}", cfg.http_timeout_s))
        })?;
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("atc-relay/", env!("CARGO_PKG_VERSION")));

        if let Some(path) = cfg.ca_cert.as_deref() {
            let pem = std::fs::read(path).map_err(|e| {
                CoordinatorError::Configuration(format!("read ca_cert {}: {}", path, e))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                CoordinatorError::Configuration(format!("parse ca_cert {}: {}", path, e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if cfg.tls_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| CoordinatorError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { client, base_url: cfg.server_url.trim_end_matches('/').to_string() })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn execute(&self, req: &ApiRequest) -> Result<ApiResponse, CoordinatorError> {
        let url = format!("{}{}", self.base_url, req.path);
        let mut rb = match req.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if !req.query.is_empty() {
            rb = rb.query(&req.query);
        }
        rb = match &req.auth {
            Auth::Registration(token) => rb.header(REGISTRATION_HEADER, token),
            Auth::Bearer(token) => rb.bearer_auth(token),
        };
        if let Some(body) = &req.body {
            rb = rb.json(body);
        }

        let resp = rb.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(ApiResponse { status, body })
    }
}
