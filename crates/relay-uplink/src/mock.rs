//! Scripted `HttpTransport` for host tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::CoordinatorError;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport};

/// Replays canned replies in order and records every request.
/// Panics on a request with no reply left.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<ApiResponse, CoordinatorError>>>,
    seen: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<(u16, &str)>) -> Self {
        let t = Self::default();
        for (status, body) in replies {
            t.reply(status, body);
        }
        t
    }

    pub fn reply(&self, status: u16, body: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(ApiResponse { status, body: body.to_string() }));
    }

    pub fn fail(&self, err: CoordinatorError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|r| r.path == path).count()
    }
}

impl HttpTransport for ScriptedTransport {
    async fn execute(&self, req: &ApiRequest) -> Result<ApiResponse, CoordinatorError> {
        self.seen.lock().unwrap().push(req.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request to {}", req.path))
    }
}
