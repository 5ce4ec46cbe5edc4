//! Fakes shared by the controller tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::api::{
    AgentApi, ApiError, CreatedUser, MediaContent, NewUser, RunReply, StartRun, UserRecord,
};
use crate::models::RemoteId;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Lookup(String),
    Create(NewUser),
    Start {
        content: String,
        origin: String,
        media: usize,
    },
    Continue {
        session_id: String,
        content: String,
        media: usize,
    },
}

/// Scripted `AgentApi`. Replies are consumed in order; an exhausted script
/// answers with a 500.
#[derive(Default)]
pub struct FakeApi {
    calls: Mutex<Vec<Call>>,
    runs: Mutex<VecDeque<Result<RunReply, ApiError>>>,
    lookups: Mutex<VecDeque<Result<UserRecord, ApiError>>>,
    creates: Mutex<VecDeque<Result<CreatedUser, ApiError>>>,
    gated: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every run until `release` is notified.
    pub fn gated(self) -> Self {
        self.gated.store(true, Ordering::SeqCst);
        self
    }

    pub fn push_run(&self, reply: Result<RunReply, ApiError>) {
        self.runs.lock().unwrap().push_back(reply);
    }

    pub fn push_reply(&self, message: &str, session_id: Option<&str>) {
        self.push_run(Ok(RunReply {
            message: Some(message.to_string()),
            message_id: None,
            session_id: session_id.map(str::to_string),
        }));
    }

    pub fn push_lookup(&self, result: Result<UserRecord, ApiError>) {
        self.lookups.lock().unwrap().push_back(result);
    }

    pub fn push_create(&self, result: Result<CreatedUser, ApiError>) {
        self.creates.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn next_run(&self) -> Result<RunReply, ApiError> {
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(server_error()))
    }
}

pub fn server_error() -> ApiError {
    ApiError::Status {
        status: 500,
        body: String::new(),
    }
}

pub fn user_record(id: i64, name: &str) -> UserRecord {
    serde_json::from_value(serde_json::json!({ "id": id, "name": name })).unwrap()
}

#[async_trait]
impl AgentApi for FakeApi {
    async fn lookup_user(&self, phone: &str) -> Result<UserRecord, ApiError> {
        self.record(Call::Lookup(phone.to_string()));
        self.lookups
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::NotFound))
    }

    async fn create_user(&self, user: &NewUser) -> Result<CreatedUser, ApiError> {
        self.record(Call::Create(user.clone()));
        self.creates
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(server_error()))
    }

    async fn start_run(&self, run: &StartRun, _user_id: &RemoteId) -> Result<RunReply, ApiError> {
        self.record(Call::Start {
            content: run.content.clone(),
            origin: run.session_origin.clone(),
            media: run.media.as_ref().map_or(0, Vec::len),
        });
        self.next_run().await
    }

    async fn continue_run(
        &self,
        session_id: &str,
        content: &str,
        _user_id: &RemoteId,
        media: Option<&[MediaContent]>,
    ) -> Result<RunReply, ApiError> {
        self.record(Call::Continue {
            session_id: session_id.to_string(),
            content: content.to_string(),
            media: media.map_or(0, <[MediaContent]>::len),
        });
        self.next_run().await
    }
}
