//! Call-record collaborator
//!
//! The record service assigns the session id when a call starts and is
//! told how it ended.

use crate::error::CallError;
use crate::media::MediaKind;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

#[async_trait]
pub trait CallRecordService: Send + Sync {
    /// Register a new call. Returns the record id used as session id.
    async fn notify_call_started(
        &self,
        caller: &str,
        callee: &str,
        media_kind: MediaKind,
    ) -> Result<String, CallError>;

    async fn notify_call_ended(
        &self,
        record_id: &str,
        reason: &TerminalReason,
        duration_seconds: u64,
    ) -> Result<(), CallError>;
}

/// Why a call ended normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    ConnectivityTerminated,
    TransportClosed,
    Declined,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local hangup",
            EndReason::RemoteHangup => "remote hangup",
            EndReason::ConnectivityTerminated => "connectivity terminated",
            EndReason::TransportClosed => "transport closed",
            EndReason::Declined => "declined",
        }
    }
}

/// How a call reached its terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    Ended(EndReason),
    Failed(String),
}

impl TerminalReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, TerminalReason::Failed(_))
    }

    pub fn status(&self) -> CallStatus {
        match self {
            TerminalReason::Ended(EndReason::Declined) => CallStatus::Declined,
            TerminalReason::Ended(_) => CallStatus::Ended,
            TerminalReason::Failed(_) => CallStatus::Failed,
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::Ended(reason) => f.write_str(reason.as_str()),
            TerminalReason::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

impl From<CallError> for TerminalReason {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Cancelled => TerminalReason::Ended(EndReason::LocalHangup),
            CallError::ConnectivityTerminated => TerminalReason::Ended(EndReason::ConnectivityTerminated),
            other => TerminalReason::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Ended,
    Failed,
    Declined,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub id: String,
    pub caller: String,
    pub callee: String,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub started_at: SystemTime,
    pub duration_seconds: u64,
    pub reason: Option<String>,
}

/// Record service keeping the call history in memory
#[derive(Debug, Default)]
pub struct InMemoryCallRecords {
    records: Mutex<Vec<CallRecord>>,
}

impl InMemoryCallRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }

    pub fn get(&self, record_id: &str) -> Option<CallRecord> {
        self.records.lock().iter().find(|r| r.id == record_id).cloned()
    }

    /// Calls `user` took part in, newest first
    pub fn history_for(&self, user: &str) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.caller == user || r.callee == user)
            .cloned()
            .collect();
        calls.reverse();
        calls
    }
}

#[async_trait]
impl CallRecordService for InMemoryCallRecords {
    async fn notify_call_started(
        &self,
        caller: &str,
        callee: &str,
        media_kind: MediaKind,
    ) -> Result<String, CallError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.records.lock().push(CallRecord {
            id: id.clone(),
            caller: caller.to_string(),
            callee: callee.to_string(),
            media_kind,
            status: CallStatus::Calling,
            started_at: SystemTime::now(),
            duration_seconds: 0,
            reason: None,
        });
        info!("Call record {} opened: {} -> {} ({})", id, caller, callee, media_kind.as_str());
        Ok(id)
    }

    async fn notify_call_ended(
        &self,
        record_id: &str,
        reason: &TerminalReason,
        duration_seconds: u64,
    ) -> Result<(), CallError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| CallError::SessionNotFound(record_id.to_string()))?;

        if record.status != CallStatus::Calling {
            debug!("Call record {} already closed as {:?}", record_id, record.status);
            return Ok(());
        }
        record.status = reason.status();
        record.duration_seconds = duration_seconds;
        record.reason = Some(reason.to_string());
        info!(
            "Call record {} closed: {} ({})",
            record_id,
            reason,
            format_duration(duration_seconds)
        );
        Ok(())
    }
}

/// `mm:ss`, or `h:mm:ss` past an hour
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
