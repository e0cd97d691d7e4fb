// Token refresh logic
// Refresh endpoint call plus the single-flight guard around it

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::token;
use super::types::{RefreshRequest, RefreshResponse, TokenData};
use crate::error::{Result, SessionError};
use crate::transport::{Transport, TransportOutcome, TransportRequest};

pub const REFRESH_PATH: &str = "/auth/refresh";

/// Why a refresh call failed
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshFailure {
    /// The server refused the refresh token, or answered with garbage
    Rejected(String),
    /// No usable answer; the refresh token may still be good
    Transient(SessionError),
}

/// Exchange a refresh token for a new access token
pub async fn request_new_token(
    transport: &dyn Transport,
    refresh_token: &str,
) -> std::result::Result<TokenData, RefreshFailure> {
    tracing::info!("Refreshing access token...");

    let body = serde_json::to_value(RefreshRequest { refresh_token })
        .map_err(|e| RefreshFailure::Transient(SessionError::Internal(e.to_string())))?;

    let outcome = transport
        .send(TransportRequest::post(REFRESH_PATH).with_json(body))
        .await;

    let value = match outcome {
        TransportOutcome::Ok(value) => value,
        TransportOutcome::Unauthorized => {
            return Err(RefreshFailure::Rejected(
                "refresh token rejected".to_string(),
            ))
        }
        TransportOutcome::NetworkError(msg) => {
            return Err(RefreshFailure::Transient(SessionError::NetworkError(msg)))
        }
        TransportOutcome::ServerError { status, message } => {
            let err = SessionError::ServerError { status, message };
            return Err(if err.is_retryable() {
                RefreshFailure::Transient(err)
            } else {
                RefreshFailure::Rejected(err.to_string())
            });
        }
    };

    let data: RefreshResponse = serde_json::from_value(value).map_err(|e| {
        RefreshFailure::Rejected(format!("Failed to parse refresh response: {}", e))
    })?;

    token::claims(&data.access_token)
        .map_err(|e| RefreshFailure::Rejected(e.to_string()))?;

    tracing::info!(
        "Access token refreshed ({})",
        token::redact(&data.access_token)
    );

    Ok(TokenData {
        access_token: data.access_token,
        refresh_token: data.refresh_token,
    })
}

pub type RefreshResult = Result<String>;
pub type RefreshAttempt = Shared<BoxFuture<'static, RefreshResult>>;

struct PendingRefresh {
    id: u64,
    epoch: u64,
    attempt: RefreshAttempt,
}

/// Holds at most one in-flight refresh per session identity
pub struct RefreshGate {
    slot: Mutex<Option<PendingRefresh>>,
    next_id: AtomicU64,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join the pending attempt for `epoch`, or start one with `start`
    ///
    /// Check and set happen under one lock, before anything is awaited.
    /// `start` receives the attempt id it must pass to `clear` when the
    /// network call settles. Returns the attempt and whether it was just started.
    pub fn join_or_start<F>(&self, epoch: u64, start: F) -> (RefreshAttempt, bool)
    where
        F: FnOnce(u64) -> BoxFuture<'static, RefreshResult>,
    {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(ref pending) = *slot {
            if pending.epoch == epoch {
                return (pending.attempt.clone(), false);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let attempt = start(id).shared();
        *slot = Some(PendingRefresh {
            id,
            epoch,
            attempt: attempt.clone(),
        });
        (attempt, true)
    }

    /// Forget attempt `id` so the next caller starts fresh
    pub fn clear(&self, id: u64) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|p| p.id) == Some(id) {
            *slot = None;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new()
    }
}
