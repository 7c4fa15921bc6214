//! Server side of the approval protocol.
//!
//! Every tool call the kernel makes must be decided by the host before it
//! reaches a provider. This module correlates each outbound
//! [`ApprovalRequestMsg`] with the decision that (maybe) comes back:
//! one pending slot per request ID, resolved at most once, with exactly one
//! terminal transition among accepted / rejected / expired / cancelled.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use pybox_protocol::ApprovalRequestMsg;

/// Capacity of the outbound queue toward the single attached peer.
const OUTBOUND_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accept,
    Reject,
    Cancel,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// No decision arrived within the approval timeout.
    #[error("approval request timed out")]
    Timeout,
    /// The surrounding execution was cancelled while the request waited.
    #[error("approval request cancelled")]
    Cancelled,
    /// No peer is attached, or the peer went away mid-request.
    #[error("approval channel not connected")]
    Disconnected,
}

#[derive(Debug, Error)]
#[error("an approval peer is already attached")]
pub struct PeerAlreadyAttached;

pub struct ApprovalChannel {
    approval_timeout: Option<Duration>,
    peer: Mutex<Option<mpsc::Sender<ApprovalRequestMsg>>>,
    // Never held across an await; map mutation only.
    pending: Mutex<HashMap<String, oneshot::Sender<Verdict>>>,
}

impl ApprovalChannel {
    pub fn new(approval_timeout: Option<Duration>) -> Self {
        ApprovalChannel {
            approval_timeout,
            peer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches the single host peer and hands back the stream of outbound
    /// requests it must forward. Fails while another peer is attached.
    pub fn attach_peer(
        &self,
    ) -> std::result::Result<mpsc::Receiver<ApprovalRequestMsg>, PeerAlreadyAttached> {
        let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        if peer.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(PeerAlreadyAttached);
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *peer = Some(tx);
        info!("approval peer attached");
        Ok(rx)
    }

    /// Detaches the peer and fails everything still pending: with nobody to
    /// decide, letting requests hang would wedge the kernel.
    pub fn detach_peer(&self) {
        {
            let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
            *peer = None;
        }
        let dropped: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        if !dropped.is_empty() {
            info!("approval peer detached with {} request(s) pending", dropped.len());
        }
        // Dropping the slots resolves the waiters with `Disconnected`.
    }

    pub fn peer_attached(&self) -> bool {
        self.peer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Requests a decision for one tool call. Blocks until the host
    /// decides, the approval timeout elapses, or the surrounding execution
    /// is cancelled. `Ok(true)` means accepted, `Ok(false)` rejected.
    pub async fn request(
        &self,
        provider: &str,
        tool: &str,
        args: Value,
    ) -> std::result::Result<bool, ApprovalError> {
        let outbound = {
            let peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
            peer.clone().ok_or(ApprovalError::Disconnected)?
        };

        let id = Uuid::new_v4().to_string();
        let msg = ApprovalRequestMsg {
            id: id.clone(),
            provider: provider.to_string(),
            tool: tool.to_string(),
            args,
            ts: unix_millis(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id.clone(), tx);
        }

        if outbound.send(msg).await.is_err() {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&id);
            return Err(ApprovalError::Disconnected);
        }

        let verdict = match self.approval_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(result) => result,
                Err(_) => {
                    // Expired: remove the slot so a late decision is a
                    // silent no-op rather than a resurrection.
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.remove(&id);
                    return Err(ApprovalError::Timeout);
                }
            },
            None => rx.await,
        };

        match verdict {
            Ok(Verdict::Accept) => Ok(true),
            Ok(Verdict::Reject) => Ok(false),
            Ok(Verdict::Cancel) => Err(ApprovalError::Cancelled),
            Err(_) => Err(ApprovalError::Disconnected),
        }
    }

    /// Records the host's decision. Unknown or already-settled IDs are
    /// silently dropped.
    pub fn decide(&self, id: &str, accept: bool) {
        let slot = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(id)
        };
        match slot {
            Some(tx) => {
                let verdict = if accept { Verdict::Accept } else { Verdict::Reject };
                let _ = tx.send(verdict);
            }
            None => debug!(id, "decision for unknown or settled approval request"),
        }
    }

    /// Cancels everything pending. Used when the surrounding execution is
    /// interrupted or reset.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Verdict::Cancel);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
