//! Nonce-keyed table of in-flight calls
//!
//! Each outbound call registers a slot under a fresh nonce and awaits a
//! [`PendingResponse`]. The matching inbound reply completes the slot exactly once;
//! replies for unknown or already-completed nonces are ignored.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::plugin::traits::PluginError;

/// Correlation token matching a request with its reply
pub type Nonce = String;

/// How nonces are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStyle {
    /// 128 random bits, hex encoded
    RandomHex,
    /// UUID v4 in simple (dashless) form
    Uuid,
}

impl NonceStyle {
    fn generate(self) -> Nonce {
        match self {
            NonceStyle::RandomHex => hex::encode(rand::random::<[u8; 16]>()),
            NonceStyle::Uuid => uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

struct PendingCall<T> {
    sender: oneshot::Sender<Result<T, PluginError>>,
    /// Present until handed out by `issue`
    receiver: Option<oneshot::Receiver<Result<T, PluginError>>>,
    created_at: Instant,
}

/// Registry of calls awaiting a reply
pub struct CallRegistry<T> {
    style: NonceStyle,
    pending: Mutex<HashMap<Nonce, PendingCall<T>>>,
}

impl<T> CallRegistry<T> {
    pub fn new(style: NonceStyle) -> Self {
        Self {
            style,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Nonce, PendingCall<T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh nonce and an empty pending slot
    pub fn register(&self) -> Nonce {
        self.insert_with(|style| style.generate())
    }

    /// Like [`register`](Self::register), with the nonce prefixed by `tag` for traceability
    pub fn register_tagged(&self, tag: &str) -> Nonce {
        self.insert_with(|style| format!("{}A{}", tag, style.generate()))
    }

    fn insert_with(&self, make: impl Fn(NonceStyle) -> Nonce) -> Nonce {
        let mut table = self.table();
        let mut nonce = make(self.style);
        while table.contains_key(&nonce) {
            nonce = make(self.style);
        }
        let (sender, receiver) = oneshot::channel();
        table.insert(
            nonce.clone(),
            PendingCall {
                sender,
                receiver: Some(receiver),
                created_at: Instant::now(),
            },
        );
        nonce
    }

    /// Hand out the awaitable for `nonce`; `None` if unknown or already issued
    pub fn issue(&self, nonce: &str) -> Option<PendingResponse<T>> {
        self.table()
            .get_mut(nonce)
            .and_then(|call| call.receiver.take())
            .map(|receiver| PendingResponse { receiver })
    }

    /// Register and issue in one step
    pub fn open(&self) -> (Nonce, PendingResponse<T>) {
        let nonce = self.register();
        let pending = self.issue_fresh(&nonce);
        (nonce, pending)
    }

    /// Tagged variant of [`open`](Self::open)
    pub fn open_tagged(&self, tag: &str) -> (Nonce, PendingResponse<T>) {
        let nonce = self.register_tagged(tag);
        let pending = self.issue_fresh(&nonce);
        (nonce, pending)
    }

    fn issue_fresh(&self, nonce: &str) -> PendingResponse<T> {
        match self.issue(nonce) {
            Some(pending) => pending,
            // Only reachable if another thread completed the slot in between; the
            // caller then sees a closed call rather than a hang.
            None => {
                let (_, receiver) = oneshot::channel();
                PendingResponse { receiver }
            }
        }
    }

    /// Complete `nonce` successfully. Returns false for unknown nonces.
    pub fn resolve(&self, nonce: &str, value: T) -> bool {
        self.complete(nonce, Ok(value))
    }

    /// Complete `nonce` with an error. Returns false for unknown nonces.
    pub fn reject(&self, nonce: &str, error: PluginError) -> bool {
        self.complete(nonce, Err(error))
    }

    fn complete(&self, nonce: &str, outcome: Result<T, PluginError>) -> bool {
        let call = self.table().remove(nonce);
        match call {
            Some(call) => {
                // The awaiting side may have given up; that is not an error here
                let _ = call.sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Whether `nonce` still awaits a reply
    pub fn contains(&self, nonce: &str) -> bool {
        self.table().contains_key(nonce)
    }

    /// Number of calls awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Age of the longest-waiting call
    pub fn oldest_pending(&self) -> Option<Duration> {
        self.table()
            .values()
            .map(|call| call.created_at.elapsed())
            .max()
    }
}

/// Future resolving to the reply for one nonce
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse<T> {
    receiver: oneshot::Receiver<Result<T, PluginError>>,
}

impl<T> Future for PendingResponse<T> {
    type Output = Result<T, PluginError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(PluginError::Ipc(
                "call registry dropped before the call completed".to_string(),
            )),
        })
    }
}
