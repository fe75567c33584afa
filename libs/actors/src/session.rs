//! Session correlation
//!
//! A caller opens a session, sends a request tagged with it and later gets
//! the matching `resp`. Responses may arrive in any order. Each session is
//! completed at most once, and a `resp` for an unknown session is ignored.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{KiteError, RemoteError, Result};
use crate::message::Session;

type Completion = oneshot::Sender<std::result::Result<Value, RemoteError>>;

/// Pending request table of one party (a worker or the coordinator)
#[derive(Debug, Default)]
pub struct Sessions {
    last: Session,
    pending: HashMap<Session, Completion>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session and register its completion
    pub fn open(&mut self) -> (Session, oneshot::Receiver<std::result::Result<Value, RemoteError>>) {
        self.last += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(self.last, tx);
        (self.last, rx)
    }

    /// Complete a session. Returns false for unknown or already completed ones.
    pub fn complete(&mut self, session: Session, result: std::result::Result<Value, RemoteError>) -> bool {
        match self.pending.remove(&session) {
            // A dropped Reply just discards the value
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Forget a session whose request never left
    pub fn cancel(&mut self, session: Session) {
        self.pending.remove(&session);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Open a session, hand it to `send`, and return the reply future.
    ///
    /// The borrow is released before `send` runs.
    pub fn request<T>(cell: &RefCell<Sessions>, send: impl FnOnce(Session) -> Result<()>) -> Reply<T> {
        let (session, rx) = cell.borrow_mut().open();
        match send(session) {
            Ok(()) => Reply::pending(rx),
            Err(err) => {
                cell.borrow_mut().cancel(session);
                Reply::failed(err)
            }
        }
    }
}

enum ReplyState {
    Pending(oneshot::Receiver<std::result::Result<Value, RemoteError>>),
    Failed(Option<KiteError>),
}

/// Future resolving to the decoded payload of a `resp`.
///
/// The request is already on its way when a `Reply` exists; dropping it
/// only discards the answer.
#[must_use = "the response is lost unless the reply is awaited"]
pub struct Reply<T = Value> {
    state: ReplyState,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Reply<T> {
    pub(crate) fn pending(rx: oneshot::Receiver<std::result::Result<Value, RemoteError>>) -> Self {
        Self {
            state: ReplyState::Pending(rx),
            _marker: PhantomData,
        }
    }

    /// A reply that fails immediately, for requests that could not be sent
    pub fn failed(err: KiteError) -> Self {
        Self {
            state: ReplyState::Failed(Some(err)),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Future for Reply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(Ok(value))) => Poll::Ready(serde_json::from_value(value).map_err(|e| {
                    KiteError::protocol(format!("unexpected response payload: {e}"))
                })),
                Poll::Ready(Ok(Err(remote))) => Poll::Ready(Err(remote.into())),
                Poll::Ready(Err(_)) => Poll::Ready(Err(KiteError::Shutdown)),
            },
            ReplyState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(KiteError::Shutdown))),
        }
    }
}

impl<T> std::fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            ReplyState::Pending(_) => "pending",
            ReplyState::Failed(_) => "failed",
        };
        f.debug_struct("Reply").field("state", &state).finish()
    }
}
