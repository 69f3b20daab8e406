//! Completion handle for an in-flight call.

use crate::error::ConnectionLost;
use crate::message::Message;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::error;

/// How a call ends: the destination's response (which may itself be an
/// `Exception`), or the transport failure that kept it from arriving.
pub type Response = Result<Message, ConnectionLost>;

type Callback = Box<dyn FnOnce(&Response) + Send + 'static>;

#[derive(Default)]
struct FutureState {
    response: Option<Response>,
    callbacks: Vec<Callback>,
}

/// The eventual response to a message handed to the transport.
///
/// A future completes at most once. Callbacks registered before completion
/// run on the completing thread, in registration order. A callback
/// registered after completion never runs on the registering thread: it is
/// spawned onto the current tokio runtime, or onto a fresh thread outside
/// one. Whoever registers it can therefore finish its own bookkeeping first.
#[derive(Default)]
pub struct FutureMessage {
    state: Mutex<FutureState>,
    completed: Condvar,
    notify: Notify,
}

impl FutureMessage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A future that is already complete.
    pub fn completed(message: Message) -> Arc<Self> {
        let fut = Self::new();
        fut.mark_completed(message);
        fut
    }

    /// Complete the future with the destination's response.
    ///
    /// Returns `false` (and drops `message`) if it was already complete.
    pub fn mark_completed(&self, message: Message) -> bool {
        self.complete(Ok(message))
    }

    /// Complete the future with an `Exception` message.
    pub fn set_error(&self, text: impl Into<String>) -> bool {
        self.mark_completed(Message::exception(text))
    }

    /// Complete the future with a transport failure.
    pub fn mark_lost(&self, lost: ConnectionLost) -> bool {
        self.complete(Err(lost))
    }

    fn complete(&self, response: Response) -> bool {
        let callbacks = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.response.is_some() {
                return false;
            }
            state.response = Some(response.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.completed.notify_all();
        self.notify.notify_waiters();
        for callback in callbacks {
            callback(&response);
        }
        true
    }

    /// Register a callback that runs exactly once with the outcome.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        let ready = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match &state.response {
                Some(response) => response.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        run_detached(Box::new(callback), ready);
    }

    pub fn is_completed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .response
            .is_some()
    }

    /// The outcome, if the future is complete.
    pub fn try_response(&self) -> Option<Response> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .response
            .clone()
    }

    /// Wait for the outcome without blocking the thread.
    pub async fn wait(&self) -> Response {
        loop {
            let notified = self.notify.notified();
            if let Some(response) = self.try_response() {
                return response;
            }
            notified.await;
        }
    }

    /// Block the current thread until the outcome is known.
    pub fn wait_blocking(&self) -> Response {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(response) = &state.response {
                return response.clone();
            }
            state = self
                .completed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Run a late callback away from the registering thread. A panic here is a
/// broken invariant with no caller left to report it to, so the process
/// aborts as it would on the transport's delivery task.
fn run_detached(callback: Callback, response: Response) {
    let run = move || {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&response))).is_err() {
            error!("Response callback panicked; aborting");
            std::process::abort();
        }
    };
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { run() });
        }
        Err(_) => {
            std::thread::spawn(run);
        }
    }
}

impl std::fmt::Debug for FutureMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureMessage")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_callbacks_run_once_on_completion() {
        let fut = FutureMessage::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        fut.add_callback(move |r| {
            assert!(r.as_ref().unwrap().is_exception());
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(fut.set_error("boom"));
        assert!(!fut.set_error("again"));
        assert!(!fut.mark_lost(ConnectionLost::new("w2", "reset")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fut.try_response().unwrap().unwrap().payload_text(), "boom");
    }

    #[tokio::test]
    async fn test_late_callback_is_deferred() {
        let fut = FutureMessage::completed(Message::new(vec![], vec![], MessageType::RemoteRet));
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        fut.add_callback(move |r| {
            let _ = tx.send(r.as_ref().map(|m| m.msg_type).ok());
        });
        assert!(rx.try_recv().is_err());
        assert_eq!(rx.await.unwrap(), Some(MessageType::RemoteRet));
    }

    #[test]
    fn test_late_callback_outside_runtime_uses_a_thread() {
        let fut = FutureMessage::new();
        fut.mark_lost(ConnectionLost::new("w2", "reset by peer"));
        let caller = std::thread::current().id();
        let (tx, rx) = std::sync::mpsc::channel();
        fut.add_callback(move |r| {
            let _ = tx.send((std::thread::current().id(), r.clone()));
        });
        let (ran_on, response) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(ran_on, caller);
        assert_eq!(response.unwrap_err().worker, "w2");
    }

    #[test]
    fn test_wait_blocking_across_threads() {
        let fut = FutureMessage::new();
        let f = fut.clone();
        let handle = std::thread::spawn(move || f.wait_blocking());
        std::thread::sleep(Duration::from_millis(20));
        fut.set_error("late");
        assert_eq!(handle.join().unwrap().unwrap().payload_text(), "late");
    }

    #[test]
    fn test_wait_on_completed_future_is_immediate() {
        let fut = FutureMessage::completed(Message::exception("ready"));
        let msg = tokio_test::block_on(fut.wait()).unwrap();
        assert_eq!(msg.payload_text(), "ready");
    }

    #[tokio::test]
    async fn test_async_wait() {
        let fut = FutureMessage::new();
        let f = fut.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.mark_lost(ConnectionLost::new("w2", "closed"));
        });
        let lost = fut.wait().await.unwrap_err();
        assert_eq!(lost.to_string(), "Connection to w2 lost: closed");
    }
}
