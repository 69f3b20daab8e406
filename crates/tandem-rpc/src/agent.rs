//! The transport seam.
//!
//! Dispatch code only ever talks to an [`RpcAgent`]: hand it a message for a
//! destination, get back a [`FutureMessage`] that completes with the
//! response. [`crate::peer::TcpAgent`] is the networked implementation.

use crate::error::WireError;
use crate::future::FutureMessage;
use crate::message::Message;
use std::sync::Arc;
use tandem_types::ids::WorkerInfo;

/// Sends messages to other workers.
pub trait RpcAgent: Send + Sync {
    /// The worker this agent runs as.
    fn worker_info(&self) -> &WorkerInfo;

    /// Send `message` to `to`. The returned future completes with the
    /// response (an `Exception` message if the call failed remotely), or with
    /// [`crate::error::ConnectionLost`] if the connection failed while the
    /// call was in flight.
    fn send(&self, to: &WorkerInfo, message: Message) -> Result<Arc<FutureMessage>, WireError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&WorkerInfo, &Message) -> Option<Message> + Send + Sync>;

    /// Records every message sent. With a responder, futures complete
    /// immediately with its reply; otherwise they stay pending until the test
    /// completes them.
    pub struct MockAgent {
        info: WorkerInfo,
        responder: Option<Responder>,
        pub sent: Mutex<Vec<(WorkerInfo, Message, Arc<FutureMessage>)>>,
    }

    impl MockAgent {
        pub fn new(info: WorkerInfo) -> Self {
            Self {
                info,
                responder: None,
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn with_responder<F>(info: WorkerInfo, responder: F) -> Self
        where
            F: Fn(&WorkerInfo, &Message) -> Option<Message> + Send + Sync + 'static,
        {
            Self {
                info,
                responder: Some(Box::new(responder)),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn last_sent(&self) -> (WorkerInfo, Message, Arc<FutureMessage>) {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl RpcAgent for MockAgent {
        fn worker_info(&self) -> &WorkerInfo {
            &self.info
        }

        fn send(&self, to: &WorkerInfo, message: Message) -> Result<Arc<FutureMessage>, WireError> {
            let fut = FutureMessage::new();
            self.sent
                .lock()
                .unwrap()
                .push((to.clone(), message.clone(), fut.clone()));
            if let Some(reply) = self.responder.as_ref().and_then(|r| r(to, &message)) {
                fut.mark_completed(reply);
            }
            Ok(fut)
        }
    }
}
