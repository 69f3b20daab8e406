//! Tandem: distributed call dispatch with owner/user reference handles.
//!
//! A worker can ask another worker to run a built-in operator or an opaque
//! serialized call, and either wait for the value or leave the value on the
//! remote worker and receive a reference to it.
//!
//! ## Architecture
//!
//! - **RpcDispatcher**: caller side, builds requests for the four call shapes
//! - **RequestHandler**: callee side, executes requests and accepts forks
//! - **RRefContext**: per-process registry of pending user forks and owned values
//! - **RpcAgent**: the transport seam; **TcpAgent** is the networked agent
//! - **Message**: typed envelope with a binary frame codec

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod functions;
pub mod future;
pub mod message;
pub mod operator;
pub mod peer;
pub mod registry;
pub mod request;
pub mod rref;
pub mod udf;
pub mod worker;

pub use agent::RpcAgent;
pub use context::{RRefContext, ReleaseHook};
pub use error::{ConnectionLost, RpcError, RpcResult, WireError};
pub use functions::{decode_response, finish_accept_user_rref, RpcDispatcher};
pub use future::{FutureMessage, Response};
pub use message::{Message, MessageType};
pub use operator::{Operator, OperatorRegistry};
pub use peer::TcpAgent;
pub use registry::{WorkerEntry, WorkerRegistry, WorkerState};
pub use request::RequestHandler;
pub use rref::{OwnerRRef, RRef, UserRRef, UserState};
pub use udf::{serialize_call, PayloadHandler, UdfRegistry};
pub use worker::Worker;
