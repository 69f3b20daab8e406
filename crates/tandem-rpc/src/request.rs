//! Callee-side request processing.
//!
//! The transport hands every inbound request to [`RequestHandler::handle`]
//! and sends back whatever message it returns. Failures never escape as Rust
//! errors: they become `Exception` responses carrying the error text.

use crate::context::RRefContext;
use crate::message::{
    Message, MessageType, PythonRemoteCall, RemoteRet, ScriptCall, ScriptRemoteCall, ScriptRet,
};
use crate::operator::OperatorRegistry;
use crate::udf::PayloadHandler;
use std::sync::Arc;
use tandem_types::error::TandemResult;
use tandem_types::ids::{ForkId, RRefId};
use tandem_types::value::{Stack, Value};
use tracing::{debug, warn};

/// Executes requests addressed to this worker.
pub struct RequestHandler {
    ctx: Arc<RRefContext>,
    operators: Arc<OperatorRegistry>,
    payloads: Arc<dyn PayloadHandler>,
}

impl RequestHandler {
    pub fn new(
        ctx: Arc<RRefContext>,
        operators: Arc<OperatorRegistry>,
        payloads: Arc<dyn PayloadHandler>,
    ) -> Self {
        Self {
            ctx,
            operators,
            payloads,
        }
    }

    /// Process one request and produce its response. The response carries
    /// the request's correlation id.
    pub fn handle(&self, request: &Message) -> Message {
        let mut response = match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => Message::exception(e.to_string()),
        };
        if response.is_exception() {
            debug!(
                request = %request.msg_type,
                error = %response.payload_text(),
                "Request failed"
            );
        }
        response.id = request.id;
        response
    }

    fn dispatch(&self, request: &Message) -> TandemResult<Message> {
        match request.msg_type {
            MessageType::ScriptCall => {
                let call = ScriptCall::from_message(request)?;
                match self.run_builtin(&call.schema, call.stack) {
                    Ok(value) => ScriptRet::new(value).to_message(),
                    Err(text) => Ok(Message::exception(text)),
                }
            }
            MessageType::PythonCall => match self.payloads.run(&request.payload) {
                Ok(value) => self.payloads.serialize_result(&value),
                Err(text) => Ok(Message::exception(text)),
            },
            MessageType::ScriptRemoteCall => {
                let call = ScriptRemoteCall::from_message(request)?;
                let result = self.run_builtin(&call.schema, call.stack);
                self.accept_fork(call.rref_id, call.fork_id, result)
            }
            MessageType::PythonRemoteCall => {
                let call = PythonRemoteCall::from_message(request)?;
                let result = self.payloads.run(&call.udf);
                self.accept_fork(call.rref_id, call.fork_id, result)
            }
            other => {
                warn!(msg_type = %other, "Received a response type as a request");
                Ok(Message::exception(format!("unexpected request type {other}")))
            }
        }
    }

    fn run_builtin(&self, schema: &str, stack: Stack) -> Result<Value, String> {
        let op = self
            .operators
            .by_schema(schema)
            .ok_or_else(|| format!("Unknown builtin operator schema: {schema}"))?;
        op.run(stack)
    }

    /// Store the result behind an owner handle and acknowledge the caller's
    /// fork. A failed computation is stored as well and reported back as an
    /// exception.
    fn accept_fork(
        &self,
        rref_id: RRefId,
        fork_id: ForkId,
        result: Result<Value, String>,
    ) -> TandemResult<Message> {
        let owner = self.ctx.get_or_create_owner_rref(rref_id);
        match result {
            Ok(value) => owner.set_value(value),
            Err(text) => {
                owner.set_error(text.clone());
                return Ok(Message::exception(text));
            }
        }
        self.ctx.add_fork_of_owner(rref_id, fork_id);
        debug!(rref = %rref_id, fork = %fork_id, "Accepted user fork");
        RemoteRet::new(fork_id.created_on(), rref_id, fork_id).to_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udf::{serialize_call, UdfRegistry};
    use tandem_types::ids::{GloballyUniqueId, WorkerId};

    fn handler() -> (RequestHandler, Arc<RRefContext>, Arc<UdfRegistry>) {
        let ctx = RRefContext::new(WorkerId(2));
        let udfs = Arc::new(UdfRegistry::new());
        udfs.register("sum", |args| {
            Ok(Value::Int(args.iter().filter_map(Value::as_int).sum()))
        });
        let handler = RequestHandler::new(
            ctx.clone(),
            Arc::new(OperatorRegistry::with_builtins()),
            udfs.clone(),
        );
        (handler, ctx, udfs)
    }

    fn ids() -> (RRefId, ForkId) {
        (
            RRefId(GloballyUniqueId::new(WorkerId(1), 0)),
            ForkId(GloballyUniqueId::new(WorkerId(1), 1)),
        )
    }

    #[test]
    fn test_script_call_returns_value() {
        let (h, _, _) = handler();
        let mut request = ScriptCall::new("aten::add(int a, int b) -> int", vec![Value::Int(2), Value::Int(3)])
            .to_message()
            .unwrap();
        request.id = 9;
        let response = h.handle(&request);
        assert_eq!(response.id, 9);
        assert_eq!(ScriptRet::from_message(&response).unwrap().value, Value::Int(5));
    }

    #[test]
    fn test_overflowing_float_result_returns_infinity() {
        let (h, _, udfs) = handler();
        let request = ScriptCall::new(
            "aten::mul(float a, float b) -> float",
            vec![Value::Float(1e308), Value::Float(10.0)],
        )
        .to_message()
        .unwrap();
        let response = h.handle(&request);
        assert_eq!(
            crate::functions::decode_response(&response, udfs.as_ref()).unwrap(),
            Value::Float(f64::INFINITY)
        );
    }

    #[test]
    fn test_oversized_list_is_an_exception() {
        let (h, _, _) = handler();
        let request = ScriptCall::new(
            "aten::ones(int size, float fill=1.0) -> list",
            vec![Value::Int(10_000_000_000), Value::Float(1.0)],
        )
        .to_message()
        .unwrap();
        let response = h.handle(&request);
        assert!(response.is_exception());
        assert!(response.payload_text().contains("exceeds"), "{}", response.payload_text());
    }

    #[test]
    fn test_unknown_schema_is_an_exception() {
        let (h, _, _) = handler();
        let request = ScriptCall::new("aten::nope() -> int", vec![]).to_message().unwrap();
        let response = h.handle(&request);
        assert!(response.is_exception());
        assert!(response.payload_text().contains("aten::nope"));
    }

    #[test]
    fn test_python_call() {
        let (h, _, udfs) = handler();
        let payload = serialize_call("sum", vec![Value::Int(1), Value::Int(2)]).unwrap();
        let response = h.handle(&Message::new(payload, vec![], MessageType::PythonCall));
        assert_eq!(udfs.deserialize_result(&response).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_remote_call_creates_owner_and_accepts_fork() {
        let (h, ctx, _) = handler();
        let (rref_id, fork_id) = ids();
        let request = ScriptRemoteCall::new("aten::neg(int a) -> int", vec![Value::Int(4)], rref_id, fork_id)
            .to_message()
            .unwrap();
        let response = h.handle(&request);
        let accepted = RemoteRet::from_message(&response).unwrap();
        assert_eq!(accepted, RemoteRet::new(WorkerId(1), rref_id, fork_id));

        let owner = ctx.owner_rref(rref_id).unwrap();
        assert_eq!(owner.owner(), WorkerId(2));
        assert_eq!(owner.value(), Some(Ok(Value::Int(-4))));
        assert_eq!(ctx.forks_of(rref_id), vec![fork_id]);
    }

    #[test]
    fn test_failed_remote_call_reports_exception() {
        let (h, ctx, _) = handler();
        let (rref_id, fork_id) = ids();
        let payload = serialize_call("missing", vec![]).unwrap();
        let request = PythonRemoteCall::new(payload, rref_id, fork_id)
            .to_message()
            .unwrap();
        let response = h.handle(&request);
        assert!(response.is_exception());
        assert!(ctx.forks_of(rref_id).is_empty());
        assert!(matches!(ctx.owner_rref(rref_id).unwrap().value(), Some(Err(_))));
    }

    #[test]
    fn test_response_type_as_request() {
        let (h, _, _) = handler();
        let response = h.handle(&ScriptRet::new(Value::None).to_message().unwrap());
        assert!(response.payload_text().contains("unexpected request type SCRIPT_RET"));
    }

    #[test]
    fn test_malformed_payload_is_an_exception() {
        let (h, _, _) = handler();
        let response = h.handle(&Message::new(b"{".to_vec(), vec![], MessageType::ScriptCall));
        assert!(response.is_exception());
        assert!(response.payload_text().starts_with("Serialization error"));
    }
}
