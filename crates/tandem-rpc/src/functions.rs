//! Caller-side dispatch.
//!
//! [`RpcDispatcher`] offers the four call shapes:
//!
//! | call                  | request              | returns           |
//! |-----------------------|----------------------|-------------------|
//! | [`rpc_builtin`]       | `ScriptCall`         | `FutureMessage`   |
//! | [`remote_builtin`]    | `ScriptRemoteCall`   | pending `UserRRef`|
//! | [`rpc_udf`]           | `PythonCall`         | `FutureMessage`   |
//! | [`remote_udf`]        | `PythonRemoteCall`   | pending `UserRRef`|
//!
//! [`decode_response`] turns a completed response into the call's value, and
//! [`finish_accept_user_rref`] settles a user handle once the owner answers a
//! reference-producing call. A call whose connection fails never gets a
//! response; it surfaces as [`RpcError::Wire`] instead of a remote error.
//!
//! [`rpc_builtin`]: RpcDispatcher::rpc_builtin
//! [`remote_builtin`]: RpcDispatcher::remote_builtin
//! [`rpc_udf`]: RpcDispatcher::rpc_udf
//! [`remote_udf`]: RpcDispatcher::remote_udf

use crate::agent::RpcAgent;
use crate::context::RRefContext;
use crate::error::{ConnectionLost, RpcError, RpcResult};
use crate::future::{FutureMessage, Response};
use crate::message::{
    Message, MessageType, PythonRemoteCall, RemoteRet, ScriptCall, ScriptRemoteCall, ScriptRet,
};
use crate::operator::OperatorRegistry;
use crate::rref::UserRRef;
use crate::udf::PayloadHandler;
use std::sync::Arc;
use tandem_types::error::TandemError;
use tandem_types::ids::WorkerInfo;
use tandem_types::value::Value;
use tracing::debug;

/// Decode a response message into the call's result.
///
/// `Exception` responses become [`TandemError::RemoteError`]. A response type
/// this worker cannot interpret yields the fatal
/// [`TandemError::UnrecognizedResponseType`].
pub fn decode_response(message: &Message, payloads: &dyn PayloadHandler) -> RpcResult<Value> {
    match message.msg_type {
        MessageType::ScriptRet => Ok(ScriptRet::from_message(message)?.value),
        MessageType::PythonRet => Ok(payloads.deserialize_result(message)?),
        MessageType::Exception => Err(TandemError::RemoteError(message.payload_text()).into()),
        other => Err(TandemError::UnrecognizedResponseType(other.to_string()).into()),
    }
}

/// Settle `user` from the response to the call that created it.
///
/// On an `Exception` response the handle fails and the registry is left
/// untouched. Otherwise the response must be an acceptance addressed to this
/// worker for a pending fork.
///
/// # Panics
///
/// If the acceptance cannot be decoded, names another worker, or matches no
/// pending fork. Each means messages were misrouted or duplicated and the
/// reference bookkeeping is no longer consistent.
pub fn finish_accept_user_rref(ctx: &RRefContext, user: &UserRRef, message: &Message) {
    if message.is_exception() {
        let text = message.payload_text();
        debug!(rref = %user.rref_id(), error = %text, "Remote call for user RRef failed");
        user.fail(text);
        return;
    }
    let accepted = match RemoteRet::from_message(message) {
        Ok(rr) => rr,
        Err(e) => panic!(
            "Worker {} could not decode the acceptance for {}: {e}",
            ctx.worker_id(),
            user.rref_id()
        ),
    };
    assert_eq!(
        ctx.worker_id(),
        accepted.owner,
        "Worker {} received a REMOTE_RET message of a different owner {}",
        ctx.worker_id(),
        accepted.owner
    );
    ctx.finish_user_rref(accepted.rref_id, accepted.fork_id);
}

/// Issues calls to other workers on behalf of this one.
#[derive(Clone)]
pub struct RpcDispatcher {
    agent: Arc<dyn RpcAgent>,
    ctx: Arc<RRefContext>,
    operators: Arc<OperatorRegistry>,
    payloads: Arc<dyn PayloadHandler>,
}

impl RpcDispatcher {
    pub fn new(
        agent: Arc<dyn RpcAgent>,
        ctx: Arc<RRefContext>,
        operators: Arc<OperatorRegistry>,
        payloads: Arc<dyn PayloadHandler>,
    ) -> Self {
        Self {
            agent,
            ctx,
            operators,
            payloads,
        }
    }

    pub fn context(&self) -> &Arc<RRefContext> {
        &self.ctx
    }

    pub fn operators(&self) -> &Arc<OperatorRegistry> {
        &self.operators
    }

    /// Invoke a built-in operator on `dst`.
    ///
    /// Fails synchronously with [`TandemError::NoMatchingOperator`] (and sends
    /// nothing) if no built-in accepts the arguments.
    pub fn rpc_builtin(
        &self,
        dst: &WorkerInfo,
        op_name: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> RpcResult<Arc<FutureMessage>> {
        let (op, stack) = self.operators.match_builtin(op_name, args, kwargs)?;
        let message = ScriptCall::new(op.schema(), stack).to_message()?;
        Ok(self.agent.send(dst, message)?)
    }

    /// Invoke a built-in operator on `dst`, leaving the result there.
    ///
    /// Returns a user handle in the `Pending` state; it confirms once `dst`
    /// accepts the fork. The acceptance is never processed before this
    /// returns, even when the transport answers immediately.
    pub fn remote_builtin(
        &self,
        dst: &WorkerInfo,
        op_name: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> RpcResult<UserRRef> {
        let (op, stack) = self.operators.match_builtin(op_name, args, kwargs)?;
        self.check_not_self(dst)?;
        let user = self.ctx.create_user_rref(dst.id);
        let message =
            ScriptRemoteCall::new(op.schema(), stack, user.rref_id(), user.fork_id()).to_message()?;
        self.send_for_user(dst, message, &user)?;
        Ok(user)
    }

    /// Invoke a pre-serialized call on `dst`.
    pub fn rpc_udf(&self, dst: &WorkerInfo, payload: Vec<u8>) -> RpcResult<Arc<FutureMessage>> {
        let message = Message::new(payload, Vec::new(), MessageType::PythonCall);
        Ok(self.agent.send(dst, message)?)
    }

    /// Invoke a pre-serialized call on `dst`, leaving the result there.
    pub fn remote_udf(&self, dst: &WorkerInfo, payload: Vec<u8>) -> RpcResult<UserRRef> {
        self.check_not_self(dst)?;
        let user = self.ctx.create_user_rref(dst.id);
        let message = PythonRemoteCall::new(payload, user.rref_id(), user.fork_id()).to_message()?;
        self.send_for_user(dst, message, &user)?;
        Ok(user)
    }

    /// Decode a completed call with this dispatcher's payload handler.
    pub fn to_value(&self, response: &Response) -> RpcResult<Value> {
        match response {
            Ok(message) => decode_response(message, self.payloads.as_ref()),
            Err(lost) => Err(RpcError::from(lost.clone())),
        }
    }

    /// Invoke a built-in and wait for its value.
    pub async fn call_builtin(
        &self,
        dst: &WorkerInfo,
        op_name: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> RpcResult<Value> {
        let fut = self.rpc_builtin(dst, op_name, args, kwargs)?;
        let response = fut.wait().await;
        self.to_value(&response)
    }

    /// Invoke a pre-serialized call and wait for its value.
    pub async fn call_udf(&self, dst: &WorkerInfo, payload: Vec<u8>) -> RpcResult<Value> {
        let fut = self.rpc_udf(dst, payload)?;
        let response = fut.wait().await;
        self.to_value(&response)
    }

    fn check_not_self(&self, dst: &WorkerInfo) -> RpcResult<()> {
        if dst.id == self.ctx.worker_id() {
            return Err(TandemError::SelfReferenceUnsupported(dst.id).into());
        }
        Ok(())
    }

    fn send_for_user(&self, dst: &WorkerInfo, message: Message, user: &UserRRef) -> RpcResult<()> {
        let fut = match self.agent.send(dst, message) {
            Ok(fut) => fut,
            Err(e) => {
                self.ctx.discard_pending(user.rref_id(), user.fork_id());
                user.disconnect(ConnectionLost::new(dst.name.clone(), e.to_string()));
                return Err(e.into());
            }
        };
        let ctx = self.ctx.clone();
        let user = user.clone();
        fut.add_callback(move |response| match response {
            Ok(message) => finish_accept_user_rref(&ctx, &user, message),
            Err(lost) => {
                debug!(rref = %user.rref_id(), error = %lost, "Lost the owner of a user RRef");
                user.disconnect(lost.clone());
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::MockAgent;
    use crate::rref::UserState;
    use crate::udf::{serialize_call, UdfRegistry};
    use std::sync::Mutex;
    use tandem_types::ids::{ForkId, GloballyUniqueId, RRefId, WorkerId};

    fn w1() -> WorkerInfo {
        WorkerInfo::new("w1", WorkerId(1))
    }

    fn w2() -> WorkerInfo {
        WorkerInfo::new("w2", WorkerId(2))
    }

    fn dispatcher(agent: Arc<MockAgent>) -> RpcDispatcher {
        RpcDispatcher::new(
            agent,
            RRefContext::new(WorkerId(1)),
            Arc::new(OperatorRegistry::with_builtins()),
            Arc::new(UdfRegistry::new()),
        )
    }

    fn accept(request: &Message) -> Message {
        let (rref_id, fork_id) = match request.msg_type {
            MessageType::ScriptRemoteCall => {
                let call = ScriptRemoteCall::from_message(request).unwrap();
                (call.rref_id, call.fork_id)
            }
            _ => {
                let call = PythonRemoteCall::from_message(request).unwrap();
                (call.rref_id, call.fork_id)
            }
        };
        RemoteRet::new(fork_id.created_on(), rref_id, fork_id)
            .to_message()
            .unwrap()
    }

    #[test]
    fn test_rpc_builtin_sends_script_call() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let fut = d
            .rpc_builtin(&w2(), "add", &[Value::Int(2), Value::Int(3)], &[])
            .unwrap();
        assert!(!fut.is_completed());

        let (to, msg, _) = agent.last_sent();
        assert_eq!(to, w2());
        let call = ScriptCall::from_message(&msg).unwrap();
        assert_eq!(call.schema, "aten::add(int a, int b) -> int");
        assert_eq!(call.stack, vec![Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn test_unmatched_builtin_sends_nothing() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let err = d
            .rpc_builtin(&w2(), "add", &[Value::Int(2), Value::from("x")], &[])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::RpcError::Tandem(TandemError::NoMatchingOperator { .. })
        ));
        let err = d
            .remote_builtin(&w2(), "add", &[Value::Int(2), Value::from("x")], &[])
            .unwrap_err();
        assert!(err.to_string().contains(r#""x""#));
        assert_eq!(agent.sent_count(), 0);
        assert_eq!(d.context().pending_count(), 0);
    }

    #[test]
    fn test_remote_builtin_on_self_is_rejected() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let err = d
            .remote_builtin(&w1(), "add", &[Value::Int(1), Value::Int(1)], &[])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::RpcError::Tandem(TandemError::SelfReferenceUnsupported(WorkerId(1)))
        ));
        let payload = serialize_call("f", vec![]).unwrap();
        assert!(d.remote_udf(&w1(), payload).is_err());
        assert_eq!(agent.sent_count(), 0);
        assert_eq!(d.context().pending_count(), 0);
    }

    #[test]
    fn test_remote_builtin_pending_until_accepted() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let user = d
            .remote_builtin(&w2(), "neg", &[Value::Int(4)], &[])
            .unwrap();
        assert_eq!(user.state(), UserState::Pending);
        assert_eq!(user.owner(), WorkerId(2));
        assert!(d.context().is_pending(user.rref_id(), user.fork_id()));

        let (_, request, fut) = agent.last_sent();
        let call = ScriptRemoteCall::from_message(&request).unwrap();
        assert_eq!(call.rref_id, user.rref_id());
        assert_eq!(call.fork_id, user.fork_id());

        fut.mark_completed(accept(&request));
        assert_eq!(user.state(), UserState::Confirmed);
        assert_eq!(d.context().pending_count(), 0);
        assert_eq!(d.context().shutdown(), 0);
    }

    #[tokio::test]
    async fn test_handle_registered_before_immediate_acceptance() {
        let seen_pending = Arc::new(Mutex::new(Vec::new()));
        let ctx = RRefContext::new(WorkerId(1));
        let (seen, probe) = (seen_pending.clone(), ctx.clone());
        let agent = Arc::new(MockAgent::with_responder(w1(), move |_, request| {
            seen.lock().unwrap().push(probe.pending_count());
            Some(accept(request))
        }));
        let d = RpcDispatcher::new(
            agent,
            ctx,
            Arc::new(OperatorRegistry::with_builtins()),
            Arc::new(UdfRegistry::new()),
        );
        let user = d
            .remote_builtin(&w2(), "neg", &[Value::Int(4)], &[])
            .unwrap();
        assert_eq!(*seen_pending.lock().unwrap(), vec![1]);
        assert_eq!(user.state(), UserState::Pending);
        assert!(d.context().is_pending(user.rref_id(), user.fork_id()));

        user.wait_settled().await.unwrap();
        assert!(user.is_confirmed());
        assert_eq!(d.context().pending_count(), 0);
    }

    #[test]
    fn test_remote_exception_fails_handle_without_registry_change() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let user = d
            .remote_builtin(&w2(), "div", &[Value::Int(1), Value::Int(0)], &[])
            .unwrap();
        let (_, _, fut) = agent.last_sent();
        fut.set_error("ZeroDivisionError: float division by zero");

        assert!(matches!(
            user.state(),
            UserState::Failed(t) if t.contains("ZeroDivisionError")
        ));
        let err = user.error().unwrap();
        assert!(err.remote_text().unwrap().contains("ZeroDivisionError"));
        assert!(!err.is_transport());
        assert!(d.context().is_pending(user.rref_id(), user.fork_id()));
    }

    #[test]
    fn test_lost_connection_is_not_a_remote_error() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let user = d
            .remote_builtin(&w2(), "neg", &[Value::Int(4)], &[])
            .unwrap();
        let fut = d.rpc_builtin(&w2(), "neg", &[Value::Int(4)], &[]).unwrap();
        for (_, _, sent) in agent.sent.lock().unwrap().iter() {
            sent.mark_lost(ConnectionLost::new("w2", "connection reset"));
        }

        assert!(matches!(user.state(), UserState::Disconnected(ref l) if l.worker == "w2"));
        let err = user.error().unwrap();
        assert!(err.is_transport());
        assert!(err.remote_text().is_none());
        assert!(d.context().is_pending(user.rref_id(), user.fork_id()));

        let err = d.to_value(&fut.try_response().unwrap()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RpcError::Wire(crate::error::WireError::Lost(_))
        ));

        let exception = d.to_value(&Ok(Message::exception("boom"))).unwrap_err();
        assert_eq!(exception.remote_text(), Some("boom"));
    }

    #[test]
    #[should_panic(expected = "received a REMOTE_RET message of a different owner")]
    fn test_acceptance_for_other_owner_panics() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let user = d
            .remote_builtin(&w2(), "neg", &[Value::Int(4)], &[])
            .unwrap();
        let (_, _, fut) = agent.last_sent();
        let wrong = RemoteRet::new(WorkerId(3), user.rref_id(), user.fork_id());
        fut.mark_completed(wrong.to_message().unwrap());
    }

    #[test]
    fn test_owner_mismatch_leaves_registry_untouched() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let user = d
            .remote_builtin(&w2(), "neg", &[Value::Int(4)], &[])
            .unwrap();
        let wrong = RemoteRet::new(WorkerId(3), user.rref_id(), user.fork_id())
            .to_message()
            .unwrap();
        let ctx = d.context().clone();
        let probe = user.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            finish_accept_user_rref(&ctx, &probe, &wrong)
        }));
        assert!(result.is_err());
        assert!(d.context().is_pending(user.rref_id(), user.fork_id()));
        assert_eq!(user.state(), UserState::Pending);
    }

    #[test]
    #[should_panic(expected = "not a pending user RRef")]
    fn test_duplicate_acceptance_panics() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let user = d
            .remote_builtin(&w2(), "neg", &[Value::Int(4)], &[])
            .unwrap();
        let (_, request, fut) = agent.last_sent();
        let acceptance = accept(&request);
        fut.mark_completed(acceptance.clone());
        assert!(user.is_confirmed());
        finish_accept_user_rref(d.context(), &user, &acceptance);
    }

    #[test]
    #[should_panic(expected = "not a pending user RRef")]
    fn test_spurious_acceptance_panics() {
        let ctx = RRefContext::new(WorkerId(1));
        let user = ctx.create_user_rref(WorkerId(2));
        let spurious = RemoteRet::new(
            WorkerId(1),
            RRefId(GloballyUniqueId::new(WorkerId(1), 99)),
            ForkId(GloballyUniqueId::new(WorkerId(1), 100)),
        );
        finish_accept_user_rref(&ctx, &user, &spurious.to_message().unwrap());
    }

    #[test]
    fn test_remote_udf_carries_payload() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        let payload = serialize_call("f", vec![Value::Int(1)]).unwrap();
        let user = d.remote_udf(&w2(), payload.clone()).unwrap();

        let (_, request, fut) = agent.last_sent();
        let call = PythonRemoteCall::from_message(&request).unwrap();
        assert_eq!(call.udf, payload);
        assert_eq!(call.rref_id, user.rref_id());
        fut.mark_completed(accept(&request));
        assert!(user.is_confirmed());
    }

    #[test]
    fn test_rpc_udf_sends_python_call() {
        let agent = Arc::new(MockAgent::new(w1()));
        let d = dispatcher(agent.clone());
        d.rpc_udf(&w2(), b"blob".to_vec()).unwrap();
        let (_, msg, _) = agent.last_sent();
        assert_eq!(msg.msg_type, MessageType::PythonCall);
        assert_eq!(msg.payload, b"blob");
        assert!(msg.segments.is_empty());
    }

    #[test]
    fn test_decode_response() {
        let udfs = UdfRegistry::new();
        let ret = ScriptRet::new(Value::List(vec![Value::Int(1), Value::from("a")]))
            .to_message()
            .unwrap();
        assert_eq!(
            decode_response(&ret, &udfs).unwrap(),
            Value::List(vec![Value::Int(1), Value::from("a")])
        );

        let py = udfs.serialize_result(&Value::Float(0.5)).unwrap();
        assert_eq!(decode_response(&py, &udfs).unwrap(), Value::Float(0.5));

        let err = decode_response(&Message::exception("remote boom"), &udfs).unwrap_err();
        assert_eq!(err.remote_text(), Some("remote boom"));

        let call = ScriptCall::new("aten::neg(int a) -> int", vec![Value::Int(1)])
            .to_message()
            .unwrap();
        match decode_response(&call, &udfs).unwrap_err() {
            crate::error::RpcError::Tandem(e) => {
                assert!(e.is_fatal());
                assert!(matches!(e, TandemError::UnrecognizedResponseType(_)));
            }
            other => panic!("expected a fatal decode error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_builtin_returns_value() {
        let agent = Arc::new(MockAgent::with_responder(w1(), |_, request| {
            let call = ScriptCall::from_message(request).unwrap();
            let registry = OperatorRegistry::with_builtins();
            let op = registry.by_schema(&call.schema).unwrap();
            Some(ScriptRet::new(op.run(call.stack).unwrap()).to_message().unwrap())
        }));
        let d = dispatcher(agent);
        let v = d
            .call_builtin(&w2(), "mul", &[Value::Int(6), Value::Int(7)], &[])
            .await
            .unwrap();
        assert_eq!(v, Value::Int(42));
    }
}
