//! Opaque-payload calls.
//!
//! The dispatcher never looks inside an opaque payload: the caller serializes
//! a call into bytes, the callee's [`PayloadHandler`] runs it, and the caller
//! hands the response back to the same handler to decode.
//!
//! [`UdfRegistry`] is the handler shipped with tandem: payloads are JSON
//! `{"function": name, "args": [...]}` naming a function registered on the
//! callee.

use crate::message::{value_from_message, value_message, Message, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tandem_types::error::{TandemError, TandemResult};
use tandem_types::value::Value;

/// Runs and decodes opaque payloads.
pub trait PayloadHandler: Send + Sync {
    /// Callee side: execute a serialized call.
    fn run(&self, payload: &[u8]) -> Result<Value, String>;

    /// Callee side: encode a result as a `PythonRet` message.
    fn serialize_result(&self, value: &Value) -> TandemResult<Message>;

    /// Caller side: decode a `PythonRet` message into the call's result.
    fn deserialize_result(&self, message: &Message) -> TandemResult<Value>;
}

#[derive(Serialize, Deserialize)]
struct UdfCall {
    function: String,
    args: Vec<Value>,
}

/// Serialize a call to the function registered as `function` on the callee.
pub fn serialize_call(function: &str, args: Vec<Value>) -> TandemResult<Vec<u8>> {
    Ok(serde_json::to_vec(&UdfCall {
        function: function.to_string(),
        args,
    })?)
}

type UdfFn = dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync;

/// Functions callable through opaque payloads, by name.
#[derive(Default)]
pub struct UdfRegistry {
    functions: RwLock<HashMap<String, Arc<UdfFn>>>,
}

impl UdfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a function.
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        functions.insert(name.into(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        functions.contains_key(name)
    }
}

impl PayloadHandler for UdfRegistry {
    fn run(&self, payload: &[u8]) -> Result<Value, String> {
        let call: UdfCall =
            serde_json::from_slice(payload).map_err(|e| format!("malformed call payload: {e}"))?;
        let f = {
            let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
            functions.get(&call.function).cloned()
        };
        match f {
            Some(f) => f(call.args),
            None => Err(format!("unknown function '{}'", call.function)),
        }
    }

    fn serialize_result(&self, value: &Value) -> TandemResult<Message> {
        value_message(value, MessageType::PythonRet)
    }

    fn deserialize_result(&self, message: &Message) -> TandemResult<Value> {
        if message.msg_type != MessageType::PythonRet {
            return Err(TandemError::Serialization(format!(
                "expected a {} message, got {}",
                MessageType::PythonRet,
                message.msg_type
            )));
        }
        value_from_message(message)
    }
}
