//! Built-in operators and signature matching.
//!
//! Several operators may share one name (`aten::add` exists for ints, floats
//! and strings). A call is matched against each candidate in registration
//! order; the first signature the arguments bind to wins.

use std::collections::HashMap;
use std::sync::Arc;
use tandem_types::config::DEFAULT_MAX_MESSAGE_SIZE;
use tandem_types::error::{TandemError, TandemResult};
use tandem_types::schema::{ArgKind, Argument, Signature};
use tandem_types::value::{Stack, Value};
use tracing::debug;

/// Namespace that holds the built-in operators.
pub const BUILTIN_NAMESPACE: &str = "aten";

/// Largest list a built-in may allocate. A float list element takes at least
/// 28 bytes of JSON, so anything longer could not fit in a default-sized
/// frame anyway.
pub const MAX_BUILTIN_LIST_LEN: i64 = (DEFAULT_MAX_MESSAGE_SIZE / 28) as i64;

type OperatorFn = dyn Fn(Stack) -> Result<Value, String> + Send + Sync;

/// A built-in operation: a signature plus the function that runs it on a
/// bound stack.
pub struct Operator {
    signature: Signature,
    schema: String,
    func: Box<OperatorFn>,
}

impl Operator {
    pub fn new<F>(signature: Signature, func: F) -> Self
    where
        F: Fn(Stack) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            schema: signature.schema(),
            signature,
            func: Box::new(func),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Run the operator on a stack produced by [`bind`].
    pub fn run(&self, stack: Stack) -> Result<Value, String> {
        if stack.len() != self.signature.arguments.len() {
            return Err(format!(
                "{} expects {} arguments, got {}",
                self.schema,
                self.signature.arguments.len(),
                stack.len()
            ));
        }
        (self.func)(stack)
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Operator").field(&self.schema).finish()
    }
}

/// Bind call arguments to a signature's parameters.
///
/// Positional arguments fill parameters left to right; keyword arguments
/// fill the rest by name; declared defaults cover what remains. Returns the
/// flat argument stack, or the reason binding failed.
pub fn bind(
    signature: &Signature,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<Stack, String> {
    let params = &signature.arguments;
    if args.len() > params.len() {
        return Err(format!(
            "expected at most {} positional arguments, got {}",
            params.len(),
            args.len()
        ));
    }
    for (name, _) in kwargs {
        match params.iter().position(|p| &p.name == name) {
            None => return Err(format!("unknown keyword argument '{name}'")),
            Some(idx) if idx < args.len() => {
                return Err(format!("argument '{name}' given positionally and by keyword"))
            }
            Some(_) => {}
        }
    }

    let mut stack = Vec::with_capacity(params.len());
    for (idx, param) in params.iter().enumerate() {
        let supplied = args
            .get(idx)
            .or_else(|| kwargs.iter().find(|(k, _)| k == &param.name).map(|(_, v)| v));
        let value = match (supplied, &param.default) {
            (Some(v), _) => v,
            (None, Some(default)) => default,
            (None, None) => return Err(format!("missing argument '{}'", param.name)),
        };
        let bound = param.kind.coerce(value).ok_or_else(|| {
            format!(
                "expected {} for argument '{}', got {}",
                param.kind,
                param.name,
                value.kind_name()
            )
        })?;
        stack.push(bound);
    }
    Ok(stack)
}

/// Registered built-in operators, in registration order.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: Vec<Arc<Operator>>,
    by_name: HashMap<String, Vec<usize>>,
    by_schema: HashMap<String, usize>,
}

impl OperatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the standard built-in operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    /// Register an operator. Returns `false` if an operator with the same
    /// schema is already registered; the existing one is kept.
    pub fn register(&mut self, operator: Operator) -> bool {
        if self.by_schema.contains_key(operator.schema()) {
            return false;
        }
        let idx = self.operators.len();
        self.by_schema.insert(operator.schema().to_string(), idx);
        self.by_name
            .entry(operator.signature().name.clone())
            .or_default()
            .push(idx);
        self.operators.push(Arc::new(operator));
        true
    }

    /// All operators registered under a qualified name, in registration order.
    pub fn operators_for(&self, name: &str) -> Vec<Arc<Operator>> {
        self.by_name
            .get(name)
            .map(|idxs| idxs.iter().map(|&i| self.operators[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Look up an operator by its exact schema string.
    pub fn by_schema(&self, schema: &str) -> Option<Arc<Operator>> {
        self.by_schema.get(schema).map(|&i| self.operators[i].clone())
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Find the built-in operator that accepts the given arguments.
    ///
    /// Unqualified names are looked up in the built-in namespace; names in
    /// any other namespace never match.
    pub fn match_builtin(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> TandemResult<(Arc<Operator>, Stack)> {
        let qualified = qualify(name);
        let is_builtin = qualified
            .split_once("::")
            .is_some_and(|(ns, _)| ns == BUILTIN_NAMESPACE);
        if is_builtin {
            for op in self.operators_for(&qualified) {
                match bind(op.signature(), args, kwargs) {
                    Ok(stack) => return Ok((op, stack)),
                    Err(reason) => {
                        debug!(
                            schema = %op.schema(),
                            reason = %reason,
                            "Couldn't match schema to call arguments"
                        );
                    }
                }
            }
        }
        Err(TandemError::NoMatchingOperator {
            name: name.to_string(),
            args: args.to_vec(),
            kwargs: kwargs.to_vec(),
        })
    }
}

fn qualify(name: &str) -> String {
    if name.contains("::") {
        name.to_string()
    } else {
        format!("{BUILTIN_NAMESPACE}::{name}")
    }
}

// ---------------------------------------------------------------------------
// Standard built-ins
// ---------------------------------------------------------------------------

fn sig(name: &str, params: &[(&str, ArgKind)], returns: ArgKind) -> Signature {
    Signature::new(
        format!("{BUILTIN_NAMESPACE}::{name}"),
        params
            .iter()
            .map(|(n, k)| Argument::required(*n, *k))
            .collect(),
        returns,
    )
}

fn int_binary(
    registry: &mut OperatorRegistry,
    name: &str,
    f: fn(i64, i64) -> Option<i64>,
) {
    let op = Operator::new(
        sig(name, &[("a", ArgKind::Int), ("b", ArgKind::Int)], ArgKind::Int),
        move |stack| match (stack[0].as_int(), stack[1].as_int()) {
            (Some(a), Some(b)) => f(a, b).map(Value::Int).ok_or_else(|| "integer overflow".to_string()),
            _ => Err("expected two ints".to_string()),
        },
    );
    registry.register(op);
}

fn float_binary(registry: &mut OperatorRegistry, name: &str, f: fn(f64, f64) -> f64) {
    let op = Operator::new(
        sig(
            name,
            &[("a", ArgKind::Float), ("b", ArgKind::Float)],
            ArgKind::Float,
        ),
        move |stack| match (stack[0].as_float(), stack[1].as_float()) {
            (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
            _ => Err("expected two floats".to_string()),
        },
    );
    registry.register(op);
}

fn register_builtins(registry: &mut OperatorRegistry) {
    int_binary(registry, "add", i64::checked_add);
    float_binary(registry, "add", |a, b| a + b);
    registry.register(Operator::new(
        sig("add", &[("a", ArgKind::Str), ("b", ArgKind::Str)], ArgKind::Str),
        |stack| match (stack[0].as_str(), stack[1].as_str()) {
            (Some(a), Some(b)) => Ok(Value::Str(format!("{a}{b}"))),
            _ => Err("expected two strings".to_string()),
        },
    ));
    int_binary(registry, "sub", i64::checked_sub);
    float_binary(registry, "sub", |a, b| a - b);
    int_binary(registry, "mul", i64::checked_mul);
    float_binary(registry, "mul", |a, b| a * b);

    registry.register(Operator::new(
        sig(
            "div",
            &[("a", ArgKind::Float), ("b", ArgKind::Float)],
            ArgKind::Float,
        ),
        |stack| match (stack[0].as_float(), stack[1].as_float()) {
            (Some(_), Some(b)) if b == 0.0 => Err("ZeroDivisionError: float division by zero".to_string()),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err("expected two floats".to_string()),
        },
    ));
    registry.register(Operator::new(
        sig("neg", &[("a", ArgKind::Int)], ArgKind::Int),
        |stack| {
            stack[0]
                .as_int()
                .and_then(i64::checked_neg)
                .map(Value::Int)
                .ok_or_else(|| "integer overflow".to_string())
        },
    ));
    registry.register(Operator::new(
        sig("neg", &[("a", ArgKind::Float)], ArgKind::Float),
        |stack| {
            stack[0]
                .as_float()
                .map(|a| Value::Float(-a))
                .ok_or_else(|| "expected a float".to_string())
        },
    ));
    registry.register(Operator::new(
        Signature::new(
            format!("{BUILTIN_NAMESPACE}::ones"),
            vec![
                Argument::required("size", ArgKind::Int),
                Argument::optional("fill", ArgKind::Float, Value::Float(1.0)),
            ],
            ArgKind::List,
        ),
        |stack| {
            let size = stack[0].as_int().unwrap_or(-1);
            let fill = stack[1].as_float().unwrap_or(1.0);
            if size < 0 {
                return Err(format!("negative size {size}"));
            }
            if size > MAX_BUILTIN_LIST_LEN {
                return Err(format!(
                    "size {size} exceeds the builtin list limit of {MAX_BUILTIN_LIST_LEN}"
                ));
            }
            Ok(Value::List(vec![Value::Float(fill); size as usize]))
        },
    ));
    registry.register(Operator::new(
        sig("len", &[("a", ArgKind::List)], ArgKind::Int),
        |stack| match &stack[0] {
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            _ => Err("expected a list".to_string()),
        },
    ));
    registry.register(Operator::new(
        sig("cat", &[("a", ArgKind::List), ("b", ArgKind::List)], ArgKind::List),
        |mut stack| match (stack.pop(), stack.pop()) {
            (Some(Value::List(b)), Some(Value::List(mut a))) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            _ => Err("expected two lists".to_string()),
        },
    ));
}
