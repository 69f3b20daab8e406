//! Clap CLI definitions for tandem.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tandem_types::value::Value;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tandem serve                         Serve requests until Ctrl+C
  tandem call ps add 2 3               Run aten::add on worker `ps`
  tandem call ps ones 4 --kw fill=0.5  Pass a keyword argument
  tandem remote ps mul 6 7             Leave the result on `ps`, print the handle

Worker identity comes from the config file; TANDEM_WORKER_ID and
TANDEM_WORKER_NAME override it. `call` and `remote` run as a separate
worker whose id must differ from every configured worker; pass
--worker-id or let tandem pick the lowest free one.";

/// Tandem: distributed call dispatch between workers.
#[derive(Parser)]
#[command(name = "tandem", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a worker and serve requests until interrupted.
    Serve,
    /// Invoke a built-in operator on a worker and print its value.
    Call(CallArgs),
    /// Invoke a built-in operator on a worker, leaving the value there.
    Remote(CallArgs),
}

#[derive(clap::Args)]
pub struct CallArgs {
    /// Destination worker name.
    pub dst: String,
    /// Operator name, e.g. `add` or `aten::add`.
    pub op: String,
    /// Positional arguments.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
    /// Keyword argument as `name=value` (repeatable).
    #[arg(long = "kw", value_name = "NAME=VALUE")]
    pub kwargs: Vec<String>,
    /// Worker id for this short-lived caller. Defaults to the lowest id not
    /// used by the configured worker or its peers.
    #[arg(long)]
    pub worker_id: Option<u16>,
}

impl CallArgs {
    pub fn values(&self) -> Vec<Value> {
        self.args.iter().map(|a| parse_value(a)).collect()
    }

    pub fn keyword_values(&self) -> Result<Vec<(String, Value)>, String> {
        self.kwargs
            .iter()
            .map(|kv| {
                let (name, raw) = kv
                    .split_once('=')
                    .ok_or_else(|| format!("keyword argument '{kv}' is not NAME=VALUE"))?;
                Ok((name.to_string(), parse_value(raw)))
            })
            .collect()
    }
}

/// Pick the caller's worker id: `requested` if it is not `taken`, otherwise
/// the lowest id nobody in `taken` uses.
pub fn caller_worker_id(requested: Option<u16>, taken: &[u16]) -> Result<u16, String> {
    match requested {
        Some(id) if taken.contains(&id) => Err(format!(
            "worker id {id} belongs to a configured worker; pick another --worker-id"
        )),
        Some(id) => Ok(id),
        None => (0..=u16::MAX)
            .find(|id| !taken.contains(id))
            .ok_or_else(|| "no free worker id left".to_string()),
    }
}

/// Interpret a command-line argument: int, then float, then bool, else string.
pub fn parse_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Str(raw.to_string()),
    }
}
