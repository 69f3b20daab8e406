//! Tandem CLI: run a worker, or call one.
//!
//! `call` and `remote` start a short-lived worker of their own (listening on
//! an ephemeral port) so the destination has somewhere to send responses.
//! It takes a worker id of its own so the references it mints cannot collide
//! with those of a configured worker.

mod cli;

use crate::cli::*;
use clap::Parser;
use std::sync::Arc;
use tandem_rpc::config::load_config;
use tandem_rpc::{OperatorRegistry, RpcResult, UdfRegistry, UserState, Worker};
use tandem_types::config::{PeerConfig, RpcConfig};

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn start_worker(config: &RpcConfig) -> Worker {
    let operators = Arc::new(OperatorRegistry::with_builtins());
    match Worker::start(config, operators, Arc::new(UdfRegistry::new())).await {
        Ok(worker) => worker,
        Err(e) => {
            eprintln!("Failed to start worker {}: {e}", config.worker_info());
            std::process::exit(1);
        }
    }
}

async fn cmd_serve(config: RpcConfig) {
    let worker = start_worker(&config).await;
    println!(
        "Worker {} listening on {}",
        config.worker_info(),
        worker.local_addr()
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to wait for Ctrl+C: {e}");
    }
    let pending = worker.shutdown();
    if pending > 0 {
        eprintln!("{pending} remote references were never accepted");
    }
}

async fn cmd_call(mut config: RpcConfig, args: CallArgs, remote: bool) {
    let mut taken: Vec<u16> = config.peers.iter().map(|p| p.id).collect();
    taken.push(config.worker_id);
    let id = match caller_worker_id(args.worker_id, &taken) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    // The configured worker becomes a peer, so `call` can target it by name.
    if !config.peers.iter().any(|p| p.name == config.worker_name) {
        config.peers.push(PeerConfig {
            name: config.worker_name.clone(),
            id: config.worker_id,
            addr: config.listen_addr,
        });
    }
    config.worker_id = id;
    config.worker_name = format!("tandem-cli-{id}");
    config.listen_addr.set_port(0);
    let worker = start_worker(&config).await;
    let result = run_call(&worker, &args, remote).await;
    worker.shutdown();
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run_call(worker: &Worker, args: &CallArgs, remote: bool) -> RpcResult<()> {
    let dst = worker.resolve(&args.dst)?;
    let values = args.values();
    let kwargs = match args.keyword_values() {
        Ok(kwargs) => kwargs,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    let dispatcher = worker.dispatcher();

    if !remote {
        let value = dispatcher
            .call_builtin(&dst, &args.op, &values, &kwargs)
            .await?;
        println!("{value}");
        return Ok(());
    }

    let user = dispatcher.remote_builtin(&dst, &args.op, &values, &kwargs)?;
    let settled = user.wait_settled().await;
    let state = match user.state() {
        UserState::Pending => "pending".to_string(),
        UserState::Confirmed => "confirmed".to_string(),
        UserState::Failed(text) => format!("failed: {text}"),
        UserState::Disconnected(lost) => format!("disconnected: {lost}"),
    };
    let handle = serde_json::json!({
        "rref_id": user.rref_id(),
        "fork_id": user.fork_id(),
        "owner": dst.to_string(),
        "state": state,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&handle).unwrap_or_else(|_| handle.to_string())
    );
    settled?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Call(args) => cmd_call(config, args, false).await,
        Commands::Remote(args) => cmd_call(config, args, true).await,
    }
}
