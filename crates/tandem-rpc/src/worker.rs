//! A running worker: context, registries, transport and dispatcher wired
//! together.

use crate::context::RRefContext;
use crate::error::{RpcResult, WireError};
use crate::functions::RpcDispatcher;
use crate::operator::OperatorRegistry;
use crate::peer::TcpAgent;
use crate::request::RequestHandler;
use crate::udf::PayloadHandler;
use std::net::SocketAddr;
use std::sync::Arc;
use tandem_types::config::RpcConfig;
use tandem_types::ids::{WorkerId, WorkerInfo};
use tokio::task::JoinHandle;
use tracing::info;

pub struct Worker {
    agent: Arc<TcpAgent>,
    dispatcher: RpcDispatcher,
    ctx: Arc<RRefContext>,
    accept_task: JoinHandle<()>,
}

impl Worker {
    /// Start serving with `config`. Requests are executed against
    /// `operators` and `payloads`; calls made through [`Worker::dispatcher`]
    /// use the same registries to match and decode.
    pub async fn start(
        config: &RpcConfig,
        operators: Arc<OperatorRegistry>,
        payloads: Arc<dyn PayloadHandler>,
    ) -> RpcResult<Self> {
        let ctx = RRefContext::new(WorkerId(config.worker_id));
        let handler = Arc::new(RequestHandler::new(
            ctx.clone(),
            operators.clone(),
            payloads.clone(),
        ));
        let (agent, accept_task) = TcpAgent::start(config, handler).await?;
        let dispatcher = RpcDispatcher::new(agent.clone(), ctx.clone(), operators, payloads);
        Ok(Self {
            agent,
            dispatcher,
            ctx,
            accept_task,
        })
    }

    pub fn dispatcher(&self) -> &RpcDispatcher {
        &self.dispatcher
    }

    pub fn context(&self) -> &Arc<RRefContext> {
        &self.ctx
    }

    pub fn agent(&self) -> &Arc<TcpAgent> {
        &self.agent
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.agent.local_addr()
    }

    /// Look up a known worker by name.
    pub fn resolve(&self, name: &str) -> RpcResult<WorkerInfo> {
        self.agent
            .registry()
            .get_worker(name)
            .map(|entry| entry.info)
            .ok_or_else(|| WireError::UnknownWorker(name.to_string()).into())
    }

    /// Stop serving, fail outstanding calls and release the reference
    /// registry. Returns the number of user references that were never
    /// accepted.
    pub fn shutdown(self) -> usize {
        self.agent.shutdown();
        self.accept_task.abort();
        let pending = self.ctx.shutdown();
        info!(worker = %self.ctx.worker_id(), pending, "Worker stopped");
        pending
    }
}
