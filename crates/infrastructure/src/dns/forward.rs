use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use tracing::debug;

use conduit_dns_application::context::QueryContext;
use conduit_dns_application::executable::{ChainNode, Executable};
use conduit_dns_domain::DnsError;

use super::racing::exchange_parallel;
use super::upstream::Upstream;

/// Terminal node of the graph: races the configured upstreams and installs
/// the winning response. Racing tasks are spawned on the shared tracker so
/// shutdown waits for them, and they inherit the request's cancellation.
pub struct ForwardPlugin {
    upstreams: Vec<Arc<dyn Upstream>>,
    tracker: TaskTracker,
}

impl ForwardPlugin {
    pub fn new(upstreams: Vec<Arc<dyn Upstream>>, tracker: TaskTracker) -> Result<Self, DnsError> {
        if upstreams.is_empty() {
            return Err(DnsError::Config("forward: no upstream configured".to_string()));
        }
        Ok(Self { upstreams, tracker })
    }
}

#[async_trait]
impl Executable for ForwardPlugin {
    async fn exec(
        &self,
        qctx: &mut QueryContext,
        _next: Option<&Arc<ChainNode>>,
    ) -> Result<(), DnsError> {
        let reply = exchange_parallel(
            qctx.query(),
            &self.upstreams,
            qctx.cancellation(),
            &self.tracker,
        )
        .await?;
        debug!(
            query = %qctx.summary(),
            rcode = ?reply.msg.response_code(),
            answers = reply.msg.answers().len(),
            "forward resolved"
        );
        qctx.set_response(reply.msg);
        Ok(())
    }
}
