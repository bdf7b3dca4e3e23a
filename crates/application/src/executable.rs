use std::sync::Arc;

use async_trait::async_trait;

use conduit_dns_domain::DnsError;

use crate::context::QueryContext;

/// A node of the plugin graph that can run.
///
/// An implementation may short-circuit by returning without touching `next`,
/// or continue the chain with [`exec_chain`]. It must not run `next` more
/// than once.
#[async_trait]
pub trait Executable: Send + Sync {
    async fn exec(
        &self,
        qctx: &mut QueryContext,
        next: Option<&Arc<ChainNode>>,
    ) -> Result<(), DnsError>;
}

/// A predicate over the query context, used by conditional nodes.
#[async_trait]
pub trait Matcher: Send + Sync {
    async fn matches(&self, qctx: &QueryContext) -> Result<bool, DnsError>;
}

/// One link of an executable chain. Chains are built tail-first so a node's
/// `next` is fixed at construction.
pub struct ChainNode {
    plugin: Arc<dyn Executable>,
    next: Option<Arc<ChainNode>>,
}

impl ChainNode {
    pub fn new(plugin: Arc<dyn Executable>, next: Option<Arc<ChainNode>>) -> Arc<Self> {
        Arc::new(Self { plugin, next })
    }

    /// Links `plugins` into a chain ending at `tail`. Returns `tail` when
    /// `plugins` is empty.
    pub fn link(plugins: &[Arc<dyn Executable>], tail: Option<Arc<ChainNode>>) -> Option<Arc<Self>> {
        let mut next = tail;
        for plugin in plugins.iter().rev() {
            next = Some(Self::new(Arc::clone(plugin), next));
        }
        next
    }

    pub fn next(&self) -> Option<&Arc<ChainNode>> {
        self.next.as_ref()
    }
}

/// Runs the chain starting at `node`. A `None` node is the end of the chain.
pub async fn exec_chain(
    qctx: &mut QueryContext,
    node: Option<&Arc<ChainNode>>,
) -> Result<(), DnsError> {
    match node {
        Some(n) => n.plugin.exec(qctx, n.next.as_ref()).await,
        None => Ok(()),
    }
}

/// Logical AND over a list of matchers; stops at the first false or error.
pub struct AndMatcherGroup {
    matchers: Vec<Arc<dyn Matcher>>,
}

impl AndMatcherGroup {
    pub fn new(matchers: Vec<Arc<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

#[async_trait]
impl Matcher for AndMatcherGroup {
    async fn matches(&self, qctx: &QueryContext) -> Result<bool, DnsError> {
        for m in &self.matchers {
            if !m.matches(qctx).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{RequestMeta, TransportProtocol};
    use hickory_proto::op::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        tag: u32,
        order: Arc<std::sync::Mutex<Vec<u32>>>,
        stop: bool,
    }

    #[async_trait]
    impl Executable for Recorder {
        async fn exec(
            &self,
            qctx: &mut QueryContext,
            next: Option<&Arc<ChainNode>>,
        ) -> Result<(), DnsError> {
            self.order.lock().unwrap().push(self.tag);
            if self.stop {
                return Ok(());
            }
            exec_chain(qctx, next).await
        }
    }

    fn ctx() -> QueryContext {
        QueryContext::new(
            Message::new(),
            RequestMeta::unknown_client(TransportProtocol::Udp),
        )
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugins: Vec<Arc<dyn Executable>> = (0..3)
            .map(|tag| {
                Arc::new(Recorder {
                    tag,
                    order: Arc::clone(&order),
                    stop: false,
                }) as Arc<dyn Executable>
            })
            .collect();

        let head = ChainNode::link(&plugins, None);
        exec_chain(&mut ctx(), head.as_ref()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn short_circuit_stops_chain() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugins: Vec<Arc<dyn Executable>> = vec![
            Arc::new(Recorder {
                tag: 0,
                order: Arc::clone(&order),
                stop: true,
            }),
            Arc::new(Recorder {
                tag: 1,
                order: Arc::clone(&order),
                stop: false,
            }),
        ];

        let head = ChainNode::link(&plugins, None);
        exec_chain(&mut ctx(), head.as_ref()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0]);
    }

    struct CountingMatcher {
        result: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Matcher for CountingMatcher {
        async fn matches(&self, _qctx: &QueryContext) -> Result<bool, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result)
        }
    }

    #[tokio::test]
    async fn and_group_short_circuits() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let group = AndMatcherGroup::new(vec![
            Arc::new(CountingMatcher {
                result: false,
                calls: Arc::clone(&first),
            }),
            Arc::new(CountingMatcher {
                result: true,
                calls: Arc::clone(&second),
            }),
        ]);

        assert!(!group.matches(&ctx()).await.unwrap());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }
}
