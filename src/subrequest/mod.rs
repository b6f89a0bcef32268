use crate::error::ProxyError;
use crate::request::{Request, ResponseHead, MAX_SUBREQUEST_DEPTH};
use crate::server::output::{AbortProbe, OutputChain};
use crate::server::ServerContext;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One entry in a request's postponed list: either output it produced or a
/// child whose whole subtree must be emitted first.
enum Entry {
    Data(Bytes),
    Child(PostponeNode),
}

struct NodeInner {
    entries: VecDeque<Entry>,
    done: bool,
}

/// A request's slot in the postponed-output tree. Data and children are
/// interleaved in production order; emission is a strict preorder walk, so
/// a child finishing early stays queued until everything to its left has
/// been flushed.
#[derive(Clone)]
pub struct PostponeNode {
    inner: Arc<Mutex<NodeInner>>,
}

impl PostponeNode {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NodeInner {
                entries: VecDeque::new(),
                done: false,
            })),
        }
    }

    /// Append produced output. It queues behind any pending children.
    pub fn push(&self, data: Bytes) {
        self.inner.lock().unwrap().entries.push_back(Entry::Data(data));
    }

    /// Append a child slot.
    pub fn child(&self) -> PostponeNode {
        let node = PostponeNode::new();
        self.inner
            .lock()
            .unwrap()
            .entries
            .push_back(Entry::Child(node.clone()));
        node
    }

    /// Mark this node's output complete.
    pub fn finish(&self) {
        self.inner.lock().unwrap().done = true;
    }

    /// Pop every entry that is flushable under preorder into `out`.
    /// Returns `true` when the node is done and fully drained.
    fn drain_into(&self, out: &mut Vec<Bytes>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while let Some(front) = inner.entries.front() {
            match front {
                Entry::Data(_) => {
                    if let Some(Entry::Data(data)) = inner.entries.pop_front() {
                        out.push(data);
                    }
                }
                Entry::Child(child) => {
                    let child = child.clone();
                    // The child's subtree must flush completely before
                    // anything behind it may move.
                    if child.drain_into(out) {
                        inner.entries.pop_front();
                    } else {
                        return false;
                    }
                }
            }
        }
        inner.done
    }
}

/// The per-connection subrequest tree: the root is the main request.
pub struct SubrequestTree {
    root: PostponeNode,
    notify: Arc<Notify>,
}

impl Default for SubrequestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SubrequestTree {
    pub fn new() -> Self {
        Self {
            root: PostponeNode::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn root(&self) -> PostponeNode {
        self.root.clone()
    }

    /// An output chain writing into `node`, waking this tree's emitter on
    /// every chunk. Used for the main request's own body when its output
    /// is being composed with subrequest output.
    pub fn sink(&self, node: &PostponeNode) -> NodeSink {
        NodeSink {
            node: node.clone(),
            notify: self.notify.clone(),
            bytes: 0,
        }
    }

    /// Collect everything currently flushable in preorder.
    pub fn drain_ready(&self) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.root.drain_into(&mut out);
        out
    }

    pub fn is_complete(&self) -> bool {
        fn complete(node: &PostponeNode) -> bool {
            let inner = node.inner.lock().unwrap();
            inner.done
                && inner.entries.iter().all(|e| match e {
                    Entry::Data(_) => false,
                    Entry::Child(child) => complete(child),
                })
        }
        complete(&self.root)
    }

    /// Emit the whole tree into the output chain, waiting for stragglers.
    pub async fn emit_all(&self, out: &mut dyn OutputChain) -> std::io::Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for data in self.drain_ready() {
                out.send_data(data).await?;
            }
            if self.is_complete() {
                return Ok(());
            }
            notified.await;
        }
    }
}

/// Spawn a subrequest: a child request sharing the parent's connection
/// identity, run concurrently through the phase engine, its output
/// captured into its postpone slot.
pub fn spawn(
    ctx: Arc<ServerContext>,
    tree: &SubrequestTree,
    parent: &Request,
    parent_node: &PostponeNode,
    uri: String,
    args: String,
) -> Result<tokio::task::JoinHandle<()>, ProxyError> {
    let depth = parent.subrequest_depth + 1;
    if depth > MAX_SUBREQUEST_DEPTH {
        return Err(ProxyError::Internal(format!(
            "subrequests nested too deeply, uri={uri}"
        )));
    }

    let node = parent_node.child();
    let notify = tree.notify.clone();
    let mut sink = tree.sink(&node);

    let mut child = Request::new(
        http::Method::GET,
        parent.version,
        uri,
        args,
        parent.host.clone(),
        parent.headers_in.clone(),
        parent.client_addr,
    );
    child.internal = true;
    child.subrequest_depth = depth;

    Ok(tokio::spawn(async move {
        ctx.engine.run(&ctx, &mut child, &mut sink).await;
        node.finish();
        notify.notify_waiters();
    }))
}

/// Output chain writing into one postpone slot: the head is swallowed
/// (only the root request owns the downstream response head), body bytes
/// queue in the slot.
pub struct NodeSink {
    node: PostponeNode,
    notify: Arc<Notify>,
    bytes: u64,
}

#[async_trait]
impl OutputChain for NodeSink {
    async fn send_head(&mut self, _head: &ResponseHead) -> std::io::Result<()> {
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> std::io::Result<()> {
        self.bytes += data.len() as u64;
        self.node.push(data);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        self.notify.notify_waiters();
        Ok(())
    }

    async fn ready(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn try_send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.bytes += data.len() as u64;
        self.node.push(Bytes::copy_from_slice(data));
        self.notify.notify_waiters();
        Ok(data.len())
    }

    fn probe_abort(&mut self) -> AbortProbe {
        AbortProbe::Alive
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes
    }

    fn head_sent(&self) -> bool {
        true
    }
}
