//! The batcher worker: drains the dispatch queue, coalesces operations into
//! kernel-sized batches, and flushes on size or time thresholds.
//!
//! An operation that would push the batch past the socket send buffer is
//! held back in a remainder batch and flushed right after the main one, so
//! a single oversize message never stalls the pipeline. After every flush
//! the conntrack entries of just-touched destinations are purged (when
//! enabled), so established flows cannot keep using the route they were
//! opened under.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use markroute_lib::interval::IntervalTree;

use super::conntrack_ops::ConntrackOps;
use super::netlink_ops::KernelOps;
use super::QueuedOp;

/// How long one queue poll waits before the batch is considered complete.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
/// Maximum time between flushes while the queue stays busy.
const COMMIT_INTERVAL: Duration = Duration::from_millis(20);
/// Default netlink socket send buffer; one batch never exceeds it.
const SNDBUF_LIMIT: usize = 32 * 1024;
/// Upper bound on the queue drain during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct Batcher<K: KernelOps, C: ConntrackOps> {
    kernel: K,
    conntrack: C,
    queue: mpsc::UnboundedReceiver<QueuedOp>,
    clean_conntrack: bool,
    shutdown: CancellationToken,
    commit_interval: Duration,
    sndbuf_limit: usize,
}

impl<K: KernelOps, C: ConntrackOps> Batcher<K, C> {
    pub(crate) fn new(
        kernel: K,
        conntrack: C,
        queue: mpsc::UnboundedReceiver<QueuedOp>,
        clean_conntrack: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kernel,
            conntrack,
            queue,
            clean_conntrack,
            shutdown,
            commit_interval: COMMIT_INTERVAL,
            sndbuf_limit: SNDBUF_LIMIT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_commit_interval(mut self, commit_interval: Duration) -> Self {
        self.commit_interval = commit_interval;
        self
    }

    pub(crate) async fn run(mut self) {
        'main: loop {
            let mut batch: Vec<QueuedOp> = Vec::new();
            let mut batch_len = 0usize;
            let mut remainder = None;
            let mut closed = false;
            let deadline = Instant::now() + self.commit_interval;

            loop {
                if self.shutdown.is_cancelled() {
                    break;
                }
                match tokio::time::timeout(POLL_TIMEOUT, self.queue.recv()).await {
                    Ok(Some(item)) => {
                        let encoded = item.spec.encoded_len();
                        if batch_len + encoded > self.sndbuf_limit {
                            remainder = Some(item);
                            break;
                        }
                        batch_len += encoded;
                        batch.push(item);
                        if Instant::now() >= deadline {
                            break;
                        }
                    }
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break, // poll timeout, commit what we have
                }
            }

            self.flush(batch).await;
            if let Some(item) = remainder {
                self.flush(vec![item]).await;
            }
            if closed {
                tracing::debug!("dispatch queue closed");
                break 'main;
            }
            if self.shutdown.is_cancelled() {
                break 'main;
            }
        }

        self.drain().await;
        tracing::debug!("batcher stopped");
    }

    /// Bounded best-effort drain of whatever is still queued at shutdown.
    async fn drain(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut pending = Vec::new();
        while Instant::now() < deadline {
            match self.queue.try_recv() {
                Ok(item) => pending.push(item),
                Err(_) => break,
            }
        }
        let mut batch = Vec::new();
        let mut batch_len = 0usize;
        for item in pending {
            let encoded = item.spec.encoded_len();
            if batch_len + encoded > self.sndbuf_limit {
                self.flush(std::mem::take(&mut batch)).await;
                batch_len = 0;
            }
            batch_len += encoded;
            batch.push(item);
        }
        self.flush(batch).await;
    }

    async fn flush(&mut self, batch: Vec<QueuedOp>) {
        if batch.is_empty() {
            return;
        }
        tracing::info!(ops = batch.len(), "flushing batch");
        let results = self.kernel.apply_batch(&batch).await;
        for (item, result) in batch.iter().zip(&results) {
            if let Err(error) = result {
                tracing::warn!(
                    %error,
                    op = ?item.op,
                    dst = %item.spec.dst,
                    prefix_len = item.spec.prefix_len,
                    "kernel rejected operation"
                );
            }
        }
        if self.clean_conntrack {
            self.purge_conntrack(&batch);
        }
    }

    /// Removes conntrack entries whose source or destination falls into a
    /// prefix this batch just touched, so stale flows cannot stay pinned to
    /// the previous egress.
    fn purge_conntrack(&mut self, batch: &[QueuedOp]) {
        let mut touched: IntervalTree<()> = IntervalTree::new();
        for item in batch {
            let start = u64::from(u32::from(item.spec.dst));
            let size = 1u64 << (32 - u32::from(item.spec.prefix_len));
            touched.insert(start, start + size, ());
        }

        let flows = match self.conntrack.dump_flows() {
            Ok(flows) => flows,
            Err(error) => {
                tracing::warn!(%error, "cannot enumerate conntrack, skipping purge");
                return;
            }
        };

        let mut deleted = 0usize;
        for flow in &flows {
            let src = u64::from(u32::from(flow.src));
            let dst = u64::from(u32::from(flow.dst));
            if touched.stab(src).is_empty() && touched.stab(dst).is_empty() {
                continue;
            }
            match self.conntrack.delete_flow(flow) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!(src = %flow.src, dst = %flow.dst, "deleted conntrack entry");
                }
                Err(error) => {
                    tracing::warn!(%error, src = %flow.src, dst = %flow.dst, "failed deleting conntrack entry");
                }
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, "purged conntrack entries for touched prefixes");
        }
    }
}
