//! In-memory two-level ready queue built on top of the persistent queue store
//!
//! Rows admitted from storage sit in a pending list until their domain's
//! politeness window opens, at which point a background promoter moves them
//! into a bounded channel fetch workers pull from directly.

use crate::{
    domain::{now_secs, DomainState, DomainTable},
    queue::QueueRow,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

struct Pending {
    queued_at: f64,
    row: QueueRow,
    permit: OwnedSemaphorePermit,
}

/// Bounded, domain-aware ready queue. Admission is capped by `size`
/// (the configured `max_queue_size`); a row only becomes visible to
/// [`ReadyQueue::next`] once its owning domain's politeness window has
/// opened, is temporarily marked unreachable (so it can be drained and
/// dropped), or the domain has crossed into a state that forbids
/// scheduling entirely (so it, too, can be drained and dropped). The
/// slot's permit travels with the row through `pending` and the channel and
/// is only released once the caller takes the row out via `next`, so the
/// queue's true occupancy is bounded by `size` at all times.
pub struct ReadyQueue {
    domains: Arc<DomainTable>,
    pending: Mutex<Vec<Pending>>,
    ready_tx: mpsc::UnboundedSender<(QueueRow, OwnedSemaphorePermit)>,
    ready_rx: Mutex<mpsc::UnboundedReceiver<(QueueRow, OwnedSemaphorePermit)>>,
    free_slots: Arc<Semaphore>,
    poll_period: Duration,
}

impl ReadyQueue {
    /// Construct a queue admitting at most `size` in-flight rows at once,
    /// polling pending rows for readiness every `poll_period`.
    pub fn new(domains: Arc<DomainTable>, size: usize, poll_period: Duration) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(ReadyQueue {
            domains,
            pending: Mutex::new(Vec::new()),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            free_slots: Arc::new(Semaphore::new(size)),
            poll_period,
        });
        tokio::spawn(promoter(queue.clone()));
        queue
    }

    /// Admit `row`, blocking until a free slot opens if the queue is at
    /// capacity.
    pub async fn put(&self, row: QueueRow) {
        let permit = self
            .free_slots
            .clone()
            .acquire_owned()
            .await
            .expect("free_slots semaphore is never closed");
        self.pending.lock().await.push(Pending {
            queued_at: now_secs(),
            row,
            permit,
        });
    }

    /// Block until a row is ready to fetch and return it, releasing its
    /// admission slot.
    pub async fn next(self: &Arc<Self>) -> QueueRow {
        loop {
            let item = self.ready_rx.lock().await.recv().await;
            match item {
                Some((row, permit)) => {
                    drop(permit);
                    return row;
                }
                None => unreachable!("promoter task never drops the sender while the queue lives"),
            }
        }
    }
}

fn is_ready(domains: &DomainTable, domain_name: &str) -> bool {
    domains.with(domain_name, |d| {
        d.is_temp_unreachable() || d.state > DomainState::Unknown || d.next_req < now_secs()
    })
}

async fn promoter(queue: Arc<ReadyQueue>) {
    loop {
        let mut still_pending = Vec::new();
        {
            let mut pending = queue.pending.lock().await;
            pending.sort_by(|a, b| a.queued_at.total_cmp(&b.queued_at));
            for item in pending.drain(..) {
                if is_ready(&queue.domains, &item.row.domain) {
                    let _ = queue.ready_tx.send((item.row, item.permit));
                } else {
                    still_pending.push(item);
                }
            }
            *pending = still_pending;
        }
        tokio::time::sleep(queue.poll_period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueState;

    fn row(domain: &str) -> QueueRow {
        QueueRow {
            queue_id: 1,
            uri: format!("https://{domain}/x"),
            domain: domain.to_string(),
            found_in: None,
            state: QueueState::Waiting,
            next_update: 0.0,
            update_time: 0.0,
            hash: None,
            aux: None,
        }
    }

    #[tokio::test]
    async fn promotes_ready_domain_immediately() {
        let domains = Arc::new(DomainTable::new());
        let queue = ReadyQueue::new(domains, 10, Duration::from_millis(10));
        queue.put(row("example.test")).await;
        let got = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("row should be promoted quickly");
        assert_eq!(got.domain, "example.test");
    }

    #[tokio::test]
    async fn holds_back_polite_domain_until_window_opens() {
        let domains = Arc::new(DomainTable::new());
        domains.with("slow.test", |d| d.next_req = now_secs() + 0.2);
        let queue = ReadyQueue::new(domains, 10, Duration::from_millis(20));
        queue.put(row("slow.test")).await;
        let result = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert!(result.is_err(), "row must not be promoted before its window opens");
        let got = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("row should be promoted once the window opens");
        assert_eq!(got.domain, "slow.test");
    }
}
