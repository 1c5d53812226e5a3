//! Delayed re-delivery of entities to the dispatcher
//!
//! A reconciler can ask to be re-invoked after a delay; the queue holds at
//! most one pending entry per uid (a second enqueue replaces the first) and
//! drops entries when a fresh apiserver event arrives for the same entity.
//!
//! [`queue`] returns a write handle ([`Requeuer`]) for the dispatcher and a
//! drain stream ([`RequeueQueue`]) for the watch loop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};
use tracing::debug;

use crate::entity::{Entity, EntityExt};

/// Which dispatcher path a re-delivered entity takes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequeueKind {
    Added,
    Modified,
    Deleted,
}

/// A due entry yielded by [`RequeueQueue`].
#[derive(Clone, Debug)]
pub struct RequeueEntry<K> {
    pub entity: K,
    pub kind: RequeueKind,
}

struct Inner<K> {
    queue: DelayQueue<RequeueEntry<K>>,
    /// uid -> key of the single pending entry for that uid.
    scheduled: HashMap<String, delay_queue::Key>,
    waker: Option<Waker>,
    closed: bool,
}

impl<K> Inner<K> {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Creates a linked write-handle / drain-stream pair.
pub fn queue<K: Entity>() -> (Requeuer<K>, RequeueQueue<K>) {
    let inner = Arc::new(Mutex::new(Inner {
        queue: DelayQueue::new(),
        scheduled: HashMap::new(),
        waker: None,
        closed: false,
    }));
    (
        Requeuer {
            inner: inner.clone(),
        },
        RequeueQueue { inner },
    )
}

/// Write handle: schedules and cancels pending re-deliveries.
pub struct Requeuer<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for Requeuer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// The mutex is sync on purpose: it is only held for heap bookkeeping within
// a single call or poll, never across awaits.
impl<K: Entity> Requeuer<K> {
    /// Schedule delivery at `now + delay`, replacing any pending entry for
    /// the same uid.
    pub fn enqueue(&self, entity: K, kind: RequeueKind, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let uid = entity.uid().to_owned();
        if let Some(key) = inner.scheduled.remove(&uid) {
            inner.queue.remove(&key);
        }
        debug!(%uid, ?kind, ?delay, "scheduling redelivery");
        let key = inner
            .queue
            .insert_at(RequeueEntry { entity, kind }, Instant::now() + delay);
        inner.scheduled.insert(uid, key);
        // An earlier-due entry must not wait for the previous deadline.
        inner.wake();
    }

    /// Drop any pending entry for this entity's uid. Idempotent.
    pub fn remove(&self, entity: &K) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.scheduled.remove(entity.uid()) {
            inner.queue.remove(&key);
            debug!(uid = %entity.uid(), "dropped pending redelivery");
            inner.wake();
        }
    }

    /// Ends the drain stream and discards all pending entries.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.queue.clear();
        inner.scheduled.clear();
        inner.wake();
    }
}

/// Drain stream: yields entries as their due times pass, suspending in
/// between. Never terminates until [`Requeuer::close`] is called.
pub struct RequeueQueue<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K: Entity> Stream for RequeueQueue<K> {
    type Item = RequeueEntry<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Poll::Ready(None);
        }
        match inner.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let entry = expired.into_inner();
                inner.scheduled.remove(entry.entity.uid());
                debug!(uid = %entry.entity.uid(), kind = ?entry.kind, "redelivery due");
                Poll::Ready(Some(entry))
            }
            // DelayQueue only registers a timer wakeup while non-empty, so
            // keep our own waker for inserts into an idle queue.
            Poll::Ready(None) | Poll::Pending => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{pin_mut, poll, StreamExt};
    use tokio::time::advance;

    use super::{queue, RequeueKind};
    use crate::fixtures::TestResource;

    #[tokio::test(start_paused = true)]
    async fn emits_entries_as_they_fall_due() {
        let (requeuer, drain) = queue::<TestResource>();
        pin_mut!(drain);
        requeuer.enqueue(TestResource::new("u1"), RequeueKind::Modified, Duration::from_secs(1));
        requeuer.enqueue(TestResource::new("u2"), RequeueKind::Deleted, Duration::from_secs(3));

        assert!(poll!(drain.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        let first = drain.next().await.unwrap();
        assert_eq!(first.entity.metadata.uid, "u1");
        assert_eq!(first.kind, RequeueKind::Modified);
        assert!(poll!(drain.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(drain.next().await.unwrap().entity.metadata.uid, "u2");
    }

    #[tokio::test(start_paused = true)]
    async fn second_enqueue_replaces_pending_entry() {
        let (requeuer, drain) = queue::<TestResource>();
        pin_mut!(drain);
        requeuer.enqueue(TestResource::new("u1"), RequeueKind::Added, Duration::from_secs(5));
        requeuer.enqueue(TestResource::new("u1"), RequeueKind::Modified, Duration::from_secs(1));

        advance(Duration::from_secs(2)).await;
        let entry = drain.next().await.unwrap();
        assert_eq!(entry.kind, RequeueKind::Modified);
        // The replaced entry must not fire later.
        advance(Duration::from_secs(10)).await;
        assert!(poll!(drain.next()).is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_then_remove_leaves_nothing_pending() {
        let (requeuer, drain) = queue::<TestResource>();
        pin_mut!(drain);
        let obj = TestResource::new("u1");
        requeuer.enqueue(obj.clone(), RequeueKind::Modified, Duration::from_millis(10));
        requeuer.remove(&obj);
        requeuer.remove(&obj);

        advance(Duration::from_secs(1)).await;
        assert!(poll!(drain.next()).is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_for_an_earlier_due_insert() {
        let (requeuer, drain) = queue::<TestResource>();
        pin_mut!(drain);
        requeuer.enqueue(TestResource::new("slow"), RequeueKind::Modified, Duration::from_secs(60));
        assert!(poll!(drain.next()).is_pending());

        requeuer.enqueue(TestResource::new("fast"), RequeueKind::Modified, Duration::from_secs(1));
        advance(Duration::from_secs(1)).await;
        assert_eq!(drain.next().await.unwrap().entity.metadata.uid, "fast");
    }

    #[tokio::test(start_paused = true)]
    async fn close_terminates_the_drain() {
        let (requeuer, drain) = queue::<TestResource>();
        pin_mut!(drain);
        requeuer.enqueue(TestResource::new("u1"), RequeueKind::Modified, Duration::from_secs(1));
        requeuer.close();
        assert!(drain.next().await.is_none());
        // Enqueue after close is a no-op.
        requeuer.enqueue(TestResource::new("u2"), RequeueKind::Modified, Duration::ZERO);
        assert!(drain.next().await.is_none());
    }
}
