//! Durable handle over the mutation queue.
//!
//! Every transition is persisted before it returns; if the write fails the
//! queue is restored to its previous state and the error is returned, so an
//! accepted enqueue is never lost and a failed one is never half-applied.

use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use crate::storage::Storage;
use std::sync::Arc;
use tether_engine::{
    ActionId, ActionStatus, Clock, Mutation, MutationQueue, QueueSnapshot, QueuedAction,
    RecordKey, Timestamp, QUEUE_KEY,
};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct OfflineQueue {
    queue: Mutex<MutationQueue>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl OfflineQueue {
    pub fn new(
        capacity: Option<usize>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let queue = match capacity {
            Some(capacity) => MutationQueue::with_capacity(capacity),
            None => MutationQueue::new(),
        };
        Self {
            queue: Mutex::new(queue),
            storage,
            clock,
            events,
        }
    }

    /// Restore the persisted queue. Entries left in flight by a crash go back
    /// to pending; returns how many.
    pub async fn load(&self) -> Result<usize> {
        let mut queue = self.queue.lock().await;
        let capacity = queue.capacity();

        let mut loaded = match self.storage.read(QUEUE_KEY).await? {
            Some(json) => MutationQueue::from_snapshot(QueueSnapshot::from_json(&json)?, capacity)?,
            None => MutationQueue::from_snapshot(QueueSnapshot::default(), capacity)?,
        };

        let recovered = loaded.recover_in_flight();
        if recovered > 0 {
            tracing::warn!(recovered, "in-flight actions returned to pending after restart");
            self.persist(&loaded).await?;
        }

        tracing::debug!(entries = loaded.size(), "offline queue loaded");
        *queue = loaded;
        Ok(recovered)
    }

    /// Append a mutation. Fails loudly when the queue is full.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<ActionId> {
        let kind = mutation.kind;
        let key = mutation.key();

        let id = self
            .transition(|queue, clock| queue.enqueue(mutation, clock))
            .await?;

        tracing::info!(
            action_id = id,
            module = %key.module,
            record_id = %key.id,
            "action enqueued"
        );
        self.events.publish(SyncEvent::ActionEnqueued {
            action_id: id,
            kind,
            module: key.module,
            record_id: key.id,
        });
        Ok(id)
    }

    /// Record a mutation the remote already rejected, as a failed entry the
    /// user can retry.
    pub async fn enqueue_rejected(&self, mutation: Mutation, error: String) -> Result<ActionId> {
        self.transition(|queue, clock| {
            let id = queue.enqueue(mutation, clock)?;
            queue.mark_failed(id, error)?;
            Ok(id)
        })
        .await
    }

    /// Take the next dispatchable entry in flight.
    pub async fn dequeue_next(&self) -> Result<Option<QueuedAction>> {
        let mut queue = self.queue.lock().await;
        let before = queue.clone();

        let Some(action) = queue.dequeue_next(self.clock.as_ref()) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&queue).await {
            *queue = before;
            return Err(e);
        }

        tracing::debug!(
            action_id = action.id,
            module = %action.mutation.module,
            record_id = %action.mutation.record_id,
            attempt = action.attempts,
            "action dispatched"
        );
        Ok(Some(action))
    }

    /// Remove a replayed entry. `false` if it was already gone.
    pub async fn mark_done(&self, id: ActionId) -> Result<bool> {
        self.transition(|queue, _| Ok(queue.mark_done(id))).await
    }

    pub async fn mark_failed(&self, id: ActionId, error: impl Into<String>) -> Result<QueuedAction> {
        let error = error.into();
        self.transition(|queue, _| queue.mark_failed(id, error).cloned())
            .await
    }

    pub async fn schedule_retry(
        &self,
        id: ActionId,
        error: impl Into<String>,
        at: Timestamp,
    ) -> Result<QueuedAction> {
        let error = error.into();
        self.transition(|queue, _| queue.schedule_retry(id, error, at).cloned())
            .await
    }

    /// Reset a failed entry to pending with a fresh attempt budget.
    pub async fn retry_failed(&self, id: ActionId) -> Result<QueuedAction> {
        let action = self
            .transition(|queue, _| queue.retry_failed(id).cloned())
            .await?;
        tracing::info!(action_id = id, "failed action reset for retry");
        Ok(action)
    }

    /// Drop a failed entry the user gave up on.
    pub async fn discard_failed(&self, id: ActionId) -> Result<QueuedAction> {
        let action = self
            .transition(|queue, _| queue.discard_failed(id))
            .await?;
        tracing::info!(
            action_id = id,
            module = %action.mutation.module,
            record_id = %action.mutation.record_id,
            "failed action discarded"
        );
        Ok(action)
    }

    pub async fn get(&self, id: ActionId) -> Option<QueuedAction> {
        self.queue.lock().await.get(id).cloned()
    }

    pub async fn list(&self, status: Option<ActionStatus>) -> Vec<QueuedAction> {
        self.queue
            .lock()
            .await
            .list(status)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn size(&self) -> usize {
        self.queue.lock().await.size()
    }

    pub async fn outstanding_count(&self) -> usize {
        self.queue.lock().await.outstanding_count()
    }

    pub async fn holds(&self, key: &RecordKey) -> bool {
        self.queue.lock().await.holds(key)
    }

    pub async fn next_retry_at(&self) -> Option<Timestamp> {
        self.queue.lock().await.next_retry_at()
    }

    async fn transition<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MutationQueue, &dyn Clock) -> tether_engine::error::Result<T>,
    {
        let mut queue = self.queue.lock().await;
        let before = queue.clone();

        let value = f(&mut queue, self.clock.as_ref())?;
        if let Err(e) = self.persist(&queue).await {
            *queue = before;
            return Err(e);
        }
        Ok(value)
    }

    async fn persist(&self, queue: &MutationQueue) -> Result<()> {
        let json = queue.export().to_json()?;
        self.storage.write(QUEUE_KEY, json).await?;
        Ok(())
    }
}
