//! One consumer: a reader task feeding a pool of apply workers.
//!
//! The reader pulls deliveries for the consumer's group, version-checks and
//! decodes each envelope, and dispatches its change records to workers by a
//! hash of `EntityId`, so one entity is never handled by two workers at once
//! and its changes are applied in delivery order. A message is acknowledged
//! once every one of its records is resolved (applied, duplicate, superseded
//! or dead-lettered). Undecodable messages are parked, alerted and acked.
//!
//! A heartbeat keeps the messages in flight from going idle while workers
//! apply or back off, and a reclaim timer takes over messages another member
//! left pending past the claim timeout. Every attempt re-reads the entity's
//! head first, so a change overtaken by another member's apply is resolved as
//! superseded or duplicate instead of being written over newer state.
//!
//! On shutdown the reader stops pulling, workers finish the apply in hand,
//! and unresolved messages stay unacknowledged for redelivery.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use refsync_broker::{Broker, Delivery, Subscription};
use refsync_core::config::ConsumerConfig;
use refsync_core::{ChangeRecord, ChangeType, ConsumerId, Envelope, EnvelopeError, MessageId};

use crate::alert::{Alert, AlertSink};
use crate::dlq::{DeadLetter, DeadLetterQueue, ParkedMessage, QueueFull};
use crate::error::{DaemonError, TargetError};
use crate::processing::{ProcessingRecord, ProcessingStore};
use crate::retry::RetryPolicy;
use crate::state::DeliveryState;
use crate::target::{Projection, Target};

/// Everything one consumer needs, shared by its reader and workers.
pub struct ConsumerContext {
    pub consumer: ConsumerId,
    pub target: Arc<dyn Target>,
    pub projection: Arc<dyn Projection>,
    pub processing: Arc<dyn ProcessingStore>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub alerts: Arc<dyn AlertSink>,
}

/// How a change record left a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// Reached a resolved state; counts toward acking its message.
    Resolved(DeliveryState),
    /// Shutdown interrupted a retry; the message must stay unacknowledged.
    Abandoned,
}

struct WorkItem {
    message_id: MessageId,
    change: ChangeRecord,
}

struct Completion {
    message_id: MessageId,
    result: Result<Resolution, DaemonError>,
}

/// Records still outstanding for a dispatched message.
struct InFlight {
    remaining: usize,
    abandoned: bool,
}

pub struct Subscriber {
    ctx: Arc<ConsumerContext>,
    broker: Arc<dyn Broker>,
    member: String,
    config: ConsumerConfig,
    claim_timeout: Duration,
}

impl Subscriber {
    pub fn new(
        ctx: ConsumerContext,
        broker: Arc<dyn Broker>,
        config: ConsumerConfig,
        claim_timeout: Duration,
    ) -> Self {
        let member = format!("{}-{}", ctx.consumer, std::process::id());
        Self {
            ctx: Arc::new(ctx),
            broker,
            member,
            config,
            claim_timeout,
        }
    }

    /// Override the group member name (defaults to `<consumer>-<pid>`).
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }

    pub fn consumer(&self) -> &ConsumerId {
        &self.ctx.consumer
    }

    /// Join the consumer group. Best-effort deliveries published before this
    /// returns are not received.
    pub async fn subscribe(&self) -> Result<Subscription, DaemonError> {
        Ok(self
            .broker
            .subscribe(&self.ctx.consumer.0, &self.member)
            .await?)
    }

    /// Subscribe, then consume until `shutdown` fires.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        let subscription = self.subscribe().await?;
        self.consume(subscription, shutdown).await
    }

    /// Consume `subscription` until `shutdown` fires. Errors only when the
    /// processing store cannot be written.
    pub async fn consume(
        self,
        mut subscription: Subscription,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError> {
        tracing::info!(
            consumer = %self.ctx.consumer,
            member = %self.member,
            tier = ?self.broker.tier(),
            workers = self.config.workers,
            "subscriber started",
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let policy = RetryPolicy::from_config(&self.config);
        let mut workers = Vec::with_capacity(self.config.workers.max(1));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for index in 0..self.config.workers.max(1) {
            let (tx, rx) = mpsc::channel::<WorkItem>(64);
            workers.push(tx);
            handles.push(tokio::spawn(worker_loop(
                index,
                self.ctx.clone(),
                policy.clone(),
                rx,
                done_tx.clone(),
                stop_rx.clone(),
            )));
        }
        drop(done_tx);

        let mut in_flight: HashMap<MessageId, InFlight> = HashMap::new();
        let reclaim_every = Duration::from_secs(self.config.reclaim_interval_secs.max(1));
        let mut reclaim = tokio::time::interval(reclaim_every);
        reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        reclaim.tick().await;
        let mut heartbeat = tokio::time::interval(heartbeat_period(self.claim_timeout));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await;

        let mut outcome = Ok(());
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                delivery = subscription.next() => {
                    let Some(delivery) = delivery else {
                        tracing::warn!(consumer = %self.ctx.consumer, "subscription closed");
                        break;
                    };
                    let handled = self.handle_delivery(delivery, &workers, &mut in_flight).await;
                    if let Err(err) = handled {
                        outcome = Err(err);
                        break;
                    }
                }
                Some(done) = done_rx.recv() => {
                    if let Err(err) = self.complete(done, &mut in_flight).await {
                        outcome = Err(err);
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.heartbeat(&in_flight).await;
                }
                _ = reclaim.tick() => {
                    self.reclaim(&workers, &mut in_flight).await;
                }
            }
        }

        // Stop pulling, let workers finish what they hold.
        let _ = stop_tx.send(true);
        drop(workers);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(consumer = %self.ctx.consumer, error = %err, "worker join failure");
            }
        }
        while let Ok(done) = done_rx.try_recv() {
            if let Err(err) = self.complete(done, &mut in_flight).await {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        let unacked = in_flight.len();
        tracing::info!(consumer = %self.ctx.consumer, unacked, "subscriber stopped");
        outcome
    }

    async fn handle_delivery(
        &self,
        delivery: Delivery,
        workers: &[mpsc::Sender<WorkItem>],
        in_flight: &mut HashMap<MessageId, InFlight>,
    ) -> Result<(), DaemonError> {
        if in_flight.contains_key(&delivery.message_id) {
            tracing::debug!(
                message_id = %delivery.message_id,
                "already in flight; ignoring redelivery",
            );
            return Ok(());
        }

        let envelope = match Envelope::decode(&delivery.body, self.config.supported_versions) {
            Ok(envelope) => envelope,
            Err(err) => {
                if self.park(&delivery, &err).await {
                    self.ack(&delivery.message_id).await;
                }
                return Ok(());
            }
        };

        let message_id = delivery.message_id.clone();
        let count = envelope.payload.matches.len();
        tracing::debug!(
            consumer = %self.ctx.consumer,
            message_id = %message_id,
            version = %envelope.schema_version,
            entries = count,
            delivery_count = delivery.delivery_count,
            "envelope received",
        );
        if count == 0 {
            self.ack(&message_id).await;
            return Ok(());
        }

        in_flight.insert(
            message_id.clone(),
            InFlight {
                remaining: count,
                abandoned: false,
            },
        );
        for change in envelope.payload.matches {
            let worker = &workers[partition(&change, workers.len())];
            let item = WorkItem {
                message_id: message_id.clone(),
                change,
            };
            worker
                .send(item)
                .await
                .map_err(|_| DaemonError::ChannelClosed("apply worker"))?;
        }
        Ok(())
    }

    async fn complete(
        &self,
        done: Completion,
        in_flight: &mut HashMap<MessageId, InFlight>,
    ) -> Result<(), DaemonError> {
        let resolution = match done.result {
            Ok(resolution) => resolution,
            Err(err) => {
                tracing::error!(
                    consumer = %self.ctx.consumer,
                    message_id = %done.message_id,
                    error = %err,
                    "apply bookkeeping failed; stopping subscriber",
                );
                in_flight.remove(&done.message_id);
                return Err(err);
            }
        };

        let Some(entry) = in_flight.get_mut(&done.message_id) else {
            return Ok(());
        };
        entry.remaining = entry.remaining.saturating_sub(1);
        match resolution {
            Resolution::Resolved(state) => {
                // Every resolved change must be ackable.
                state.advance(DeliveryState::Acked)?;
                tracing::trace!(
                    message_id = %done.message_id,
                    state = %state,
                    remaining = entry.remaining,
                    "change resolved",
                );
            }
            Resolution::Abandoned => entry.abandoned = true,
        }
        if entry.remaining > 0 {
            return Ok(());
        }

        let abandoned = entry.abandoned;
        in_flight.remove(&done.message_id);
        if abandoned {
            tracing::info!(
                consumer = %self.ctx.consumer,
                message_id = %done.message_id,
                "message left unacknowledged for redelivery",
            );
            return Ok(());
        }
        self.ack(&done.message_id).await;
        Ok(())
    }

    async fn heartbeat(&self, in_flight: &HashMap<MessageId, InFlight>) {
        if in_flight.is_empty() {
            return;
        }
        let ids: Vec<MessageId> = in_flight.keys().cloned().collect();
        if let Err(err) = self
            .broker
            .touch(&self.ctx.consumer.0, &self.member, &ids)
            .await
        {
            tracing::warn!(consumer = %self.ctx.consumer, error = %err, "heartbeat failed");
        }
    }

    async fn reclaim(
        &self,
        workers: &[mpsc::Sender<WorkItem>],
        in_flight: &mut HashMap<MessageId, InFlight>,
    ) {
        let group = &self.ctx.consumer.0;
        let pending = match self.broker.pending(group, self.claim_timeout).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(consumer = %self.ctx.consumer, error = %err, "pending query failed");
                return;
            }
        };
        let stale: Vec<MessageId> = pending
            .into_iter()
            .filter(|id| !in_flight.contains_key(id))
            .collect();
        if stale.is_empty() {
            return;
        }

        let claimed = match self
            .broker
            .claim(group, &self.member, self.claim_timeout, &stale)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                tracing::warn!(consumer = %self.ctx.consumer, error = %err, "claim failed");
                return;
            }
        };
        tracing::info!(
            consumer = %self.ctx.consumer,
            claimed = claimed.len(),
            "reclaimed idle messages",
        );
        for delivery in claimed {
            if let Err(err) = self.handle_delivery(delivery, workers, in_flight).await {
                tracing::warn!(
                    consumer = %self.ctx.consumer,
                    error = %err,
                    "reclaimed delivery not dispatched",
                );
            }
        }
    }

    /// Park an undecodable message. Returns whether it was parked and may
    /// be acknowledged.
    async fn park(&self, delivery: &Delivery, err: &EnvelopeError) -> bool {
        let reason = err.to_string();
        tracing::error!(
            consumer = %self.ctx.consumer,
            message_id = %delivery.message_id,
            reason = %reason,
            "parking undecodable message",
        );
        let parked = self
            .ctx
            .dead_letters
            .park(ParkedMessage {
                consumer: self.ctx.consumer.clone(),
                message_id: delivery.message_id.clone(),
                reason: reason.clone(),
                parked_at: Utc::now(),
                body: delivery.body.clone(),
            })
            .await;
        if let Err(full) = parked {
            queue_full(&self.ctx, &delivery.message_id, full);
            return false;
        }
        self.ctx.alerts.raise(Alert::MessageParked {
            consumer: self.ctx.consumer.clone(),
            message_id: delivery.message_id.clone(),
            reason,
        });
        true
    }

    async fn ack(&self, message_id: &MessageId) {
        match self.broker.ack(&self.ctx.consumer.0, message_id).await {
            Ok(()) => {
                tracing::trace!(consumer = %self.ctx.consumer, message_id = %message_id, "acked")
            }
            // Redelivered later and resolved again as duplicates.
            Err(err) => tracing::warn!(
                consumer = %self.ctx.consumer,
                message_id = %message_id,
                error = %err,
                "ack failed",
            ),
        }
    }
}

/// How often in-flight messages are touched: well inside the claim timeout.
fn heartbeat_period(claim_timeout: Duration) -> Duration {
    (claim_timeout / 3).max(Duration::from_millis(10))
}

fn partition(change: &ChangeRecord, workers: usize) -> usize {
    let mut h = DefaultHasher::new();
    change.entity_id.hash(&mut h);
    (h.finish() % workers.max(1) as u64) as usize
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn worker_loop(
    index: usize,
    ctx: Arc<ConsumerContext>,
    policy: RetryPolicy,
    mut rx: mpsc::Receiver<WorkItem>,
    done: mpsc::UnboundedSender<Completion>,
    stop: watch::Receiver<bool>,
) {
    while let Some(item) = rx.recv().await {
        let result = process_change(&ctx, &policy, &item, stop.clone()).await;
        let completion = Completion {
            message_id: item.message_id,
            result,
        };
        if done.send(completion).is_err() {
            break;
        }
    }
    tracing::trace!(consumer = %ctx.consumer, worker = index, "worker stopped");
}

/// Classify, apply with local retries, and record one change.
async fn process_change(
    ctx: &ConsumerContext,
    policy: &RetryPolicy,
    item: &WorkItem,
    mut stop: watch::Receiver<bool>,
) -> Result<Resolution, DaemonError> {
    let change = &item.change;
    let mut state = DeliveryState::Received.advance(DeliveryState::Validated)?;

    let mut attempt = 1u32;
    loop {
        if let Some(resolved) = already_handled(ctx, change, attempt).await? {
            state = state.advance(resolved)?;
            return Ok(Resolution::Resolved(state));
        }

        state = state.advance(DeliveryState::Applying)?;
        match apply(ctx, change).await {
            Ok(()) => {
                state = state.advance(DeliveryState::Applied)?;
                let record = ProcessingRecord::for_change(&ctx.consumer, change);
                blocking(ctx.processing.clone(), move |store| store.record_applied(record))
                    .await?;
                tracing::info!(
                    consumer = %ctx.consumer,
                    entity = %change.entity_id,
                    change = %change.change_type,
                    attempt,
                    "change applied",
                );
                return Ok(Resolution::Resolved(state));
            }
            Err(err) => {
                state = state.advance(DeliveryState::ApplyFailed { attempt })?;
                if !err.is_retryable() || !policy.should_retry(attempt) {
                    if let Err(full) = dead_letter(ctx, item, &err, attempt).await {
                        queue_full(ctx, &item.message_id, full);
                        return Ok(Resolution::Abandoned);
                    }
                    state = state.advance(DeliveryState::DeadLettered)?;
                    return Ok(Resolution::Resolved(state));
                }

                state = state.advance(DeliveryState::Retrying(attempt))?;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    consumer = %ctx.consumer,
                    entity = %change.entity_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "apply failed; retrying",
                );
                if *stop.borrow() {
                    return Ok(Resolution::Abandoned);
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => return Ok(Resolution::Abandoned),
                }
                attempt += 1;
            }
        }
    }
}

/// `Superseded` when a newer change for the entity has been applied,
/// `Duplicate` when this exact change is the latest one applied.
async fn already_handled(
    ctx: &ConsumerContext,
    change: &ChangeRecord,
    attempt: u32,
) -> Result<Option<DeliveryState>, DaemonError> {
    let id = change.entity_id.clone();
    let Some(head) = blocking(ctx.processing.clone(), move |store| store.head(&id)).await? else {
        return Ok(None);
    };

    let newer_applied = match (head.detected_at, change.detected_at) {
        (Some(applied), Some(detected)) => applied > detected,
        _ => false,
    };
    if newer_applied {
        tracing::info!(
            consumer = %ctx.consumer,
            entity = %change.entity_id,
            change = %change.change_type,
            attempt,
            "stale change superseded by a newer apply",
        );
        return Ok(Some(DeliveryState::Superseded));
    }

    let key = change.ledger_key();
    if change.forced || head.key != key {
        return Ok(None);
    }
    let id = change.entity_id.clone();
    let applied =
        blocking(ctx.processing.clone(), move |store| store.is_applied(&id, &key)).await?;
    if !applied {
        return Ok(None);
    }
    tracing::debug!(
        consumer = %ctx.consumer,
        entity = %change.entity_id,
        attempt,
        "duplicate change skipped",
    );
    Ok(Some(DeliveryState::Duplicate))
}

async fn apply(ctx: &ConsumerContext, change: &ChangeRecord) -> Result<(), TargetError> {
    let key = ctx.projection.resource_key(&change.entity_id);
    match change.change_type {
        ChangeType::Removed => ctx.target.delete(&key).await,
        ChangeType::New | ChangeType::Updated => {
            let Some(record) = &change.record else {
                return Err(TargetError::Permanent(format!(
                    "{} change for {} carries no record",
                    change.change_type, change.entity_id
                )));
            };
            ctx.target
                .upsert(&key, ctx.projection.attributes(record))
                .await
        }
        ChangeType::Unchanged => Ok(()),
    }
}

async fn dead_letter(
    ctx: &ConsumerContext,
    item: &WorkItem,
    err: &TargetError,
    attempts: u32,
) -> Result<(), QueueFull> {
    let change = &item.change;
    ctx.dead_letters
        .push(DeadLetter {
            consumer: ctx.consumer.clone(),
            message_id: item.message_id.clone(),
            change: change.clone(),
            error: err.to_string(),
            attempts,
            dead_lettered_at: Utc::now(),
        })
        .await?;
    tracing::error!(
        consumer = %ctx.consumer,
        entity = %change.entity_id,
        message_id = %item.message_id,
        attempts,
        error = %err,
        "change dead-lettered",
    );
    ctx.alerts.raise(Alert::DeadLettered {
        consumer: ctx.consumer.clone(),
        entity_id: change.entity_id.clone(),
        error: err.to_string(),
    });
    Ok(())
}

fn queue_full(ctx: &ConsumerContext, message_id: &MessageId, full: QueueFull) {
    tracing::error!(
        consumer = %ctx.consumer,
        message_id = %message_id,
        error = %full,
        "message held back unacknowledged",
    );
    ctx.alerts.raise(Alert::QueueFull {
        consumer: ctx.consumer.clone(),
        message_id: message_id.clone(),
        list: full.list,
    });
}

async fn blocking<T, F>(store: Arc<dyn ProcessingStore>, f: F) -> Result<T, DaemonError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ProcessingStore) -> Result<T, DaemonError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|err| DaemonError::Task(format!("processing store join error: {err}")))?
}
