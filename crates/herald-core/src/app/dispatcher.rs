//! Dispatcher - claim -> publish -> record, on a fixed tick.
//!
//! # Design
//! - Poll based. One `tick` claims at most `batch_size` rows and processes
//!   them in id order; rows of the same type that sit next to each other go
//!   to the handler as one batch when it supports that.
//! - Nothing here returns dispatch failures to callers. A failing row is
//!   rescheduled with backoff or dead-lettered; a failing `mark_*` leaves the
//!   lease to expire so the row is picked up again.
//! - Outcomes are recorded under the claim's lease token. If the lease was
//!   taken over by another claim meanwhile, the outcome is dropped and the
//!   current holder records its own.
//! - Cancellation stops the loop between ticks and between rows. In-flight
//!   handler calls are not aborted.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::BackoffPolicy;
use super::config::{DispatcherConfig, ExhaustedPolicy, UnknownEventPolicy};
use crate::domain::{ClaimedRow, HandlerError, StoreError};
use crate::ports::{Clock, OutboxStore};
use crate::typed::{DynHandler, HandlerRegistry};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub acknowledged_unknown: usize,
    /// Claimed but not processed because of cancellation. Their leases
    /// expire normally.
    pub abandoned: usize,
    /// `mark_*` calls that failed.
    pub outcome_errors: usize,
    /// Outcomes dropped because another claim holds the row now.
    pub lease_lost: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    pub fn merge(&mut self, other: TickReport) {
        self.claimed += other.claimed;
        self.published += other.published;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.acknowledged_unknown += other.acknowledged_unknown;
        self.abandoned += other.abandoned;
        self.outcome_errors += other.outcome_errors;
        self.lease_lost += other.lease_lost;
    }
}

pub struct Dispatcher<S: OutboxStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl<S: OutboxStore> Dispatcher<S> {
    /// Prefer `DispatcherBuilder`, which validates the config.
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backoff: config.backoff(),
            store,
            registry,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Tick every `tick_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease_secs,
            tick_interval_ms = self.config.tick_interval_ms,
            handlers = ?self.registry.registered_types(),
            "dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick_with(&cancel).await {
                Ok(report) if !report.is_idle() => info!(
                    claimed = report.claimed,
                    published = report.published,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    abandoned = report.abandoned,
                    lease_lost = report.lease_lost,
                    "tick finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "claim failed; retrying next tick"),
            }
        }

        info!("dispatcher stopped");
    }

    /// Run on a background task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()>
    where
        S: 'static,
    {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// One claim -> process cycle. `Err` only when the claim itself fails.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        self.tick_with(&CancellationToken::new()).await
    }

    /// Tick until a tick claims nothing. Rows waiting out a backoff are not
    /// due, so they do not keep this going.
    pub async fn drain(&self) -> Result<TickReport, StoreError> {
        let mut total = TickReport::default();
        loop {
            let report = self.tick().await?;
            if report.is_idle() {
                return Ok(total);
            }
            total.merge(report);
        }
    }

    #[instrument(skip_all, fields(batch_size = self.config.batch_size))]
    pub async fn tick_with(&self, cancel: &CancellationToken) -> Result<TickReport, StoreError> {
        let rows = self
            .store
            .claim_batch(self.config.batch_size, self.config.lease())
            .await?;
        let mut report = TickReport {
            claimed: rows.len(),
            ..TickReport::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }
        debug!(claimed = rows.len(), "claimed rows");

        let mut start = 0;
        while start < rows.len() {
            if cancel.is_cancelled() {
                break;
            }
            let event_type = rows[start].event_type.as_str();
            let end = rows[start..]
                .iter()
                .position(|r| r.event_type != event_type)
                .map_or(rows.len(), |n| start + n);
            let group = &rows[start..end];

            match self.registry.get(event_type) {
                None => {
                    for row in group {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.on_unknown(row, &mut report).await;
                    }
                }
                Some(handler) if handler.supports_batch() && group.len() > 1 => {
                    self.process_batch(handler.as_ref(), group, &mut report).await;
                }
                Some(handler) => {
                    for row in group {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let result = handler.handle_row(row).await;
                        self.record(row, result, &mut report).await;
                    }
                }
            }
            start = end;
        }

        let processed = report.published
            + report.retried
            + report.dead_lettered
            + report.acknowledged_unknown
            + report.outcome_errors
            + report.lease_lost;
        report.abandoned = report.claimed.saturating_sub(processed);
        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "tick cancelled; leases left to expire");
        }
        Ok(report)
    }

    async fn process_batch(
        &self,
        handler: &dyn DynHandler,
        rows: &[ClaimedRow],
        report: &mut TickReport,
    ) {
        debug!(event_type = handler.event_type(), rows = rows.len(), "batch dispatch");
        let results = handler.handle_rows(rows).await;
        for (row, result) in rows.iter().zip(results) {
            self.record(row, result, report).await;
        }
    }

    async fn record(
        &self,
        row: &ClaimedRow,
        result: Result<(), HandlerError>,
        report: &mut TickReport,
    ) {
        match result {
            Ok(()) => match self.store.mark_published(row.id, row.lease.token).await {
                Ok(()) => {
                    report.published += 1;
                    debug!(outbox_id = %row.id, event_type = %row.event_type, "published");
                }
                Err(e) => self.outcome_error(row, "mark_published", &e, report),
            },
            Err(err) => self.on_failure(row, &err, report).await,
        }
    }

    async fn on_failure(&self, row: &ClaimedRow, err: &HandlerError, report: &mut TickReport) {
        let attempts = row.attempts.saturating_add(1);
        let exhausted = self.config.on_exhausted == ExhaustedPolicy::DeadLetter
            && attempts >= self.config.max_attempts;

        if err.is_permanent() || exhausted {
            match self
                .store
                .mark_dead(row.id, row.lease.token, &err.to_string())
                .await
            {
                Ok(()) => {
                    report.dead_lettered += 1;
                    error!(
                        outbox_id = %row.id,
                        event_type = %row.event_type,
                        attempts,
                        permanent = err.is_permanent(),
                        error = %err,
                        "dead-lettered"
                    );
                }
                Err(e) => self.outcome_error(row, "mark_dead", &e, report),
            }
            return;
        }

        let next = self.backoff.next_available_at(self.clock.now(), attempts);
        match self
            .store
            .mark_failed(row.id, row.lease.token, next, &err.to_string())
            .await
        {
            Ok(()) => {
                report.retried += 1;
                warn!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    attempts,
                    next_available_at = %next,
                    error = %err,
                    "dispatch failed; will retry"
                );
            }
            Err(e) => self.outcome_error(row, "mark_failed", &e, report),
        }
    }

    async fn on_unknown(&self, row: &ClaimedRow, report: &mut TickReport) {
        let reason = format!("no handler registered for event type {}", row.event_type);
        match self.config.unknown_event {
            UnknownEventPolicy::Acknowledge => match self
                .store
                .mark_published(row.id, row.lease.token)
                .await
            {
                Ok(()) => {
                    report.acknowledged_unknown += 1;
                    warn!(outbox_id = %row.id, event_type = %row.event_type, "{reason}; acknowledged");
                }
                Err(e) => self.outcome_error(row, "mark_published", &e, report),
            },
            UnknownEventPolicy::Retry => {
                self.on_failure(row, &HandlerError::Transient(reason), report)
                    .await;
            }
            UnknownEventPolicy::DeadLetter => {
                self.on_failure(row, &HandlerError::Permanent(reason), report)
                    .await;
            }
        }
    }

    fn outcome_error(&self, row: &ClaimedRow, op: &str, err: &StoreError, report: &mut TickReport) {
        if let StoreError::LeaseLost(_) = err {
            report.lease_lost += 1;
            warn!(
                outbox_id = %row.id,
                op,
                lease = %row.lease.token,
                "lease lost; outcome dropped, current holder records it"
            );
            return;
        }
        report.outcome_errors += 1;
        error!(
            outbox_id = %row.id,
            op,
            error = %err,
            "failed to record outcome; row returns after lease expiry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AggregateRef, Headers, LeaseToken, OutboxCounts, OutboxId, OutboxMessage, OutboxRow,
        OutboxStatus,
    };
    use crate::impls::{InMemoryOutboxStore, InMemoryStreamPublisher};
    use crate::ports::{FixedClock, Transaction};
    use crate::typed::event::fixtures::{ItemCreated, ItemRemoved};
    use crate::typed::Event;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryOutboxStore>,
        publisher: Arc<InMemoryStreamPublisher>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ));
            Self {
                store: Arc::new(InMemoryOutboxStore::with_clock(clock.clone())),
                publisher: Arc::new(InMemoryStreamPublisher::new()),
                clock,
            }
        }

        fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher<InMemoryOutboxStore> {
            self.dispatcher_on(Arc::clone(&self.store), config)
        }

        fn dispatcher_on<S: OutboxStore>(
            &self,
            store: Arc<S>,
            config: DispatcherConfig,
        ) -> Dispatcher<S> {
            let mut registry = HandlerRegistry::new();
            registry
                .register_publisher::<ItemCreated, _>(Arc::clone(&self.publisher), "items")
                .unwrap();
            Dispatcher::new(store, Arc::new(registry), config, self.clock.clone())
        }

        async fn insert(&self, event_type: &str, payload: &str) {
            let mut tx = self.store.begin().await.unwrap();
            self.store
                .insert(
                    &mut tx,
                    OutboxMessage::new(
                        AggregateRef::new("item", "i-1"),
                        event_type,
                        payload.as_bytes().to_vec(),
                    )
                    .with_headers(Headers::new()),
                )
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        async fn insert_item(&self) {
            self.insert(ItemCreated::EVENT_TYPE, r#"{"id":"i-1","name":"lamp"}"#)
                .await;
        }
    }

    #[tokio::test]
    async fn success_marks_published() {
        let h = Harness::new();
        h.insert_item().await;
        let dispatcher = h.dispatcher(DispatcherConfig::default());

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.published, 1);
        assert_eq!(h.publisher.published_ids().await, vec![OutboxId::new(1)]);
        assert!(dispatcher.tick().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn failure_backs_off_then_succeeds() {
        let h = Harness::new();
        h.insert_item().await;
        h.publisher.fail_next(1).await;
        let dispatcher = h.dispatcher(DispatcherConfig::default());

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.retried, 1);
        let row = h.store.get(OutboxId::new(1)).await.unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.available_at, h.clock.now() + chrono::TimeDelta::seconds(1));

        assert!(dispatcher.tick().await.unwrap().is_idle());
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(dispatcher.tick().await.unwrap().published, 1);
    }

    #[tokio::test]
    async fn exhausted_rows_are_dead_lettered() {
        let h = Harness::new();
        h.insert_item().await;
        h.publisher.fail_next(usize::MAX).await;
        let dispatcher = h.dispatcher(DispatcherConfig {
            max_attempts: 3,
            ..DispatcherConfig::default()
        });

        for _ in 0..3 {
            dispatcher.tick().await.unwrap();
            h.clock.advance(Duration::from_secs(600));
        }

        let row = h.store.get(OutboxId::new(1)).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Dead);
        assert_eq!(row.attempts, 3);
        assert!(dispatcher.tick().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn retry_forever_never_dead_letters() {
        let h = Harness::new();
        h.insert_item().await;
        h.publisher.fail_next(usize::MAX).await;
        let dispatcher = h.dispatcher(DispatcherConfig {
            max_attempts: 2,
            on_exhausted: ExhaustedPolicy::RetryForever,
            ..DispatcherConfig::default()
        });

        for _ in 0..5 {
            assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
            h.clock.advance(Duration::from_secs(600));
        }
        let row = h.store.get(OutboxId::new(1)).await.unwrap().unwrap();
        assert_eq!((row.status, row.attempts), (OutboxStatus::Pending, 5));
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered_at_once() {
        let h = Harness::new();
        h.insert(ItemCreated::EVENT_TYPE, "not json").await;
        let dispatcher = h.dispatcher(DispatcherConfig::default());

        assert_eq!(dispatcher.tick().await.unwrap().dead_lettered, 1);
        assert_eq!(h.publisher.attempts().await, 0);
    }

    #[tokio::test]
    async fn unknown_event_policies() {
        for (policy, expected) in [
            (UnknownEventPolicy::Acknowledge, OutboxStatus::Published),
            (UnknownEventPolicy::Retry, OutboxStatus::Pending),
            (UnknownEventPolicy::DeadLetter, OutboxStatus::Dead),
        ] {
            let h = Harness::new();
            h.insert(ItemRemoved::EVENT_TYPE, r#"{"id":"i-1"}"#).await;
            let dispatcher = h.dispatcher(DispatcherConfig {
                unknown_event: policy,
                ..DispatcherConfig::default()
            });

            let report = dispatcher.tick().await.unwrap();
            let row = h.store.get(OutboxId::new(1)).await.unwrap().unwrap();
            assert_eq!(row.status, expected, "{policy:?}");
            if policy == UnknownEventPolicy::Acknowledge {
                assert_eq!(report.acknowledged_unknown, 1);
                assert!(row.last_error.is_none());
            } else {
                assert_eq!(report.acknowledged_unknown, 0);
                assert!(row.last_error.unwrap().contains("item.removed"));
            }
        }
    }

    /// Delegating store whose `mark_published` can fail, or can lose its
    /// lease to a competing claim before it runs.
    struct Contested<S> {
        inner: Arc<S>,
        clock: Arc<FixedClock>,
        failing_publishes: AtomicUsize,
        steal_lease: bool,
    }

    impl<S> Contested<S> {
        fn new(inner: Arc<S>, clock: Arc<FixedClock>) -> Self {
            Self {
                inner,
                clock,
                failing_publishes: AtomicUsize::new(0),
                steal_lease: false,
            }
        }
    }

    #[async_trait]
    impl<S: OutboxStore> OutboxStore for Contested<S> {
        type Tx = S::Tx;

        async fn begin(&self) -> Result<S::Tx, StoreError> {
            self.inner.begin().await
        }

        async fn insert(&self, tx: &mut S::Tx, message: OutboxMessage) -> Result<(), StoreError> {
            self.inner.insert(tx, message).await
        }

        async fn claim_batch(
            &self,
            limit: usize,
            lease: Duration,
        ) -> Result<Vec<ClaimedRow>, StoreError> {
            self.inner.claim_batch(limit, lease).await
        }

        async fn mark_published(&self, id: OutboxId, token: LeaseToken) -> Result<(), StoreError> {
            if self.steal_lease {
                self.clock.advance(Duration::from_secs(31));
                self.inner.claim_batch(10, Duration::from_secs(30)).await?;
            }
            let fail = self
                .failing_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(StoreError::Storage("disk I/O error".into()));
            }
            self.inner.mark_published(id, token).await
        }

        async fn mark_failed(
            &self,
            id: OutboxId,
            token: LeaseToken,
            next_available_at: DateTime<Utc>,
            error: &str,
        ) -> Result<(), StoreError> {
            self.inner.mark_failed(id, token, next_available_at, error).await
        }

        async fn mark_dead(
            &self,
            id: OutboxId,
            token: LeaseToken,
            error: &str,
        ) -> Result<(), StoreError> {
            self.inner.mark_dead(id, token, error).await
        }

        async fn requeue_dead(&self, id: OutboxId) -> Result<(), StoreError> {
            self.inner.requeue_dead(id).await
        }

        async fn get(&self, id: OutboxId) -> Result<Option<OutboxRow>, StoreError> {
            self.inner.get(id).await
        }

        async fn counts(&self) -> Result<OutboxCounts, StoreError> {
            self.inner.counts().await
        }
    }

    #[tokio::test]
    async fn failed_outcome_is_retried_after_lease_expiry() {
        let h = Harness::new();
        h.insert_item().await;
        let store = Contested::new(Arc::clone(&h.store), h.clock.clone());
        store.failing_publishes.store(1, Ordering::SeqCst);
        let dispatcher = h.dispatcher_on(Arc::new(store), DispatcherConfig::default());

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.outcome_errors, 1);
        assert_eq!((report.published, report.abandoned), (0, 0));
        let row = h.store.get(OutboxId::new(1)).await.unwrap().unwrap();
        assert_eq!((row.status, row.attempts), (OutboxStatus::Pending, 0));

        // still leased
        assert!(dispatcher.tick().await.unwrap().is_idle());

        h.clock.advance(Duration::from_secs(31));
        let report = dispatcher.tick().await.unwrap();
        assert_eq!((report.published, report.outcome_errors), (1, 0));
        // delivered twice: at-least-once
        assert_eq!(
            h.publisher.published_ids().await,
            vec![OutboxId::new(1), OutboxId::new(1)]
        );
    }

    #[tokio::test]
    async fn lost_lease_drops_the_outcome() {
        let h = Harness::new();
        h.insert_item().await;
        let store = Contested {
            steal_lease: true,
            ..Contested::new(Arc::clone(&h.store), h.clock.clone())
        };
        let dispatcher = h.dispatcher_on(Arc::new(store), DispatcherConfig::default());

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.lease_lost, 1);
        assert_eq!((report.published, report.outcome_errors, report.abandoned), (0, 0, 0));

        let row = h.store.get(OutboxId::new(1)).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert!(row.has_active_lease(h.clock.now()));
    }

    #[tokio::test]
    async fn adjacent_rows_of_one_type_go_out_as_a_batch() {
        let h = Harness::new();
        for _ in 0..3 {
            h.insert_item().await;
        }
        let dispatcher = h.dispatcher(DispatcherConfig::default());

        // a single injected failure sinks the whole bulk call
        h.publisher.fail_next(1).await;
        let report = dispatcher.tick().await.unwrap();
        assert_eq!((report.published, report.retried), (0, 3));

        h.clock.advance(Duration::from_secs(1));
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(
            h.publisher.published_ids().await,
            vec![OutboxId::new(1), OutboxId::new(2), OutboxId::new(3)]
        );
    }

    #[tokio::test]
    async fn cancelled_tick_abandons_rows() {
        let h = Harness::new();
        h.insert_item().await;
        h.insert_item().await;
        let dispatcher = h.dispatcher(DispatcherConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = dispatcher.tick_with(&cancel).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.abandoned, 2);
        assert_eq!(h.store.counts().await.unwrap().leased, 2);
    }

    #[tokio::test]
    async fn batch_size_bounds_a_tick() {
        let h = Harness::new();
        for _ in 0..5 {
            h.insert_item().await;
        }
        let dispatcher = h.dispatcher(DispatcherConfig {
            batch_size: 2,
            ..DispatcherConfig::default()
        });

        assert_eq!(dispatcher.tick().await.unwrap().claimed, 2);
        let rest = dispatcher.drain().await.unwrap();
        assert_eq!(rest.published, 3);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let h = Harness::new();
        h.insert_item().await;
        let dispatcher = h.dispatcher(DispatcherConfig {
            tick_interval_ms: 10,
            ..DispatcherConfig::default()
        });
        let cancel = CancellationToken::new();
        let handle = dispatcher.spawn(cancel.clone());

        for _ in 0..100 {
            if h.store.counts().await.unwrap().published == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.store.counts().await.unwrap().published, 1);
    }
}
