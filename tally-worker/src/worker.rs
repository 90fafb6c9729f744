use std::sync::Arc;
use std::time;

use tokio::sync;
use tracing::error;

use tally_common::category::UserCategories;
use tally_common::envelope::Envelope;
use tally_common::health::HealthHandle;
use tally_common::queue::{Delivery, EnvelopeQueue};
use tally_common::retry::RetryPolicy;
use tally_common::store::{CategoryStore, TransactionStore};
use tally_common::transaction::{TransactionDraft, TransactionRecord};

use crate::classifier::{classify_with_backoff, Classifier, ClassifyRequest};
use crate::error::{EnvelopeError, WorkerError};
use crate::parser::parse_upload;
use crate::reader::ObjectReader;

/// Tunables for one consumer, taken from `Config` in production.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    /// The interval for polling the queue.
    pub poll_interval: time::Duration,
    /// How many envelopes one receive cycle may pull.
    pub batch_size: u32,
    /// Maximum number of envelopes processed concurrently.
    pub max_concurrent_envelopes: usize,
    /// Confidence at or above this commits `Categorized`.
    pub confidence_threshold: f64,
    /// The wall-clock budget for one envelope, oracle retries included.
    pub message_deadline: time::Duration,
}

/// Everything one envelope-processing task needs, cheap to clone into it.
#[derive(Clone)]
struct ProcessorHandles {
    name: String,
    queue: Arc<dyn EnvelopeQueue>,
    reader: Arc<dyn ObjectReader>,
    classifier: Arc<dyn Classifier>,
    transactions: Arc<dyn TransactionStore>,
    categories: Arc<dyn CategoryStore>,
    retry_policy: RetryPolicy,
    confidence_threshold: f64,
    message_deadline: time::Duration,
}

/// A worker to poll the envelope queue and process received envelopes into
/// transaction records.
///
/// Envelopes within a batch are isolated from each other: each one is
/// acknowledged, redelivered or dead-lettered on its own, so one bad upload
/// never holds back the rest of the batch.
pub struct BatchConsumer {
    poll_interval: time::Duration,
    batch_size: u32,
    max_concurrent_envelopes: usize,
    semaphore: Arc<sync::Semaphore>,
    handles: ProcessorHandles,
    /// The liveness check handle, to call on a schedule to report healthy.
    liveness: HealthHandle,
}

impl BatchConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: Arc<dyn EnvelopeQueue>,
        reader: Arc<dyn ObjectReader>,
        classifier: Arc<dyn Classifier>,
        transactions: Arc<dyn TransactionStore>,
        categories: Arc<dyn CategoryStore>,
        settings: ConsumerSettings,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            batch_size: settings.batch_size,
            max_concurrent_envelopes: settings.max_concurrent_envelopes,
            semaphore: Arc::new(sync::Semaphore::new(settings.max_concurrent_envelopes)),
            handles: ProcessorHandles {
                name: name.to_owned(),
                queue,
                reader,
                classifier,
                transactions,
                categories,
                retry_policy,
                confidence_threshold: settings.confidence_threshold,
                message_deadline: settings.message_deadline,
            },
            liveness,
        }
    }

    /// Run this worker to continuously process envelopes as they arrive.
    ///
    /// Dispatched envelopes are not awaited here: the poll loop keeps
    /// ticking and reporting liveness while envelopes spend their
    /// processing budget, which can exceed the reporting deadline.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            metrics::gauge!("consumer_saturation_percent").set(
                1f64 - self.semaphore.available_permits() as f64
                    / self.max_concurrent_envelopes as f64,
            );

            self.dispatch_cycle().await?;
        }
    }

    /// Receive one batch and spawn a processing task per envelope.
    /// Dispatch waits on concurrency permits, not on the processing.
    async fn dispatch_cycle(&self) -> Result<Vec<tokio::task::JoinHandle<()>>, WorkerError> {
        let deliveries = self
            .handles
            .queue
            .receive_batch(&self.handles.name, self.batch_size)
            .await?;

        let mut tasks = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            tasks.push(
                spawn_envelope_processing_task(
                    self.handles.clone(),
                    self.semaphore.clone(),
                    delivery,
                )
                .await,
            );
        }

        Ok(tasks)
    }

    /// Receive one batch and process every envelope in it to completion.
    /// Returns how many envelopes were received.
    pub async fn consume_cycle(&self) -> Result<usize, WorkerError> {
        let tasks = self.dispatch_cycle().await?;
        let received = tasks.len();

        for task in tasks {
            if let Err(join_error) = task.await {
                error!("envelope processing task panicked: {}", join_error);
            }
        }

        Ok(received)
    }
}

/// Spawn a Tokio task to process one envelope once we acquire a permit.
async fn spawn_envelope_processing_task(
    handles: ProcessorHandles,
    semaphore: Arc<sync::Semaphore>,
    delivery: Delivery,
) -> tokio::task::JoinHandle<()> {
    let permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    tokio::spawn(async move {
        process_delivery(handles, delivery).await;
        drop(permit);
    })
}

/// Process one delivered envelope and settle it against the queue.
///
/// The envelope is acknowledged only when every draft reached a terminal
/// classification outcome. On failure it is left unacknowledged to lapse
/// back for redelivery, and if this delivery consumed the last receive its
/// drafts are committed as `DeadLettered` so they stop reading as work in
/// progress.
async fn process_delivery(handles: ProcessorHandles, delivery: Delivery) {
    let labels = [("consumer", handles.name.clone())];
    metrics::counter!("envelopes_total", &labels).increment(1);

    let started = tokio::time::Instant::now();
    // Holds whatever drafts were parsed before a failure, for dead-lettering.
    let mut drafts = Vec::new();
    let result = process_envelope(&handles, &delivery.envelope, &mut drafts).await;

    match result {
        Ok(()) => {
            if let Err(queue_error) = handles.queue.acknowledge(&delivery.receipt).await {
                // The envelope will be redelivered; the idempotent upserts
                // make the repeat a no-op.
                error!(
                    "failed to acknowledge envelope {}: {}",
                    delivery.envelope.object_key, queue_error
                );
                return;
            }

            metrics::counter!("envelopes_completed", &labels).increment(1);
            metrics::histogram!("envelope_processing_duration_seconds", &labels)
                .record(started.elapsed().as_secs_f64());
        }
        Err(envelope_error) => {
            error!(
                "failed to process envelope {}: {}",
                delivery.envelope.object_key, envelope_error
            );

            if let Err(queue_error) = handles
                .queue
                .record_failure(&delivery.receipt, &envelope_error.to_string())
                .await
            {
                error!(
                    "failed to record failure for envelope {}: {}",
                    delivery.envelope.object_key, queue_error
                );
            }

            if delivery.is_final_receive() {
                mark_dead_lettered(&handles, &drafts, &labels).await;
            }

            metrics::counter!("envelopes_failed", &labels).increment(1);
        }
    }
}

/// Read, parse, classify and commit one envelope's transactions.
///
/// Drafts parsed so far are pushed into `drafts` before classification
/// starts, so a failure partway through still leaves the caller knowing
/// which records this envelope owns.
async fn process_envelope(
    handles: &ProcessorHandles,
    envelope: &Envelope,
    drafts: &mut Vec<TransactionDraft>,
) -> Result<(), EnvelopeError> {
    let content = handles
        .reader
        .get_string(&envelope.bucket, &envelope.object_key)
        .await
        .map_err(|e| EnvelopeError::ObjectReadError {
            key: envelope.object_key.clone(),
            reason: e.to_string(),
        })?;

    *drafts = parse_upload(envelope, &content)?;
    if drafts.is_empty() {
        return Ok(());
    }
    let user_id = drafts[0].user_id.clone();

    // Everything below shares the envelope's processing window.
    let started = tokio::time::Instant::now();

    // Commit every draft as pending before classification starts, so the
    // upload is visible as work in progress even if the oracle stalls.
    for draft in drafts.iter() {
        upsert_with_backoff(handles, &TransactionRecord::pending(draft), started).await?;
    }

    let categories = match handles.categories.user_categories(&user_id).await? {
        Some(categories) => categories,
        None => UserCategories::default_for(&user_id),
    };
    let candidates = categories.candidate_ids();

    for draft in drafts.iter() {
        // A redelivered envelope skips drafts that already settled, so
        // duplicates cost no oracle calls and cannot re-commit.
        if let Some(existing) = handles
            .transactions
            .get(&draft.user_id, &draft.transaction_date_id)
            .await?
        {
            if existing.status.is_terminal() {
                continue;
            }
        }

        let remaining = handles.message_deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(EnvelopeError::DeadlineExceeded);
        }

        let request = ClassifyRequest {
            user_id: draft.user_id.clone(),
            date: draft.date.clone(),
            amount_minor: draft.amount_minor,
            merchant: draft.merchant.clone(),
            description: draft.description.clone(),
            candidate_categories: candidates.clone(),
        };
        let classification = classify_with_backoff(
            handles.classifier.as_ref(),
            &request,
            &handles.retry_policy,
            remaining,
        )
        .await?;

        let record = TransactionRecord::classified(
            draft,
            &classification.category_id,
            classification.confidence,
            handles.confidence_threshold,
        );
        let status_label = [("status", record.status.to_string())];
        upsert_with_backoff(handles, &record, started).await?;
        metrics::counter!("transactions_committed", &status_label).increment(1);
    }

    Ok(())
}

/// Upsert one record, retrying transient store failures with backoff until
/// the envelope's processing window would be exceeded. A write skipped by
/// terminal-state protection is a successful no-op, not a failure.
async fn upsert_with_backoff(
    handles: &ProcessorHandles,
    record: &TransactionRecord,
    started: tokio::time::Instant,
) -> Result<(), EnvelopeError> {
    let mut attempt: u32 = 0;

    loop {
        match handles.transactions.upsert(record).await {
            Ok(_) => return Ok(()),
            Err(store_error) => {
                let interval = handles.retry_policy.retry_interval(attempt);
                if started.elapsed() + interval >= handles.message_deadline {
                    return Err(EnvelopeError::StoreError(store_error));
                }
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
        }
    }
}

/// Commit this envelope's drafts as `DeadLettered`. The upsert guard keeps
/// any draft that already reached a terminal outcome.
async fn mark_dead_lettered(
    handles: &ProcessorHandles,
    drafts: &[TransactionDraft],
    labels: &[(&'static str, String)],
) {
    for draft in drafts {
        if let Err(store_error) = handles
            .transactions
            .upsert(&TransactionRecord::dead_lettered(draft))
            .await
        {
            error!(
                "failed to dead-letter transaction {}: {}",
                draft.transaction_date_id, store_error
            );
        }
    }

    metrics::counter!("envelopes_dead_lettered", labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    use tally_common::health::HealthRegistry;
    use tally_common::queue::MemoryQueue;
    use tally_common::store::{MemoryCategoryStore, MemoryTransactionStore};
    use tally_common::transaction::TransactionStatus;

    use crate::classifier::FakeClassifier;
    use crate::reader::MemoryObjectReader;

    const THREE_ROW_UPLOAD: &str = "\
date,amount,merchant,description
2024-03-02,-12.50,Corner Cafe,CORNER CAFE 0042
2024-03-02,-3.00,Metro,METRO FARE
2024-03-04,1850.00,Acme Corp,SALARY MARCH";

    struct Fixture {
        queue: Arc<MemoryQueue>,
        reader: MemoryObjectReader,
        classifier: FakeClassifier,
        transactions: Arc<MemoryTransactionStore>,
        categories: MemoryCategoryStore,
        registry: HealthRegistry,
        consumer: BatchConsumer,
    }

    async fn fixture(max_receives: i32, message_deadline: time::Duration) -> Fixture {
        fixture_with(
            max_receives,
            message_deadline,
            ::time::Duration::seconds(30),
        )
        .await
    }

    async fn fixture_with(
        max_receives: i32,
        message_deadline: time::Duration,
        liveness_deadline: ::time::Duration,
    ) -> Fixture {
        let queue = Arc::new(MemoryQueue::new(time::Duration::from_secs(300), max_receives));
        let reader = MemoryObjectReader::new();
        let classifier = FakeClassifier::new();
        let transactions = Arc::new(MemoryTransactionStore::new());
        let categories = MemoryCategoryStore::new();

        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("consumer".to_string(), liveness_deadline)
            .await;

        let consumer = BatchConsumer::new(
            "test-consumer",
            queue.clone(),
            Arc::new(reader.clone()),
            Arc::new(classifier.clone()),
            transactions.clone(),
            Arc::new(categories.clone()),
            ConsumerSettings {
                poll_interval: time::Duration::from_millis(10),
                batch_size: 10,
                max_concurrent_envelopes: 4,
                confidence_threshold: 0.6,
                message_deadline,
            },
            RetryPolicy::new(2, time::Duration::from_millis(1), None),
            liveness,
        );

        Fixture {
            queue,
            reader,
            classifier,
            transactions,
            categories,
            registry,
            consumer,
        }
    }

    async fn script_three_rows(f: &Fixture) {
        f.classifier.script("CORNER CAFE 0042", "Food", 0.92).await;
        f.classifier.script("METRO FARE", "Transportation", 0.88).await;
        f.classifier.script("SALARY MARCH", "Savings", 0.75).await;
    }

    #[tokio::test]
    async fn test_processes_an_upload_end_to_end() {
        let f = fixture(3, time::Duration::from_secs(5)).await;
        f.reader
            .put("uploads", "user-1/march.csv", THREE_ROW_UPLOAD)
            .await;
        script_three_rows(&f).await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        let received = f.consumer.consume_cycle().await.expect("cycle failed");
        assert_eq!(received, 1);

        assert_eq!(f.transactions.record_count().await, 3);
        let committed = f
            .transactions
            .list_pending_validation(10)
            .await
            .expect("list failed");
        assert!(committed.is_empty());
        assert!(f
            .transactions
            .list_in_progress(10)
            .await
            .expect("list failed")
            .is_empty());

        // Acknowledged, so the envelope is gone even after its visibility
        // timeout lapses.
        f.queue.expire_visibility().await;
        let redelivered = f.consumer.consume_cycle().await.expect("cycle failed");
        assert_eq!(redelivered, 0);
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_idempotent() {
        let f = fixture(3, time::Duration::from_secs(5)).await;
        f.reader
            .put("uploads", "user-1/march.csv", THREE_ROW_UPLOAD)
            .await;
        script_three_rows(&f).await;

        // The object store may notify more than once for one upload.
        for _ in 0..2 {
            f.queue
                .enqueue(Envelope::new("uploads", "user-1/march.csv"))
                .await
                .expect("failed to enqueue");
        }

        let received = f.consumer.consume_cycle().await.expect("cycle failed");
        assert_eq!(received, 2);

        assert_eq!(f.transactions.record_count().await, 3);
        // The duplicate found every record already settled and skipped the
        // oracle entirely.
        assert_eq!(f.classifier.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_liveness_outlives_a_slow_envelope() {
        let f = fixture_with(
            3,
            time::Duration::from_secs(5),
            ::time::Duration::milliseconds(300),
        )
        .await;
        f.reader
            .put(
                "uploads",
                "user-1/march.csv",
                "date,amount,merchant,description\n2024-03-02,-12.50,Corner Cafe,CORNER CAFE 0042",
            )
            .await;
        f.classifier.script("CORNER CAFE 0042", "Food", 0.92).await;
        // Roughly a second of injected backoff before classification succeeds.
        f.classifier.fake_fail(10).await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        let consumer = f.consumer;
        let run = tokio::spawn(async move { consumer.run().await });

        // Well past the reporting deadline, with the envelope likely still
        // in flight, the poll loop keeps the component healthy.
        tokio::time::sleep(time::Duration::from_millis(600)).await;
        assert!(f.registry.get_status().healthy);

        let settled_by = tokio::time::Instant::now() + time::Duration::from_secs(5);
        loop {
            let in_progress = f
                .transactions
                .list_in_progress(10)
                .await
                .expect("list failed");
            if in_progress.is_empty() && f.transactions.record_count().await == 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < settled_by,
                "envelope never settled"
            );
            tokio::time::sleep(time::Duration::from_millis(25)).await;
        }
        assert!(f.registry.get_status().healthy);
        run.abort();
    }

    #[tokio::test]
    async fn test_low_confidence_awaits_validation() {
        let f = fixture(3, time::Duration::from_secs(5)).await;
        f.reader
            .put("uploads", "user-1/march.csv", THREE_ROW_UPLOAD)
            .await;
        f.classifier.script("CORNER CAFE 0042", "Food", 0.92).await;
        f.classifier.script("METRO FARE", "Transportation", 0.4).await;
        f.classifier.script("SALARY MARCH", "Savings", 0.75).await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        f.consumer.consume_cycle().await.expect("cycle failed");

        // The uncertain line needs review; the other two settle as
        // categorized.
        assert_eq!(f.transactions.record_count().await, 3);
        let needs_review = f
            .transactions
            .list_pending_validation(10)
            .await
            .expect("list failed");
        assert_eq!(needs_review.len(), 1);
        assert_eq!(needs_review[0].description, "METRO FARE");
        assert_eq!(needs_review[0].status, TransactionStatus::AwaitingValidation);
        assert_eq!(needs_review[0].category_id.as_deref(), Some("Transportation"));
        assert_eq!(needs_review[0].confidence, Some(0.4));

        // Low confidence is a terminal outcome: the envelope was acknowledged.
        f.queue.expire_visibility().await;
        assert_eq!(f.consumer.consume_cycle().await.expect("cycle failed"), 0);
    }

    #[tokio::test]
    async fn test_user_categories_reach_the_classifier() {
        use tally_common::category::{CategoryGroup, UserCategories};

        let f = fixture(3, time::Duration::from_secs(5)).await;
        f.categories
            .put(UserCategories {
                user_id: "user-1".to_owned(),
                categories: vec![CategoryGroup {
                    category: "Eating Out".to_owned(),
                    subcategories: Vec::new(),
                }],
            })
            .await;
        f.reader
            .put(
                "uploads",
                "user-1/march.csv",
                "date,amount,merchant,description\n2024-03-02,-12.50,Corner Cafe,CORNER CAFE 0042",
            )
            .await;
        f.classifier
            .script("CORNER CAFE 0042", "Eating Out", 0.9)
            .await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        f.consumer.consume_cycle().await.expect("cycle failed");

        let drafts = parse_upload(
            &Envelope::new("uploads", "user-1/march.csv"),
            "date,amount,merchant,description\n2024-03-02,-12.50,Corner Cafe,CORNER CAFE 0042",
        )
        .expect("parse failed");
        let stored = f
            .transactions
            .get("user-1", &drafts[0].transaction_date_id)
            .await
            .expect("get failed")
            .expect("record not found");
        assert_eq!(stored.category_id.as_deref(), Some("Eating Out"));
        assert_eq!(stored.status, TransactionStatus::Categorized);
    }

    #[tokio::test]
    async fn test_failed_envelope_keeps_committed_records() {
        let f = fixture(3, time::Duration::from_secs(5)).await;
        f.reader
            .put(
                "uploads",
                "user-1/march.csv",
                "date,amount,merchant,description\n\
                 2024-03-02,-12.50,Corner Cafe,CORNER CAFE 0042\n\
                 2024-03-02,-3.00,Metro,METRO FARE",
            )
            .await;
        // Only the first row is classifiable; the second is rejected.
        f.classifier.script("CORNER CAFE 0042", "Food", 0.92).await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        f.consumer.consume_cycle().await.expect("cycle failed");

        // The first record's commit survives the envelope failure.
        assert_eq!(f.transactions.record_count().await, 2);
        let in_progress = f
            .transactions
            .list_in_progress(10)
            .await
            .expect("list failed");
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].description, "METRO FARE");
        assert_eq!(
            in_progress[0].status,
            TransactionStatus::PendingCategorization
        );

        // Unacknowledged: the envelope comes back after its timeout, and the
        // retry only classifies the record that is still pending.
        f.queue.expire_visibility().await;
        f.classifier.script("METRO FARE", "Transportation", 0.88).await;
        let calls_before = f.classifier.call_count().await;
        assert_eq!(f.consumer.consume_cycle().await.expect("cycle failed"), 1);
        assert_eq!(f.classifier.call_count().await, calls_before + 1);
        assert!(f
            .transactions
            .list_in_progress(10)
            .await
            .expect("list failed")
            .is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_oracle_dead_letters_on_final_receive() {
        // One receive only: the first failure is terminal for the envelope.
        let f = fixture(1, time::Duration::from_millis(20)).await;
        f.reader
            .put("uploads", "user-1/march.csv", THREE_ROW_UPLOAD)
            .await;
        f.classifier.fake_fail(u32::MAX).await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        f.consumer.consume_cycle().await.expect("cycle failed");

        // Every draft is committed as dead-lettered, not left pending.
        assert_eq!(f.transactions.record_count().await, 3);
        assert!(f
            .transactions
            .list_in_progress(10)
            .await
            .expect("list failed")
            .is_empty());

        // The envelope itself lands in the dead-letter listing exactly once.
        f.queue.expire_visibility().await;
        assert_eq!(f.consumer.consume_cycle().await.expect("cycle failed"), 0);
        let dead = f.queue.dead_letters(10).await.expect("list failed");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].errors[0].contains("unavailable"));
    }

    #[tokio::test]
    async fn test_malformed_upload_dead_letters_without_records() {
        let f = fixture(1, time::Duration::from_secs(5)).await;
        f.reader
            .put(
                "uploads",
                "user-1/march.csv",
                "date,amount,merchant,description\n2024-03-02,not-a-number,Metro,METRO FARE",
            )
            .await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        f.consumer.consume_cycle().await.expect("cycle failed");

        // Nothing parsed, so nothing was written to the store.
        assert_eq!(f.transactions.record_count().await, 0);

        f.queue.expire_visibility().await;
        f.consumer.consume_cycle().await.expect("cycle failed");
        let dead = f.queue.dead_letters(10).await.expect("list failed");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].errors[0].contains("malformed"));
    }

    #[tokio::test]
    async fn test_transient_store_outage_recovers_within_the_attempt() {
        let f = fixture(3, time::Duration::from_secs(5)).await;
        f.reader
            .put(
                "uploads",
                "user-1/march.csv",
                "date,amount,merchant,description\n2024-03-02,-12.50,Corner Cafe,CORNER CAFE 0042",
            )
            .await;
        f.classifier.script("CORNER CAFE 0042", "Food", 0.92).await;
        f.transactions.fake_fail_upserts(1).await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/march.csv"))
            .await
            .expect("failed to enqueue");

        f.consumer.consume_cycle().await.expect("cycle failed");

        // The retry inside the processing window absorbed the outage and
        // the envelope completed on its first receive.
        assert_eq!(f.transactions.record_count().await, 1);
        f.queue.expire_visibility().await;
        assert_eq!(f.consumer.consume_cycle().await.expect("cycle failed"), 0);
    }

    #[tokio::test]
    async fn test_header_only_upload_is_acknowledged() {
        let f = fixture(3, time::Duration::from_secs(5)).await;
        f.reader
            .put(
                "uploads",
                "user-1/empty.csv",
                "date,amount,merchant,description\n",
            )
            .await;
        f.queue
            .enqueue(Envelope::new("uploads", "user-1/empty.csv"))
            .await
            .expect("failed to enqueue");

        f.consumer.consume_cycle().await.expect("cycle failed");

        assert_eq!(f.transactions.record_count().await, 0);
        f.queue.expire_visibility().await;
        assert_eq!(f.consumer.consume_cycle().await.expect("cycle failed"), 0);
    }
}
