//! Post-session fan-out.
//!
//! Handlers hand billing entries, portal messages and match data to
//! [`PostSessionHandler`] without ever waiting. Each kind has its own bounded
//! queue and its own pool of worker tasks:
//!
//! ```text
//!  send_billing_entry ──► [billing queue] ──► N workers ──► Biller
//!  send_portal_counts ──► [counts queue]  ──► N workers ──┐
//!  send_portal_data   ──► [portal queue]  ──► N workers ──┴► Publisher ring
//!  send_match_data    ──► [match queue]   ──► N workers ──► Matcher
//! ```
//!
//! A full queue drops the new item and counts it. On cancellation the
//! workers drain what is queued; the last billing and match workers out
//! then flush and close their sink.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::billing::{BillingEntry2, Biller};
use crate::error::PublishError;
use crate::match_data::{MatchDataEntry, Matcher};
use crate::metrics::{Counter, PostSessionMetrics};
use crate::portal::{
    Publisher, SessionCountData, SessionPortalData, TOPIC_SESSION_COUNTS, TOPIC_SESSION_DATA,
};

/// Fan-out configuration
#[derive(Debug, Clone)]
pub struct PostSessionConfig {
    /// Worker tasks per queue
    pub worker_count: usize,
    /// Capacity of each queue
    pub channel_size: usize,
    /// Retries per portal publisher after the first attempt
    pub portal_max_retries: usize,
    /// Deadline for each sink flush and close at shutdown
    pub sink_timeout: Duration,
}

impl Default for PostSessionConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            channel_size: 1024,
            portal_max_retries: 3,
            sink_timeout: Duration::from_secs(10),
        }
    }
}

/// Downstream sinks fed by the fan-out
#[derive(Clone)]
pub struct PostSessionSinks {
    /// Billing ledger
    pub biller: Arc<dyn Biller>,
    /// Match data ingestion
    pub matcher: Arc<dyn Matcher>,
    /// Portal publishers, tried round robin
    pub publishers: Vec<Arc<dyn Publisher>>,
}

/// Round-robin portal publishing with per-publisher retries
struct PortalRing {
    publishers: Vec<Arc<dyn Publisher>>,
    max_retries: usize,
    index: AtomicUsize,
}

impl PortalRing {
    async fn transmit(&self, topic: &str, data: &[u8]) -> Result<usize, PublishError> {
        let count = self.publishers.len();
        let start = self.index.load(Ordering::Relaxed);

        for offset in 0..count {
            let publisher = &self.publishers[(start + offset) % count];
            for attempt in 0..=self.max_retries {
                match publisher.publish(topic, data).await {
                    Ok(bytes) => {
                        let _ = self.index.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| {
                            Some((i + 1) % count)
                        });
                        return Ok(bytes);
                    }
                    Err(PublishError::Retryable(reason)) => {
                        debug!(topic, publisher = (start + offset) % count, attempt, %reason, "portal publish retry");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(PublishError::Exhausted { publishers: count })
    }
}

struct Shared {
    billing_rx: Mutex<Receiver<BillingEntry2>>,
    counts_rx: Mutex<Receiver<SessionCountData>>,
    portal_rx: Mutex<Receiver<SessionPortalData>>,
    match_rx: Mutex<Receiver<MatchDataEntry>>,
    biller: Arc<dyn Biller>,
    matcher: Arc<dyn Matcher>,
    portal: PortalRing,
    metrics: Arc<PostSessionMetrics>,
    cancel: CancellationToken,
    sink_timeout: Duration,
}

impl Shared {
    async fn bill(&self, entry: BillingEntry2) {
        match self.biller.bill(&entry).await {
            Ok(()) => self.metrics.billing_entries_finished.inc(),
            Err(err) => {
                error!(session_id = %format!("{:016x}", entry.session_id), %err, "could not submit billing entry");
                self.metrics.billing_failure.inc();
            }
        }
    }

    async fn submit_match(&self, entry: MatchDataEntry) {
        match self.matcher.submit(&entry).await {
            Ok(()) => self.metrics.match_data_finished.inc(),
            Err(err) => {
                error!(match_id = entry.match_id, %err, "could not submit match data");
                self.metrics.match_data_failure.inc();
            }
        }
    }

    async fn publish_counts(&self, counts: SessionCountData) {
        let bytes = counts.marshal_binary();
        self.publish(TOPIC_SESSION_COUNTS, &bytes).await;
    }

    async fn publish_portal_data(&self, data: SessionPortalData) {
        match data.marshal_binary() {
            Ok(bytes) => self.publish(TOPIC_SESSION_DATA, &bytes).await,
            Err(err) => {
                error!(%err, "could not marshal portal data");
                self.metrics.portal_failure.inc();
            }
        }
    }

    async fn publish(&self, topic: &str, data: &[u8]) {
        match self.portal.transmit(topic, data).await {
            Ok(bytes) => {
                debug!(topic, bytes, "published to portal");
                self.metrics.portal_entries_finished.inc();
            }
            Err(err) => {
                error!(topic, %err, "could not publish portal message");
                self.metrics.portal_failure.inc();
            }
        }
    }

    async fn finish_billing(&self) {
        match tokio::time::timeout(self.sink_timeout, self.biller.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "billing flush failed"),
            Err(_) => warn!("billing flush timed out"),
        }
        match tokio::time::timeout(self.sink_timeout, self.biller.close()).await {
            Ok(Ok(())) => debug!("biller closed"),
            Ok(Err(err)) => warn!(%err, "billing close failed"),
            Err(_) => warn!("billing close timed out"),
        }
    }

    async fn finish_matcher(&self) {
        match tokio::time::timeout(self.sink_timeout, self.matcher.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "match data flush failed"),
            Err(_) => warn!("match data flush timed out"),
        }
        match tokio::time::timeout(self.sink_timeout, self.matcher.close()).await {
            Ok(Ok(())) => debug!("matcher closed"),
            Ok(Err(err)) => warn!(%err, "match data close failed"),
            Err(_) => warn!("match data close timed out"),
        }
    }
}

/// Next queued item, or `None` once cancelled or closed.
async fn next_item<T>(rx: &Mutex<Receiver<T>>, cancel: &CancellationToken) -> Option<T> {
    let mut rx = rx.lock().await;
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Whatever is still queued after cancellation.
async fn drain_item<T>(rx: &Mutex<Receiver<T>>) -> Option<T> {
    rx.lock().await.try_recv().ok()
}

async fn billing_worker(shared: Arc<Shared>, active: Arc<AtomicUsize>) {
    while let Some(entry) = next_item(&shared.billing_rx, &shared.cancel).await {
        shared.bill(entry).await;
    }
    while let Some(entry) = drain_item(&shared.billing_rx).await {
        shared.bill(entry).await;
    }
    if active.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.finish_billing().await;
    }
}

async fn counts_worker(shared: Arc<Shared>) {
    while let Some(counts) = next_item(&shared.counts_rx, &shared.cancel).await {
        shared.publish_counts(counts).await;
    }
    while let Some(counts) = drain_item(&shared.counts_rx).await {
        shared.publish_counts(counts).await;
    }
}

async fn portal_worker(shared: Arc<Shared>) {
    while let Some(data) = next_item(&shared.portal_rx, &shared.cancel).await {
        shared.publish_portal_data(data).await;
    }
    while let Some(data) = drain_item(&shared.portal_rx).await {
        shared.publish_portal_data(data).await;
    }
}

async fn match_worker(shared: Arc<Shared>, active: Arc<AtomicUsize>) {
    while let Some(entry) = next_item(&shared.match_rx, &shared.cancel).await {
        shared.submit_match(entry).await;
    }
    while let Some(entry) = drain_item(&shared.match_rx).await {
        shared.submit_match(entry).await;
    }
    if active.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.finish_matcher().await;
    }
}

/// Non-blocking hand-off from handlers to slow downstream sinks
pub struct PostSessionHandler {
    billing_tx: Sender<BillingEntry2>,
    counts_tx: Sender<SessionCountData>,
    portal_tx: Sender<SessionPortalData>,
    match_tx: Sender<MatchDataEntry>,
    shared: Arc<Shared>,
    worker_count: usize,
    started: AtomicBool,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PostSessionHandler {
    /// Create the queues. No workers run until [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: &PostSessionConfig,
        sinks: PostSessionSinks,
        metrics: Arc<PostSessionMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let capacity = config.channel_size.max(1);
        let (billing_tx, billing_rx) = mpsc::channel(capacity);
        let (counts_tx, counts_rx) = mpsc::channel(capacity);
        let (portal_tx, portal_rx) = mpsc::channel(capacity);
        let (match_tx, match_rx) = mpsc::channel(capacity);

        let shared = Arc::new(Shared {
            billing_rx: Mutex::new(billing_rx),
            counts_rx: Mutex::new(counts_rx),
            portal_rx: Mutex::new(portal_rx),
            match_rx: Mutex::new(match_rx),
            biller: sinks.biller,
            matcher: sinks.matcher,
            portal: PortalRing {
                publishers: sinks.publishers,
                max_retries: config.portal_max_retries,
                index: AtomicUsize::new(0),
            },
            metrics,
            cancel,
            sink_timeout: config.sink_timeout,
        });

        Self {
            billing_tx,
            counts_tx,
            portal_tx,
            match_tx,
            shared,
            worker_count: config.worker_count.max(1),
            started: AtomicBool::new(false),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pools on the current runtime. Later calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let billing_active = Arc::new(AtomicUsize::new(self.worker_count));
        let match_active = Arc::new(AtomicUsize::new(self.worker_count));
        let mut handles = Vec::with_capacity(self.worker_count * 4);
        for _ in 0..self.worker_count {
            handles.push(tokio::spawn(billing_worker(
                Arc::clone(&self.shared),
                Arc::clone(&billing_active),
            )));
            handles.push(tokio::spawn(counts_worker(Arc::clone(&self.shared))));
            handles.push(tokio::spawn(portal_worker(Arc::clone(&self.shared))));
            handles.push(tokio::spawn(match_worker(
                Arc::clone(&self.shared),
                Arc::clone(&match_active),
            )));
        }

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        debug!(workers = self.worker_count, "post-session workers started");
    }

    fn enqueue<T>(tx: &Sender<T>, item: T, sent: &Counter, full: &Counter) {
        match tx.try_send(item) {
            Ok(()) => sent.inc(),
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => full.inc(),
        }
    }

    /// Queue a billing entry, dropping it if the queue is full.
    pub fn send_billing_entry(&self, entry: BillingEntry2) {
        let metrics = &self.shared.metrics;
        Self::enqueue(
            &self.billing_tx,
            entry,
            &metrics.billing_entries_sent,
            &metrics.billing_buffer_full,
        );
    }

    /// Queue a session count heartbeat, dropping it if the queue is full.
    pub fn send_portal_counts(&self, counts: SessionCountData) {
        let metrics = &self.shared.metrics;
        Self::enqueue(
            &self.counts_tx,
            counts,
            &metrics.portal_counts_sent,
            &metrics.portal_counts_buffer_full,
        );
    }

    /// Queue a session snapshot, dropping it if the queue is full.
    pub fn send_portal_data(&self, data: SessionPortalData) {
        let metrics = &self.shared.metrics;
        Self::enqueue(
            &self.portal_tx,
            data,
            &metrics.portal_data_sent,
            &metrics.portal_data_buffer_full,
        );
    }

    /// Queue a match data entry, dropping it if the queue is full.
    pub fn send_match_data(&self, entry: MatchDataEntry) {
        let metrics = &self.shared.metrics;
        Self::enqueue(
            &self.match_tx,
            entry,
            &metrics.match_data_sent,
            &metrics.match_data_buffer_full,
        );
    }

    /// Entries waiting in the billing queue
    #[must_use]
    pub fn billing_buffer_len(&self) -> usize {
        self.billing_tx.max_capacity() - self.billing_tx.capacity()
    }

    /// Entries waiting in the session count queue
    #[must_use]
    pub fn portal_counts_buffer_len(&self) -> usize {
        self.counts_tx.max_capacity() - self.counts_tx.capacity()
    }

    /// Entries waiting in the session data queue
    #[must_use]
    pub fn portal_data_buffer_len(&self) -> usize {
        self.portal_tx.max_capacity() - self.portal_tx.capacity()
    }

    /// Entries waiting in the match data queue
    #[must_use]
    pub fn match_data_buffer_len(&self) -> usize {
        self.match_tx.max_capacity() - self.match_tx.capacity()
    }

    /// Publish to the portal ring.
    ///
    /// Starts at the current ring index and gives each publisher
    /// `portal_max_retries + 1` attempts before moving on. A success advances
    /// the ring index by one.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error unchanged, or
    /// [`PublishError::Exhausted`] when every publisher used up its attempts.
    pub async fn transmit_portal_data(&self, topic: &str, data: &[u8]) -> Result<usize, PublishError> {
        self.shared.portal.transmit(topic, data).await
    }

    /// Publisher the next transmission starts at
    #[must_use]
    pub fn portal_publisher_index(&self) -> usize {
        self.shared.portal.index.load(Ordering::Relaxed)
    }

    /// Fan-out counters
    #[must_use]
    pub fn metrics(&self) -> &PostSessionMetrics {
        &self.shared.metrics
    }

    /// Cancel the workers and wait for them to drain and close the sinks.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(err) = handle.await {
                error!(%err, "post-session worker panicked");
            }
        }
    }
}
