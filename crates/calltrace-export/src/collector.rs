//! Collector sink
//!
//! Ships tracked events to a remote collector over HTTP. `track` only pushes
//! onto a bounded queue; a background task drains it, groups events into
//! batches and POSTs each batch as a JSON array. Network errors and 5xx
//! answers are retried with exponential backoff, 4xx answers are not.

use calltrace_core::config::CollectorSettings;
use calltrace_core::events::TrackedEvent;
use calltrace_core::sink::{EventSink, SinkError, SinkResult};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Collector sink configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Collector endpoint URL
    pub url: String,

    /// Maximum events per request
    pub batch_size: usize,

    /// Maximum time an event waits in a partial batch
    pub flush_interval: Duration,

    /// Maximum number of retries per batch
    pub max_retries: u32,

    /// Initial retry delay (doubles with each retry)
    pub initial_retry_delay: Duration,

    /// Maximum retry delay
    pub max_retry_delay: Duration,

    /// Request timeout
    pub timeout: Duration,

    /// Events buffered before new ones are dropped
    pub queue_capacity: usize,

    /// User-Agent header
    pub user_agent: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4000/events".to_string(),
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            queue_capacity: 10_000,
            user_agent: format!("calltrace/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl From<&CollectorSettings> for CollectorConfig {
    fn from(settings: &CollectorSettings) -> Self {
        Self {
            url: settings.url.clone(),
            batch_size: settings.batch_size.max(1),
            flush_interval: Duration::from_millis(settings.flush_interval_ms.max(1)),
            max_retries: settings.max_retries,
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            queue_capacity: settings.queue_capacity.max(1),
            ..Default::default()
        }
    }
}

/// Collector delivery statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub events_queued: u64,
    pub events_sent: u64,
    pub batches_sent: u64,
    /// Batches that needed at least one retry before succeeding
    pub batches_retried: u64,
    pub events_dropped: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_queued: AtomicU64,
    events_sent: AtomicU64,
    batches_sent: AtomicU64,
    batches_retried: AtomicU64,
    events_dropped: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CollectorStats {
        CollectorStats {
            events_queued: self.events_queued.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_retried: self.batches_retried.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Event(TrackedEvent),
    /// Send the pending batch now; acknowledge once it has been handled
    Flush(Option<oneshot::Sender<()>>),
}

/// Event sink that batches events to a remote collector
pub struct CollectorSink {
    sender: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
    url: String,
}

impl CollectorSink {
    /// Start the sink. Must be called from within a tokio runtime.
    pub fn spawn(config: CollectorConfig) -> SinkResult<Self> {
        if config.url.trim().is_empty() {
            return Err(SinkError::Configuration(
                "Collector URL is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()
            .map_err(|e| {
                SinkError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let url = config.url.clone();

        info!(
            "Collector sink started: url={}, batch_size={}, flush_interval={:?}",
            config.url, config.batch_size, config.flush_interval
        );

        let delivery = Delivery {
            client,
            config,
            counters: counters.clone(),
        };
        let worker = tokio::spawn(delivery.run(receiver));

        Ok(Self {
            sender,
            counters,
            worker,
            url,
        })
    }

    /// Deliver everything queued so far and wait until it has been handled
    pub async fn drain(&self) -> SinkResult<()> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send(Command::Flush(Some(ack)))
            .await
            .map_err(|_| SinkError::Closed)?;
        done.await.map_err(|_| SinkError::Closed)
    }

    /// Deliver pending events and stop the background task
    pub async fn shutdown(self) {
        let Self {
            sender,
            worker,
            counters,
            ..
        } = self;
        drop(sender);
        if let Err(e) = worker.await {
            error!("Collector worker ended abnormally: {}", e);
        }
        let stats = counters.snapshot();
        info!(
            "Collector sink shutdown: sent={}, dropped={}",
            stats.events_sent, stats.events_dropped
        );
    }

    /// Get delivery statistics
    pub fn stats(&self) -> CollectorStats {
        self.counters.snapshot()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl EventSink for CollectorSink {
    fn name(&self) -> &str {
        "collector"
    }

    fn track(&self, event: TrackedEvent) {
        if event.name.trim().is_empty() {
            warn!("Dropping event without a name");
            self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.sender.try_send(Command::Event(event)) {
            Ok(()) => {
                self.counters.events_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.events_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Collector queue full, {} events dropped so far", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Collector sink closed, dropping event");
            }
        }
    }

    /// Ask the background task to send its pending batch without waiting
    fn flush(&self) -> SinkResult<()> {
        match self.sender.try_send(Command::Flush(None)) {
            Ok(()) => Ok(()),
            // a full queue is drained anyway
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

/// Background side of the sink
struct Delivery {
    client: Client,
    config: CollectorConfig,
    counters: Arc<Counters>,
}

impl Delivery {
    async fn run(self, mut receiver: mpsc::Receiver<Command>) {
        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<TrackedEvent> = Vec::with_capacity(batch_size);

        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(Command::Event(event)) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            self.deliver(&mut batch).await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.deliver(&mut batch).await;
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    None => {
                        self.deliver(&mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.deliver(&mut batch).await;
                }
            }
        }

        debug!("Collector worker stopped");
    }

    async fn deliver(&self, batch: &mut Vec<TrackedEvent>) {
        if batch.is_empty() {
            return;
        }

        let events: Vec<_> = batch.drain(..).collect();
        let count = events.len() as u64;

        let payload = match serde_json::to_string(&events) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize batch of {} events: {}", count, e);
                self.counters.events_dropped.fetch_add(count, Ordering::Relaxed);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.send_with_retry(&payload).await {
            Ok(()) => {
                self.counters.events_sent.fetch_add(count, Ordering::Relaxed);
                self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                debug!("Delivered {} events to collector", count);
            }
            Err(_) => {
                self.counters.events_dropped.fetch_add(count, Ordering::Relaxed);
            }
        }
    }

    /// Send a single request
    async fn send_request(&self, payload: &str) -> SinkResult<()> {
        let response = self
            .client
            .post(&self.config.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| SinkError::Network(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(SinkError::Client {
                status: status.as_u16(),
                body,
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SinkError::Server {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Send with retry logic
    async fn send_with_retry(&self, payload: &str) -> SinkResult<()> {
        let mut delay = self.config.initial_retry_delay;
        let mut attempts = 0;

        loop {
            match self.send_request(payload).await {
                Ok(()) => {
                    if attempts > 0 {
                        self.counters.batches_retried.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Collector rejected batch: {}", e);
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        error!("Collector request failed after {} attempts: {}", attempts, e);
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }

                    warn!(
                        "Collector request failed (attempt {}), retrying in {:?}: {}",
                        attempts, delay, e
                    );

                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
                }
            }
        }
    }
}
