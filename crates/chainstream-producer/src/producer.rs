//! The block producer control loop.
//!
//! # Discovery
//! - **Polling**: every `poll_interval_ms`, ask for the head number and walk
//!   forward from the delivery cursor. A tick that fires while a cycle is
//!   still running is skipped.
//! - **Push**: each header from the subscription triggers one cycle. A
//!   subscription that stays silent past the liveness timeout is torn down
//!   and re-established.
//!
//! # Delivery
//! A candidate is delivered only once it trails the head by `block_delay`,
//! is fully fetched, and its parent hash links to the last delivered block.
//! A link failure hands over to fork resolution, which emits exactly one
//! reorg notice and rewinds the cursor to the common ancestor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use chainstream_core::{
    Block, BlockHeader, ChainEvent, Lifecycle, Observer, ReorgNotice, StreamError,
};
use chainstream_rpc::{
    BlockSource, FailoverClient, HeaderSubscription, RetryPolicy, RpcBlockSource,
    WsHeaderSubscription,
};

use crate::config::{DiscoveryMode, ProducerConfig};
use crate::reorg::{find_common_ancestor, Resolution};
use crate::window::ReorgWindow;

// ─── State ────────────────────────────────────────────────────────────────────

/// Lifecycle state of a producer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProducerState {
    Idle,
    Starting,
    Streaming,
    ReorgRecovering,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for ProducerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Streaming => write!(f, "streaming"),
            Self::ReorgRecovering => write!(f, "reorg-recovering"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters for one producer instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerMetrics {
    pub blocks_delivered: u64,
    pub reorgs: u64,
    pub resubscriptions: u64,
    pub skipped_ticks: u64,
    pub last_delivered: Option<u64>,
}

struct Shared {
    lifecycle: Lifecycle,
    state: watch::Sender<ProducerState>,
    metrics: Mutex<ProducerMetrics>,
    observer: Arc<dyn Observer<ChainEvent>>,
    closed: AtomicBool,
}

impl Shared {
    /// `Stopped` is terminal: once reached, later transitions are ignored.
    fn set_state(&self, next: ProducerState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ProducerState::Stopped {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "producer state");
            *current = next;
            true
        });
    }

    /// Final notifications; runs once, under the emission gate.
    async fn close(&self, error: Option<&StreamError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(e) = error {
            self.observer.error(e).await;
        }
        self.observer.closed().await;
        self.set_state(ProducerState::Stopped);
        tracing::info!("block producer stopped");
    }
}

// ─── Handle ───────────────────────────────────────────────────────────────────

/// Control handle for a running producer.
#[derive(Clone)]
pub struct ProducerHandle {
    shared: Arc<Shared>,
}

impl ProducerHandle {
    pub fn state(&self) -> ProducerState {
        *self.shared.state.borrow()
    }

    pub fn metrics(&self) -> ProducerMetrics {
        self.shared.metrics.lock().unwrap().clone()
    }

    /// Stop the producer. Once this returns, no further block or reorg
    /// notice is emitted.
    ///
    /// Awaiting this from inside the observer's `next` would wait on itself;
    /// call [`ProducerHandle::request_stop`] there instead.
    pub async fn stop(&self) {
        self.shared
            .lifecycle
            .stop_with(self.shared.close(None))
            .await;
    }

    /// Raise the stop flag without waiting.
    pub fn request_stop(&self) {
        self.shared.lifecycle.request_stop();
    }

    /// Resolves once the producer reaches [`ProducerState::Stopped`].
    pub async fn stopped(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == ProducerState::Stopped).await;
    }
}

// ─── Producer ─────────────────────────────────────────────────────────────────

/// Reorg-safe block producer.
pub struct BlockProducer {
    config: ProducerConfig,
    source: Arc<dyn BlockSource>,
    subscription: Option<Arc<dyn HeaderSubscription>>,
}

/// Delivery position, owned by the control loop.
struct Cursor {
    window: ReorgWindow,
    next: u64,
}

impl BlockProducer {
    /// Build a producer over an arbitrary block source.
    pub fn new(config: ProducerConfig, source: Arc<dyn BlockSource>) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            subscription: None,
        })
    }

    /// Build a producer over the configured RPC endpoints.
    ///
    /// In push mode `subscription_endpoint` must be set.
    pub fn from_config(config: ProducerConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let client = FailoverClient::from_urls(
            &config.endpoints,
            config.alternate_endpoint.as_deref(),
            config.failover(),
        )?;
        let source = Arc::new(RpcBlockSource::new(Arc::new(client), config.source_options()));
        let subscription = match (config.discovery, &config.subscription_endpoint) {
            (DiscoveryMode::Push, Some(url)) => {
                Some(Arc::new(WsHeaderSubscription::new(url.clone())) as Arc<dyn HeaderSubscription>)
            }
            (DiscoveryMode::Push, None) => {
                return Err(StreamError::configuration(
                    "push discovery requires subscription_endpoint",
                ))
            }
            (DiscoveryMode::Polling, _) => None,
        };
        Ok(Self {
            config,
            source,
            subscription,
        })
    }

    /// Use `subscription` for push discovery.
    pub fn with_subscription(mut self, subscription: Arc<dyn HeaderSubscription>) -> Self {
        self.subscription = Some(subscription);
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Spawn the control loop, delivering to `observer`.
    pub fn start(self, observer: Arc<dyn Observer<ChainEvent>>) -> ProducerHandle {
        let (state, _) = watch::channel(ProducerState::Idle);
        let shared = Arc::new(Shared {
            lifecycle: Lifecycle::new(),
            state,
            metrics: Mutex::new(ProducerMetrics::default()),
            observer,
            closed: AtomicBool::new(false),
        });
        let handle = ProducerHandle {
            shared: Arc::clone(&shared),
        };
        let control = ControlLoop {
            retry: RetryPolicy::new(self.config.retry()),
            config: self.config,
            source: self.source,
            subscription: self.subscription,
            shared,
        };
        tokio::spawn(control.run());
        handle
    }
}

// ─── Control loop ─────────────────────────────────────────────────────────────

struct ControlLoop {
    config: ProducerConfig,
    source: Arc<dyn BlockSource>,
    subscription: Option<Arc<dyn HeaderSubscription>>,
    retry: RetryPolicy,
    shared: Arc<Shared>,
}

impl ControlLoop {
    async fn run(self) {
        self.shared.set_state(ProducerState::Starting);
        tracing::info!(
            start_block = self.config.start_block,
            discovery = ?self.config.discovery,
            block_delay = self.config.block_delay,
            max_reorg_depth = self.config.max_reorg_depth,
            "block producer starting"
        );

        let mut cursor = Cursor {
            window: ReorgWindow::new(self.config.max_reorg_depth),
            next: self.config.start_block,
        };
        let result = match self.config.discovery {
            DiscoveryMode::Polling => self.run_polling(&mut cursor).await,
            DiscoveryMode::Push => self.run_push(&mut cursor).await,
        };

        let shared = &self.shared;
        match result {
            Ok(()) => shared.lifecycle.stop_with(shared.close(None)).await,
            Err(e) => {
                tracing::error!(kind = ?e.kind(), error = %e, "block producer failed");
                shared.lifecycle.stop_with(shared.close(Some(&e))).await;
            }
        }
    }

    async fn run_polling(&self, cursor: &mut Cursor) -> Result<(), StreamError> {
        let interval = self.config.poll_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shared.lifecycle.stopped() => return Ok(()),
            }

            let started = Instant::now();
            let result = self.cycle(cursor, None).await;
            self.count_skipped_ticks(started.elapsed(), interval);
            self.absorb(result, &mut failures)?;
            if self.shared.lifecycle.is_stopped() {
                return Ok(());
            }
        }
    }

    async fn run_push(&self, cursor: &mut Cursor) -> Result<(), StreamError> {
        let subscription = self
            .subscription
            .clone()
            .ok_or_else(|| StreamError::configuration("push discovery requires a header subscription"))?;
        let liveness = self.config.subscription_timeout();
        let mut failures = 0u32;

        let Some(mut headers) = self.subscribe(subscription.as_ref()).await? else {
            return Ok(());
        };
        // Catch up from the cursor to the current head before reacting to pushes.
        let result = self.cycle(cursor, None).await;
        self.absorb(result, &mut failures)?;

        loop {
            let received = tokio::select! {
                r = tokio::time::timeout(liveness, headers.recv()) => r,
                _ = self.shared.lifecycle.stopped() => return Ok(()),
            };

            let header = match received {
                Ok(Some(header)) => header,
                lost => {
                    if lost.is_err() {
                        let e = StreamError::liveness(self.config.subscription_timeout_ms);
                        tracing::warn!(error = %e, "header subscription silent, resubscribing");
                    } else {
                        tracing::warn!("header subscription closed, resubscribing");
                    }
                    drop(headers);
                    self.shared.metrics.lock().unwrap().resubscriptions += 1;
                    let Some(rx) = self.subscribe(subscription.as_ref()).await? else {
                        return Ok(());
                    };
                    headers = rx;
                    let result = self.cycle(cursor, None).await;
                    self.absorb(result, &mut failures)?;
                    continue;
                }
            };

            tracing::debug!(block = header.number, hash = %header.hash, "header received");
            let result = self.on_header(cursor, &header).await;
            self.absorb(result, &mut failures)?;
            if self.shared.lifecycle.is_stopped() {
                return Ok(());
            }
        }
    }

    /// Establish a subscription, retrying with backoff. `None` if stopped meanwhile.
    async fn subscribe(
        &self,
        subscription: &dyn HeaderSubscription,
    ) -> Result<Option<mpsc::Receiver<BlockHeader>>, StreamError> {
        let mut attempt = 0u32;
        loop {
            if self.shared.lifecycle.is_stopped() {
                return Ok(None);
            }
            match subscription.subscribe().await {
                Ok(rx) => return Ok(Some(rx)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        return Err(StreamError::new(
                            e.kind(),
                            format!("subscription failed after {attempt} attempts: {}", e.message()),
                        )
                        .with_cause(e)
                        .into_fatal());
                    };
                    tracing::warn!(attempt, error = %e, "subscribe failed, retrying in {delay:?}");
                    if !self.shared.lifecycle.sleep(delay).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// React to one pushed header.
    async fn on_header(&self, cursor: &mut Cursor, header: &BlockHeader) -> Result<(), StreamError> {
        // Header-level check: a header at the cursor that does not link to the
        // last delivered block starts fork resolution without a full fetch.
        if self.config.block_delay == 0 && header.number == cursor.next {
            if let Some(last) = cursor.window.last() {
                if !header.extends(last) {
                    self.resolve_fork(cursor, header.number).await?;
                }
            }
        }
        self.cycle(cursor, Some(header.number)).await
    }

    /// One discovery-and-deliver cycle.
    ///
    /// `head_hint` comes from a pushed header; without it the head is fetched.
    async fn cycle(&self, cursor: &mut Cursor, head_hint: Option<u64>) -> Result<(), StreamError> {
        if self.shared.lifecycle.is_stopped() {
            return Ok(());
        }
        self.shared.set_state(ProducerState::Streaming);

        let head = match head_hint {
            Some(n) => n,
            None => self.source.fetch_latest_number().await?,
        };
        let Some(target) = head.checked_sub(self.config.block_delay) else {
            return Ok(());
        };

        while cursor.next <= target {
            if self.shared.lifecycle.is_stopped() {
                return Ok(());
            }
            let Some(block) = self.source.fetch_block(cursor.next).await? else {
                tracing::debug!(block = cursor.next, "block not yet available");
                break;
            };
            if block.number != cursor.next {
                return Err(StreamError::protocol(format!(
                    "requested block {} but received {}",
                    cursor.next, block.number
                )));
            }

            let links = cursor.window.last().map_or(true, |last| block.extends(last));
            if links {
                if !self.deliver(cursor, block).await? {
                    return Ok(());
                }
            } else if !self.resolve_fork(cursor, block.number).await? {
                // Last delivered block is still canonical; retry the candidate later.
                break;
            }
        }
        Ok(())
    }

    /// Deliver one event under the emission gate; `false` if stopped instead.
    async fn emit(&self, event: ChainEvent) -> Result<bool, StreamError> {
        let shared = &self.shared;
        let number = event.number();
        let is_block = matches!(event, ChainEvent::Block(_));
        let emitted = shared
            .lifecycle
            .emit(async {
                shared.observer.next(event).await?;
                let mut m = shared.metrics.lock().unwrap();
                if is_block {
                    m.blocks_delivered += 1;
                    m.last_delivered = Some(number);
                } else {
                    m.reorgs += 1;
                }
                Ok::<(), StreamError>(())
            })
            .await;
        match emitted {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(e)) => {
                let what = if is_block { "block" } else { "reorg notice at" };
                Err(StreamError::handler(format!("observer rejected {what} {number}"))
                    .with_cause(e)
                    .into_fatal())
            }
        }
    }

    /// Deliver `block` and advance the cursor; `false` if stopped instead.
    async fn deliver(&self, cursor: &mut Cursor, block: Block) -> Result<bool, StreamError> {
        let number = block.number;
        let block_ref = block.block_ref();
        if !self.emit(ChainEvent::Block(block)).await? {
            return Ok(false);
        }
        tracing::debug!(block = number, hash = %block_ref.hash, "block delivered");
        cursor.window.push(block_ref);
        cursor.next = number + 1;
        Ok(true)
    }

    /// Resolve a fork detected at `detected_at`.
    ///
    /// Returns `true` if the cursor was rewound, `false` if the delivered
    /// branch turned out to be canonical.
    async fn resolve_fork(&self, cursor: &mut Cursor, detected_at: u64) -> Result<bool, StreamError> {
        self.shared.set_state(ProducerState::ReorgRecovering);
        tracing::warn!(detected_at, "parent hash mismatch, resolving fork");

        let resolution = find_common_ancestor(
            self.source.as_ref(),
            &cursor.window,
            self.config.max_reorg_depth,
            detected_at,
        )
        .await?;

        match resolution {
            Resolution::Consistent => {
                tracing::warn!(detected_at, "delivered branch still canonical, candidate will be re-fetched");
                self.shared.set_state(ProducerState::Streaming);
                Ok(false)
            }
            Resolution::Ancestor { ancestor, depth, seed } => {
                let notice = ReorgNotice {
                    common_ancestor: ancestor,
                    depth,
                    detected_at,
                };
                if !self.emit(ChainEvent::Reorg(notice)).await? {
                    return Ok(true);
                }

                tracing::warn!(ancestor, depth, detected_at, "reorg resolved");
                cursor.window.truncate_after(ancestor);
                if let Some(seed) = seed {
                    // Every retained entry was forked away; link from the ancestor.
                    cursor.window.push(seed);
                }
                cursor.next = ancestor + 1;
                self.shared.set_state(ProducerState::Streaming);
                Ok(true)
            }
        }
    }

    /// Fold a cycle result into the consecutive-failure count.
    fn absorb(&self, result: Result<(), StreamError>, failures: &mut u32) -> Result<(), StreamError> {
        match result {
            Ok(()) => {
                *failures = 0;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                *failures += 1;
                if *failures > self.config.max_retries {
                    return Err(e.into_fatal());
                }
                tracing::warn!(attempt = *failures, kind = ?e.kind(), error = %e, "cycle failed");
                Ok(())
            }
        }
    }

    fn count_skipped_ticks(&self, elapsed: Duration, interval: Duration) {
        let skipped = (elapsed.as_millis() / interval.as_millis().max(1)) as u64;
        if skipped > 0 {
            tracing::debug!(skipped, "cycle outlasted poll interval, ticks skipped");
            self.shared.metrics.lock().unwrap().skipped_ticks += skipped;
        }
    }
}
