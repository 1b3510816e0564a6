//! Interactive interception gate
//!
//! One gate is shared by every pipeline. When armed, a hook that submits a
//! targeted exchange is suspended until the operator forwards, multiplies or
//! drops it. Callers serialize on the review mutex, so at most one exchange
//! is under review at any time.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use proxy_common::{Direction, Exchange, Snapshot};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::admin::Metrics;
use crate::config::GateConfig;
use crate::policy::InterceptOptions;
use crate::replay::ReplayReport;

/// Something that can replay a snapshot `count` times
#[async_trait]
pub trait Resender: Send + Sync {
    async fn resend(&self, snapshot: Snapshot, count: usize, wait: bool) -> Option<ReplayReport>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Forward(Vec<u8>),
    ForwardMultiple(Vec<u8>),
    Drop,
}

/// What the gate did with one submitted payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Not reviewed
    Passed(Vec<u8>),
    Forwarded(Vec<u8>),
    ForwardedMultiple(Vec<u8>),
    Dropped,
}

impl GateOutcome {
    /// Bytes to continue with; empty for a drop
    pub fn into_data(self) -> Vec<u8> {
        match self {
            GateOutcome::Passed(data)
            | GateOutcome::Forwarded(data)
            | GateOutcome::ForwardedMultiple(data) => data,
            GateOutcome::Dropped => Vec::new(),
        }
    }

    pub fn was_dropped(&self) -> bool {
        matches!(self, GateOutcome::Dropped)
    }

    pub fn was_multiplied(&self) -> bool {
        matches!(self, GateOutcome::ForwardedMultiple(_))
    }
}

/// The exchange currently shown to the operator
#[derive(Debug, Clone, Serialize)]
pub struct PendingReview {
    pub exchange: Exchange,
    /// Payload as submitted, after modification rules
    #[serde(with = "lossy_text")]
    pub data: Vec<u8>,
}

mod lossy_text {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(data))
    }
}

/// Verdict channel of the review in progress, bound to the exchange it
/// belongs to
struct Waiter {
    review: PendingReview,
    tx: oneshot::Sender<Verdict>,
}

pub struct InterceptGate {
    armed: AtomicBool,
    options: Arc<InterceptOptions>,
    review: tokio::sync::Mutex<()>,
    waiter: Mutex<Option<Waiter>>,
    current: watch::Sender<Option<PendingReview>>,
    resender: RwLock<Option<Weak<dyn Resender>>>,
    forward_multiple_total: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Default for InterceptGate {
    fn default() -> Self {
        Self::new(&GateConfig::default())
    }
}

impl InterceptGate {
    pub fn new(config: &GateConfig) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            armed: AtomicBool::new(config.armed),
            options: Arc::new(InterceptOptions::new()),
            review: tokio::sync::Mutex::new(()),
            waiter: Mutex::new(None),
            current,
            resender: RwLock::new(None),
            forward_multiple_total: config.forward_multiple_total.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wire the replay service used by forward-multiple
    pub fn set_resender(&self, resender: Weak<dyn Resender>) {
        *self.resender.write() = Some(resender);
    }

    pub fn options(&self) -> &Arc<InterceptOptions> {
        &self.options
    }

    /// Serialization mutex held for the whole duration of one review
    pub fn review_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.review
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn is_waiting(&self) -> bool {
        self.waiter.lock().is_some()
    }

    pub fn pending(&self) -> Option<PendingReview> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PendingReview>> {
        self.current.subscribe()
    }

    fn is_target(&self, exchange: &Exchange, request: Option<&Exchange>) -> bool {
        match exchange.direction {
            Direction::Client => self.options.intercept_on_request(exchange),
            Direction::Server => self.options.intercept_on_response(request, exchange),
        }
    }

    /// Submit `data` belonging to `exchange`. Returns immediately unless the
    /// gate is armed and the exchange is a target; then waits for a verdict.
    pub async fn received(
        &self,
        data: Vec<u8>,
        exchange: &Exchange,
        request: Option<&Exchange>,
    ) -> GateOutcome {
        if !self.is_armed() || !self.is_target(exchange, request) {
            return GateOutcome::Passed(data);
        }

        let _review = self.review.lock().await;
        // disarmed while queued behind another review
        if !self.is_armed() {
            return GateOutcome::Passed(data);
        }

        let (tx, rx) = oneshot::channel();
        let review = PendingReview {
            exchange: exchange.clone(),
            data: data.clone(),
        };
        *self.waiter.lock() = Some(Waiter {
            review: review.clone(),
            tx,
        });
        self.current.send_replace(Some(review));
        if let Some(metrics) = &self.metrics {
            metrics.exchanges_intercepted.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            "⏸️ Intercepted {} {} on {} ({} bytes)",
            exchange.direction,
            exchange.id,
            exchange.conn,
            data.len()
        );

        let verdict = match rx.await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!("intercept verdict channel closed, forwarding {}", exchange.id);
                Verdict::Forward(data)
            }
        };
        self.current.send_replace(None);

        match verdict {
            Verdict::Forward(data) => GateOutcome::Forwarded(data),
            Verdict::ForwardMultiple(data) => GateOutcome::ForwardedMultiple(data),
            Verdict::Drop => {
                if let Some(metrics) = &self.metrics {
                    metrics.exchanges_dropped.fetch_add(1, Ordering::Relaxed);
                }
                GateOutcome::Dropped
            }
        }
    }

    fn deliver(&self, verdict: Verdict) -> bool {
        match self.waiter.lock().take() {
            Some(waiter) => waiter.tx.send(verdict).is_ok(),
            None => false,
        }
    }

    pub fn enable_intercept_mode(&self) {
        self.armed.store(true, Ordering::SeqCst);
        info!("Intercept mode enabled");
    }

    /// Disarm, forwarding the exchange under review with `data` (or its
    /// submitted payload when `None`)
    pub fn disable_intercept_mode(&self, data: Option<Vec<u8>>) {
        self.armed.store(false, Ordering::SeqCst);
        info!("Intercept mode disabled");
        let claimed = self.waiter.lock().take();
        if let Some(waiter) = claimed {
            let data = data.unwrap_or(waiter.review.data);
            // the reviewed exchange may already be gone
            let _ = waiter.tx.send(Verdict::Forward(data));
        }
    }

    /// Release the exchange under review with `data`
    pub fn forward(&self, data: Vec<u8>) -> bool {
        self.deliver(Verdict::Forward(data))
    }

    pub fn drop_exchange(&self) -> bool {
        self.deliver(Verdict::Drop)
    }

    /// Release the exchange under review with `data` and replay the same
    /// payload against its target so the total number of sends is the
    /// configured fan-out. Replays are given a bounded head start before the
    /// original is released. The review is claimed up front, so the verdict
    /// always reaches the exchange the replays were cut from.
    pub async fn forward_multiple(&self, data: Vec<u8>) -> bool {
        let claimed = self.waiter.lock().take();
        let Some(Waiter { review: pending, tx }) = claimed else {
            return false;
        };
        let extra = self.forward_multiple_total.saturating_sub(1);
        let resender = self.resender.read().as_ref().and_then(Weak::upgrade);
        match resender {
            Some(resender) if extra > 0 => {
                let snapshot = pending.exchange.snapshot(data.clone());
                if let Some(report) = resender.resend(snapshot, extra, true).await {
                    info!(
                        "forward-multiple for {}: {} replayed, {} failed",
                        pending.exchange.id, report.succeeded, report.failed
                    );
                }
            }
            Some(_) => {}
            None => warn!("forward-multiple without a replay service, forwarding once"),
        }
        tx.send(Verdict::ForwardMultiple(data)).is_ok()
    }
}
