//! Async notification channel
//!
//! Publish-only, at-least-once delivery addressed by routing key. The
//! coordinator never reads anything back from the channel.
//!
//! The broker connection is owned by a [`ChannelHandle`]: it is opened once,
//! probed in the background, and every caller checks a lock-free availability
//! flag instead of touching the connection on the hot path.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("publish to '{routing_key}' failed: {reason}")]
    Publish { routing_key: String, reason: String },

    #[error("notification payload could not be encoded: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("routing key '{0}' already has a consumer")]
    AlreadyBound(String),
}

/// One message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub exchange: String,
    pub routing_key: String,
    /// Ask the broker to keep the message across its own restarts.
    pub persistent: bool,
    /// JSON-encoded payload
    pub body: Vec<u8>,
}

impl Notification {
    pub fn json<T: Serialize>(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        persistent: bool,
        payload: &T,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            persistent,
            body: serde_json::to_vec(payload)?,
        })
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Transport behind a [`ChannelHandle`].
pub trait NotificationChannel: Send + Sync + 'static {
    /// Hands one notification to the broker. Returning `Ok` means the broker
    /// accepted it; delivery from there on is the broker's contract.
    fn publish(
        &self,
        notification: Notification,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Cheap health check; implementations may reconnect here.
    fn probe(&self) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// Probe cadence and reconnect backoff for [`ChannelHandle::spawn_health_monitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    pub interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl HealthCheckPolicy {
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_backoff)
    }
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

/// Shared, health-checked handle to a notification channel.
pub struct ChannelHandle<C> {
    inner: Arc<ChannelInner<C>>,
}

struct ChannelInner<C> {
    channel: C,
    available: AtomicBool,
}

impl<C> Clone for ChannelHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: NotificationChannel> ChannelHandle<C> {
    /// Opens the channel once. A failed first probe still yields a handle,
    /// marked unavailable until the health monitor brings it back.
    pub async fn connect(channel: C) -> Self {
        let handle = Self {
            inner: Arc::new(ChannelInner {
                channel,
                available: AtomicBool::new(false),
            }),
        };
        match handle.inner.channel.probe().await {
            Ok(()) => {
                handle.inner.available.store(true, Ordering::Release);
                tracing::info!("notification channel connected");
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "notification channel could not connect during initialization"
                );
            }
        }
        handle
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    pub fn channel(&self) -> &C {
        &self.inner.channel
    }

    pub async fn publish(&self, notification: Notification) -> Result<(), ChannelError> {
        let result = self.inner.channel.publish(notification).await;
        if let Err(ChannelError::Unavailable(reason)) = &result {
            self.set_available(false, reason);
        }
        result
    }

    /// Runs one probe and records the result. Returns the new availability.
    pub async fn probe(&self) -> bool {
        match self.inner.channel.probe().await {
            Ok(()) => {
                self.set_available(true, "probe succeeded");
                true
            }
            Err(err) => {
                self.set_available(false, &err.to_string());
                false
            }
        }
    }

    /// Probes every `policy.interval` while healthy and with exponential
    /// backoff while down.
    pub fn spawn_health_monitor(&self, policy: HealthCheckPolicy) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut backoff = policy.initial_backoff;
            loop {
                let delay = if handle.is_available() {
                    policy.interval
                } else {
                    backoff
                };
                tokio::time::sleep(delay).await;

                if handle.probe().await {
                    backoff = policy.initial_backoff;
                } else {
                    backoff = policy.next_backoff(backoff);
                    tracing::debug!(
                        retry_in_ms = backoff.as_millis() as u64,
                        "notification channel still down"
                    );
                }
            }
        })
    }

    fn set_available(&self, available: bool, reason: &str) {
        let was = self.inner.available.swap(available, Ordering::AcqRel);
        if was != available {
            if available {
                tracing::info!("notification channel available again");
            } else {
                tracing::error!(reason, "notification channel became unavailable");
            }
        }
    }
}

/// In-process direct-exchange broker.
///
/// Each routing key gets its own queue, created on first publish or bind.
/// Messages published before a consumer binds stay queued until it does.
pub struct LocalBroker {
    online: AtomicBool,
    queues: DashMap<String, Queue>,
    published: AtomicU64,
}

struct Queue {
    tx: mpsc::UnboundedSender<Notification>,
    rx: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            queues: DashMap::new(),
            published: AtomicU64::new(0),
        }
    }

    /// Simulates a broker outage (or recovery).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Takes the single consumer for `routing_key`.
    pub fn bind(
        &self,
        routing_key: &str,
    ) -> Result<mpsc::UnboundedReceiver<Notification>, ChannelError> {
        self.queues
            .entry(routing_key.to_string())
            .or_insert_with(Queue::new)
            .rx
            .take()
            .ok_or_else(|| ChannelError::AlreadyBound(routing_key.to_string()))
    }

    /// Total notifications accepted since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationChannel for LocalBroker {
    async fn publish(&self, notification: Notification) -> Result<(), ChannelError> {
        if !self.is_online() {
            return Err(ChannelError::Unavailable("local broker offline".to_string()));
        }

        let routing_key = notification.routing_key.clone();
        self.queues
            .entry(routing_key.clone())
            .or_insert_with(Queue::new)
            .tx
            .send(notification)
            .map_err(|_| ChannelError::Publish {
                routing_key,
                reason: "consumer dropped its queue".to_string(),
            })?;

        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn probe(&self) -> Result<(), ChannelError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("local broker offline".to_string()))
        }
    }
}
