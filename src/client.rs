//! Rate-limited, key-rotating access to quota-constrained remote APIs.
//!
//! A [`RateLimitedClient`] owns a [`CredentialPool`] and a [`BackoffPolicy`]
//! and forwards requests to a [`Provider`]. Throttled calls are retried on the
//! same credential with exponential backoff; every other failure ends the
//! call immediately.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

use crate::error::CallError;

/// One API credential.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    Basic { id: String, secret: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(***)"),
            Self::Basic { id, .. } => write!(f, "Basic({id}:***)"),
        }
    }
}

struct Slot {
    credential: Credential,
    in_flight: Mutex<()>,
}

/// Credentials handed out round-robin, one per call.
///
/// Each credential carries its own lock so that at most one call per
/// credential is in flight; a single-credential pool serializes all callers.
pub struct CredentialPool {
    slots: Vec<Slot>,
    next: AtomicUsize,
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("len", &self.slots.len())
            .finish()
    }
}

impl CredentialPool {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            slots: credentials
                .into_iter()
                .map(|credential| Slot {
                    credential,
                    in_flight: Mutex::new(()),
                })
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Pool of bare API keys from a comma-separated list.
    pub fn from_keys(list: &str) -> Self {
        Self::new(split_list(list).map(|k| Credential::ApiKey(k.to_string())))
    }

    /// Pool of id/secret pairs from two comma-separated lists.
    ///
    /// The lists rotate independently: call `i` uses `ids[i % n]` with
    /// `secrets[i % m]`. The pool holds `lcm(n, m)` pairs so that round-robin
    /// over it yields exactly that sequence.
    pub fn from_pairs(ids: &str, secrets: &str) -> Self {
        let ids: Vec<&str> = split_list(ids).collect();
        let secrets: Vec<&str> = split_list(secrets).collect();
        if ids.is_empty() || secrets.is_empty() {
            return Self::new(Vec::new());
        }
        let n = lcm(ids.len(), secrets.len());
        Self::new((0..n).map(|i| Credential::Basic {
            id: ids[i % ids.len()].to_string(),
            secret: secrets[i % secrets.len()].to_string(),
        }))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn acquire(&self) -> Option<&Slot> {
        if self.slots.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots.get(i)
    }
}

fn lcm(a: usize, b: usize) -> usize {
    let (mut x, mut y) = (a, b);
    while y != 0 {
        (x, y) = (y, x % y);
    }
    a / x * b
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Exponential backoff applied to throttled calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Passive-scan providers: 1s doubling, capped at 60s, 5 attempts.
    pub fn passive() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 5)
    }

    /// Classification backend: 1s doubling, capped at 60s, 6 attempts.
    pub fn classification() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 6)
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max_delay)
    }
}

/// A remote API reachable through [`RateLimitedClient`].
///
/// Implementations map provider throttling to [`CallError::RateLimited`] and
/// anything else that went wrong to one of the terminal variants.
#[async_trait]
pub trait Provider: Send + Sync {
    type Request: Send + Sync;
    type Response: Send;

    fn name(&self) -> &str;

    async fn send(
        &self,
        credential: &Credential,
        request: &Self::Request,
    ) -> Result<Self::Response, CallError>;
}

pub struct RateLimitedClient<P: Provider> {
    provider: P,
    pool: CredentialPool,
    policy: BackoffPolicy,
    call_delay: Duration,
}

impl<P: Provider> fmt::Debug for RateLimitedClient<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("provider", &self.provider.name())
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .field("call_delay", &self.call_delay)
            .finish()
    }
}

impl<P: Provider> RateLimitedClient<P> {
    pub fn new(provider: P, pool: CredentialPool, policy: BackoffPolicy) -> Self {
        Self {
            provider,
            pool,
            policy,
            call_delay: Duration::ZERO,
        }
    }

    /// Pause after every completed call, whatever its outcome.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Issue one logical call. An empty pool fails before any delay is spent.
    pub async fn call(&self, request: &P::Request) -> Result<P::Response, CallError> {
        let slot = self.pool.acquire().ok_or(CallError::NoCredentials)?;
        let result = self.call_with_retries(slot, request).await;
        if !self.call_delay.is_zero() {
            time::sleep(self.call_delay).await;
        }
        result
    }

    async fn call_with_retries(&self, slot: &Slot, request: &P::Request) -> Result<P::Response, CallError> {
        let _in_flight = slot.in_flight.lock().await;
        let provider = self.provider.name();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.provider.send(&slot.credential, request).await {
                Err(CallError::RateLimited(reason)) => {
                    if attempt >= self.policy.max_attempts {
                        warn!(provider, attempts = attempt, %reason, "giving up after repeated throttling");
                        return Err(CallError::Exhausted { attempts: attempt });
                    }
                    let delay = self.policy.delay_for(attempt - 1);
                    warn!(
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "rate limited; backing off"
                    );
                    time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(provider, attempt, error = %e, "call failed");
                    return Err(e);
                }
                Ok(response) => return Ok(response),
            }
        }
    }
}

/// Map an HTTP status to the client's error taxonomy.
pub fn check_status(status: StatusCode) -> Result<(), CallError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Err(CallError::RateLimited(format!("HTTP {status}")))
    } else if status.is_success() {
        Ok(())
    } else {
        Err(CallError::Provider(format!("HTTP {status}")))
    }
}

/// Map a transport-level error to [`CallError::Provider`].
pub fn transport_error(err: reqwest::Error) -> CallError {
    match err.status() {
        Some(StatusCode::TOO_MANY_REQUESTS) => CallError::RateLimited(err.to_string()),
        _ => CallError::Provider(err.to_string()),
    }
}
