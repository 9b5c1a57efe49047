//! Per-destination circuit breaker for RTMP endpoints.
//!
//! State lives in the shared store under `rtmp_circuit:{digest}` where the
//! digest is the SHA-256 of the normalized URL. Every write refreshes the
//! record TTL, so destinations that are never retried age out on their own.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::BreakerSection;
use crate::store::{get_record, put_record, SharedStore, StoreError};

const RTMP_DEFAULT_PORT: u16 = 1935;
const RTMPS_DEFAULT_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type BreakerResult<T> = Result<T, BreakerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub url: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Only meaningful while half-open.
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub half_open_started_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitRecord {
    fn closed(url: &str, now: DateTime<Utc>) -> Self {
        Self {
            url: url.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            half_open_started_at: None,
            last_failure_reason: None,
            updated_at: now,
        }
    }
}

/// Lowercases scheme and host and drops a trailing slash so equivalent
/// spellings of one destination share a circuit.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return trimmed.to_string();
    };
    let mut normalized = format!(
        "{}://{}",
        parsed.scheme().to_ascii_lowercase(),
        host.to_ascii_lowercase()
    );
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{port}"));
    }
    normalized.push_str(parsed.path().trim_end_matches('/'));
    if let Some(query) = parsed.query() {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized
}

pub fn circuit_key(url: &str) -> String {
    let digest = Sha256::digest(normalize_url(url).as_bytes());
    format!("rtmp_circuit:{}", hex::encode(digest))
}

/// Host and port to probe for an RTMP URL, or `None` when the URL has no host.
pub fn probe_target(url: &str) -> Option<(String, u16)> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str().filter(|host| !host.is_empty())?.to_string();
    let port = parsed.port().unwrap_or(match parsed.scheme() {
        "rtmps" => RTMPS_DEFAULT_PORT,
        _ => RTMP_DEFAULT_PORT,
    });
    Some((host, port))
}

#[derive(Clone)]
pub struct RtmpCircuitBreaker {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: BreakerSection,
}

impl fmt::Debug for RtmpCircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtmpCircuitBreaker")
            .field("config", &self.config)
            .finish()
    }
}

impl RtmpCircuitBreaker {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: BreakerSection) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Whether a connection attempt may proceed. Expired OPEN and HALF_OPEN
    /// windows are transitioned here.
    pub fn is_available(&self, url: &str) -> BreakerResult<bool> {
        let Some(mut record) = self.load(url)? else {
            return Ok(true);
        };
        let now = self.clock.now();
        match record.state {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => {
                let opened_at = record.last_failure_time.unwrap_or(record.updated_at);
                if now - opened_at > Duration::seconds(self.config.open_timeout_seconds) {
                    record.state = CircuitState::HalfOpen;
                    record.success_count = 0;
                    record.half_open_started_at = Some(now);
                    self.save(&mut record)?;
                    info!(url = %record.url, "circuit half-open, probing allowed");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            CircuitState::HalfOpen => {
                let started = record.half_open_started_at.unwrap_or(record.updated_at);
                if now - started > Duration::seconds(self.config.half_open_timeout_seconds) {
                    record.state = CircuitState::Open;
                    record.success_count = 0;
                    record.half_open_started_at = None;
                    record.last_failure_time = Some(now);
                    record.last_failure_reason = Some("half-open window expired".to_string());
                    self.save(&mut record)?;
                    warn!(url = %record.url, "half-open window expired, circuit reopened");
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
        }
    }

    pub fn record_success(&self, url: &str) -> BreakerResult<()> {
        let Some(mut record) = self.load(url)? else {
            return Ok(());
        };
        match record.state {
            CircuitState::Closed => {
                if record.failure_count == 0 {
                    return Ok(());
                }
                record.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.config.success_threshold {
                    record.state = CircuitState::Closed;
                    record.failure_count = 0;
                    record.success_count = 0;
                    record.half_open_started_at = None;
                    info!(url = %record.url, "circuit closed");
                }
            }
            CircuitState::Open => {
                debug!(url = %record.url, "success ignored while circuit open");
                return Ok(());
            }
        }
        self.save(&mut record)
    }

    pub fn record_failure(&self, url: &str, reason: &str) -> BreakerResult<()> {
        let now = self.clock.now();
        let mut record = self
            .load(url)?
            .unwrap_or_else(|| CircuitRecord::closed(&normalize_url(url), now));
        record.failure_count += 1;
        record.last_failure_time = Some(now);
        record.last_failure_reason = Some(reason.to_string());
        match record.state {
            CircuitState::Closed => {
                if record.failure_count >= self.config.failure_threshold {
                    record.state = CircuitState::Open;
                    warn!(
                        url = %record.url,
                        failures = record.failure_count,
                        reason,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.success_count = 0;
                record.half_open_started_at = None;
                warn!(url = %record.url, reason, "probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
        self.save(&mut record)
    }

    /// Operator override: forget all state for `url`.
    pub fn reset(&self, url: &str) -> BreakerResult<bool> {
        let removed = self.store.delete(&circuit_key(url))?;
        info!(url = %normalize_url(url), removed, "circuit reset");
        Ok(removed)
    }

    pub fn snapshot(&self, url: &str) -> BreakerResult<Option<CircuitRecord>> {
        self.load(url)
    }

    /// TCP probe of the endpoint's host and port, recording the outcome.
    pub async fn health_check(&self, url: &str) -> BreakerResult<bool> {
        let Some((host, port)) = probe_target(url) else {
            self.record_failure(url, "malformed rtmp url")?;
            return Ok(false);
        };
        let timeout = std::time::Duration::from_secs(self.config.probe_timeout_seconds);
        let outcome = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await;
        match outcome {
            Ok(Ok(_stream)) => {
                self.record_success(url)?;
                Ok(true)
            }
            Ok(Err(err)) => {
                self.record_failure(url, &format!("connect to {host}:{port} failed: {err}"))?;
                Ok(false)
            }
            Err(_) => {
                self.record_failure(url, &format!("connect to {host}:{port} timed out"))?;
                Ok(false)
            }
        }
    }

    /// Splits `urls` into those currently permitted and those blocked.
    pub fn partition_available(&self, urls: &[String]) -> BreakerResult<(Vec<String>, Vec<String>)> {
        let mut available = Vec::new();
        let mut blocked = Vec::new();
        for url in urls {
            if self.is_available(url)? {
                available.push(url.clone());
            } else {
                blocked.push(url.clone());
            }
        }
        Ok((available, blocked))
    }

    fn load(&self, url: &str) -> BreakerResult<Option<CircuitRecord>> {
        Ok(get_record(self.store.as_ref(), &circuit_key(url))?)
    }

    fn save(&self, record: &mut CircuitRecord) -> BreakerResult<()> {
        record.updated_at = self.clock.now();
        put_record(
            self.store.as_ref(),
            &circuit_key(&record.url),
            record,
            Some(Duration::seconds(self.config.state_ttl_seconds)),
        )?;
        Ok(())
    }
}
