use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::{DemoStatus, Signal, SignalEvent, SignalStatus, SignalUpdate};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("signal {0} not found")]
    NotFound(u64),
    #[error("signal {0} already exists")]
    Duplicate(u64),
    #[error("illegal status transition for signal {id}: {from} -> {to}")]
    IllegalTransition { id: u64, from: String, to: DemoStatus },
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied(Signal),
    /// The stored status no longer matched the expected one.
    Conflict { current: Option<DemoStatus> },
}

/// Work lists the reconciliation sweep walks through.
#[derive(Debug, Clone, PartialEq)]
pub enum Bucket {
    /// Active, no order yet, never attempted or stopped by a retryable gate
    /// other than WAITING_FOR_PRICE.
    Pending { cutoff: DateTime<Utc> },
    LevelBroken { cutoff: DateTime<Utc> },
    WaitingForPrice { cutoff: DateTime<Utc> },
    /// Active with a live entry order.
    OpenOrders,
    /// Closed upstream before any order went out.
    OrphanedClosed,
    /// Filled positions not yet moved to breakeven.
    BreakevenCandidates,
    /// Active with a position on the exchange, before or after breakeven.
    Positions,
}

impl Bucket {
    pub fn matches(&self, s: &Signal) -> bool {
        match self {
            Bucket::Pending { cutoff } => {
                s.is_active()
                    && s.order_id.is_none()
                    && s.demo_status
                        .map_or(true, |d| d.is_retryable() && d != DemoStatus::WaitingForPrice)
                    && s.timestamp >= *cutoff
            }
            Bucket::LevelBroken { cutoff } => {
                s.is_active() && s.demo_status == Some(DemoStatus::LevelBroken) && s.timestamp >= *cutoff
            }
            Bucket::WaitingForPrice { cutoff } => {
                s.is_active()
                    && s.demo_status == Some(DemoStatus::WaitingForPrice)
                    && s.timestamp >= *cutoff
            }
            Bucket::OpenOrders => {
                s.is_active() && s.order_id.is_some() && s.demo_status.is_some_and(|d| d.is_live_order())
            }
            Bucket::OrphanedClosed => {
                !s.is_active() && s.order_id.is_none() && s.demo_status.is_some_and(|d| d.is_retryable())
            }
            Bucket::BreakevenCandidates => {
                s.is_active() && s.demo_status == Some(DemoStatus::OpenPosition) && s.filled_at.is_some()
            }
            Bucket::Positions => {
                s.is_active()
                    && matches!(
                        s.demo_status,
                        Some(DemoStatus::OpenPosition) | Some(DemoStatus::SlToBreakeven)
                    )
            }
        }
    }
}

/// Persistence for signals and their journal. Every status change goes
/// through `compare_and_set`.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert(&self, signal: Signal) -> Result<(), StoreError>;
    async fn get(&self, id: u64) -> Result<Option<Signal>, StoreError>;
    /// Apply `update` and move to `next` only if the stored status still equals `expected`.
    async fn compare_and_set(
        &self,
        id: u64,
        expected: Option<DemoStatus>,
        next: DemoStatus,
        update: SignalUpdate,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;
    /// Upstream market-lifecycle write (close, TP, SL).
    async fn set_market_status(
        &self,
        id: u64,
        status: SignalStatus,
        exit_price: Option<f64>,
        exit_timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn query(&self, bucket: Bucket) -> Result<Vec<Signal>, StoreError>;
    /// Closed, order-backed trades with entry and exit prices.
    async fn closed_trades(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Signal>, StoreError>;
    async fn active_pairs(&self) -> Result<Vec<String>, StoreError>;
    async fn append_event(&self, event: SignalEvent) -> Result<(), StoreError>;
    async fn events(&self, signal_id: u64) -> Result<Vec<SignalEvent>, StoreError>;
}

/// Append a journal entry for `signal_id`.
pub async fn record_event(
    store: &dyn SignalStore,
    signal_id: u64,
    at: DateTime<Utc>,
    event_type: &str,
    status: Option<DemoStatus>,
    message: impl Into<String>,
    details: serde_json::Value,
) -> Result<(), StoreError> {
    store
        .append_event(SignalEvent::new(signal_id, at, event_type, status, message, details))
        .await
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub signals: BTreeMap<u64, Signal>,
    #[serde(default)]
    pub events: Vec<SignalEvent>,
}

#[derive(Default)]
pub struct MemorySignalStore {
    state: RwLock<StoreSnapshot>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    pub async fn signals(&self) -> Vec<Signal> {
        self.state.read().await.signals.values().cloned().collect()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn insert(&self, signal: Signal) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.signals.contains_key(&signal.id) {
            return Err(StoreError::Duplicate(signal.id));
        }
        state.signals.insert(signal.id, signal);
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<Signal>, StoreError> {
        Ok(self.state.read().await.signals.get(&id).cloned())
    }

    async fn compare_and_set(
        &self,
        id: u64,
        expected: Option<DemoStatus>,
        next: DemoStatus,
        update: SignalUpdate,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state.write().await;
        let signal = state.signals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if signal.demo_status != expected {
            return Ok(CasOutcome::Conflict {
                current: signal.demo_status,
            });
        }
        if !DemoStatus::transition_allowed(expected, next) {
            return Err(StoreError::IllegalTransition {
                id,
                from: expected.map_or("unset".to_string(), |s| s.to_string()),
                to: next,
            });
        }
        update.apply(signal, next, at);
        Ok(CasOutcome::Applied(signal.clone()))
    }

    async fn set_market_status(
        &self,
        id: u64,
        status: SignalStatus,
        exit_price: Option<f64>,
        exit_timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let signal = state.signals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        signal.status = status;
        if exit_price.is_some() {
            signal.exit_price = exit_price;
        }
        if exit_timestamp.is_some() {
            signal.exit_timestamp = exit_timestamp;
        }
        signal.version += 1;
        Ok(())
    }

    async fn query(&self, bucket: Bucket) -> Result<Vec<Signal>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .signals
            .values()
            .filter(|s| bucket.matches(s))
            .cloned()
            .collect())
    }

    async fn closed_trades(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Signal>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .signals
            .values()
            .filter(|s| {
                !s.is_active() && s.order_id.is_some() && s.entry_price.is_some() && s.exit_price.is_some()
            })
            .filter(|s| since.map_or(true, |since| s.timestamp >= since))
            .cloned()
            .collect())
    }

    async fn active_pairs(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let pairs: BTreeSet<String> = state
            .signals
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.pair.clone())
            .collect();
        Ok(pairs.into_iter().collect())
    }

    async fn append_event(&self, event: SignalEvent) -> Result<(), StoreError> {
        self.state.write().await.events.push(event);
        Ok(())
    }

    async fn events(&self, signal_id: u64) -> Result<Vec<SignalEvent>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.signal_id == signal_id)
            .cloned()
            .collect())
    }
}

/// `MemorySignalStore` that writes a JSON snapshot after every mutation and
/// reloads it on open.
pub struct JsonFileStore {
    inner: MemorySignalStore,
    path: PathBuf,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<StoreSnapshot>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            "Signal store {} loaded: {} signals, {} events",
            path.display(),
            snapshot.signals.len(),
            snapshot.events.len()
        );
        Ok(Self {
            inner: MemorySignalStore::from_snapshot(snapshot),
            path,
        })
    }

    pub async fn signals(&self) -> Vec<Signal> {
        self.inner.signals().await
    }

    async fn save_state(&self) -> Result<(), StoreError> {
        let snapshot = self.inner.snapshot().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl SignalStore for JsonFileStore {
    async fn insert(&self, signal: Signal) -> Result<(), StoreError> {
        self.inner.insert(signal).await?;
        self.save_state().await
    }

    async fn get(&self, id: u64) -> Result<Option<Signal>, StoreError> {
        self.inner.get(id).await
    }

    async fn compare_and_set(
        &self,
        id: u64,
        expected: Option<DemoStatus>,
        next: DemoStatus,
        update: SignalUpdate,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let outcome = self.inner.compare_and_set(id, expected, next, update, at).await?;
        if matches!(outcome, CasOutcome::Applied(_)) {
            if let Err(e) = self.save_state().await {
                warn!("Failed to persist signal {}: {}", id, e);
                return Err(e);
            }
        }
        Ok(outcome)
    }

    async fn set_market_status(
        &self,
        id: u64,
        status: SignalStatus,
        exit_price: Option<f64>,
        exit_timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.inner
            .set_market_status(id, status, exit_price, exit_timestamp)
            .await?;
        self.save_state().await
    }

    async fn query(&self, bucket: Bucket) -> Result<Vec<Signal>, StoreError> {
        self.inner.query(bucket).await
    }

    async fn closed_trades(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Signal>, StoreError> {
        self.inner.closed_trades(since).await
    }

    async fn active_pairs(&self) -> Result<Vec<String>, StoreError> {
        self.inner.active_pairs().await
    }

    async fn append_event(&self, event: SignalEvent) -> Result<(), StoreError> {
        self.inner.append_event(event).await?;
        self.save_state().await
    }

    async fn events(&self, signal_id: u64) -> Result<Vec<SignalEvent>, StoreError> {
        self.inner.events(signal_id).await
    }
}
