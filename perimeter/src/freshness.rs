//! Per-source freshness bookkeeping.
//!
//! Decides whether a plugin may query its external source again for a given
//! asset, or must serve from the graph. Also hosts the single-flight map that
//! collapses concurrent external queries for the same (plugin, asset) pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use asset_graph::AssetKind;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use time::OffsetDateTime;
use tokio::sync::watch;

/// Engine-wide fallback when neither the configuration nor the plugin
/// declares a TTL for a source.
pub const DEFAULT_SOURCE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-(source, from-kind, to-kind) freshness window.
#[derive(Debug, Clone)]
pub struct TtlDescriptor {
    pub source: SmolStr,
    pub from_kind: AssetKind,
    pub to_kind: AssetKind,
    pub duration: Duration,
}

/// Resolution order: per-transform descriptor, per-source duration (config
/// override wins over the plugin default), engine default.
#[derive(Default)]
pub struct TtlTable {
    sources: RwLock<HashMap<SmolStr, Duration>>,
    transforms: RwLock<HashMap<(SmolStr, AssetKind, AssetKind), Duration>>,
}

impl TtlTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugin-declared default; keeps an existing (config-provided) entry.
    pub fn declare_source(&self, source: impl Into<SmolStr>, duration: Duration) {
        self.sources.write().entry(source.into()).or_insert(duration);
    }

    /// Config override; replaces whatever the plugin declared.
    pub fn override_source(&self, source: impl Into<SmolStr>, duration: Duration) {
        self.sources.write().insert(source.into(), duration);
    }

    pub fn declare_transform(&self, descriptor: TtlDescriptor) {
        self.transforms
            .write()
            .entry((descriptor.source, descriptor.from_kind, descriptor.to_kind))
            .or_insert(descriptor.duration);
    }

    pub fn duration(&self, source: &str, from_kind: AssetKind, to_kind: AssetKind) -> Duration {
        if let Some(duration) = self.transforms.read().get(&(source.into(), from_kind, to_kind)) {
            return *duration;
        }

        self.sources
            .read()
            .get(source)
            .copied()
            .unwrap_or(DEFAULT_SOURCE_TTL)
    }

    /// Oldest `last_seen` considered fresh for graph reads backing `source`.
    pub fn ttl_start(&self, source: &str, from_kind: AssetKind, to_kind: AssetKind) -> OffsetDateTime {
        OffsetDateTime::now_utc() - self.duration(source, from_kind, to_kind)
    }
}

/// Remembers when each (source, asset) pair was last queried externally.
#[derive(Default)]
pub struct FreshnessTracker {
    marks: RwLock<HashMap<(SmolStr, String), OffsetDateTime>>,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_monitored(&self, source: &str, asset_key: &str, when: OffsetDateTime) {
        self.marks.write().insert((source.into(), asset_key.to_owned()), when);
    }

    /// True iff `mark_monitored` was recorded within `ttl` of `now`.
    ///
    /// Monotonic within the window: once marked at `t`, every probe before
    /// `t + ttl` answers true.
    pub fn within_ttl(&self, source: &str, asset_key: &str, ttl: Duration, now: OffsetDateTime) -> bool {
        self.marks
            .read()
            .get(&(source.into(), asset_key.to_owned()))
            .is_some_and(|marked| now - *marked < ttl)
    }
}

/// Outcome of entering the single-flight map.
pub enum FlightTicket {
    /// This caller performs the external query; dropping the guard releases
    /// the key and wakes every follower.
    Leader(FlightGuard),
    /// Another dispatch of the same (plugin, asset) is already querying.
    Follower(FlightWaiter),
}

/// Collapses concurrent external queries per (plugin, natural key).
///
/// Keys are plain identifiers on purpose: holding asset or session handles
/// here would tie their lifetimes to in-flight queries.
#[derive(Default)]
pub struct Flights {
    inner: Arc<Mutex<HashMap<(SmolStr, String), watch::Receiver<bool>>>>,
}

impl Flights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, plugin: &str, asset_key: &str) -> FlightTicket {
        let key = (SmolStr::from(plugin), asset_key.to_owned());
        let mut inner = self.inner.lock();

        if let Some(receiver) = inner.get(&key) {
            return FlightTicket::Follower(FlightWaiter(receiver.clone()));
        }

        let (sender, receiver) = watch::channel(false);
        inner.insert(key.clone(), receiver);

        FlightTicket::Leader(FlightGuard {
            key,
            map: Arc::clone(&self.inner),
            done: sender,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct FlightGuard {
    key: (SmolStr, String),
    map: Arc<Mutex<HashMap<(SmolStr, String), watch::Receiver<bool>>>>,
    done: watch::Sender<bool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Eviction happens on every exit path, including panics and
        // cancellation, so a crashed leader cannot wedge its followers.
        self.map.lock().remove(&self.key);
        let _ = self.done.send(true);
    }
}

pub struct FlightWaiter(watch::Receiver<bool>);

impl FlightWaiter {
    /// Resolves once the leader's query completed (or was abandoned).
    pub async fn wait(mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                // Leader dropped without sending; treated as completed.
                break;
            }
        }
    }
}
