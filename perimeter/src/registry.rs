//! Handler table: which callbacks run for which asset kind, in what order,
//! and with how much parallelism.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use asset_graph::AssetKind;
use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::sync::Semaphore;
use typed_builder::TypedBuilder;

use crate::event::Event;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Shutdown or session completion observed mid-handler. Not a failure.
    #[error("handler interrupted by shutdown")]
    Canceled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, session: &Arc<Session>, event: &Event) -> Result<(), HandlerError>;
}

/// Registration request built by a plugin's `start`.
#[derive(TypedBuilder)]
pub struct HandlerSpec {
    #[builder(setter(into))]
    pub plugin: SmolStr,
    #[builder(setter(into))]
    pub name: SmolStr,
    pub event_kind: AssetKind,
    /// Asset kinds this handler may produce. Drives TTL descriptor lookups.
    #[builder(default)]
    pub transforms: Vec<AssetKind>,
    /// Lower runs earlier; equal priorities run concurrently.
    #[builder(default = 5)]
    pub priority: u8,
    #[builder(default = 1)]
    pub max_instances: usize,
    pub callback: Arc<dyn Handler>,
}

/// A handler as held by the registry: spec plus admission state.
pub struct RegisteredHandler {
    pub plugin: SmolStr,
    pub name: SmolStr,
    pub event_kind: AssetKind,
    pub transforms: Vec<AssetKind>,
    pub priority: u8,
    pub max_instances: usize,
    pub callback: Arc<dyn Handler>,
    permits: Semaphore,
    seq: u64,
}

impl RegisteredHandler {
    /// Admission gate honoring `max_instances`.
    pub async fn acquire(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.permits.acquire().await.expect("handler semaphore is never closed")
    }

    pub fn idle(&self) -> bool {
        self.permits.available_permits() == self.max_instances
    }
}

/// Immutable-after-startup table of handlers, indexed by event kind and kept
/// in `(priority, registration order)` order.
#[derive(Default)]
pub struct Registry {
    by_kind: HashMap<AssetKind, Vec<Arc<RegisteredHandler>>>,
    names: HashSet<(SmolStr, SmolStr)>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Failure here is fatal to the run: a plugin that
    /// cannot install its handlers leaves the engine in an undefined shape.
    pub fn register(&mut self, spec: HandlerSpec) -> anyhow::Result<()> {
        anyhow::ensure!(spec.max_instances > 0, "max_instances must be at least 1");

        let name_key = (spec.plugin.clone(), spec.name.clone());
        anyhow::ensure!(
            self.names.insert(name_key),
            "handler {}/{} is already registered",
            spec.plugin,
            spec.name,
        );

        let seq = self.next_seq;
        self.next_seq += 1;

        let handler = Arc::new(RegisteredHandler {
            plugin: spec.plugin,
            name: spec.name,
            event_kind: spec.event_kind,
            transforms: spec.transforms,
            priority: spec.priority,
            max_instances: spec.max_instances,
            callback: spec.callback,
            permits: Semaphore::new(spec.max_instances),
            seq,
        });

        let slot = self.by_kind.entry(handler.event_kind).or_default();
        slot.push(handler);
        slot.sort_by_key(|h| (h.priority, h.seq));

        Ok(())
    }

    pub fn handlers_for(&self, kind: AssetKind) -> &[Arc<RegisteredHandler>] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn handler_count(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    /// True when no handler is currently running anywhere. One of the
    /// quiescence conditions.
    pub fn fully_replenished(&self) -> bool {
        self.by_kind.values().flatten().all(|handler| handler.idle())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(&self, _session: &Arc<Session>, _event: &Event) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn spec(plugin: &str, name: &str, priority: u8) -> HandlerSpec {
        HandlerSpec::builder()
            .plugin(plugin)
            .name(name)
            .event_kind(AssetKind::Fqdn)
            .priority(priority)
            .callback(Arc::new(NoopHandler))
            .build()
    }

    #[test]
    fn handlers_are_ordered_by_priority_then_registration() {
        let mut registry = Registry::new();

        registry.register(spec("beta", "late-high", 6)).unwrap();
        registry.register(spec("alpha", "first-low", 3)).unwrap();
        registry.register(spec("gamma", "second-low", 3)).unwrap();

        let order: Vec<&str> = registry
            .handlers_for(AssetKind::Fqdn)
            .iter()
            .map(|h| h.name.as_str())
            .collect();

        assert_eq!(order, ["first-low", "second-low", "late-high"]);
    }

    #[test]
    fn duplicate_handler_names_are_rejected() {
        let mut registry = Registry::new();

        registry.register(spec("dns", "forward", 1)).unwrap();
        let err = registry.register(spec("dns", "forward", 2)).unwrap_err();

        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn unknown_kind_has_no_handlers() {
        let registry = Registry::new();
        assert!(registry.handlers_for(AssetKind::Asn).is_empty());
        assert!(registry.fully_replenished());
    }
}
