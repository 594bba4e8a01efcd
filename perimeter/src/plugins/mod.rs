//! Plugin contract and the built-in reference data sources.
//!
//! A plugin is a thin adapter between one external data source and the asset
//! graph. It registers handlers at startup and otherwise only reacts to
//! dispatched events. Handler callbacks follow one discipline: type-check the
//! asset, look up credentials (absence is a clean no-op, not an error),
//! confirm scope, resolve the source asset, branch on the TTL window,
//! normalize, re-filter, persist with attribution, re-emit.

use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::Registry;
use crate::session::Session;

pub mod certspot;
pub mod dns;
pub mod rdap;

pub use certspot::CertspotPlugin;
pub use dns::DnsPlugin;
pub use rdap::RdapPlugin;

pub type DynPlugin = Arc<dyn Plugin>;

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable identifier; used for source attribution, config lookup and
    /// rate-limit bucketing.
    fn name(&self) -> &'static str;

    /// Registers handlers and declares TTL defaults. A failure here is fatal
    /// to the run.
    fn start(&self, registry: &mut Registry, session: &Arc<Session>) -> anyhow::Result<()>;

    /// Releases whatever the plugin holds. Idempotent.
    async fn stop(&self);
}

/// The data sources compiled into this binary.
pub fn built_in() -> Vec<DynPlugin> {
    vec![
        Arc::new(DnsPlugin::new()),
        Arc::new(CertspotPlugin::new()),
        Arc::new(RdapPlugin::new()),
    ]
}

/// Starts every plugin, registering its handlers.
pub fn start_all(plugins: &[DynPlugin], registry: &mut Registry, session: &Arc<Session>) -> anyhow::Result<()> {
    for plugin in plugins {
        plugin
            .start(registry, session)
            .map_err(|e| e.context(format!("failed to start plugin {}", plugin.name())))?;
        debug!(plugin = plugin.name(), "Plugin started");
    }

    Ok(())
}

/// Stops every plugin, in reverse start order.
pub async fn stop_all(plugins: &[DynPlugin]) {
    for plugin in plugins.iter().rev() {
        plugin.stop().await;
    }
}
