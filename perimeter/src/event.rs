use asset_graph::Asset;
use smol_str::SmolStr;
use time::OffsetDateTime;

/// Unit of work flowing through the dispatcher: "this asset should be
/// processed by any matching handlers".
#[derive(Debug, Clone)]
pub struct Event {
    pub asset: Asset,
    pub meta: EventMeta,
    pub created_at: OffsetDateTime,
}

/// Dispatch bookkeeping carried alongside the asset.
#[derive(Debug, Clone, Default)]
pub struct EventMeta {
    /// Transform distance from a seed. Seeds are depth 0.
    pub depth: u32,
    /// Plugin that emitted the event, when not a seed.
    pub origin: Option<SmolStr>,
    /// Queue ordering priority; lower drains first.
    pub priority: u8,
    /// Suppress external queries for this event: serve from the graph only.
    pub no_requery: bool,
}

impl Event {
    /// Seed event, enqueued at run start for every configured seed asset.
    pub fn seed(asset: Asset) -> Self {
        Self {
            asset,
            meta: EventMeta::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Successor event produced by a handler while processing `self`.
    pub fn successor(&self, asset: Asset, origin: impl Into<SmolStr>, priority: u8) -> Self {
        Self {
            asset,
            meta: EventMeta {
                depth: self.meta.depth + 1,
                origin: Some(origin.into()),
                priority,
                no_requery: self.meta.no_requery,
            },
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_inherits_and_extends_metadata() {
        let seed = Event::seed(Asset::fqdn("example.com"));
        assert_eq!(seed.meta.depth, 0);
        assert!(seed.meta.origin.is_none());

        let next = seed.successor(Asset::fqdn("www.example.com"), "dns", 3);
        assert_eq!(next.meta.depth, 1);
        assert_eq!(next.meta.origin.as_deref(), Some("dns"));
        assert_eq!(next.meta.priority, 3);

        let third = next.successor(Asset::ip("192.0.2.1".parse().unwrap()), "dns", 3);
        assert_eq!(third.meta.depth, 2);
    }
}
