use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::asset::Asset;
use crate::relation::{Relation, RelationLabel};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(AssetId);
id_type!(RelationId);

/// An asset as persisted: stable id plus bookkeeping stamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAsset {
    pub id: AssetId,
    pub asset: Asset,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

pub type DynGraphStore = Arc<dyn GraphStore>;

/// Abstract store contract.
///
/// Reads accept a `since` cutoff: entries whose `last_seen` is older are
/// treated as absent. Writes are upsert-by-natural-key for assets and
/// append-only (with `last_seen` refresh) for relations, which makes them safe
/// under concurrent writers.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Looks up assets matching the given value's `(kind, key)`.
    async fn find_by_content(&self, asset: &Asset, since: Option<OffsetDateTime>)
        -> anyhow::Result<Vec<StoredAsset>>;

    async fn find_by_id(&self, id: AssetId, since: Option<OffsetDateTime>) -> anyhow::Result<Option<StoredAsset>>;

    /// Outgoing edges of `from`, optionally restricted to one label.
    async fn outgoing_relations(
        &self,
        from: AssetId,
        since: Option<OffsetDateTime>,
        label: Option<RelationLabel>,
    ) -> anyhow::Result<Vec<Relation>>;

    /// Incoming edges of `to`, optionally restricted to one label.
    ///
    /// Used by reverse walks (does this contact reach a seed?); symmetric
    /// labels are visible from both sides through `outgoing_relations` alone.
    async fn incoming_relations(
        &self,
        to: AssetId,
        since: Option<OffsetDateTime>,
        label: Option<RelationLabel>,
    ) -> anyhow::Result<Vec<Relation>>;

    /// Inserts the asset, or refreshes `last_seen` of the live asset sharing
    /// its natural key. Either way the returned id is the canonical one.
    async fn upsert_asset(&self, asset: Asset) -> anyhow::Result<StoredAsset>;

    /// Inserts the edge, or refreshes `last_seen` of the existing
    /// `(from, to, label)` edge. Labels for which
    /// [`RelationLabel::is_symmetric`] holds are written in both directions.
    async fn create_relation(&self, from: AssetId, to: AssetId, label: RelationLabel) -> anyhow::Result<RelationId>;

    async fn update_last_seen(&self, relation: RelationId) -> anyhow::Result<()>;
}
