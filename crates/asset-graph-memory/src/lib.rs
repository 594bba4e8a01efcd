//! In-memory [`GraphStore`] backend.
//!
//! Reference implementation used by the engine out of the box and by the test
//! suite. Durable backends live behind the same trait in their own crates.

use std::collections::HashMap;

use async_trait::async_trait;
use asset_graph::{Asset, AssetId, AssetKind, GraphStore, Relation, RelationId, RelationLabel, StoredAsset};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Default)]
pub struct MemoryGraph {
    inner: RwLock<Inner>,
}

/// Flat serializable image of a graph, the interchange form between a
/// finished run and read-only consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub assets: Vec<StoredAsset>,
    pub relations: Vec<Relation>,
}

#[derive(Default)]
struct Inner {
    assets: HashMap<AssetId, StoredAsset>,
    // Natural-key index; the uniqueness invariant lives here.
    by_key: HashMap<(AssetKind, String), AssetId>,
    relations: HashMap<RelationId, Relation>,
    by_edge: HashMap<(AssetId, AssetId, RelationLabel), RelationId>,
    outgoing: HashMap<AssetId, Vec<RelationId>>,
    incoming: HashMap<AssetId, Vec<RelationId>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asset_count(&self) -> usize {
        self.inner.read().assets.len()
    }

    pub fn relation_count(&self) -> usize {
        self.inner.read().relations.len()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.read();

        GraphSnapshot {
            assets: inner.assets.values().cloned().collect(),
            relations: inner.relations.values().cloned().collect(),
        }
    }

    /// Rebuilds a graph (indexes included) from a snapshot.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut inner = Inner::default();

        for stored in snapshot.assets {
            inner.by_key.insert((stored.asset.kind(), stored.asset.key()), stored.id);
            inner.assets.insert(stored.id, stored);
        }

        for relation in snapshot.relations {
            inner
                .by_edge
                .insert((relation.from_id, relation.to_id, relation.label), relation.id);
            inner.outgoing.entry(relation.from_id).or_default().push(relation.id);
            inner.incoming.entry(relation.to_id).or_default().push(relation.id);
            inner.relations.insert(relation.id, relation);
        }

        Self {
            inner: RwLock::new(inner),
        }
    }
}

fn fresh(last_seen: OffsetDateTime, since: Option<OffsetDateTime>) -> bool {
    since.is_none_or(|cutoff| last_seen >= cutoff)
}

impl Inner {
    fn upsert_edge(&mut self, from: AssetId, to: AssetId, label: RelationLabel, now: OffsetDateTime) -> RelationId {
        if let Some(id) = self.by_edge.get(&(from, to, label)) {
            let relation = self.relations.get_mut(id).expect("edge index points to a live relation");
            relation.last_seen = now;
            return *id;
        }

        let id = RelationId::random();
        let relation = Relation {
            id,
            from_id: from,
            to_id: to,
            label,
            last_seen: now,
        };

        self.relations.insert(id, relation);
        self.by_edge.insert((from, to, label), id);
        self.outgoing.entry(from).or_default().push(id);
        self.incoming.entry(to).or_default().push(id);

        id
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn find_by_content(
        &self,
        asset: &Asset,
        since: Option<OffsetDateTime>,
    ) -> anyhow::Result<Vec<StoredAsset>> {
        let inner = self.inner.read();

        let found = inner
            .by_key
            .get(&(asset.kind(), asset.key()))
            .and_then(|id| inner.assets.get(id))
            .filter(|stored| fresh(stored.last_seen, since))
            .cloned();

        Ok(found.into_iter().collect())
    }

    async fn find_by_id(&self, id: AssetId, since: Option<OffsetDateTime>) -> anyhow::Result<Option<StoredAsset>> {
        let inner = self.inner.read();

        Ok(inner
            .assets
            .get(&id)
            .filter(|stored| fresh(stored.last_seen, since))
            .cloned())
    }

    async fn outgoing_relations(
        &self,
        from: AssetId,
        since: Option<OffsetDateTime>,
        label: Option<RelationLabel>,
    ) -> anyhow::Result<Vec<Relation>> {
        let inner = self.inner.read();

        let relations = inner
            .outgoing
            .get(&from)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.relations.get(id))
            .filter(|relation| label.is_none_or(|l| relation.label == l))
            .filter(|relation| fresh(relation.last_seen, since))
            .cloned()
            .collect();

        Ok(relations)
    }

    async fn incoming_relations(
        &self,
        to: AssetId,
        since: Option<OffsetDateTime>,
        label: Option<RelationLabel>,
    ) -> anyhow::Result<Vec<Relation>> {
        let inner = self.inner.read();

        let relations = inner
            .incoming
            .get(&to)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.relations.get(id))
            .filter(|relation| label.is_none_or(|l| relation.label == l))
            .filter(|relation| fresh(relation.last_seen, since))
            .cloned()
            .collect();

        Ok(relations)
    }

    async fn upsert_asset(&self, asset: Asset) -> anyhow::Result<StoredAsset> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write();

        let key = (asset.kind(), asset.key());

        if let Some(id) = inner.by_key.get(&key).copied() {
            let stored = inner.assets.get_mut(&id).expect("key index points to a live asset");
            stored.last_seen = now;
            return Ok(stored.clone());
        }

        let stored = StoredAsset {
            id: AssetId::random(),
            asset,
            created_at: now,
            last_seen: now,
        };

        inner.by_key.insert(key, stored.id);
        inner.assets.insert(stored.id, stored.clone());

        Ok(stored)
    }

    async fn create_relation(&self, from: AssetId, to: AssetId, label: RelationLabel) -> anyhow::Result<RelationId> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write();

        anyhow::ensure!(inner.assets.contains_key(&from), "unknown asset id: {from}");
        anyhow::ensure!(inner.assets.contains_key(&to), "unknown asset id: {to}");

        let id = inner.upsert_edge(from, to, label, now);

        if label.is_symmetric() && from != to {
            inner.upsert_edge(to, from, label, now);
        }

        Ok(id)
    }

    async fn update_last_seen(&self, relation: RelationId) -> anyhow::Result<()> {
        let mut inner = self.inner.write();

        let relation = inner
            .relations
            .get_mut(&relation)
            .ok_or_else(|| anyhow::anyhow!("unknown relation id: {relation}"))?;
        relation.last_seen = OffsetDateTime::now_utc();

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use time::Duration;

    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent_per_natural_key() {
        let graph = MemoryGraph::new();

        let first = graph.upsert_asset(Asset::fqdn("www.example.com")).await.unwrap();
        let second = graph.upsert_asset(Asset::fqdn("WWW.EXAMPLE.COM")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(graph.asset_count(), 1);
        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn relations_collapse_and_refresh_last_seen() {
        let graph = MemoryGraph::new();

        let a = graph.upsert_asset(Asset::fqdn("a.example.com")).await.unwrap();
        let b = graph.upsert_asset(Asset::fqdn("example.com")).await.unwrap();

        let first = graph
            .create_relation(a.id, b.id, RelationLabel::SubdomainOf)
            .await
            .unwrap();
        let second = graph
            .create_relation(a.id, b.id, RelationLabel::SubdomainOf)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(graph.relation_count(), 1);
    }

    #[tokio::test]
    async fn association_edges_are_written_both_ways() {
        let graph = MemoryGraph::new();

        let a = graph
            .upsert_asset(Asset::Organization { name: "Acme".to_owned() })
            .await
            .unwrap();
        let b = graph
            .upsert_asset(Asset::Organization {
                name: "Acme Holdings".to_owned(),
            })
            .await
            .unwrap();

        graph
            .create_relation(a.id, b.id, RelationLabel::AssociatedWith)
            .await
            .unwrap();

        let forward = graph
            .outgoing_relations(a.id, None, Some(RelationLabel::AssociatedWith))
            .await
            .unwrap();
        let backward = graph
            .outgoing_relations(b.id, None, Some(RelationLabel::AssociatedWith))
            .await
            .unwrap();

        assert_eq!(forward.len(), 1);
        assert_eq!(backward.len(), 1);
        assert_eq!(forward[0].to_id, b.id);
        assert_eq!(backward[0].to_id, a.id);
    }

    #[tokio::test]
    async fn update_last_seen_refreshes_one_relation() {
        let graph = MemoryGraph::new();

        let a = graph.upsert_asset(Asset::fqdn("a.example.com")).await.unwrap();
        let b = graph.upsert_asset(Asset::fqdn("example.com")).await.unwrap();
        let id = graph
            .create_relation(a.id, b.id, RelationLabel::SubdomainOf)
            .await
            .unwrap();

        let before = graph.outgoing_relations(a.id, None, None).await.unwrap()[0].last_seen;
        graph.update_last_seen(id).await.unwrap();
        let after = graph.outgoing_relations(a.id, None, None).await.unwrap()[0].last_seen;

        assert!(after >= before);
        assert!(graph.update_last_seen(RelationId::random()).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_ids_and_edges() {
        let graph = MemoryGraph::new();

        let a = graph.upsert_asset(Asset::fqdn("www.example.com")).await.unwrap();
        let b = graph.upsert_asset(Asset::fqdn("example.com")).await.unwrap();
        graph
            .create_relation(a.id, b.id, RelationLabel::SubdomainOf)
            .await
            .unwrap();

        let json = serde_json::to_string(&graph.snapshot()).unwrap();
        let restored = MemoryGraph::from_snapshot(serde_json::from_str(&json).unwrap());

        let found = restored
            .find_by_content(&Asset::fqdn("www.example.com"), None)
            .await
            .unwrap();
        assert_eq!(found[0].id, a.id);

        let edges = restored
            .outgoing_relations(a.id, None, Some(RelationLabel::SubdomainOf))
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to_id, b.id);

        // Upserting into the restored graph reuses the existing id.
        let again = restored.upsert_asset(Asset::fqdn("WWW.example.com")).await.unwrap();
        assert_eq!(again.id, a.id);
    }

    #[tokio::test]
    async fn since_cutoff_hides_stale_entries() {
        let graph = MemoryGraph::new();

        let stored = graph.upsert_asset(Asset::fqdn("old.example.com")).await.unwrap();

        let future_cutoff = OffsetDateTime::now_utc() + Duration::hours(1);
        let hidden = graph.find_by_content(&stored.asset, Some(future_cutoff)).await.unwrap();
        assert!(hidden.is_empty());

        let past_cutoff = OffsetDateTime::now_utc() - Duration::hours(1);
        let visible = graph.find_by_content(&stored.asset, Some(past_cutoff)).await.unwrap();
        assert_eq!(visible.len(), 1);
    }
}
