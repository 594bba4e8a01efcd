//! Shared helpers plugins use to persist findings and emit successor events.
//!
//! Persistence here is the only write path plugins take, which is what keeps
//! the source-attribution invariant honest: everything stored through this
//! module leaves with a `source` edge.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use asset_graph::{Asset, GraphStore as _, RelationLabel, StoredAsset};
use bloomfilter::Bloom;
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::event::Event;
use crate::normalize::{clean_fqdn, parent_name};
use crate::session::Session;

const FILTER_FP_RATE: f64 = 0.0001;

/// Growable approximate-membership filter over FQDNs.
///
/// Bounds duplicate-suppression memory: membership is a Bloom filter, while a
/// bounded recency list supports `prune` (rebuilding the filter from the most
/// recent insertions). False positives drop a re-discovered name, never add a
/// wrong one.
pub struct FqdnFilter {
    inner: Mutex<FilterInner>,
}

struct FilterInner {
    bloom: Bloom<str>,
    recent: VecDeque<SmolStr>,
    capacity: usize,
}

impl FqdnFilter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16);

        Self {
            inner: Mutex::new(FilterInner {
                bloom: Bloom::new_for_fp_rate(capacity, FILTER_FP_RATE),
                recent: VecDeque::new(),
                capacity,
            }),
        }
    }

    /// Returns true when the name was not seen before.
    pub fn insert(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();

        if inner.bloom.check(name) {
            return false;
        }

        inner.bloom.set(name);
        inner.recent.push_back(name.into());

        if inner.recent.len() > inner.capacity {
            inner.capacity *= 2;
            inner.rebuild();
        }

        true
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().bloom.check(name)
    }

    /// Keeps the `keep` most recently inserted names and forgets the rest.
    pub fn prune(&self, keep: usize) {
        let mut inner = self.inner.lock();

        while inner.recent.len() > keep {
            inner.recent.pop_front();
        }

        inner.rebuild();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FilterInner {
    fn rebuild(&mut self) {
        let mut bloom = Bloom::new_for_fp_rate(self.capacity.max(self.recent.len()), FILTER_FP_RATE);

        for name in &self.recent {
            bloom.set(name.as_str());
        }

        self.bloom = bloom;
    }
}

/// Normalizes, scope-filters and upserts candidate names as FQDN assets with
/// source attribution, then emits dedup-filtered successor events at the
/// handler's priority.
///
/// Names failing normalization or scope are skipped silently; both are
/// expected paths for raw data-source output.
pub async fn store_fqdns_with_source<I, S>(
    session: &Arc<Session>,
    event: &Event,
    names: I,
    source: &StoredAsset,
    plugin: &str,
    priority: u8,
) -> anyhow::Result<Vec<StoredAsset>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let depth = event.meta.depth + 1;

    let mut handled: HashSet<String> = HashSet::new();
    let mut stored_assets = Vec::new();

    for raw in names {
        let raw = raw.as_ref();

        let name = match clean_fqdn(raw) {
            Ok(name) => name,
            Err(error) => {
                trace!(raw, %error, "Discarding malformed candidate name");
                continue;
            }
        };

        if !handled.insert(name.to_string()) {
            continue;
        }

        let candidate = Asset::Fqdn { name };

        let Some(verdict) = session.in_scope(&candidate, depth).await? else {
            trace!(name = %candidate.key(), "Candidate rejected by scope");
            continue;
        };

        let stored = store_fqdn_chain(session, verdict.asset, source).await?;
        stored_assets.push(stored);
    }

    if !stored_assets.is_empty() {
        debug!(plugin, count = stored_assets.len(), "Stored in-scope names");
    }

    process_fqdns(session, event, &stored_assets, plugin, priority).await;

    Ok(stored_assets)
}

/// Upserts one FQDN plus its in-scope ancestors, linking `subdomain_of`
/// edges and attributing every touched asset to `source`.
async fn store_fqdn_chain(
    session: &Arc<Session>,
    asset: Asset,
    source: &StoredAsset,
) -> anyhow::Result<StoredAsset> {
    let graph = session.graph();

    let stored = graph.upsert_asset(asset).await?;
    graph.create_relation(stored.id, source.id, RelationLabel::Source).await?;

    let mut child = stored.clone();

    while let Asset::Fqdn { name } = &child.asset {
        let Some(parent) = parent_name(name) else { break };
        let parent = Asset::fqdn(parent);

        if session.scope().assess(&parent) == 0 {
            break;
        }

        let parent = graph.upsert_asset(parent).await?;
        graph.create_relation(child.id, parent.id, RelationLabel::SubdomainOf).await?;
        graph.create_relation(parent.id, source.id, RelationLabel::Source).await?;

        child = parent;
    }

    Ok(stored)
}

/// Enqueues follow-on events for assets already in the graph, one per name
/// not yet seen this session.
///
/// Returns how many events were actually enqueued.
pub async fn process_fqdns(
    session: &Arc<Session>,
    event: &Event,
    assets: &[StoredAsset],
    plugin: &str,
    priority: u8,
) -> usize {
    let mut emitted = 0;

    for stored in assets {
        let key = stored.asset.key();

        if !session.seen.insert(&key) {
            continue;
        }

        let successor = event.successor(stored.asset.clone(), plugin, priority);
        session.queue.push(successor).await;
        emitted += 1;
    }

    emitted
}

/// Assets attributed to `source` with an attribution refreshed after
/// `since`. This is the graph-side read a plugin serves from while its TTL
/// window is still open.
pub async fn source_assets_within_ttl(
    session: &Arc<Session>,
    source: &StoredAsset,
    since: time::OffsetDateTime,
) -> anyhow::Result<Vec<StoredAsset>> {
    let graph = session.graph();

    let attributions = graph
        .incoming_relations(source.id, Some(since), Some(RelationLabel::Source))
        .await?;

    let mut assets = Vec::with_capacity(attributions.len());
    for relation in attributions {
        if let Some(stored) = graph.find_by_id(relation.from_id, Some(since)).await? {
            assets.push(stored);
        }
    }

    Ok(assets)
}

/// Records source attribution for an asset stored outside the FQDN path.
pub async fn attach_source(session: &Arc<Session>, asset: &StoredAsset, source: &StoredAsset) -> anyhow::Result<()> {
    session
        .graph()
        .create_relation(asset.id, source.id, RelationLabel::Source)
        .await?;
    Ok(())
}
