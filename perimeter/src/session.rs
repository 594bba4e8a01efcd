//! Per-run context shared by the dispatcher, the plugins and the support
//! library.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use asset_graph::{Asset, AssetId, AssetKind, DynGraphStore, GraphStore as _, RelationLabel, StoredAsset};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng as _;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::config::ConfHandle;
use crate::dispatcher::EventQueue;
use crate::freshness::{Flights, FreshnessTracker, TtlTable};
use crate::lifecycle::{Halt, HaltController, HaltWatcher};
use crate::limits::{IoBudget, RatePolicy, RetryPolicy};
use crate::scope::{Scope, Verdict};
use crate::support::FqdnFilter;

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SEEN_FILTER_CAPACITY: usize = 1 << 16;

/// Labels that carry registration relationships; the ancillary-asset scope
/// walk follows these, and only these, backwards.
const REGISTRATION_LABELS: [RelationLabel; 9] = [
    RelationLabel::Registration,
    RelationLabel::Registrant,
    RelationLabel::RegistrantContact,
    RelationLabel::AssociatedWith,
    RelationLabel::Person,
    RelationLabel::Organization,
    RelationLabel::Location,
    RelationLabel::Phone,
    RelationLabel::Email,
];

pub struct Session {
    id: Uuid,
    conf_handle: ConfHandle,
    scope: Scope,
    graph: DynGraphStore,

    pub queue: Arc<EventQueue>,
    pub seen: FqdnFilter,
    pub ttl: TtlTable,
    pub freshness: FreshnessTracker,
    pub flights: Flights,
    pub rates: RatePolicy,
    pub io: IoBudget,
    pub retry: RetryPolicy,

    http: reqwest::Client,
    dns_cache: RwLock<HashMap<IpAddr, Option<SmolStr>>>,
    sources: RwLock<HashMap<SmolStr, StoredAsset>>,
    accepted: RwLock<HashMap<(AssetKind, String), u8>>,
    seed: u64,

    halt: HaltController,
    halt_watcher: HaltWatcher,
}

impl Session {
    pub fn new(conf_handle: ConfHandle, graph: DynGraphStore) -> anyhow::Result<Arc<Self>> {
        let conf = conf_handle.get_conf();

        let http = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .user_agent(concat!("perimeter/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build the HTTP client")?;

        let rates = RatePolicy::new();
        let ttl = TtlTable::new();

        for source in &conf.datasources {
            if let Some(duration) = source.ttl {
                ttl.override_source(source.name.clone(), duration);
            }
            if let Some(rate) = source.rate {
                rates.set_rate(source.name.clone(), rate);
            }
        }

        let (halt, halt_watcher) = HaltController::new();

        let session = Session {
            id: Uuid::new_v4(),
            scope: conf.scope.clone(),
            queue: Arc::new(EventQueue::new(conf.engine.queue_high_water, conf.engine.queue_low_water)),
            seen: FqdnFilter::new(SEEN_FILTER_CAPACITY),
            ttl,
            freshness: FreshnessTracker::new(),
            flights: Flights::new(),
            rates,
            io: IoBudget::new(conf.engine.max_concurrent_http, conf.engine.max_concurrent_dns),
            retry: RetryPolicy::default(),
            http,
            dns_cache: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            accepted: RwLock::new(HashMap::new()),
            seed: conf.engine.seed,
            conf_handle,
            graph,
            halt,
            halt_watcher,
        };

        Ok(Arc::new(session))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn conf(&self) -> Arc<crate::config::Conf> {
        self.conf_handle.get_conf()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn graph(&self) -> &DynGraphStore {
        &self.graph
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Deterministic RNG derived from the configured seed; used for jittered
    /// sampling so lockstep loops do not align.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Halt state observed by every suspension point. Set by the termination
    /// detector on quiescence or by the supervising service on stop.
    pub fn halted(&self) -> HaltWatcher {
        self.halt_watcher.clone()
    }

    /// Records that the event stream drained.
    pub fn complete(&self) {
        self.halt.halt(Halt::Drained);
    }

    /// Records an operator-requested stop.
    pub fn shutdown(&self) {
        self.halt.halt(Halt::Stopped);
    }

    pub fn cached_dns_name(&self, addr: IpAddr) -> Option<Option<SmolStr>> {
        self.dns_cache.read().get(&addr).cloned()
    }

    pub fn cache_dns_name(&self, addr: IpAddr, name: Option<SmolStr>) {
        self.dns_cache.write().insert(addr, name);
    }

    /// Memoized `Source` asset for a plugin, upserted on first use.
    ///
    /// Every asset a plugin stores gets an outgoing `source` edge to this.
    pub async fn source_asset(&self, name: &str, confidence: u8) -> anyhow::Result<StoredAsset> {
        if let Some(stored) = self.sources.read().get(name) {
            return Ok(stored.clone());
        }

        let stored = self
            .graph
            .upsert_asset(Asset::Source {
                name: name.into(),
                confidence,
            })
            .await
            .with_context(|| format!("failed to store source asset for {name}"))?;

        self.sources.write().insert(name.into(), stored.clone());

        Ok(stored)
    }

    /// Full scope check: seed rules first, then graph-assisted rules.
    ///
    /// `depth` is the event's transform distance from a seed; ancillary assets
    /// with no graph trail yet are admitted on depth alone.
    ///
    /// Accepted verdicts are cached for the session lifetime so a given input
    /// always maps to the same answer.
    pub async fn in_scope(&self, asset: &Asset, depth: u32) -> anyhow::Result<Option<Verdict>> {
        let cache_key = (asset.kind(), asset.key());

        if let Some(confidence) = self.accepted.read().get(&cache_key) {
            return Ok(Some(Verdict {
                asset: canonical(asset),
                confidence: *confidence,
            }));
        }

        let confidence = self.compute_confidence(asset, depth).await?;

        if confidence == 0 {
            return Ok(None);
        }

        self.accepted.write().insert(cache_key, confidence);

        Ok(Some(Verdict {
            asset: canonical(asset),
            confidence,
        }))
    }

    async fn compute_confidence(&self, asset: &Asset, depth: u32) -> anyhow::Result<u8> {
        let direct = self.scope.assess(asset);
        if direct > 0 {
            return Ok(direct);
        }

        match asset {
            Asset::IpAddress { addr } => {
                if self.announced_by_seed_asn(*addr).await? {
                    Ok(crate::scope::CONFIDENCE_ANNOUNCED)
                } else {
                    Ok(0)
                }
            }
            Asset::Netblock { cidr } => {
                if self.announced_by_seed_asn(cidr.network()).await? {
                    Ok(crate::scope::CONFIDENCE_ANNOUNCED)
                } else {
                    Ok(0)
                }
            }
            Asset::Fqdn { .. } | Asset::Asn { .. } => Ok(0),
            _ => self.ancillary_confidence(asset, depth).await,
        }
    }

    /// True when a seed ASN announces a netblock containing `addr`.
    async fn announced_by_seed_asn(&self, addr: IpAddr) -> anyhow::Result<bool> {
        for number in self.scope.seed_asns() {
            let autnum = Asset::Asn { number: *number };

            let Some(stored) = self.graph.find_by_content(&autnum, None).await?.into_iter().next() else {
                continue;
            };

            let announces = self
                .graph
                .outgoing_relations(stored.id, None, Some(RelationLabel::Announces))
                .await?;

            for relation in announces {
                let Some(netblock) = self.graph.find_by_id(relation.to_id, None).await? else {
                    continue;
                };

                if let Asset::Netblock { cidr } = netblock.asset {
                    if cidr.contains(addr) {
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Ancillary assets are in scope when they reach a seed FQDN through at
    /// most `max_depth` registration edges. When the asset has no graph trail
    /// yet (it is being ingested right now), the event depth stands in for
    /// the walk.
    async fn ancillary_confidence(&self, asset: &Asset, depth: u32) -> anyhow::Result<u8> {
        let max_depth = self.scope.max_depth();

        let start = self.graph.find_by_content(asset, None).await?.into_iter().next();

        let Some(start) = start else {
            return Ok(if depth <= max_depth { depth_confidence(depth) } else { 0 });
        };

        if let Some(steps) = self.registration_distance_to_seed(start.id).await? {
            return Ok(depth_confidence(steps));
        }

        // Stored but not connected yet; same fallback as unstored assets.
        Ok(if depth <= max_depth { depth_confidence(depth) } else { 0 })
    }

    /// Breadth-first walk over incoming registration-family edges, bounded by
    /// the scope's max depth. Explicit worklist, no recursion.
    async fn registration_distance_to_seed(&self, start: AssetId) -> anyhow::Result<Option<u32>> {
        let max_depth = self.scope.max_depth();

        let mut visited: HashSet<AssetId> = HashSet::from([start]);
        let mut worklist: VecDeque<(AssetId, u32)> = VecDeque::from([(start, 0)]);

        while let Some((id, steps)) = worklist.pop_front() {
            if steps >= max_depth {
                continue;
            }

            let mut neighbors = Vec::new();
            for label in REGISTRATION_LABELS {
                let incoming = self.graph.incoming_relations(id, None, Some(label)).await?;
                neighbors.extend(incoming.into_iter().map(|relation| relation.from_id));
            }

            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }

                if let Some(stored) = self.graph.find_by_id(neighbor, None).await? {
                    if self.scope.assess(&stored.asset) > 0 {
                        return Ok(Some(steps + 1));
                    }
                }

                worklist.push_back((neighbor, steps + 1));
            }
        }

        Ok(None)
    }
}

fn depth_confidence(depth: u32) -> u8 {
    let penalty = depth.saturating_mul(10).min(90);
    u8::try_from(100 - penalty).unwrap_or(10)
}

fn canonical(asset: &Asset) -> Asset {
    match asset {
        Asset::Fqdn { name } => Asset::fqdn(name.to_lowercase()),
        other => other.clone(),
    }
}
