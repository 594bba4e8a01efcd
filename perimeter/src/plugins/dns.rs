//! Forward and reverse DNS resolution.
//!
//! Credential-less. Forward resolution turns in-scope FQDNs into address
//! assets with `resolves_to` edges; reverse resolution turns discovered
//! addresses back into candidate names.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use asset_graph::{Asset, AssetKind, GraphStore as _, RelationLabel};
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::event::Event;
use crate::freshness::FlightTicket;
use crate::limits::FetchError;
use crate::normalize::clean_fqdn;
use crate::plugins::Plugin;
use crate::registry::{Handler, HandlerError, HandlerSpec, Registry};
use crate::session::Session;
use crate::support;

const SOURCE_NAME: &str = "dns";
const SOURCE_CONFIDENCE: u8 = 80;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

const FORWARD_PRIORITY: u8 = 1;
const REVERSE_PRIORITY: u8 = 2;

pub struct DnsPlugin;

impl DnsPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DnsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for DnsPlugin {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn start(&self, registry: &mut Registry, session: &Arc<Session>) -> anyhow::Result<()> {
        session.ttl.declare_source(SOURCE_NAME, DEFAULT_TTL);

        registry.register(
            HandlerSpec::builder()
                .plugin(SOURCE_NAME)
                .name("forward")
                .event_kind(AssetKind::Fqdn)
                .transforms(vec![AssetKind::IpAddress])
                .priority(FORWARD_PRIORITY)
                .max_instances(8)
                .callback(Arc::new(ForwardHandler))
                .build(),
        )?;

        registry.register(
            HandlerSpec::builder()
                .plugin(SOURCE_NAME)
                .name("reverse")
                .event_kind(AssetKind::IpAddress)
                .transforms(vec![AssetKind::Fqdn])
                .priority(REVERSE_PRIORITY)
                .max_instances(8)
                .callback(Arc::new(ReverseHandler))
                .build(),
        )?;

        Ok(())
    }

    async fn stop(&self) {}
}

struct ForwardHandler;

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, session: &Arc<Session>, event: &Event) -> Result<(), HandlerError> {
        let Asset::Fqdn { .. } = &event.asset else {
            return Ok(());
        };

        let Some(verdict) = session.in_scope(&event.asset, event.meta.depth).await? else {
            return Ok(());
        };

        let name = verdict.asset.key();
        let source = session.source_asset(SOURCE_NAME, SOURCE_CONFIDENCE).await?;

        let ttl = session.ttl.duration(SOURCE_NAME, AssetKind::Fqdn, AssetKind::IpAddress);
        let now = OffsetDateTime::now_utc();

        if event.meta.no_requery || session.freshness.within_ttl(SOURCE_NAME, &name, ttl, now) {
            return serve_forward_from_graph(session, event, &verdict.asset).await;
        }

        let guard = match session.flights.enter(SOURCE_NAME, &name) {
            FlightTicket::Leader(guard) => guard,
            FlightTicket::Follower(waiter) => {
                // Another dispatch is already resolving this name; its results
                // land in the graph either way.
                waiter.wait().await;
                return Ok(());
            }
        };

        let mut halt = session.halted();
        let limiter = session.rates.limiter(SOURCE_NAME);

        if halt.guard(limiter.take()).await.is_err() {
            return Err(HandlerError::Canceled);
        }

        let Ok(_permit) = halt.guard(session.io.dns_permit()).await else {
            return Err(HandlerError::Canceled);
        };

        let addrs = {
            let lookup_name = name.clone();
            match session.retry.run(|| forward_lookup(lookup_name.clone())).await {
                Ok(addrs) => addrs,
                Err(FetchError::Canceled) => return Err(HandlerError::Canceled),
                Err(error) => {
                    debug!(name = %lookup_name, error = format!("{error:#}"), "Forward resolution failed");
                    Vec::new()
                }
            }
        };

        session.freshness.mark_monitored(SOURCE_NAME, &name, now);

        let graph = session.graph();
        let stored_name = graph.upsert_asset(verdict.asset.clone()).await.map_err(HandlerError::from)?;
        support::attach_source(session, &stored_name, &source).await?;

        for addr in addrs {
            let candidate = Asset::ip(addr);

            // Resolved addresses are stored as facts about the name either
            // way; only in-scope addresses spawn follow-on work.
            let stored_addr = graph.upsert_asset(candidate.clone()).await.map_err(HandlerError::from)?;
            graph
                .create_relation(stored_name.id, stored_addr.id, RelationLabel::ResolvesTo)
                .await
                .map_err(HandlerError::from)?;
            support::attach_source(session, &stored_addr, &source).await?;

            let in_scope = session.in_scope(&candidate, event.meta.depth + 1).await?.is_some();
            if in_scope && session.seen.insert(&candidate.key()) {
                let successor = event.successor(candidate, SOURCE_NAME, FORWARD_PRIORITY);
                session.queue.push(successor).await;
            }
        }

        drop(guard);

        Ok(())
    }
}

async fn serve_forward_from_graph(
    session: &Arc<Session>,
    event: &Event,
    asset: &Asset,
) -> Result<(), HandlerError> {
    let graph = session.graph();
    let since = session.ttl.ttl_start(SOURCE_NAME, AssetKind::Fqdn, AssetKind::IpAddress);

    let Some(stored) = graph
        .find_by_content(asset, None)
        .await
        .map_err(HandlerError::from)?
        .into_iter()
        .next()
    else {
        return Ok(());
    };

    let relations = graph
        .outgoing_relations(stored.id, Some(since), Some(RelationLabel::ResolvesTo))
        .await
        .map_err(HandlerError::from)?;

    for relation in relations {
        let Some(target) = graph.find_by_id(relation.to_id, None).await.map_err(HandlerError::from)? else {
            continue;
        };

        let in_scope = session.in_scope(&target.asset, event.meta.depth + 1).await?.is_some();
        if in_scope && session.seen.insert(&target.asset.key()) {
            let successor = event.successor(target.asset, SOURCE_NAME, FORWARD_PRIORITY);
            session.queue.push(successor).await;
        }
    }

    Ok(())
}

struct ReverseHandler;

#[async_trait]
impl Handler for ReverseHandler {
    async fn handle(&self, session: &Arc<Session>, event: &Event) -> Result<(), HandlerError> {
        let Asset::IpAddress { addr } = event.asset else {
            return Ok(());
        };

        if session.in_scope(&event.asset, event.meta.depth).await?.is_none() {
            return Ok(());
        }

        let key = event.asset.key();
        let source = session.source_asset(SOURCE_NAME, SOURCE_CONFIDENCE).await?;

        let ttl = session.ttl.duration(SOURCE_NAME, AssetKind::IpAddress, AssetKind::Fqdn);
        let now = OffsetDateTime::now_utc();

        if event.meta.no_requery || session.freshness.within_ttl(SOURCE_NAME, &key, ttl, now) {
            return Ok(());
        }

        // The session-wide cache short-circuits addresses shared by many
        // names, a common shape behind load balancers.
        if session.cached_dns_name(addr).is_some() {
            return Ok(());
        }

        let guard = match session.flights.enter(SOURCE_NAME, &key) {
            FlightTicket::Leader(guard) => guard,
            FlightTicket::Follower(waiter) => {
                waiter.wait().await;
                return Ok(());
            }
        };

        let mut halt = session.halted();
        let limiter = session.rates.limiter(SOURCE_NAME);

        if halt.guard(limiter.take()).await.is_err() {
            return Err(HandlerError::Canceled);
        }

        let Ok(_permit) = halt.guard(session.io.dns_permit()).await else {
            return Err(HandlerError::Canceled);
        };

        let resolved = match session.retry.run(|| reverse_lookup(addr)).await {
            Ok(resolved) => resolved,
            Err(FetchError::Canceled) => return Err(HandlerError::Canceled),
            Err(error) => {
                debug!(%addr, error = format!("{error:#}"), "Reverse resolution failed");
                None
            }
        };

        session.freshness.mark_monitored(SOURCE_NAME, &key, now);

        let name = resolved.and_then(|raw| clean_fqdn(&raw).ok());
        session.cache_dns_name(addr, name.clone());

        let Some(name) = name else {
            drop(guard);
            return Ok(());
        };

        let stored =
            support::store_fqdns_with_source(session, event, [name.as_str()], &source, SOURCE_NAME, REVERSE_PRIORITY)
                .await?;

        // Tie the resolved name back to the address it came from.
        if let Some(stored_name) = stored.first() {
            let graph = session.graph();
            let stored_addr = graph.upsert_asset(event.asset.clone()).await.map_err(HandlerError::from)?;
            graph
                .create_relation(stored_name.id, stored_addr.id, RelationLabel::ResolvesTo)
                .await
                .map_err(HandlerError::from)?;
        }

        drop(guard);

        Ok(())
    }
}

async fn forward_lookup(name: String) -> Result<Vec<IpAddr>, FetchError> {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_host(&name));

    match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(Ok(addrs))) => Ok(addrs),
        Ok(Ok(Err(error))) => Err(classify_lookup_error(error)),
        Ok(Err(join_error)) => Err(FetchError::Permanent(anyhow::anyhow!("lookup task failed: {join_error}"))),
        Err(_elapsed) => Err(FetchError::Transient(anyhow::anyhow!("DNS lookup timed out"))),
    }
}

async fn reverse_lookup(addr: IpAddr) -> Result<Option<String>, FetchError> {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr));

    match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(Ok(name))) => Ok(Some(name)),
        // No PTR record is an ordinary outcome, not a failure.
        Ok(Ok(Err(_))) => Ok(None),
        Ok(Err(join_error)) => Err(FetchError::Permanent(anyhow::anyhow!("lookup task failed: {join_error}"))),
        Err(_elapsed) => Err(FetchError::Transient(anyhow::anyhow!("reverse DNS lookup timed out"))),
    }
}

fn classify_lookup_error(error: std::io::Error) -> FetchError {
    use std::io::ErrorKind;

    match error.kind() {
        // Resolver overload and SERVFAIL-ish conditions surface as these.
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            FetchError::Transient(anyhow::Error::new(error).context("DNS lookup"))
        }
        _ => FetchError::Permanent(anyhow::Error::new(error).context("DNS lookup")),
    }
}
