//! Certificate-transparency data source.
//!
//! Queries an issuance-search API for every seed domain and harvests the DNS
//! names found in matching certificates. Requires an API key; without one the
//! plugin stays registered but every event is a clean no-op.

use std::sync::Arc;
use std::time::Duration;

use asset_graph::{Asset, AssetKind};
use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use crate::event::Event;
use crate::freshness::FlightTicket;
use crate::limits::FetchError;
use crate::plugins::Plugin;
use crate::registry::{Handler, HandlerError, HandlerSpec, Registry};
use crate::session::Session;
use crate::support;

const SOURCE_NAME: &str = "certspot";
const SOURCE_CONFIDENCE: u8 = 70;
const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const DEFAULT_API_BASE: &str = "https://api.certspotter.com";

const ISSUANCES_PRIORITY: u8 = 3;

pub struct CertspotPlugin {
    base: Url,
}

impl CertspotPlugin {
    pub fn new() -> Self {
        Self {
            base: Url::parse(DEFAULT_API_BASE).expect("the default API base is a valid URL"),
        }
    }

    /// Points the plugin at another endpoint; test servers mostly.
    pub fn with_base(base: Url) -> Self {
        Self { base }
    }
}

impl Default for CertspotPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for CertspotPlugin {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn start(&self, registry: &mut Registry, session: &Arc<Session>) -> anyhow::Result<()> {
        session.ttl.declare_source(SOURCE_NAME, DEFAULT_TTL);

        registry.register(
            HandlerSpec::builder()
                .plugin(SOURCE_NAME)
                .name("issuances")
                .event_kind(AssetKind::Fqdn)
                .transforms(vec![AssetKind::Fqdn])
                .priority(ISSUANCES_PRIORITY)
                .max_instances(4)
                .callback(Arc::new(IssuancesHandler { base: self.base.clone() }))
                .build(),
        )?;

        Ok(())
    }

    async fn stop(&self) {}
}

struct IssuancesHandler {
    base: Url,
}

#[async_trait]
impl Handler for IssuancesHandler {
    async fn handle(&self, session: &Arc<Session>, event: &Event) -> Result<(), HandlerError> {
        let Asset::Fqdn { name } = &event.asset else {
            return Ok(());
        };

        // Issuance search covers the whole domain tree; only run it for the
        // seeds themselves.
        if !session.scope().is_seed_domain(name) {
            return Ok(());
        }

        // Missing credentials are not an error: the operator simply didn't
        // enable this source.
        let conf = session.conf();
        let Some(apikey) = conf
            .datasource(SOURCE_NAME)
            .and_then(|source| source.first_credential())
            .and_then(|cred| cred.apikey.clone())
        else {
            trace!(plugin = SOURCE_NAME, "No API key configured; skipping");
            return Ok(());
        };

        let Some(verdict) = session.in_scope(&event.asset, event.meta.depth).await? else {
            return Ok(());
        };

        let domain = verdict.asset.key();
        let source = session.source_asset(SOURCE_NAME, SOURCE_CONFIDENCE).await?;

        let ttl = session.ttl.duration(SOURCE_NAME, AssetKind::Fqdn, AssetKind::Fqdn);
        let now = OffsetDateTime::now_utc();

        if event.meta.no_requery || session.freshness.within_ttl(SOURCE_NAME, &domain, ttl, now) {
            let since = session.ttl.ttl_start(SOURCE_NAME, AssetKind::Fqdn, AssetKind::Fqdn);
            let assets = support::source_assets_within_ttl(session, &source, since).await?;
            support::process_fqdns(session, event, &assets, SOURCE_NAME, ISSUANCES_PRIORITY).await;
            return Ok(());
        }

        let guard = match session.flights.enter(SOURCE_NAME, &domain) {
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

        let Ok(_permit) = halt.guard(session.io.http_permit()).await else {
            return Err(HandlerError::Canceled);
        };

        let names = {
            let request_url = issuances_url(&self.base, &domain);
            let http = session.http().clone();
            let apikey = apikey.clone();

            let outcome = session
                .retry
                .run(|| fetch_issuances(http.clone(), request_url.clone(), apikey.clone()))
                .await;

            match outcome {
                Ok(issuances) => dns_names(issuances),
                Err(FetchError::Canceled) => return Err(HandlerError::Canceled),
                Err(error) => {
                    // Permanent failures abandon the request; the event
                    // continues through the remaining handlers.
                    warn!(plugin = SOURCE_NAME, %domain, error = format!("{error:#}"), "Issuance query failed");
                    drop(guard);
                    return Ok(());
                }
            }
        };

        session.freshness.mark_monitored(SOURCE_NAME, &domain, now);

        support::store_fqdns_with_source(session, event, names.iter().map(String::as_str), &source, SOURCE_NAME, ISSUANCES_PRIORITY)
            .await?;

        drop(guard);

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Issuance {
    #[serde(default)]
    dns_names: Vec<String>,
}

fn issuances_url(base: &Url, domain: &str) -> Url {
    let mut url = base.clone();
    url.set_path("/v1/issuances");
    url.query_pairs_mut()
        .append_pair("domain", domain)
        .append_pair("include_subdomains", "true")
        .append_pair("expand", "dns_names")
        .finish();
    url
}

async fn fetch_issuances(http: reqwest::Client, url: Url, apikey: String) -> Result<Vec<Issuance>, FetchError> {
    let response = http
        .get(url)
        .bearer_auth(apikey)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(e, "issuance query"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::from_status(status, "issuance query"));
    }

    response
        .json::<Vec<Issuance>>()
        .await
        .map_err(|e| FetchError::Permanent(anyhow::Error::new(e).context("malformed issuance response")))
}

fn dns_names(issuances: Vec<Issuance>) -> Vec<String> {
    issuances.into_iter().flat_map(|issuance| issuance.dns_names).collect()
}
