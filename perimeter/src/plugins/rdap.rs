//! Registration-data source (RDAP).
//!
//! For each seed domain, pulls the RDAP domain object, persists it as a
//! `DomainRecord` with its registrant contact details, and links records that
//! share a registrant with `associated_with` edges. Those edges are what the
//! association closure traverses later.

use std::sync::Arc;
use std::time::Duration;

use asset_graph::{Asset, AssetKind, GraphStore as _, RelationLabel, StoredAsset};
use async_trait::async_trait;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

use crate::event::Event;
use crate::freshness::FlightTicket;
use crate::limits::FetchError;
use crate::plugins::Plugin;
use crate::registry::{Handler, HandlerError, HandlerSpec, Registry};
use crate::session::Session;
use crate::support;

const SOURCE_NAME: &str = "rdap";
const SOURCE_CONFIDENCE: u8 = 90;
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_API_BASE: &str = "https://rdap.org";

const DOMAIN_PRIORITY: u8 = 4;

pub struct RdapPlugin {
    base: Url,
}

impl RdapPlugin {
    pub fn new() -> Self {
        Self {
            base: Url::parse(DEFAULT_API_BASE).expect("the default API base is a valid URL"),
        }
    }

    pub fn with_base(base: Url) -> Self {
        Self { base }
    }
}

impl Default for RdapPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for RdapPlugin {
    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn start(&self, registry: &mut Registry, session: &Arc<Session>) -> anyhow::Result<()> {
        session.ttl.declare_source(SOURCE_NAME, DEFAULT_TTL);

        registry.register(
            HandlerSpec::builder()
                .plugin(SOURCE_NAME)
                .name("domain")
                .event_kind(AssetKind::Fqdn)
                .transforms(vec![
                    AssetKind::DomainRecord,
                    AssetKind::Organization,
                    AssetKind::Person,
                    AssetKind::Location,
                    AssetKind::PhoneNumber,
                    AssetKind::EmailAddress,
                ])
                .priority(DOMAIN_PRIORITY)
                .max_instances(2)
                .callback(Arc::new(DomainHandler { base: self.base.clone() }))
                .build(),
        )?;

        Ok(())
    }

    async fn stop(&self) {}
}

struct DomainHandler {
    base: Url,
}

#[async_trait]
impl Handler for DomainHandler {
    async fn handle(&self, session: &Arc<Session>, event: &Event) -> Result<(), HandlerError> {
        let Asset::Fqdn { name } = &event.asset else {
            return Ok(());
        };

        // Registration data exists per registered domain; subdomains carry
        // nothing of their own.
        if !session.scope().is_seed_domain(name) {
            return Ok(());
        }

        let Some(verdict) = session.in_scope(&event.asset, event.meta.depth).await? else {
            return Ok(());
        };

        let domain = verdict.asset.key();
        let source = session.source_asset(SOURCE_NAME, SOURCE_CONFIDENCE).await?;

        let ttl = session.ttl.duration(SOURCE_NAME, AssetKind::Fqdn, AssetKind::DomainRecord);
        let now = OffsetDateTime::now_utc();

        // Inside the window the record is already in the graph; there are no
        // follow-on events to replay for registration data.
        if event.meta.no_requery || session.freshness.within_ttl(SOURCE_NAME, &domain, ttl, now) {
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

        let document = {
            let request_url = domain_url(&self.base, &domain);
            let http = session.http().clone();

            let outcome = session.retry.run(|| fetch_domain(http.clone(), request_url.clone())).await;

            match outcome {
                Ok(document) => document,
                Err(FetchError::Canceled) => return Err(HandlerError::Canceled),
                Err(error) => {
                    debug!(plugin = SOURCE_NAME, %domain, error = format!("{error:#}"), "RDAP query failed");
                    drop(guard);
                    return Ok(());
                }
            }
        };

        session.freshness.mark_monitored(SOURCE_NAME, &domain, now);

        let registration = registration_data(&domain, document);
        persist_registration(session, event, &verdict.asset, registration, &source).await?;

        drop(guard);

        Ok(())
    }
}

async fn persist_registration(
    session: &Arc<Session>,
    event: &Event,
    fqdn: &Asset,
    registration: RegistrationData,
    source: &StoredAsset,
) -> Result<(), HandlerError> {
    let graph = session.graph();
    let depth = event.meta.depth + 1;

    let stored_fqdn = graph.upsert_asset(fqdn.clone()).await.map_err(HandlerError::from)?;
    support::attach_source(session, &stored_fqdn, source).await?;

    if session.in_scope(&registration.record, depth).await?.is_none() {
        return Ok(());
    }

    let record = graph.upsert_asset(registration.record).await.map_err(HandlerError::from)?;
    graph
        .create_relation(stored_fqdn.id, record.id, RelationLabel::Registration)
        .await
        .map_err(HandlerError::from)?;
    support::attach_source(session, &record, source).await?;

    let Some(card) = registration.registrant else {
        return Ok(());
    };

    let contact_asset = match (card.org, card.full_name) {
        (Some(org), _) => Asset::Organization { name: org },
        (None, Some(full_name)) => Asset::Person { full_name },
        (None, None) => return Ok(()),
    };

    if session.in_scope(&contact_asset, depth + 1).await?.is_none() {
        return Ok(());
    }

    let contact = graph.upsert_asset(contact_asset).await.map_err(HandlerError::from)?;
    graph
        .create_relation(record.id, contact.id, RelationLabel::Registrant)
        .await
        .map_err(HandlerError::from)?;
    support::attach_source(session, &contact, source).await?;

    let mut details: Vec<(RelationLabel, Asset)> = Vec::new();

    if let Some(address) = card.address {
        details.push((RelationLabel::Location, Asset::Location { address }));
    }
    for number in card.phones {
        details.push((RelationLabel::Phone, Asset::PhoneNumber { number: number.into() }));
    }
    for address in card.emails {
        details.push((RelationLabel::Email, Asset::EmailAddress { address: address.into() }));
    }

    for (label, asset) in details {
        if session.in_scope(&asset, depth + 2).await?.is_none() {
            continue;
        }

        let stored = graph.upsert_asset(asset).await.map_err(HandlerError::from)?;
        graph.create_relation(contact.id, stored.id, label).await.map_err(HandlerError::from)?;
        support::attach_source(session, &stored, source).await?;
    }

    // Records sharing this registrant belong to the same owner; link them so
    // the association closure can cross between their domains.
    let sibling_records = graph
        .incoming_relations(contact.id, None, Some(RelationLabel::Registrant))
        .await
        .map_err(HandlerError::from)?;

    for relation in sibling_records {
        if relation.from_id != record.id {
            graph
                .create_relation(record.id, relation.from_id, RelationLabel::AssociatedWith)
                .await
                .map_err(HandlerError::from)?;
        }
    }

    Ok(())
}

fn domain_url(base: &Url, domain: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&format!("/domain/{domain}"));
    url
}

async fn fetch_domain(http: reqwest::Client, url: Url) -> Result<RdapDomain, FetchError> {
    let response = http
        .get(url)
        .header(reqwest::header::ACCEPT, "application/rdap+json")
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(e, "RDAP query"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::from_status(status, "RDAP query"));
    }

    response
        .json::<RdapDomain>()
        .await
        .map_err(|e| FetchError::Permanent(anyhow::Error::new(e).context("malformed RDAP response")))
}

#[derive(Debug, Deserialize)]
struct RdapDomain {
    handle: Option<String>,
    #[serde(default)]
    status: Vec<String>,
    #[serde(default)]
    events: Vec<RdapEvent>,
    #[serde(default)]
    entities: Vec<RdapEntity>,
}

#[derive(Debug, Deserialize)]
struct RdapEvent {
    #[serde(rename = "eventAction")]
    action: String,
    #[serde(rename = "eventDate")]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RdapEntity {
    #[serde(default)]
    roles: Vec<String>,
    #[serde(rename = "vcardArray")]
    vcard: Option<serde_json::Value>,
}

#[derive(Debug, Default, PartialEq)]
struct ContactCard {
    full_name: Option<String>,
    org: Option<String>,
    address: Option<String>,
    phones: Vec<String>,
    emails: Vec<String>,
}

struct RegistrationData {
    record: Asset,
    registrant: Option<ContactCard>,
}

/// Shapes the raw RDAP document into graph assets.
fn registration_data(domain: &str, document: RdapDomain) -> RegistrationData {
    let expiration = document
        .events
        .iter()
        .find(|event| event.action == "expiration")
        .and_then(|event| event.date.as_deref())
        .and_then(|date| OffsetDateTime::parse(date, &Rfc3339).ok());

    let registrar = document
        .entities
        .iter()
        .find(|entity| entity.roles.iter().any(|role| role == "registrar"))
        .and_then(|entity| entity.vcard.as_ref())
        .and_then(|vcard| parse_vcard(vcard).full_name);

    let registrant = document
        .entities
        .iter()
        .find(|entity| entity.roles.iter().any(|role| role == "registrant"))
        .and_then(|entity| entity.vcard.as_ref())
        .map(parse_vcard);

    let record = Asset::DomainRecord {
        domain: domain.into(),
        name: document.handle,
        registrar,
        expiration,
        statuses: document.status,
    };

    RegistrationData { record, registrant }
}

/// Pulls the useful properties out of a jCard (RFC 7095) value.
///
/// The format is `["vcard", [[name, params, type, value], …]]` with `adr`
/// values being a seven-component array.
fn parse_vcard(vcard: &serde_json::Value) -> ContactCard {
    let mut card = ContactCard::default();

    let Some(properties) = vcard.get(1).and_then(|v| v.as_array()) else {
        return card;
    };

    for property in properties {
        let Some(items) = property.as_array() else { continue };
        let Some(name) = items.first().and_then(|v| v.as_str()) else {
            continue;
        };
        let value = items.get(3);

        match name {
            "fn" => card.full_name = value.and_then(|v| v.as_str()).map(str::to_owned).filter(|s| !s.is_empty()),
            "org" => card.org = value.and_then(|v| v.as_str()).map(str::to_owned).filter(|s| !s.is_empty()),
            "adr" => {
                let joined = value.and_then(|v| v.as_array()).map(|components| {
                    components
                        .iter()
                        .filter_map(|c| c.as_str())
                        .filter(|c| !c.is_empty())
                        .collect::<Vec<_>>()
                        .join(", ")
                });
                card.address = joined.filter(|s| !s.is_empty());
            }
            "tel" => {
                if let Some(number) = value.and_then(|v| v.as_str()) {
                    card.phones.push(number.trim_start_matches("tel:").to_owned());
                }
            }
            "email" => {
                if let Some(address) = value.and_then(|v| v.as_str()) {
                    card.emails.push(address.to_owned());
                }
            }
            _ => {}
        }
    }

    card
}
