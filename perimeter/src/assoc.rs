//! Association closure: which assets share registration relationships with a
//! seed domain.
//!
//! Read-only over the graph. Traversal uses an explicit worklist and a
//! visited-id set, so cycles terminate and output order is deterministic.

use std::collections::HashSet;

use asset_graph::{Asset, AssetId, DynGraphStore, GraphStore as _, RelationLabel, StoredAsset};
use time::OffsetDateTime;

/// Computes the set of assets transitively associated with `seed_domain`.
///
/// Resolves the seed FQDNs, collects their `registration` targets as roots,
/// then walks the `associated_with` closure breadth-first. Same-level ties
/// are broken by ascending asset id. The roots themselves are not part of
/// the result.
pub async fn associations(
    graph: &DynGraphStore,
    seed_domain: &str,
    since: Option<OffsetDateTime>,
) -> anyhow::Result<Vec<StoredAsset>> {
    let fqdns = graph
        .find_by_content(&Asset::fqdn(seed_domain.to_ascii_lowercase()), since)
        .await?;

    let mut roots: Vec<AssetId> = Vec::new();
    for fqdn in &fqdns {
        let registrations = graph
            .outgoing_relations(fqdn.id, since, Some(RelationLabel::Registration))
            .await?;
        roots.extend(registrations.into_iter().map(|relation| relation.to_id));
    }

    roots.sort_unstable();
    roots.dedup();

    let mut visited: HashSet<AssetId> = roots.iter().copied().collect();
    let mut frontier = roots;
    let mut closure = Vec::new();

    while !frontier.is_empty() {
        let mut next_level: Vec<AssetId> = Vec::new();

        for id in frontier {
            let relations = graph
                .outgoing_relations(id, since, Some(RelationLabel::AssociatedWith))
                .await?;

            for relation in relations {
                if visited.insert(relation.to_id) {
                    next_level.push(relation.to_id);
                }
            }
        }

        next_level.sort_unstable();

        for id in &next_level {
            if let Some(stored) = graph.find_by_id(*id, since).await? {
                closure.push(stored);
            }
        }

        frontier = next_level;
    }

    Ok(closure)
}

/// Expands the contact details reachable from one association.
///
/// Follows `registrant` and `registrant_contact` edges, then the person /
/// organization / location / phone / email edges of each contact node. A
/// contact node carrying no detail edges is returned as its own detail.
pub async fn contact_details(
    graph: &DynGraphStore,
    association: AssetId,
    since: Option<OffsetDateTime>,
) -> anyhow::Result<Vec<(RelationLabel, StoredAsset)>> {
    let mut contacts = Vec::new();

    for label in [RelationLabel::Registrant, RelationLabel::RegistrantContact] {
        let relations = graph.outgoing_relations(association, since, Some(label)).await?;
        contacts.extend(relations.into_iter().map(|relation| relation.to_id));
    }

    contacts.sort_unstable();
    contacts.dedup();

    let mut details = Vec::new();

    for contact in contacts {
        let mut expanded = false;

        for label in RelationLabel::CONTACT_LABELS {
            let relations = graph.outgoing_relations(contact, since, Some(label)).await?;

            for relation in relations {
                if let Some(stored) = graph.find_by_id(relation.to_id, since).await? {
                    details.push((label, stored));
                    expanded = true;
                }
            }
        }

        if !expanded {
            if let Some(stored) = graph.find_by_id(contact, since).await? {
                let label = match stored.asset {
                    Asset::Person { .. } => RelationLabel::Person,
                    Asset::Organization { .. } => RelationLabel::Organization,
                    Asset::Location { .. } => RelationLabel::Location,
                    Asset::PhoneNumber { .. } => RelationLabel::Phone,
                    Asset::EmailAddress { .. } => RelationLabel::Email,
                    _ => continue,
                };
                details.push((label, stored));
            }
        }
    }

    Ok(details)
}
