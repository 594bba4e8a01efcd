//! Association closure over a populated graph, the way the CLI consumes it.

use std::sync::Arc;

use asset_graph::{Asset, DynGraphStore, GraphStore as _, RelationLabel, StoredAsset};
use asset_graph_memory::MemoryGraph;
use perimeter::assoc::{associations, contact_details};
use smol_str::SmolStr;

async fn domain_record(graph: &DynGraphStore, domain: &str) -> StoredAsset {
    graph
        .upsert_asset(Asset::DomainRecord {
            domain: SmolStr::from(domain),
            name: None,
            registrar: None,
            expiration: None,
            statuses: Vec::new(),
        })
        .await
        .expect("upsert succeeds")
}

// The registration root is not part of its own closure, and a cycle through
// the association edges terminates.
#[tokio::test]
async fn closure_with_cycle_returns_the_two_peers() {
    let graph: DynGraphStore = Arc::new(MemoryGraph::new());

    let seed = graph.upsert_asset(Asset::fqdn("example.com")).await.expect("upsert succeeds");
    let d1 = domain_record(&graph, "example.com").await;
    let d2 = domain_record(&graph, "example.net").await;
    let d3 = domain_record(&graph, "example.org").await;

    graph
        .create_relation(seed.id, d1.id, RelationLabel::Registration)
        .await
        .expect("relation succeeds");
    graph
        .create_relation(d1.id, d2.id, RelationLabel::AssociatedWith)
        .await
        .expect("relation succeeds");
    graph
        .create_relation(d2.id, d3.id, RelationLabel::AssociatedWith)
        .await
        .expect("relation succeeds");
    graph
        .create_relation(d3.id, d1.id, RelationLabel::AssociatedWith)
        .await
        .expect("relation succeeds");

    let closure = associations(&graph, "example.com", None).await.expect("closure succeeds");

    let mut domains: Vec<String> = closure
        .iter()
        .map(|stored| match &stored.asset {
            Asset::DomainRecord { domain, .. } => domain.to_string(),
            other => other.key(),
        })
        .collect();
    domains.sort();

    assert_eq!(domains, ["example.net", "example.org"]);
}

// Verbose expansion reaches the contact details behind an association.
#[tokio::test]
async fn contact_details_behind_an_association() {
    let graph: DynGraphStore = Arc::new(MemoryGraph::new());

    let seed = graph.upsert_asset(Asset::fqdn("example.com")).await.expect("upsert succeeds");
    let own = domain_record(&graph, "example.com").await;
    let peer = domain_record(&graph, "example.net").await;

    let org = graph
        .upsert_asset(Asset::Organization {
            name: "Example Corp".to_owned(),
        })
        .await
        .expect("upsert succeeds");
    let email = graph
        .upsert_asset(Asset::EmailAddress {
            address: "hostmaster@example.net".into(),
        })
        .await
        .expect("upsert succeeds");

    graph
        .create_relation(seed.id, own.id, RelationLabel::Registration)
        .await
        .expect("relation succeeds");
    graph
        .create_relation(own.id, peer.id, RelationLabel::AssociatedWith)
        .await
        .expect("relation succeeds");
    graph
        .create_relation(peer.id, org.id, RelationLabel::Registrant)
        .await
        .expect("relation succeeds");
    graph
        .create_relation(org.id, email.id, RelationLabel::Email)
        .await
        .expect("relation succeeds");

    let closure = associations(&graph, "example.com", None).await.expect("closure succeeds");
    assert_eq!(closure.len(), 1);
    assert_eq!(closure[0].id, peer.id);

    let details = contact_details(&graph, closure[0].id, None).await.expect("expansion succeeds");
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].0, RelationLabel::Email);
    assert_eq!(details[0].1.asset.key(), "hostmaster@example.net");
}

// Closure reads honor the `since` cutoff like every other graph read.
#[tokio::test]
async fn stale_associations_are_hidden_by_the_cutoff() {
    let graph: DynGraphStore = Arc::new(MemoryGraph::new());

    let seed = graph.upsert_asset(Asset::fqdn("example.com")).await.expect("upsert succeeds");
    let d1 = domain_record(&graph, "example.com").await;
    let d2 = domain_record(&graph, "example.net").await;

    graph
        .create_relation(seed.id, d1.id, RelationLabel::Registration)
        .await
        .expect("relation succeeds");
    graph
        .create_relation(d1.id, d2.id, RelationLabel::AssociatedWith)
        .await
        .expect("relation succeeds");

    let now = associations(&graph, "example.com", None).await.expect("closure succeeds");
    assert_eq!(now.len(), 1);

    let future_cutoff = time::OffsetDateTime::now_utc() + time::Duration::hours(1);
    let later = associations(&graph, "example.com", Some(future_cutoff))
        .await
        .expect("closure succeeds");
    assert!(later.is_empty());
}
