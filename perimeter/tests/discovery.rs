//! End-to-end scenarios for the discovery pipeline: a scripted data source
//! driven through the real session, registry and dispatcher over the
//! in-memory graph.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use asset_graph::{Asset, AssetKind, DynGraphStore, GraphStore as _, RelationLabel};
use asset_graph_memory::MemoryGraph;
use async_trait::async_trait;
use perimeter::config::ConfHandle;
use perimeter::dispatcher::{Dispatcher, DispatcherTask, QuiescenceTask};
use perimeter::lifecycle::Halt;
use perimeter::plugins::{CertspotPlugin, Plugin as _};
use perimeter::registry::{Handler, HandlerError, HandlerSpec, Registry};
use perimeter::session::Session;
use perimeter::{support, Event};
use time::OffsetDateTime;

const CONF: &str = r#"
engine:
  event_workers: 2
  queue_high_water: 64
  queue_low_water: 16
  quiescence_secs: 1
scope:
  domains: ["example.com"]
"#;

fn session_with_graph() -> Arc<Session> {
    let handle = ConfHandle::mock(CONF).expect("mock config is valid");
    let graph: DynGraphStore = Arc::new(MemoryGraph::new());
    Session::new(handle, graph).expect("session builds")
}

/// Test double standing in for an external subdomain feed.
struct ScriptedSource {
    names: Vec<&'static str>,
    external_calls: Arc<AtomicUsize>,
    priority: u8,
}

const SCRIPTED_NAME: &str = "scripted";

#[async_trait]
impl Handler for ScriptedSource {
    async fn handle(&self, session: &Arc<Session>, event: &Event) -> Result<(), HandlerError> {
        let Asset::Fqdn { .. } = &event.asset else {
            return Ok(());
        };

        let Some(verdict) = session.in_scope(&event.asset, event.meta.depth).await? else {
            return Ok(());
        };

        let key = verdict.asset.key();
        let source = session.source_asset(SCRIPTED_NAME, 60).await?;

        let ttl = session.ttl.duration(SCRIPTED_NAME, AssetKind::Fqdn, AssetKind::Fqdn);
        let now = OffsetDateTime::now_utc();

        if session.freshness.within_ttl(SCRIPTED_NAME, &key, ttl, now) {
            return Ok(());
        }

        self.external_calls.fetch_add(1, Ordering::SeqCst);
        session.freshness.mark_monitored(SCRIPTED_NAME, &key, now);

        support::store_fqdns_with_source(
            session,
            event,
            self.names.clone(),
            &source,
            SCRIPTED_NAME,
            self.priority,
        )
        .await?;

        Ok(())
    }
}

fn register_scripted(
    registry: &mut Registry,
    names: Vec<&'static str>,
    priority: u8,
) -> Arc<AtomicUsize> {
    let external_calls = Arc::new(AtomicUsize::new(0));

    registry
        .register(
            HandlerSpec::builder()
                .plugin(SCRIPTED_NAME)
                .name("subdomains")
                .event_kind(AssetKind::Fqdn)
                .transforms(vec![AssetKind::Fqdn])
                .priority(priority)
                .max_instances(4)
                .callback(Arc::new(ScriptedSource {
                    names,
                    external_calls: Arc::clone(&external_calls),
                    priority,
                }))
                .build(),
        )
        .expect("registration succeeds");

    external_calls
}

// Subdomain discovery happy path: raw feed output is normalized, out-of-scope
// names are dropped, and two successor events come out at the handler's
// priority.
#[tokio::test]
async fn subdomain_discovery_happy_path() {
    let session = session_with_graph();

    let mut registry = Registry::new();
    register_scripted(
        &mut registry,
        vec!["WWW.Example.COM", " *.api.example.com ", "unrelated.org"],
        3,
    );
    let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::new(registry));

    dispatcher.dispatch(Event::seed(Asset::fqdn("example.com"))).await;

    let graph = session.graph();

    for expected in ["www.example.com", "api.example.com"] {
        let found = graph
            .find_by_content(&Asset::fqdn(expected), None)
            .await
            .expect("graph read succeeds");
        assert_eq!(found.len(), 1, "{expected} must be stored exactly once");
    }

    let rejected = graph
        .find_by_content(&Asset::fqdn("unrelated.org"), None)
        .await
        .expect("graph read succeeds");
    assert!(rejected.is_empty(), "out-of-scope names must not enter the graph");

    assert_eq!(session.queue.len(), 2);
    let successor = session.queue.try_pop().expect("a successor event is queued");
    assert_eq!(successor.meta.priority, 3);
    assert_eq!(successor.meta.origin.as_deref(), Some(SCRIPTED_NAME));
}

// TTL suppression: one external call at t=0, none inside the window, one
// more once the window has passed.
#[tokio::test]
async fn ttl_suppresses_repeat_external_calls() {
    let session = session_with_graph();
    session.ttl.override_source(SCRIPTED_NAME, Duration::from_secs(24 * 60 * 60));

    let mut registry = Registry::new();
    let calls = register_scripted(&mut registry, vec!["www.example.com"], 3);
    let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::new(registry));

    let seed = Event::seed(Asset::fqdn("example.com"));

    dispatcher.dispatch(seed.clone()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Within the 24 h window: served from the graph, no external call.
    dispatcher.dispatch(seed.clone()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Move the recorded mark 25 h into the past; the window has lapsed.
    let lapsed = OffsetDateTime::now_utc() - time::Duration::hours(25);
    session.freshness.mark_monitored(SCRIPTED_NAME, "example.com", lapsed);

    dispatcher.dispatch(seed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// Missing credentials: the certificate-transparency source has no API key
// configured, so the event is a clean no-op rather than an error.
#[tokio::test]
async fn missing_credentials_are_a_clean_no_op() {
    let session = session_with_graph();

    let mut registry = Registry::new();
    CertspotPlugin::new()
        .start(&mut registry, &session)
        .expect("plugin start succeeds");
    let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::new(registry));

    dispatcher.dispatch(Event::seed(Asset::fqdn("example.com"))).await;

    // Nothing stored, nothing emitted, no source asset created.
    assert_eq!(session.queue.len(), 0);
    let sources = session
        .graph()
        .find_by_content(
            &Asset::Source {
                name: "certspot".into(),
                confidence: 70,
            },
            None,
        )
        .await
        .expect("graph read succeeds");
    assert!(sources.is_empty());
}

/// Appends begin/end markers around a simulated unit of work.
struct MarkerHandler {
    label: &'static str,
    work: Duration,
    trace: Arc<parking_lot::Mutex<Vec<String>>>,
}

#[async_trait]
impl Handler for MarkerHandler {
    async fn handle(&self, _session: &Arc<Session>, _event: &Event) -> Result<(), HandlerError> {
        self.trace.lock().push(format!("{}:begin", self.label));
        tokio::time::sleep(self.work).await;
        self.trace.lock().push(format!("{}:end", self.label));
        Ok(())
    }
}

// Priority ordering: both priority-3 handlers overlap, and every priority-3
// invocation finishes before any priority-6 invocation begins.
#[tokio::test]
async fn lower_priority_handlers_complete_first() {
    let session = session_with_graph();
    let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut registry = Registry::new();

    for (plugin, label, priority) in [("alpha", "lo-a", 3), ("beta", "lo-b", 3), ("gamma", "hi", 6)] {
        registry
            .register(
                HandlerSpec::builder()
                    .plugin(plugin)
                    .name("marker")
                    .event_kind(AssetKind::Fqdn)
                    .priority(priority)
                    .max_instances(2)
                    .callback(Arc::new(MarkerHandler {
                        label,
                        work: Duration::from_millis(50),
                        trace: Arc::clone(&trace),
                    }))
                    .build(),
            )
            .expect("registration succeeds");
    }

    let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::new(registry));
    dispatcher.dispatch(Event::seed(Asset::fqdn("example.com"))).await;

    let trace = trace.lock();

    let hi_begin = trace.iter().position(|m| m == "hi:begin").expect("hi ran");
    for marker in ["lo-a:end", "lo-b:end"] {
        let lo_end = trace.iter().position(|m| m == marker).expect("lo ran");
        assert!(lo_end < hi_begin, "{marker} must precede hi:begin: {trace:?}");
    }

    // The two priority-3 handlers overlapped: both began before either ended.
    let first_end = trace
        .iter()
        .position(|m| m.ends_with(":end"))
        .expect("something ended");
    let begins_before_first_end = trace[..first_end].iter().filter(|m| m.ends_with(":begin")).count();
    assert_eq!(begins_before_first_end, 2, "equal priorities must run concurrently: {trace:?}");
}

// The full loop: seed in, workers drain the stream, the termination detector
// records the drain verdict on the session.
#[tokio::test]
async fn event_stream_drains_to_quiescence() {
    let session = session_with_graph();

    let mut registry = Registry::new();
    register_scripted(&mut registry, vec!["www.example.com", "api.example.com"], 3);
    let registry = Arc::new(registry);

    let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::clone(&registry));

    let dispatcher_run = tokio::spawn(DispatcherTask::new(dispatcher.clone(), 2).run());
    let detector_run = tokio::spawn(QuiescenceTask::new(dispatcher, registry, Duration::from_millis(300)).run());

    session.queue.push(Event::seed(Asset::fqdn("example.com"))).await;

    let mut halt = session.halted();
    let reason = tokio::time::timeout(Duration::from_secs(10), halt.halted())
        .await
        .expect("the session must reach quiescence");
    assert_eq!(reason, Halt::Drained);

    detector_run.await.expect("detector exits cleanly").expect("no error");
    dispatcher_run.await.expect("dispatcher exits cleanly").expect("no error");

    // The discovered names are in the graph by the time the stream drained.
    let found = session
        .graph()
        .find_by_content(&Asset::fqdn("www.example.com"), None)
        .await
        .expect("graph read succeeds");
    assert_eq!(found.len(), 1);

    // Everything enqueued was consumed.
    let stats = session.queue.stats();
    assert_eq!(stats.enqueued(), stats.dequeued());
}

// Source attribution invariant: every asset stored by a plugin carries an
// outgoing `source` edge naming that plugin.
#[tokio::test]
async fn every_produced_asset_is_source_attributed() {
    let session = session_with_graph();

    let mut registry = Registry::new();
    register_scripted(&mut registry, vec!["www.example.com", "mail.example.com"], 3);
    let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::new(registry));

    dispatcher.dispatch(Event::seed(Asset::fqdn("example.com"))).await;

    let graph = session.graph();
    let source = session.source_asset(SCRIPTED_NAME, 60).await.expect("source resolves");

    for name in ["www.example.com", "mail.example.com"] {
        let stored = graph
            .find_by_content(&Asset::fqdn(name), None)
            .await
            .expect("graph read succeeds")
            .pop()
            .expect("asset is stored");

        let attributions = graph
            .outgoing_relations(stored.id, None, Some(RelationLabel::Source))
            .await
            .expect("graph read succeeds");

        assert!(
            attributions.iter().any(|relation| relation.to_id == source.id),
            "{name} must be attributed to {SCRIPTED_NAME}",
        );
    }
}
