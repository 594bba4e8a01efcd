use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use asset_graph::{Asset, DynGraphStore};
use asset_graph_memory::MemoryGraph;
use camino::Utf8PathBuf;
use perimeter::config::ConfHandle;
use perimeter::dispatcher::{Dispatcher, DispatcherTask, QuiescenceTask};
use perimeter::lifecycle::HaltWatcher;
use perimeter::plugins::{self, DynPlugin};
use perimeter::registry::Registry;
use perimeter::session::Session;
use perimeter::{log as engine_log, Event};
use perimeter_log::LogHandle;
use tokio::runtime::{self, Runtime};
use tokio::task::JoinHandle;

/// How long a task gets to wind down after the session halt before it is
/// aborted outright.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

struct SupervisedTask {
    name: &'static str,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// Spawns `work` with completion logging attached, so a task failing mid-run
/// shows up in the logs right away instead of at shutdown.
fn supervise<F>(name: &'static str, work: F) -> SupervisedTask
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let result = work.await;

        match &result {
            Ok(()) => trace!(task = name, "Task finished"),
            Err(error) => error!(task = name, error = format!("{error:#}"), "Task failed"),
        }

        result
    });

    SupervisedTask { name, handle }
}

enum EngineState {
    Stopped,
    Running {
        session: Arc<Session>,
        tasks: Vec<SupervisedTask>,
        runtime: Runtime,
    },
}

pub struct EngineService {
    conf_handle: ConfHandle,
    state: EngineState,
    _log_handle: LogHandle,
}

impl EngineService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let log_handle = engine_log::init(&conf).context("failed to setup logging")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        Ok(EngineService {
            conf_handle,
            state: EngineState::Stopped,
            _log_handle: log_handle,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build the async runtime")?;

        // Seed events must be enqueued from inside the runtime.
        let (session, tasks) = runtime.block_on(launch(self.conf_handle.clone()))?;

        self.state = EngineState::Running {
            session,
            tasks,
            runtime,
        };

        Ok(())
    }

    /// Halt state of the running session; resolves when it drains or stops.
    pub fn halt_watcher(&self) -> Option<HaltWatcher> {
        match &self.state {
            EngineState::Stopped => None,
            EngineState::Running { session, .. } => Some(session.halted()),
        }
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, EngineState::Stopped) {
            EngineState::Stopped => {
                info!("Attempted to stop the engine, but it's already stopped");
            }
            EngineState::Running {
                session,
                tasks,
                runtime,
            } => {
                info!("Stopping discovery engine");

                // One verdict stops everything: workers, detector, sweepers.
                session.shutdown();

                runtime.block_on(async move {
                    for SupervisedTask { name, mut handle } in tasks {
                        match tokio::time::timeout(STOP_GRACE_PERIOD, &mut handle).await {
                            // Success and failure were already logged by the
                            // supervision wrapper.
                            Ok(Ok(_)) => {}
                            Ok(Err(join_error)) => {
                                error!(task = name, error = %join_error, "Task panicked or was aborted");
                            }
                            Err(_elapsed) => {
                                warn!(task = name, "Task refused to stop in time; aborting it");
                                handle.abort();
                            }
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));
            }
        }
    }
}

async fn launch(conf_handle: ConfHandle) -> anyhow::Result<(Arc<Session>, Vec<SupervisedTask>)> {
    let conf = conf_handle.get_conf();

    let memory = Arc::new(MemoryGraph::new());
    let graph: DynGraphStore = memory.clone();

    let session = Session::new(conf_handle, graph).context("failed to create the session")?;

    let mut registry = Registry::new();
    let built_in = plugins::built_in();
    plugins::start_all(&built_in, &mut registry, &session).context("failed to register handlers")?;
    let registry = Arc::new(registry);

    info!(
        session = %session.id(),
        handlers = registry.handler_count(),
        seeds = conf.scope.seed_domains().len() + conf.scope.seed_cidrs().len() + conf.scope.seed_asns().len(),
        "Session initialized",
    );

    let dispatcher = Dispatcher::new(Arc::clone(&session), Arc::clone(&registry));

    let tasks = vec![
        supervise(
            "event dispatcher",
            DispatcherTask::new(dispatcher.clone(), conf.engine.event_workers).run(),
        ),
        supervise(
            "termination detector",
            QuiescenceTask::new(dispatcher, registry, conf.engine.quiescence_window).run(),
        ),
        supervise(
            "log maintenance",
            engine_log::maintenance_loop(conf.log_file.clone(), session.halted()),
        ),
        supervise(
            "graph snapshot",
            write_snapshot_on_halt(
                Arc::clone(&memory),
                session.halted(),
                perimeter::config::get_data_dir().join("graph.json"),
            ),
        ),
        supervise("plugin shutdown", stop_plugins_on_halt(built_in, session.halted())),
    ];

    for domain in conf.scope.seed_domains() {
        session.queue.push(Event::seed(Asset::fqdn(domain.clone()))).await;
    }
    for cidr in conf.scope.seed_cidrs() {
        session.queue.push(Event::seed(Asset::Netblock { cidr: *cidr })).await;
    }
    for number in conf.scope.seed_asns() {
        session.queue.push(Event::seed(Asset::Asn { number: *number })).await;
    }

    Ok((session, tasks))
}

/// Writes the collected graph to disk once the session halts, so the
/// association CLI can consume the run afterwards.
async fn write_snapshot_on_halt(
    graph: Arc<MemoryGraph>,
    mut halt: HaltWatcher,
    path: Utf8PathBuf,
) -> anyhow::Result<()> {
    let reason = halt.halted().await;
    debug!(?reason, "Persisting the collected graph");

    let snapshot = graph.snapshot();
    let json = serde_json::to_vec(&snapshot).context("failed to serialize the graph snapshot")?;

    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("failed to write the graph snapshot at {path}"))?;

    info!(path = %path, assets = snapshot.assets.len(), "Graph snapshot written");

    Ok(())
}

/// Releases plugin resources once the session halts.
async fn stop_plugins_on_halt(built_in: Vec<DynPlugin>, mut halt: HaltWatcher) -> anyhow::Result<()> {
    halt.halted().await;
    plugins::stop_all(&built_in).await;
    Ok(())
}
