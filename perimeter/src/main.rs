#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

// Used by the perimeter library.
use {
    backoff as _, bloomfilter as _, camino as _, cfg_if as _, dns_lookup as _, futures as _, governor as _,
    hostname as _, idna as _, ipnetwork as _, parking_lot as _, rand as _, reqwest as _, serde as _, serde_json as _,
    serde_yaml as _, smol_str as _, thiserror as _, time as _, typed_builder as _, url as _, uuid as _,
};
// Used by tests.
#[cfg(test)]
use {proptest as _, rstest as _, tempfile as _, tokio_test as _, tracing_subscriber as _};

#[macro_use]
extern crate tracing;

mod service;

use anyhow::Context as _;
use perimeter::config::ConfHandle;
use tap::prelude::*;

use crate::service::EngineService;

enum CliAction {
    ShowHelp,
    Run,
    ConfigInitOnly,
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let executable = args.next().context("executable name is missing from the environment")?;

    // Extract and remove --config-path argument if provided
    let mut config_path = None;
    let mut remaining_args = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            if let Some(path) = args.next() {
                config_path = Some(path);
            } else {
                anyhow::bail!("missing value for --config-path");
            }
        } else {
            remaining_args.push(arg);
        }
    }

    if let Some(path) = config_path {
        // SAFETY: At this point the program is single-threaded.
        unsafe { std::env::set_var("PERIMETER_CONFIG_PATH", &path) };
    }

    let action = match remaining_args.first().map(String::as_str) {
        Some("--config-init-only") => CliAction::ConfigInitOnly,
        None => CliAction::Run,
        Some(_) => CliAction::ShowHelp,
    };

    match action {
        CliAction::ShowHelp => {
            println!(
                r#"HELP:

    Run a discovery session over the configured seeds:
        "{executable}"

    Initialize configuration only (will not override existing configuration):
        "{executable}" --config-init-only

    Options:
        --config-path <CONFIG_PATH>
"#
            )
        }
        CliAction::ConfigInitOnly => {
            let conf_file = perimeter::config::load_conf_file_or_generate_new()?;
            let conf_file_yaml =
                serde_yaml::to_string(&conf_file).context("couldn't represent config file as YAML")?;
            println!("{conf_file_yaml}");
        }
        CliAction::Run => {
            let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
            let mut service = EngineService::load(conf_handle).context("service loading failed")?;

            service
                .start()
                .tap_err(|error| error!(error = format!("{error:#}"), "Failed to start"))?;

            let halt = service.halt_watcher();

            // Wait until the session drains or a stop signal arrives (CTRL-C…)
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .context("failed to build the async runtime")?;

            rt.block_on(async {
                match halt {
                    Some(mut halt) => {
                        tokio::select! {
                            res = build_signals_fut() => res,
                            reason = halt.halted() => {
                                info!(?reason, "Discovery session ended");
                                Ok(())
                            }
                        }
                    }
                    None => build_signals_fut().await,
                }
            })?;

            service.stop();
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream failed")?;
    let mut interrupt_signal =
        signal(SignalKind::interrupt()).context("failed to create interrupt signal stream failed")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
