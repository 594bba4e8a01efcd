//! Logging for perimeter binaries: a console layer plus daily-rotated files,
//! and a sweeper that trims expired files out of the log folder.
//!
//! The crate does setup and single-pass maintenance only; retention length
//! and sweep cadence are the caller's policy.

#[macro_use]
extern crate tracing;

use std::io;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8Path;
use tokio::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Where log lines go and how they are filtered.
pub struct LogConfig<'a> {
    /// Either a folder, or a folder joined with the desired file stem.
    pub target: &'a Utf8Path,
    /// Stem applied when `target` is a bare folder.
    pub file_stem: &'a str,
    /// Rolled files kept on disk before the appender overwrites the oldest.
    pub max_files: usize,
    /// Baseline `tracing` filter, typically derived from the verbosity
    /// profile.
    pub base_filter: &'a str,
    /// Comma-separated operator-supplied directives layered on top.
    pub extra_directives: Option<&'a str>,
}

/// Keeps the non-blocking writers flushing. Hold it for the process lifetime;
/// dropping it loses buffered lines.
#[must_use]
pub struct LogHandle {
    _guards: Vec<WorkerGuard>,
}

pub fn init_logging(config: &LogConfig<'_>) -> anyhow::Result<LogHandle> {
    let (folder, stem) = split_target(config.target, config.file_stem)?;

    let rolled = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(stem)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(folder)
        .with_context(|| format!("failed to open a rolling log writer under {folder}"))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(rolled);

    let (console_writer, console_guard) = tracing_appender::non_blocking(io::stdout());

    let mut filter =
        EnvFilter::try_new(config.base_filter).with_context(|| format!("bad base filter: {}", config.base_filter))?;

    for directive in config.extra_directives.iter().flat_map(|extra| extra.split(',')) {
        let parsed = directive
            .trim()
            .parse()
            .with_context(|| format!("bad filtering directive: {directive}"))?;
        filter = filter.add_directive(parsed);
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(fmt::layer().with_writer(console_writer))
        .with(filter)
        .init();

    Ok(LogHandle {
        _guards: vec![file_guard, console_guard],
    })
}

/// What one pass of [`sweep_expired_logs`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub removed: usize,
    pub kept: usize,
}

/// Deletes rolled log files whose last modification is older than `keep_for`.
///
/// One pass over the folder; files that do not match the stem/suffix naming
/// of the rolling appender are never touched.
pub async fn sweep_expired_logs(
    target: &Utf8Path,
    file_stem: &str,
    keep_for: Duration,
) -> anyhow::Result<SweepOutcome> {
    let (folder, stem) = split_target(target, file_stem)?;

    let mut entries = fs::read_dir(folder)
        .await
        .with_context(|| format!("couldn't list the log folder {folder}"))?;

    let mut outcome = SweepOutcome::default();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        if !file_name.starts_with(stem) || !file_name.ends_with("log") {
            continue;
        }

        let age = entry
            .metadata()
            .await
            .and_then(|metadata| metadata.modified())
            .and_then(|modified| modified.elapsed().map_err(io::Error::other));

        let Ok(age) = age else {
            warn!(file_name, "No usable modification time; leaving the file alone");
            outcome.kept += 1;
            continue;
        };

        if age <= keep_for {
            outcome.kept += 1;
            continue;
        }

        match fs::remove_file(entry.path()).await {
            Ok(()) => {
                info!(file_name, "Removed expired log file");
                outcome.removed += 1;
            }
            Err(error) => {
                warn!(%error, file_name, "Expired log file left in place");
                outcome.kept += 1;
            }
        }
    }

    Ok(outcome)
}

/// Resolves a log target into the folder and file stem the rolling appender
/// and the sweeper agree on.
fn split_target<'a>(target: &'a Utf8Path, fallback_stem: &'a str) -> anyhow::Result<(&'a Utf8Path, &'a str)> {
    if target.is_dir() {
        return Ok((target, fallback_stem));
    }

    match (target.parent(), target.file_name()) {
        (Some(folder), Some(stem)) => Ok((folder, stem)),
        _ => anyhow::bail!("log target {target} names neither a folder nor a file inside one"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn folder_targets_use_the_fallback_stem() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let (folder, stem) = split_target(&dir_path, "engine").unwrap();
        assert_eq!(folder, dir_path);
        assert_eq!(stem, "engine");
    }

    #[test]
    fn file_targets_split_into_folder_and_stem() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let target = dir_path.join("custom-name");

        let (folder, stem) = split_target(&target, "ignored").unwrap();
        assert_eq!(folder, dir_path);
        assert_eq!(stem, "custom-name");
    }

    #[tokio::test]
    async fn sweep_removes_only_matching_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        std::fs::write(dir_path.join("engine.2025-01-01.log"), "old lines").unwrap();
        std::fs::write(dir_path.join("engine.2025-01-02.log"), "old lines").unwrap();
        std::fs::write(dir_path.join("unrelated.txt"), "not a log").unwrap();

        // Zero retention expires everything the naming filter matches.
        let outcome = sweep_expired_logs(&dir_path, "engine", Duration::ZERO).await.unwrap();

        assert_eq!(outcome.removed, 2);
        assert!(!dir_path.join("engine.2025-01-01.log").exists());
        assert!(dir_path.join("unrelated.txt").exists());
    }

    #[tokio::test]
    async fn sweep_keeps_files_inside_the_retention_window() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        std::fs::write(dir_path.join("engine.2025-06-30.log"), "fresh lines").unwrap();

        let outcome = sweep_expired_logs(&dir_path, "engine", Duration::from_secs(3600)).await.unwrap();

        assert_eq!(outcome, SweepOutcome { removed: 0, kept: 1 });
        assert!(dir_path.join("engine.2025-06-30.log").exists());
    }
}
