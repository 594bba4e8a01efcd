//! Engine logging policy on top of `perimeter-log`: file naming, how many
//! rolled files stay around, and the periodic sweep of expired ones.

use std::time::Duration;

use camino::Utf8PathBuf;
use perimeter_log::{init_logging, sweep_expired_logs, LogConfig, LogHandle};

use crate::config::Conf;
use crate::lifecycle::HaltWatcher;

pub const LOG_FILE_STEM: &str = "perimeter";
const MAX_LOG_FILES: usize = 10;
const LOG_RETENTION: Duration = Duration::from_secs(45 * 24 * 60 * 60); // 45 days
const SWEEP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub fn init(conf: &Conf) -> anyhow::Result<LogHandle> {
    init_logging(&LogConfig {
        target: &conf.log_file,
        file_stem: LOG_FILE_STEM,
        max_files: MAX_LOG_FILES,
        base_filter: conf.verbosity_profile.to_log_filter(),
        extra_directives: conf.log_directive.as_deref(),
    })
}

/// Sweeps expired log files twice a day until the session halts.
pub async fn maintenance_loop(target: Utf8PathBuf, mut halt: HaltWatcher) -> anyhow::Result<()> {
    loop {
        match sweep_expired_logs(&target, LOG_FILE_STEM, LOG_RETENTION).await {
            Ok(outcome) => {
                if outcome.removed > 0 {
                    debug!(removed = outcome.removed, kept = outcome.kept, "Swept the log folder");
                }
            }
            Err(error) => {
                warn!(error = format!("{error:#}"), "Log sweep failed; will retry next interval");
            }
        }

        if halt.guard(tokio::time::sleep(SWEEP_INTERVAL)).await.is_err() {
            return Ok(());
        }
    }
}
