//! Invocation router
//!
//! NZBGet launches the same binary for every hook and tells it which one
//! through environment variables. The scan hook only pauses fresh releases
//! and records the canonical queued file name; every other mode runs the
//! full check cycle. The manual button additionally signals success to the
//! host with exit code 93.

use crate::config::Config;
use crate::error::Result;
use crate::queue;
use crate::report::Reporter;
use crate::rpc::HostClient;
use std::path::Path;
use tokio::time::Instant;
use tracing::debug;

/// Exit code for the non-button modes
pub const EXIT_OK: i32 = 0;

/// Exit code NZBGet expects from a successful command-button run
pub const EXIT_COMMAND_OK: i32 = 93;

/// Queue events that warrant a check; anything else would fire per part
const HANDLED_EVENTS: [&str; 4] = ["NZB_ADDED", "NZB_DOWNLOADED", "NZB_DELETED", "NZB_MARKED"];

/// How this invocation was launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Periodic scheduler task
    Scheduler,
    /// Queue event (`NZBNA_*`)
    QueueEvent,
    /// Pre-queue scan of an incoming NZB (`NZBNP_*`)
    Scan,
    /// Manual button in the host UI (`NZBCP_*`)
    ManualButton,
}

/// Detect the launch modes from the environment selectors
pub fn detect_modes(lookup: &impl Fn(&str) -> Option<String>) -> Vec<InvocationMode> {
    let mut modes = Vec::new();
    if lookup("NZBSP_TASKID").is_some() {
        modes.push(InvocationMode::Scheduler);
    }
    if lookup("NZBNA_NZBNAME").is_some() {
        modes.push(InvocationMode::QueueEvent);
    }
    if lookup("NZBNP_NZBNAME").is_some() {
        modes.push(InvocationMode::Scan);
    }
    if lookup("NZBCP_COMMAND").is_some() {
        modes.push(InvocationMode::ManualButton);
    }
    modes
}

/// Dispatch one invocation; returns the process exit code
pub async fn run(config: &Config, client: &HostClient) -> Result<i32> {
    run_with_lookup(config, client, |key| std::env::var(key).ok()).await
}

/// Dispatch with an injectable environment (tests)
pub async fn run_with_lookup(
    config: &Config,
    client: &HostClient,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<i32> {
    let reporter = Reporter::new(config.options.verbose, config.options.extreme);

    if config.options.check_dupes.enabled() && !config.host.dupe_check {
        reporter.warning(
            "DupeCheck should be enabled in NZBGet, otherwise the CheckDupes option \
             of this script that you have enabled does not work",
        );
    }

    let mut exit_code = EXIT_OK;
    for mode in detect_modes(&lookup) {
        debug!("invocation mode {mode:?}");
        match mode {
            InvocationMode::Scheduler => {
                queue::run_check_cycle(config, client, reporter, None).await?;
            }
            InvocationMode::QueueEvent => {
                queue_event(config, client, reporter, &lookup).await?;
            }
            InvocationMode::Scan => {
                scan_hook(config, reporter, &lookup)?;
            }
            InvocationMode::ManualButton => {
                queue::run_check_cycle(config, client, reporter, None).await?;
                exit_code = EXIT_COMMAND_OK;
            }
        }
    }
    Ok(exit_code)
}

/// Queue-event entry: act only on whole-NZB events
async fn queue_event(
    config: &Config,
    client: &HostClient,
    reporter: Reporter,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(file) = lookup("NZBNA_QUEUEDFILE") {
        reporter.info(file);
    }
    let Some(event) = lookup("NZBNA_EVENT") else {
        return Ok(());
    };
    if !HANDLED_EVENTS.contains(&event.as_str()) {
        return Ok(());
    }
    // a finished download means the host was just talking to the providers
    let host_active_at = (event == "NZB_DOWNLOADED").then(Instant::now);
    queue::run_check_cycle(config, client, reporter, host_active_at).await
}

/// Scan hook: pause the incoming release and record its queued file name
///
/// The host renames an incoming `name.nzb` to `name.nzb.queued`, or to
/// `name.nzb.<n>.queued` when the name collides with releases already in
/// the queue or history, and never exposes which one it picked. The same
/// numbering is derived here and stamped onto the entry as a parameter so
/// later invocations can find the descriptor.
fn scan_hook(
    config: &Config,
    reporter: Reporter,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let category = lookup("NZBNP_CATEGORY")
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !config.options.categories.is_empty() && !config.options.categories.contains(&category) {
        return Ok(());
    }
    let Some(filename) = lookup("NZBNP_FILENAME") else {
        return Ok(());
    };

    let base = Path::new(&filename)
        .strip_prefix(&config.host.nzb_dir)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| {
            Path::new(&filename)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| filename.clone())
        });

    let existing: Vec<String> = std::fs::read_dir(&config.host.nzb_dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    let taken = existing
        .iter()
        .filter(|f| f.starts_with(&base) && f.ends_with(".queued"))
        .count();
    if taken > 0 {
        reporter.verbose(format!(
            "Found {taken} queued / history nzb with identical name: {base}"
        ));
    }
    let queued = queued_file_name(&existing, &base);

    reporter.verbose(format!("Expected queued file name: \"{queued}\""));
    reporter.nzb_directive("NZBPR_CnpNZBFileName", &queued);
    reporter.verbose(format!(
        "Pausing: \"{}\"",
        lookup("NZBNP_NZBNAME").unwrap_or_default()
    ));
    reporter.nzb_directive("PAUSED", "1");
    Ok(())
}

/// Lowest free queued name: `base.queued`, then `base.2.queued`, ...
pub fn queued_file_name(existing: &[String], base: &str) -> String {
    let mut n = 1usize;
    loop {
        let candidate = if n == 1 {
            format!("{base}.queued")
        } else {
            format!("{base}.{n}.queued")
        };
        if !existing.iter().any(|f| f == &candidate) {
            return candidate;
        }
        n += 1;
    }
}
