//! Candidate selection
//!
//! One decision cycle: take the single-instance lock, gate on queue
//! priorities, pause the host's own downloading so its provider connections
//! free up, probe the paused candidates in order until one is resumed, and
//! hand downloading back to the host.

use crate::check::{QUEUED_NAME_PARAMETER, ReleaseCandidate, ReleaseChecker};
use crate::config::Config;
use crate::error::Result;
use crate::lock::{LockFile, LockOutcome};
use crate::report::Reporter;
use crate::rpc::{HostClient, QueueEntry};
use chrono::Utc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// One full check cycle for the scheduler, queue-event and button modes
///
/// `host_active_at` is set when the trigger implies the host was just
/// talking to the providers (a finished download); the session pool waits
/// out the host's quit-after-idle window before dialling.
pub async fn run_check_cycle(
    config: &Config,
    client: &HostClient,
    reporter: Reporter,
    host_active_at: Option<Instant>,
) -> Result<()> {
    let jobs = client.list_groups().await?;
    let paused: Vec<&QueueEntry> = jobs
        .iter()
        .filter(|job| job.status == "PAUSED" && job.parameter(QUEUED_NAME_PARAMETER).is_some())
        .collect();
    if jobs.is_empty() || paused.is_empty() {
        reporter.verbose("Empty queue");
        return Ok(());
    }

    let status = client.status().await?;
    let lock = match LockFile::acquire(
        &config.host.temp_dir,
        status.server_time,
        status.up_time_sec,
        &reporter,
    )? {
        LockOutcome::Busy => return Ok(()),
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::AcquiredAfterCrash(lock) => {
            // a crashed run may have left the host paused forever
            client.resume_download().await?;
            lock
        }
    };

    let result = check_paused_queue(config, client, reporter, &jobs, &paused, host_active_at).await;
    lock.release(&reporter);
    result
}

/// Priority gate: is some paused candidate more important than everything
/// the host is currently downloading or has queued?
fn priority_gate(jobs: &[QueueEntry], paused: &[&QueueEntry], reporter: &Reporter) -> bool {
    let max_queued_priority = jobs
        .iter()
        .filter(|job| matches!(job.status.as_str(), "DOWNLOADING" | "QUEUED"))
        .map(|job| job.max_priority)
        .max();
    let Some(max_queued_priority) = max_queued_priority else {
        // nothing is downloading or queued
        return true;
    };
    reporter.verbose(format!(
        "Maximum priority of DOWNLOADING / QUEUED NZBs = {max_queued_priority}"
    ));
    if paused
        .iter()
        .any(|job| job.max_priority > max_queued_priority)
    {
        reporter.verbose(
            "QUEUED / DOWNLOADING NZBs have lower priority than by script paused items, \
             starting check",
        );
        true
    } else {
        reporter.verbose(
            "QUEUED / DOWNLOADING NZBs have higher or equal priority than by script \
             paused items, skipping check",
        );
        false
    }
}

/// Order candidates: oldest post first, releases beyond `AgeSortLimit`
/// moved to the tail, then stable-sorted by priority descending
fn order_candidates<'a>(
    paused: &[&'a QueueEntry],
    age_sort_limit_secs: i64,
    now: i64,
) -> Vec<&'a QueueEntry> {
    let max_age = now - age_sort_limit_secs;
    let (mut young, old): (Vec<&QueueEntry>, Vec<&QueueEntry>) = paused
        .iter()
        .copied()
        .partition(|job| job.max_post_time >= max_age);
    young.sort_by_key(|job| job.max_post_time);
    young.extend(old);
    young.sort_by_key(|job| std::cmp::Reverse(job.max_priority));
    young
}

async fn check_paused_queue(
    config: &Config,
    client: &HostClient,
    reporter: Reporter,
    jobs: &[QueueEntry],
    paused: &[&QueueEntry],
    host_active_at: Option<Instant>,
) -> Result<()> {
    let started = Instant::now();

    let do_check = if config.options.ignore_queue_priority {
        reporter.verbose("Ignoring priority of existing items");
        true
    } else {
        priority_gate(jobs, paused, &reporter)
    };
    if !do_check {
        return Ok(());
    }

    if pause_host(client, &reporter).await? {
        // paused by the user, not by us: hands off
        reporter.verbose("Not started because download is paused");
        return Ok(());
    }

    let queued_file_env = std::env::var("NZBNA_QUEUEDFILE").ok();
    let now = Utc::now().timestamp();
    if reporter.verbose {
        reporter.verbose("Paused UNSORTED NZBs in queue that will be processed:");
        for job in paused {
            describe_candidate(job, now, &reporter);
        }
        reporter.verbose(format!(
            "Ignoring sorting priority of items older than AgeSortLimit of {} hours",
            config.options.age_sort_limit_hours
        ));
    }
    let ordered = order_candidates(paused, config.options.age_sort_limit_secs(), now);
    if reporter.verbose {
        reporter.verbose("Paused and SORTED NZBs in queue that will be processed:");
        for job in &ordered {
            describe_candidate(job, now, &reporter);
        }
    }

    let checker = ReleaseChecker::new(config, client, reporter, host_active_at).await?;
    for job in ordered {
        let Some(candidate) = ReleaseCandidate::from_entry(job, queued_file_env.as_deref())
        else {
            continue;
        };
        debug!("selected candidate {}", candidate.nzb_id);
        // stop at the first release handed back to the host
        if checker.check_release(&candidate).await? {
            break;
        }
    }

    reporter.info(format!(
        "Overall check completed in {:.2} sec.",
        started.elapsed().as_secs_f64()
    ));
    client.resume_download().await?;
    reporter.verbose("Downloading for NZBGet resumed");
    Ok(())
}

fn describe_candidate(job: &QueueEntry, now: i64, reporter: &Reporter) {
    let name = job
        .parameter(QUEUED_NAME_PARAMETER)
        .unwrap_or(job.name.as_str());
    reporter.verbose(format!(
        "* {}, Age: {:.1} hours, Priority: {}",
        name,
        (now - job.max_post_time) as f64 / 3600.0,
        job.max_priority
    ));
}

/// Pause the host's downloading and wait for its connections to drain
///
/// Returns true when the host was already paused by the user, in which case
/// no check should run and the host is left untouched.
async fn pause_host(client: &HostClient, reporter: &Reporter) -> Result<bool> {
    let status = client.status().await?;
    if status.download_paused {
        return Ok(true);
    }

    let mut rate = status.download_rate;
    client.pause_download().await?;
    reporter.verbose("Waiting for NZBGet to end downloading");
    reporter.flush();
    while rate > 0 {
        reporter.verbose(format!(
            "Download rate: {:.1} kB/s, waiting 1 sec to stop downloading",
            rate as f64 / 1000.0
        ));
        reporter.flush();
        sleep(Duration::from_secs(1)).await;
        rate = client.status().await?.download_rate;
        if rate == 0 {
            // the host sends QUIT on its idle connections after 5 seconds
            reporter.verbose("Waiting 5 sec while NZBGet closes the news server connections.");
            reporter.flush();
            sleep(Duration::from_secs(5)).await;
        }
    }
    reporter.verbose("Downloading for NZBGet paused");
    reporter.flush();
    Ok(false)
}
