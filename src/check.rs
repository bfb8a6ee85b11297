//! Per-release completion check
//!
//! Ties the pieces together for one paused release: parse its descriptor,
//! filter the providers against its age, probe, and commit the verdict.
//! When a release is not good enough yet but young, the history is searched
//! for complete duplicates that can take its place in the queue.

use crate::config::Config;
use crate::decision::{self, DecisionEngine, Verdict};
use crate::error::{DescriptorError, Result};
use crate::nzb;
use crate::prober::AvailabilityProber;
use crate::providers::{self, Provider};
use crate::report::Reporter;
use crate::rpc::{HostClient, QueueEntry};
use chrono::Utc;
use std::path::PathBuf;
use tokio::time::Instant;
use tracing::debug;

/// The queue parameter the scan hook stamps onto releases it pauses
///
/// Its value is the canonical `.queued` file name, which the host does not
/// expose anywhere else. Presence of the parameter is also how later
/// invocations recognise "paused by this extension".
pub const QUEUED_NAME_PARAMETER: &str = "CnpNZBFileName";

/// A paused release selected for probing
#[derive(Debug, Clone)]
pub struct ReleaseCandidate {
    /// Host-side NZB ID
    pub nzb_id: i64,
    /// Canonical queued descriptor file name
    pub queued_name: String,
    /// Timestamp of the newest article post
    pub post_time: i64,
    /// Host health floor, 0..=1000
    pub critical_health: i64,
    /// Duplicate grouping key; empty when not feed-sourced
    pub dupe_key: String,
    /// Duplicate ranking score
    pub dupe_score: i64,
}

impl ReleaseCandidate {
    /// Build a candidate from a queue entry
    ///
    /// The name comes from the entry's own parameter; `NZBNA_QUEUEDFILE` is
    /// only a fallback for the event release before the parameter is
    /// visible.
    pub fn from_entry(entry: &QueueEntry, queued_file_env: Option<&str>) -> Option<Self> {
        let queued_name = entry
            .parameter(QUEUED_NAME_PARAMETER)
            .map(str::to_string)
            .or_else(|| queued_file_env.map(str::to_string))?;
        Some(Self {
            nzb_id: entry.nzb_id,
            queued_name,
            post_time: entry.max_post_time,
            critical_health: entry.critical_health,
            dupe_key: entry.dupe_key.clone(),
            dupe_score: entry.dupe_score,
        })
    }

    /// Release age in seconds at `now`
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.post_time
    }
}

/// Runs completion checks for individual releases
pub struct ReleaseChecker<'a> {
    config: &'a Config,
    client: &'a HostClient,
    providers: Vec<Provider>,
    reporter: Reporter,
    /// Host's last known NNTP activity, for the dial-wait window
    host_active_at: Option<Instant>,
}

impl<'a> ReleaseChecker<'a> {
    /// Load the provider settings blocks and build a checker
    pub async fn new(
        config: &'a Config,
        client: &'a HostClient,
        reporter: Reporter,
        host_active_at: Option<Instant>,
    ) -> Result<ReleaseChecker<'a>> {
        let status = client.status().await?;
        let providers = providers::load_providers(
            &status.news_server_ids,
            &|key| std::env::var(key).ok(),
            &config.options,
            &reporter,
        );
        Ok(Self {
            config,
            client,
            providers,
            reporter,
            host_active_at,
        })
    }

    /// Checker over an explicit provider list (tests)
    pub fn with_providers(
        config: &'a Config,
        client: &'a HostClient,
        providers: Vec<Provider>,
        reporter: Reporter,
        host_active_at: Option<Instant>,
    ) -> ReleaseChecker<'a> {
        Self {
            config,
            client,
            providers,
            reporter,
            host_active_at,
        }
    }

    fn descriptor_path(&self, queued_name: &str) -> PathBuf {
        let path = PathBuf::from(queued_name);
        if path.is_absolute() {
            path
        } else {
            self.config.host.nzb_dir.join(queued_name)
        }
    }

    /// Probe one descriptor and return its miss-ratio against the threshold
    async fn probe_descriptor(
        &self,
        path: &PathBuf,
        threshold: f64,
        age_secs: i64,
    ) -> std::result::Result<f64, DescriptorError> {
        let sample = nzb::load_probe_set(path, &self.config.options, &self.reporter)?;
        let providers = providers::filter_providers(
            self.providers.clone(),
            age_secs,
            &self.config.options,
            &self.reporter,
        );
        let prober =
            AvailabilityProber::new(&self.config.tuning, &self.config.options, self.reporter);
        let ratio = prober
            .probe(&sample, &providers, threshold, self.host_active_at)
            .await;
        self.reporter
            .verbose(format!("Total failed ratio: {ratio:.1}%"));
        Ok(ratio)
    }

    /// Check one paused release and commit the resulting action
    ///
    /// Returns true when the release (or a duplicate standing in for it)
    /// was resumed, which ends the selection loop for this invocation.
    pub async fn check_release(&self, candidate: &ReleaseCandidate) -> Result<bool> {
        debug!("checking release {}", candidate.nzb_id);
        self.reporter
            .info(format!("Checking: \"{}\"", candidate.queued_name));
        let engine = DecisionEngine::new(self.client, self.reporter);

        let threshold = decision::release_threshold(candidate.critical_health);
        let path = self.descriptor_path(&candidate.queued_name);
        let now = Utc::now().timestamp();
        let age_secs = candidate.age_secs(now);

        self.reporter.info(format!(
            "Maximum failed articles limit for NZB: {threshold}%"
        ));
        if self.config.options.max_failure > 0.0 {
            self.reporter.info(format!(
                "Maximum failed articles limit for highest level news server: {}%",
                self.config.options.max_failure
            ));
        }

        let miss_ratio = match self.probe_descriptor(&path, threshold, age_secs).await {
            Err(DescriptorError::NoSuchFile) => {
                self.reporter.warning(format!(
                    "The NZB file {} does not seem to exist, resuming NZB.",
                    candidate.queued_name
                ));
                engine.resume_release(candidate.nzb_id).await?;
                return Ok(true);
            }
            Err(DescriptorError::Invalid) => {
                self.reporter.warning(format!(
                    "The NZB file {} appears to be invalid, resuming NZB.",
                    candidate.queued_name
                ));
                engine.resume_release(candidate.nzb_id).await?;
                return Ok(true);
            }
            Err(DescriptorError::NoRarArticles) => {
                self.reporter.warning(format!(
                    "The NZB file {} does not contain any .rar files and has been \
                     moved back to the queue.",
                    candidate.queued_name
                ));
                engine.resume_release(candidate.nzb_id).await?;
                return Ok(true);
            }
            Ok(ratio) => ratio,
        };

        let verdict = decision::decide(
            miss_ratio,
            threshold,
            self.config.options.max_failure,
            age_secs,
            self.config.options.age_limit_secs(),
            self.config.options.force_failure,
        );
        match verdict {
            Verdict::Resume => {
                self.reporter
                    .info(format!("Resuming: \"{}\"", candidate.queued_name));
                self.reporter.flush();
                engine.resume_release(candidate.nzb_id).await?;
                Ok(true)
            }
            Verdict::ForceFailure => {
                engine.force_failure(candidate.nzb_id).await?;
                Ok(false)
            }
            Verdict::MarkBad => {
                self.reporter
                    .verbose(format!("Marked as BAD: \"{}\"", candidate.queued_name));
                self.reporter.flush();
                engine.mark_bad(candidate.nzb_id).await?;
                Ok(false)
            }
            Verdict::KeepPaused => {
                if self.config.options.check_dupes.enabled() && !candidate.dupe_key.is_empty() {
                    if self.check_dupes(candidate).await? {
                        self.reporter.info(format!(
                            "\"{}\" moved to history as DUPE, complete DUPE returned to queue.",
                            candidate.queued_name
                        ));
                        return Ok(true);
                    }
                    self.reporter.warning(format!(
                        "\"{}\", remains paused for next check, no suitable/complete \
                         DUPEs found in history",
                        candidate.queued_name
                    ));
                } else if self.config.options.check_dupes.enabled() {
                    self.reporter.verbose(format!(
                        "{} is not added via RSS, therefore the dupekey is empty and \
                         checking for DUPEs in the history is skipped.",
                        candidate.queued_name
                    ));
                }
                Ok(false)
            }
        }
    }

    /// Look for a complete duplicate of the release in the history
    ///
    /// Only entries this extension demoted earlier qualify: status
    /// `DELETED/DUPE`, same dupe key, and the queued-name parameter present.
    /// The first candidate that probes complete is swapped into the queue.
    async fn check_dupes(&self, current: &ReleaseCandidate) -> Result<bool> {
        let history = self.client.history().await?;
        let same_score_only = self.config.options.check_dupes
            == crate::config::DupeMode::SameScore;
        let mut dupes: Vec<&QueueEntry> = history
            .iter()
            .filter(|job| {
                job.status == "DELETED/DUPE"
                    && job.dupe_key == current.dupe_key
                    && job.parameter(QUEUED_NAME_PARAMETER).is_some()
            })
            .collect();
        if same_score_only {
            let before = dupes.len();
            dupes.retain(|job| job.dupe_score >= current.dupe_score);
            if dupes.len() < before {
                self.reporter.verbose(
                    "DUPE NZB found with lower dupe score, ignored due to SameScore setting.",
                );
            }
        }

        if dupes.is_empty() {
            self.reporter.verbose(format!(
                "No DUPE of {} found in history.",
                current.queued_name
            ));
            return Ok(false);
        }
        self.reporter.verbose(format!(
            "{} duplicate of {} found in history",
            dupes.len(),
            current.queued_name
        ));

        // oldest post first, then higher scores on top; both sorts stable
        dupes.sort_by_key(|job| job.max_post_time);
        dupes.sort_by_key(|job| std::cmp::Reverse(job.dupe_score));

        let engine = DecisionEngine::new(self.client, self.reporter);
        let total = dupes.len();
        for (i, job) in dupes.into_iter().enumerate() {
            let dupe_name = job
                .parameter(QUEUED_NAME_PARAMETER)
                .unwrap_or(&job.name)
                .to_string();
            self.reporter.info(format!(
                "Checking DUPE: \"{dupe_name}\" [{}/{}]",
                i + 1,
                total
            ));

            let threshold = decision::release_threshold(job.critical_health);
            let path = self.descriptor_path(&dupe_name);
            let now = Utc::now().timestamp();
            let age_secs = now - job.max_post_time;

            let miss_ratio = match self.probe_descriptor(&path, threshold, age_secs).await {
                Err(_) => {
                    self.reporter
                        .verbose_warning("DUPE NZB appears broken, marking BAD.");
                    if self.config.options.force_failure {
                        engine.force_failure_dupe(job.nzb_id).await?;
                    } else {
                        engine.mark_bad_dupe(job.nzb_id).await?;
                    }
                    continue;
                }
                Ok(ratio) => ratio,
            };
            self.reporter.verbose(format!(
                "Maximum failed articles limit: {threshold}%"
            ));

            let verdict = decision::decide(
                miss_ratio,
                threshold,
                self.config.options.max_failure,
                age_secs,
                self.config.options.age_limit_secs(),
                self.config.options.force_failure,
            );
            match verdict {
                Verdict::Resume => {
                    self.reporter
                        .info(format!("Resuming DUPE: \"{dupe_name}\""));
                    self.reporter.flush();
                    engine.resume_dupe(job.nzb_id, current.nzb_id).await?;
                    return Ok(true);
                }
                Verdict::MarkBad => {
                    self.reporter
                        .verbose(format!("Marked as BAD: \"{dupe_name}\""));
                    engine.mark_bad_dupe(job.nzb_id).await?;
                }
                Verdict::ForceFailure => {
                    self.reporter
                        .verbose(format!("Forcing failure of: \"{dupe_name}\""));
                    engine.force_failure_dupe(job.nzb_id).await?;
                }
                Verdict::KeepPaused => {}
            }
        }
        Ok(false)
    }
}
