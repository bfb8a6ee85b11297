//! Decision engine
//!
//! Maps a probed miss-ratio, the release thresholds and the release age to
//! one action, and commits actions through the host RPC adapter. The
//! committed edits mirror what the host expects: a resume always re-pauses
//! the extra par files, a mark-bad must delete the group first, and the
//! forced failure strips the release down to a stub the host will fail on
//! its own.

use crate::error::Result;
use crate::report::Reporter;
use crate::rpc::{HostClient, QueuedFile};
use std::time::Duration;

/// Highest tolerated miss-ratio for a release, in percent
///
/// `critical_health` is the host's 0..=1000 health floor; a release with
/// critical health 850 tolerates 15 % missing articles.
pub fn release_threshold(critical_health: i64) -> f64 {
    ((100.0 - critical_health as f64 / 10.0) * 10.0).round() / 10.0
}

/// What to do with a paused release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Enough articles are retrievable: hand the release back to the host
    Resume,
    /// Too broken and old enough: delete and mark bad in history
    MarkBad,
    /// Too broken and old enough, with `ForceFailure` set
    ForceFailure,
    /// Not good enough yet, but too young to give up on
    KeepPaused,
}

/// The decision table for a probed release
///
/// `max_failure` of 0 disables the override. The age gate is strict: a
/// release aged exactly `age_limit_secs` is not yet past it.
pub fn decide(
    miss_ratio: f64,
    threshold: f64,
    max_failure: f64,
    age_secs: i64,
    age_limit_secs: i64,
    force_failure: bool,
) -> Verdict {
    let below_limits =
        miss_ratio < threshold && (miss_ratio < max_failure || max_failure == 0.0);
    if below_limits || miss_ratio == 0.0 {
        return Verdict::Resume;
    }
    let over_limits =
        miss_ratio >= threshold || (miss_ratio >= max_failure && max_failure > 0.0);
    if over_limits && age_secs > age_limit_secs {
        if force_failure {
            Verdict::ForceFailure
        } else {
            Verdict::MarkBad
        }
    } else {
        Verdict::KeepPaused
    }
}

/// File IDs to delete so that only the smallest par2 and the smallest
/// non-par file survive
///
/// Sizes are the full 64-bit values; a release made of >4 GiB files would
/// otherwise pick its survivors by the truncated low word. Without any par2
/// a single file survives.
pub fn force_failure_deletions(files: &[QueuedFile]) -> Vec<i64> {
    let smallest_par = files
        .iter()
        .filter(|f| f.is_par2())
        .min_by_key(|f| f.size())
        .map(|f| f.id);
    let smallest_other = files
        .iter()
        .filter(|f| !f.is_par2())
        .min_by_key(|f| f.size())
        .map(|f| f.id);
    files
        .iter()
        .filter(|f| Some(f.id) != smallest_par && Some(f.id) != smallest_other)
        .map(|f| f.id)
        .collect()
}

/// Commits decisions against the host
pub struct DecisionEngine<'a> {
    client: &'a HostClient,
    reporter: Reporter,
}

impl<'a> DecisionEngine<'a> {
    /// Create an engine over the host client
    pub fn new(client: &'a HostClient, reporter: Reporter) -> Self {
        Self { client, reporter }
    }

    /// Resume a paused release and re-pause its extra par files
    pub async fn resume_release(&self, nzb_id: i64) -> Result<()> {
        self.client.edit_queue("GroupResume", &[nzb_id]).await?;
        self.client
            .edit_queue("GroupPauseExtraPars", &[nzb_id])
            .await?;
        Ok(())
    }

    /// Swap a complete history duplicate in for the broken queue entry
    ///
    /// The redownload must come first: deleting the queue entry while the
    /// duplicate still sits in history would make the host auto-return a
    /// duplicate of its own choosing.
    pub async fn resume_dupe(&self, dupe_nzb_id: i64, current_nzb_id: i64) -> Result<()> {
        self.client
            .edit_queue("HistoryRedownload", &[dupe_nzb_id])
            .await?;
        self.client.edit_queue("GroupResume", &[dupe_nzb_id]).await?;
        self.client
            .edit_queue("GroupPauseExtraPars", &[dupe_nzb_id])
            .await?;
        self.client
            .edit_queue("GroupDupeDelete", &[current_nzb_id])
            .await?;
        Ok(())
    }

    /// Delete a queue entry and mark it bad in history
    pub async fn mark_bad(&self, nzb_id: i64) -> Result<()> {
        self.client.edit_queue("GroupDelete", &[nzb_id]).await?;
        self.client.edit_queue("HistoryMarkBad", &[nzb_id]).await?;
        Ok(())
    }

    /// Mark a history entry bad in place
    pub async fn mark_bad_dupe(&self, dupe_nzb_id: i64) -> Result<()> {
        self.client
            .edit_queue("HistoryMarkBad", &[dupe_nzb_id])
            .await?;
        Ok(())
    }

    /// Force a failure the host's downstream automation can see
    ///
    /// Mark-bad is invisible to FailureLink, Sonarr and the like. Instead,
    /// every file except the smallest par2 and the smallest non-par is
    /// deleted and the release resumed; the host then fails it on the stub.
    pub async fn force_failure(&self, nzb_id: i64) -> Result<()> {
        self.reporter
            .verbose(format!("force_failure(nzb_id={nzb_id})"));
        let files = self.client.list_files(nzb_id).await?;
        let deletions = force_failure_deletions(&files);
        if self.reporter.verbose {
            for file in &files {
                if !deletions.contains(&file.id) {
                    self.reporter
                        .verbose(format!("Leaving file: {} in the NZB file", file.filename));
                }
            }
        }
        self.reporter.warning("Forcing failure of NZB:");
        // land the message before the host floods the log with delete entries
        self.reporter.flush();
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !deletions.is_empty() {
            self.client.edit_queue("FileDelete", &deletions).await?;
        }
        self.client.edit_queue("GroupResume", &[nzb_id]).await?;
        Ok(())
    }

    /// Force-fail a history duplicate by returning it to the queue first
    pub async fn force_failure_dupe(&self, dupe_nzb_id: i64) -> Result<()> {
        self.reporter
            .verbose(format!("force_failure_dupe(nzb_id={dupe_nzb_id})"));
        self.reporter
            .verbose("Pausing failed DUPE NZB before returning to queue.");
        self.client.edit_queue("GroupPause", &[dupe_nzb_id]).await?;
        self.reporter.verbose("Returning failed DUPE NZB to queue.");
        self.client
            .edit_queue("HistoryReturn", &[dupe_nzb_id])
            .await?;
        self.force_failure(dupe_nzb_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: i64, name: &str, lo: u32, hi: u32) -> QueuedFile {
        QueuedFile {
            id,
            filename: name.to_string(),
            file_size_lo: lo,
            file_size_hi: hi,
        }
    }

    #[test]
    fn test_release_threshold() {
        assert_eq!(release_threshold(850), 15.0);
        assert_eq!(release_threshold(1000), 0.0);
        assert_eq!(release_threshold(0), 100.0);
        assert_eq!(release_threshold(925), 7.5);
    }

    #[test]
    fn test_decide_resume_below_threshold() {
        assert_eq!(decide(5.0, 10.0, 0.0, 0, 14_400, false), Verdict::Resume);
        assert_eq!(decide(0.0, 0.0, 0.0, 0, 14_400, false), Verdict::Resume);
    }

    #[test]
    fn test_decide_max_failure_disabled_at_zero() {
        // only the release threshold counts when MaxFailure is 0
        assert_eq!(decide(9.0, 10.0, 0.0, 0, 14_400, false), Verdict::Resume);
        assert_eq!(
            decide(9.0, 10.0, 5.0, 0, 14_400, false),
            Verdict::KeepPaused
        );
    }

    #[test]
    fn test_decide_old_release_goes_bad() {
        assert_eq!(
            decide(40.0, 10.0, 0.0, 14_401, 14_400, false),
            Verdict::MarkBad
        );
        assert_eq!(
            decide(40.0, 10.0, 0.0, 14_401, 14_400, true),
            Verdict::ForceFailure
        );
    }

    #[test]
    fn test_decide_age_gate_is_strict() {
        // exactly at the limit: not past the gate
        assert_eq!(
            decide(40.0, 10.0, 0.0, 14_400, 14_400, false),
            Verdict::KeepPaused
        );
        assert_eq!(
            decide(40.0, 10.0, 0.0, 14_401, 14_400, false),
            Verdict::MarkBad
        );
    }

    #[test]
    fn test_force_failure_keeps_smallest_par_and_file() {
        let files = vec![
            file(1, "rel.part01.rar", 5_000, 0),
            file(2, "rel.part02.rar", 4_000, 0),
            file(3, "rel.vol00+01.par2", 900, 0),
            file(4, "rel.vol01+02.par2", 1_800, 0),
            file(5, "rel.nfo", 300, 0),
        ];
        let mut deletions = force_failure_deletions(&files);
        deletions.sort_unstable();
        // survivors: id 3 (smallest par2) and id 5 (smallest non-par)
        assert_eq!(deletions, vec![1, 2, 4]);
    }

    #[test]
    fn test_force_failure_uses_full_64bit_size() {
        // low word alone would call the 4 GiB file the smallest
        let files = vec![
            file(1, "huge.part01.rar", 1, 1),
            file(2, "small.rar", 100, 0),
        ];
        let deletions = force_failure_deletions(&files);
        assert_eq!(deletions, vec![1]);
    }

    #[test]
    fn test_force_failure_without_par2() {
        let files = vec![
            file(1, "a.rar", 200, 0),
            file(2, "b.rar", 100, 0),
        ];
        let deletions = force_failure_deletions(&files);
        // a single file survives
        assert_eq!(deletions, vec![1]);
    }
}
