//! Per-provider session pool
//!
//! A pool fans one provider out into up to `min(max_conns, ceil(sample/2))`
//! sessions, each driven by its own cooperative task. All sessions share the
//! sample cursor and the confirmation column, so every article is issued to
//! exactly one session and articles confirmed by an earlier provider are
//! skipped without a `STAT`. Within one session requests are strictly
//! pipelined-by-request: one outstanding `STAT` at a time, so the reply
//! order matches the issue order.
//!
//! The slow-session policy: an empty read slot of
//! `SocketLoopInterval / pool_size` spaces each retry; the 5th consecutive
//! empty read stalls the session for two seconds; from the 6th a pseudo
//! `999` reply is synthesised and scored as missing. Twenty synthesised
//! replies abandon the whole provider (`loop_failed`).

use crate::config::Tuning;
use crate::nzb::ProbeSet;
use crate::providers::Provider;
use crate::report::Reporter;
use crate::session::{
    self, ProbeSession, ReadOutcome, ReplyEvent, SessionState, authinfo_pass_cmd,
    authinfo_user_cmd, group_cmd, quit_cmd, stat_cmd,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Empty reads before the long stall kicks in
const IDLE_READS_BEFORE_STALL: u32 = 5;

/// Long stall after the 5th consecutive empty read
const STALL_SLEEP: Duration = Duration::from_secs(2);

/// Synthesised replies that abandon the provider
const STALLED_REPLIES_LIMIT: usize = 20;

/// Reads per session while draining after end-of-work
const DRAIN_ROUNDS: usize = 8;

/// The host closes idle NNTP connections after this long
const HOST_QUIT_IDLE: Duration = Duration::from_secs(5);

/// Outcome of one provider run
#[derive(Debug, Clone, Copy)]
pub struct ProviderReport {
    /// Articles issued to this provider
    pub sent: usize,
    /// Articles this provider reported missing
    pub missing: usize,
    /// Provider abandoned for replying too slowly
    pub loop_failed: bool,
    /// Sessions that successfully dialed
    pub dialed: usize,
}

struct Shared {
    sample: ProbeSet,
    provider: Provider,
    /// 1-based ordinal of this provider in the probe order
    ordinal: u32,
    cursor: AtomicUsize,
    sent: AtomicUsize,
    missing: AtomicUsize,
    stalled: AtomicUsize,
    loop_failed: AtomicBool,
    threshold: f64,
    max_failure: f64,
    slot: Duration,
    milestones: BTreeSet<usize>,
    reporter: Reporter,
}

impl Shared {
    fn miss_ratio(&self) -> f64 {
        self.missing.load(Ordering::Acquire) as f64 * 100.0 / self.sample.len() as f64
    }

    /// Miss ratio has reached the release threshold or the MaxFailure override
    fn over_limit(&self) -> bool {
        if self.missing.load(Ordering::Acquire) == 0 {
            return false;
        }
        let ratio = self.miss_ratio();
        ratio >= self.threshold || (self.max_failure > 0.0 && ratio >= self.max_failure)
    }

    fn should_stop(&self) -> bool {
        self.loop_failed.load(Ordering::Acquire) || self.over_limit()
    }

    /// Claim the next article not yet confirmed by an earlier provider
    fn next_unconfirmed(&self) -> Option<usize> {
        loop {
            let i = self.cursor.fetch_add(1, Ordering::AcqRel);
            if i >= self.sample.len() {
                return None;
            }
            if self.sample.found_on_provider(i).is_some() {
                self.reporter.wire(format!(
                    "Article {i} already checked and available on an earlier server"
                ));
                continue;
            }
            let sent = self.sent.fetch_add(1, Ordering::AcqRel) + 1;
            if self.milestones.contains(&sent) {
                self.reporter.info(format!(
                    "Requested [{sent}/{}] articles, {} failed.",
                    self.sample.len(),
                    self.missing.load(Ordering::Acquire)
                ));
                self.reporter.flush();
            }
            return Some(i);
        }
    }

    fn record_missing(&self) {
        self.missing.fetch_add(1, Ordering::AcqRel);
    }

    /// Count one synthesised reply; abandons the provider at the limit
    fn record_stalled(&self) {
        let stalled = self.stalled.fetch_add(1, Ordering::AcqRel) + 1;
        if stalled >= STALLED_REPLIES_LIMIT && !self.loop_failed.swap(true, Ordering::AcqRel) {
            self.reporter.warning(
                "Skipping current server as it is replying very slow on header \
                 requests for this NZB file",
            );
        }
    }
}

enum PolicyOutcome {
    Reply(String),
    Stalled,
    Dead,
}

/// Read one reply applying the slow-session policy
async fn read_with_policy(session: &mut ProbeSession, shared: &Shared) -> PolicyOutcome {
    loop {
        if shared.loop_failed.load(Ordering::Acquire) {
            return PolicyOutcome::Dead;
        }
        match session.read_chunk(shared.slot).await {
            Ok(ReadOutcome::Reply(raw)) => return PolicyOutcome::Reply(raw),
            Ok(ReadOutcome::Eof) | Err(_) => return PolicyOutcome::Dead,
            Ok(ReadOutcome::Empty) => {
                session.idle_reads += 1;
                if session.idle_reads < IDLE_READS_BEFORE_STALL {
                    // the elapsed slot already spaced this retry
                    continue;
                }
                if session.idle_reads == IDLE_READS_BEFORE_STALL {
                    shared.reporter.verbose(format!(
                        "Socket: {} No data received on 5th retry, pausing script for 2 sec.",
                        session.ordinal
                    ));
                    sleep(STALL_SLEEP).await;
                    continue;
                }
                shared.reporter.verbose(format!(
                    "Socket: {} Still no data received after waiting, \
                     marking requested article as failed.",
                    session.ordinal
                ));
                shared.record_stalled();
                return PolicyOutcome::Stalled;
            }
        }
    }
}

/// Drive one session until the sample is exhausted or the pool stops
async fn run_session(mut session: ProbeSession, shared: Arc<Shared>) {
    let mut pending: Option<usize> = None;

    loop {
        let outcome = read_with_policy(&mut session, &shared).await;
        let (code, raw) = match outcome {
            PolicyOutcome::Reply(raw) => (session::parse_code(&raw), Some(raw)),
            PolicyOutcome::Stalled => (Some(session::STALLED_REPLY_CODE), None),
            PolicyOutcome::Dead => return,
        };
        if let Some(raw) = &raw {
            shared.reporter.wire(format!(
                "Socket: {} {}, NNTP reply: {}",
                session.ordinal,
                session.host(),
                raw.trim_end()
            ));
        }

        let (next_state, event) = session::transition(session.state, code);
        session.state = next_state;

        match event {
            ReplyEvent::Present => {
                if let Some(i) = pending.take() {
                    // prefer the echoed message-ID; a pipelining hiccup may
                    // hand us another article's confirmation
                    let idx = raw
                        .as_deref()
                        .and_then(session::reply_message_id)
                        .and_then(|mid| find_by_id(&shared.sample, &mid))
                        .unwrap_or(i);
                    shared.sample.confirm(idx, shared.ordinal);
                }
                session.last_pending_id = None;
            }
            ReplyEvent::Missing => {
                if pending.take().is_some() {
                    if code == Some(session::STALLED_REPLY_CODE) {
                        shared.reporter.verbose_warning(format!(
                            "Socket: {} {}, NNTP reply: 999 Article marked as failed by script.",
                            session.ordinal,
                            session.host()
                        ));
                    } else {
                        shared.reporter.verbose_warning(format!(
                            "Socket: {} {}, NNTP reply: {}",
                            session.ordinal,
                            session.host(),
                            raw.as_deref().unwrap_or("").trim_end()
                        ));
                    }
                    shared.record_missing();
                }
                session.last_pending_id = None;
            }
            ReplyEvent::SendStat => {}
            ReplyEvent::SendAuthUser => {
                let cmd = authinfo_user_cmd(&shared.provider.username);
                if session.send(&cmd).await.is_err() {
                    return;
                }
                continue;
            }
            ReplyEvent::SendAuthPass => {
                let cmd = authinfo_pass_cmd(&shared.provider.password);
                if session.send(&cmd).await.is_err() {
                    return;
                }
                continue;
            }
            ReplyEvent::SendGroup => {
                let group = pending
                    .map(|i| shared.sample.article(i))
                    .and_then(|a| a.groups.first().cloned())
                    .unwrap_or_default();
                if session.send(&group_cmd(&group)).await.is_err() {
                    return;
                }
                continue;
            }
            ReplyEvent::Fatal => {
                shared.reporter.error(format!(
                    "Socket: {} {}, Incorrect news server account settings: {}",
                    session.ordinal,
                    session.host(),
                    raw.as_deref().unwrap_or("").trim_end()
                ));
                return;
            }
            ReplyEvent::Closed => return,
            ReplyEvent::Ignore => continue,
        }

        // Present / Missing / SendStat all end up here needing a pending article
        if pending.is_none() {
            if shared.should_stop() {
                shutdown(&mut session, &shared).await;
                return;
            }
            pending = shared.next_unconfirmed();
        }
        match pending {
            Some(i) => {
                let id = shared.sample.article(i).message_id.clone();
                let cmd = stat_cmd(&id);
                session.last_pending_id = Some(id);
                if session.send(&cmd).await.is_err() {
                    return;
                }
            }
            None => {
                shutdown(&mut session, &shared).await;
                return;
            }
        }
    }
}

/// Send `QUIT` and collect the goodbye
async fn shutdown(session: &mut ProbeSession, shared: &Shared) {
    if session.send(quit_cmd()).await.is_err() {
        return;
    }
    session.state = SessionState::Closing;
    for _ in 0..DRAIN_ROUNDS {
        match session.read_chunk(shared.slot).await {
            Ok(ReadOutcome::Reply(raw)) => {
                if session::parse_code(&raw) == Some(205) {
                    shared
                        .reporter
                        .verbose(format!("Socket {} closed.", session.ordinal));
                    return;
                }
            }
            Ok(ReadOutcome::Empty) => continue,
            Ok(ReadOutcome::Eof) | Err(_) => return,
        }
    }
}

fn find_by_id(sample: &ProbeSet, message_id: &str) -> Option<usize> {
    (0..sample.len()).find(|&i| sample.article(i).message_id == message_id)
}

/// Progress milestones: first article, the failure threshold, each quarter
fn milestones(total: usize, threshold: f64) -> BTreeSet<usize> {
    BTreeSet::from([
        1,
        (total as f64 * threshold * 0.01) as usize,
        total / 4,
        total / 2,
        total * 3 / 4,
        total,
    ])
}

/// One provider's pool of probe sessions
pub struct SessionPool<'a> {
    provider: &'a Provider,
    tuning: &'a Tuning,
    reporter: Reporter,
}

impl<'a> SessionPool<'a> {
    /// Create a pool for one provider
    pub fn new(provider: &'a Provider, tuning: &'a Tuning, reporter: Reporter) -> Self {
        Self {
            provider,
            tuning,
            reporter,
        }
    }

    /// Probe the sample against this provider
    ///
    /// `ordinal` is the provider's 1-based position in the probe order and
    /// is what gets stamped into the confirmation column.
    /// `host_active_at` is the host's last known NNTP activity; dialling
    /// waits out the host's quit-after-idle window to avoid tripping the
    /// provider's connection cap.
    pub async fn run(
        &self,
        sample: &ProbeSet,
        ordinal: u32,
        threshold: f64,
        max_failure: f64,
        host_active_at: Option<Instant>,
    ) -> ProviderReport {
        let pool_size = self
            .provider
            .max_conns
            .min(sample.len().div_ceil(2))
            .max(1);
        let slot = self.tuning.socket_loop_interval / pool_size as u32;

        if let Some(active_at) = host_active_at {
            let window = HOST_QUIT_IDLE + self.tuning.socket_loop_interval;
            let elapsed = active_at.elapsed();
            if elapsed < window {
                let wait = window - elapsed;
                self.reporter.verbose(format!(
                    "Waiting {:.2} sec while NZBGet closes its news server connections.",
                    wait.as_secs_f64()
                ));
                sleep(wait).await;
            }
        }

        self.reporter
            .verbose(format!("Creating sockets for server: {}", self.provider.host));
        let connector = self.provider.tls.then(session::tls_connector);
        let mut sessions = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            match ProbeSession::dial(
                self.provider,
                i,
                self.tuning.nntp_timeout,
                connector.as_ref(),
            )
            .await
            {
                Ok(session) => {
                    self.reporter.verbose(format!("Socket {i} created."));
                    sessions.push(session);
                    sleep(self.tuning.socket_create_interval).await;
                }
                Err(e) => {
                    self.reporter.warning(format!(
                        "Socket: {i} {e}, check host, port and number of connections \
                         settings for server {}",
                        self.provider.host
                    ));
                }
            }
        }

        let dialed = sessions.len();
        if dialed == 0 {
            self.reporter.error(format!(
                "Creation of all sockets for server {} failed.",
                self.provider.host
            ));
            return ProviderReport {
                sent: 0,
                missing: 0,
                loop_failed: false,
                dialed: 0,
            };
        }

        let shared = Arc::new(Shared {
            sample: sample.clone(),
            provider: self.provider.clone(),
            ordinal,
            cursor: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            missing: AtomicUsize::new(0),
            stalled: AtomicUsize::new(0),
            loop_failed: AtomicBool::new(false),
            threshold,
            max_failure,
            slot,
            milestones: milestones(sample.len(), threshold),
            reporter: self.reporter,
        });

        debug!(
            "probing {} articles on {} with {} sessions",
            sample.len(),
            self.provider.host,
            dialed
        );
        let handles: Vec<_> = sessions
            .into_iter()
            .map(|session| tokio::spawn(run_session(session, Arc::clone(&shared))))
            .collect();
        for handle in handles {
            let _ = handle.await;
        }

        // every session died before the work ran out: a provider-scoped
        // failure, not a verdict on the articles
        let exhausted = shared.cursor.load(Ordering::Acquire) >= sample.len();
        let aborted = !exhausted && !shared.should_stop();
        if aborted {
            self.reporter.warning(format!(
                "All sessions for server {} failed before the check completed.",
                self.provider.host
            ));
        }

        ProviderReport {
            sent: shared.sent.load(Ordering::Acquire),
            missing: shared.missing.load(Ordering::Acquire),
            loop_failed: shared.loop_failed.load(Ordering::Acquire) || aborted,
            dialed,
        }
    }
}
