//! Extension configuration
//!
//! NZBGet communicates everything through environment variables: script
//! options as `NZBPO_*`, host options as `NZBOP_*`, per-server settings as
//! `NZBOP_Server<i>.*`. This module loads them once into an immutable
//! [`Config`] that is passed by reference into every component.
//!
//! Loading goes through a lookup closure so tests can feed a plain map
//! instead of mutating the process environment.

use crate::error::{CompletionError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Duplicate-handling policy, normalised from the `CheckDupes` option
///
/// The option is matched case-insensitively at load time; every comparison
/// after that is on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupeMode {
    /// Never look at history duplicates
    No,
    /// Consider every duplicate with the same dupe key
    Yes,
    /// Consider only duplicates whose score is at least the current one
    SameScore,
}

impl DupeMode {
    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("samescore") {
            DupeMode::SameScore
        } else if raw.is_empty() || raw.eq_ignore_ascii_case("no") {
            DupeMode::No
        } else {
            // Any other value means the user switched the option on
            DupeMode::Yes
        }
    }

    /// Whether history duplicates should be considered at all
    pub fn enabled(&self) -> bool {
        !matches!(self, DupeMode::No)
    }
}

/// Script options (`NZBPO_*`)
#[derive(Debug, Clone)]
pub struct Options {
    /// Hours a release must age before it can be marked bad or failed
    pub age_limit_hours: u32,
    /// Hours after which a release is moved to the tail of the check order
    pub age_sort_limit_hours: u32,
    /// Duplicate-handling policy
    pub check_dupes: DupeMode,
    /// Replace mark-bad with the forced-failure procedure
    pub force_failure: bool,
    /// Categories handled by the scan hook (lowercase; empty = all)
    pub categories: Vec<String>,
    /// Allow-list of server IDs to probe (empty = all active servers)
    pub servers: Vec<String>,
    /// Server IDs only consulted for releases older than the age limit
    pub fill_servers: Vec<String>,
    /// Miss-ratio override in percent; 0 disables
    pub max_failure: f64,
    /// Emit `[V]` trace lines
    pub verbose: bool,
    /// Emit `[E]` wire trace lines
    pub extreme: bool,
    /// Probe paused releases even when higher-priority work is queued
    pub ignore_queue_priority: bool,
    /// Percentage of rar articles to sample
    pub check_limit_percent: u32,
    /// Upper bound on sampled articles
    pub max_articles: usize,
    /// Lower bound on sampled articles
    pub min_articles: usize,
    /// Sample every article when the release carries at most one par file
    pub full_check_no_pars: bool,
}

impl Options {
    /// Age limit in seconds
    pub fn age_limit_secs(&self) -> i64 {
        i64::from(self.age_limit_hours) * 3600
    }

    /// Age sort limit in seconds
    pub fn age_sort_limit_secs(&self) -> i64 {
        i64::from(self.age_sort_limit_hours) * 3600
    }
}

/// Host connection settings and paths (`NZBOP_*`)
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Control interface address; `0.0.0.0` is rewritten to `127.0.0.1`
    pub ip: String,
    /// Control interface port
    pub port: u16,
    /// HTTP Basic username
    pub username: String,
    /// HTTP Basic password
    pub password: String,
    /// Host temp directory (the lock file lives under it)
    pub temp_dir: PathBuf,
    /// Directory holding queued NZB files
    pub nzb_dir: PathBuf,
    /// Whether the host's own DupeCheck option is on
    pub dupe_check: bool,
}

/// Probe timing knobs
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Dial timeout per socket; low, but enough for a connection check
    pub nntp_timeout: Duration,
    /// Delay between handshakes to avoid dial timeouts on picky providers
    pub socket_create_interval: Duration,
    /// Upper bound on a single empty read-loop slot
    pub socket_loop_interval: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            nntp_timeout: Duration::from_secs(2),
            socket_create_interval: Duration::ZERO,
            socket_loop_interval: Duration::from_millis(200),
        }
    }
}

/// Immutable configuration for one invocation
#[derive(Debug, Clone)]
pub struct Config {
    /// Script options
    pub options: Options,
    /// Host connection settings
    pub host: HostConfig,
    /// Probe timing knobs
    pub tuning: Tuning,
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through a lookup closure (tests feed a map here)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let age_limit_hours = parse_num(&lookup, "NZBPO_AgeLimit", 4u32)?;
        let mut age_sort_limit_hours = parse_num(&lookup, "NZBPO_AgeSortLimit", 48u32)?;
        // Sorting by age below the action gate would be meaningless
        if age_sort_limit_hours < age_limit_hours {
            age_sort_limit_hours = age_limit_hours;
        }

        let options = Options {
            age_limit_hours,
            age_sort_limit_hours,
            check_dupes: DupeMode::parse(&lookup("NZBPO_CheckDupes").unwrap_or_default()),
            force_failure: parse_yes(&lookup, "NZBPO_ForceFailure"),
            categories: parse_list(&lookup, "NZBPO_Categories"),
            servers: parse_list(&lookup, "NZBPO_Servers"),
            fill_servers: parse_list(&lookup, "NZBPO_FillServers"),
            max_failure: parse_num(&lookup, "NZBPO_MaxFailure", 0.0f64)?,
            verbose: parse_yes(&lookup, "NZBPO_Verbose"),
            extreme: parse_yes(&lookup, "NZBPO_Extreme"),
            ignore_queue_priority: parse_yes(&lookup, "NZBPO_IgnoreQueuePriority"),
            check_limit_percent: parse_num(&lookup, "NZBPO_CheckLimit", 10u32)?,
            max_articles: parse_num(&lookup, "NZBPO_MaxArticles", 1000usize)?,
            min_articles: parse_num(&lookup, "NZBPO_MinArticles", 50usize)?,
            full_check_no_pars: lookup("NZBPO_FullCheckNoPars")
                .map(|v| v.eq_ignore_ascii_case("yes"))
                .unwrap_or(true),
        };

        let mut ip = require(&lookup, "NZBOP_CONTROLIP")?;
        if ip == "0.0.0.0" {
            ip = "127.0.0.1".to_string();
        }
        let host = HostConfig {
            ip,
            port: require(&lookup, "NZBOP_CONTROLPORT")?
                .parse()
                .map_err(|_| CompletionError::Config("NZBOP_CONTROLPORT is not a port".into()))?,
            username: require(&lookup, "NZBOP_CONTROLUSERNAME")?,
            password: require(&lookup, "NZBOP_CONTROLPASSWORD")?,
            temp_dir: PathBuf::from(require(&lookup, "NZBOP_TEMPDIR")?),
            nzb_dir: PathBuf::from(require(&lookup, "NZBOP_NZBDIR")?),
            dupe_check: lookup("NZBOP_DUPECHECK")
                .map(|v| !v.eq_ignore_ascii_case("no"))
                .unwrap_or(true),
        };

        Ok(Self {
            options,
            host,
            tuning: Tuning::default(),
        })
    }
}

fn require(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key).ok_or_else(|| CompletionError::Config(format!("{key} is not set")))
}

fn parse_yes(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key).map(|v| v.eq_ignore_ascii_case("yes")).unwrap_or(false)
}

/// Comma-separated option list, lowercased, empty entries dropped
fn parse_list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Vec<String> {
    lookup(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CompletionError::Config(format!("{key} has an invalid value: {raw}"))),
    }
}
