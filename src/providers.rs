//! News-server providers
//!
//! The host exposes its configured news servers both through the `status`
//! RPC (which yields the IDs) and through `NZBOP_Server<i>.*` environment
//! variables (which carry the settings). Providers are filtered against the
//! release age and the script's server lists before a probe run, and
//! collapsed so that at most one server per host-side server group remains.

use crate::config::Options;
use crate::error::{CompletionError, Result};
use crate::report::Reporter;

const SECS_PER_DAY: f64 = 86_400.0;

/// One configured news server
#[derive(Debug, Clone)]
pub struct Provider {
    /// Host-side server ID
    pub id: u32,
    /// Server level; lower levels are probed first
    pub level: i32,
    /// Host-side server group; 0 means ungrouped
    pub group_id: i32,
    /// Server hostname
    pub host: String,
    /// Server port
    pub port: u16,
    /// Use TLS
    pub tls: bool,
    /// Username for AUTHINFO
    pub username: String,
    /// Password for AUTHINFO
    pub password: String,
    /// Connection cap configured on the host
    pub max_conns: usize,
    /// Retention in days; 0 means unlimited
    pub retention_days: f64,
    /// Whether the server is listed in the `FillServers` option
    pub is_fill: bool,
    /// Whether the server is active on the host
    pub active: bool,
}

impl Provider {
    /// Read one `NZBOP_Server<id>.*` block
    pub fn from_lookup(
        id: u32,
        lookup: &impl Fn(&str) -> Option<String>,
        opts: &Options,
    ) -> Result<Self> {
        let get = |field: &str| -> Result<String> {
            let key = format!("NZBOP_Server{id}.{field}");
            lookup(&key).ok_or_else(|| CompletionError::Config(format!("{key} is not set")))
        };
        let id_str = id.to_string();
        Ok(Self {
            id,
            level: get("Level")?.trim().parse().unwrap_or(0),
            group_id: get("Group")?.trim().parse().unwrap_or(0),
            host: get("Host")?,
            port: get("Port")?
                .trim()
                .parse()
                .map_err(|_| CompletionError::Config(format!("Server{id}.Port is invalid")))?,
            tls: get("Encryption")?.eq_ignore_ascii_case("yes"),
            username: get("Username")?,
            password: get("Password")?,
            max_conns: get("Connections")?.trim().parse().unwrap_or(1),
            retention_days: {
                let raw = get("Retention")?;
                let raw = raw.trim();
                if raw.is_empty() { 0.0 } else { raw.parse().unwrap_or(0.0) }
            },
            is_fill: opts.fill_servers.contains(&id_str),
            active: get("Active")?.eq_ignore_ascii_case("yes"),
        })
    }
}

/// Load the settings blocks for the given host server IDs
///
/// Servers whose block cannot be read are skipped with a warning rather than
/// failing the whole run.
pub fn load_providers(
    ids: &[u32],
    lookup: &impl Fn(&str) -> Option<String>,
    opts: &Options,
    reporter: &Reporter,
) -> Vec<Provider> {
    let mut providers = Vec::with_capacity(ids.len());
    for &id in ids {
        match Provider::from_lookup(id, lookup, opts) {
            Ok(p) => providers.push(p),
            Err(e) => reporter.warning(format!("Skipping server {id}: {e}")),
        }
    }
    providers
}

/// Apply the filter rules and group dedup for one release
///
/// Rules, in order: inactive servers go; servers outside a configured
/// `Servers`/`FillServers` allow-list go; fill servers go while the release
/// is younger than the age limit; servers whose retention the release has
/// outlived go. The survivors are sorted by `(group, level)` and each
/// nonzero group keeps only its lowest-level member.
pub fn filter_providers(
    providers: Vec<Provider>,
    release_age_secs: i64,
    opts: &Options,
    reporter: &Reporter,
) -> Vec<Provider> {
    let age_days = release_age_secs as f64 / SECS_PER_DAY;
    let age_hours = age_days * 24.0;
    let has_allow_list = !opts.servers.is_empty();

    let mut kept: Vec<Provider> = Vec::new();
    for p in providers {
        let id_str = p.id.to_string();
        if !p.active {
            reporter.verbose(format!(
                "Skipping server: {}, disabled in NZBGet settings.",
                p.host
            ));
            continue;
        }
        if has_allow_list
            && !opts.servers.contains(&id_str)
            && !opts.fill_servers.contains(&id_str)
        {
            reporter.verbose(format!(
                "Skipping server: {}, not listed as Server or FillServer in script settings.",
                p.host
            ));
            continue;
        }
        if p.is_fill && age_hours < f64::from(opts.age_limit_hours) {
            reporter.verbose(format!(
                "Skipping Fill server: {}, NZB age of {:.1} hours within AgeLimit of {} hours",
                p.host, age_hours, opts.age_limit_hours
            ));
            continue;
        }
        if p.retention_days != 0.0 && p.retention_days < age_days {
            reporter.verbose(format!(
                "Skipping server: {}, retention of {} days is less than NZB age of {:.1} days.",
                p.host, p.retention_days, age_days
            ));
            continue;
        }
        kept.push(p);
    }

    reporter.verbose(
        "All news servers after filtering on Active, Servers, FillServers + AgeLimit \
         and Retention, BEFORE filtering on NZBGet ServerX.Group:",
    );
    for p in &kept {
        reporter.verbose(format!(
            "* {}:{}, SSL: {}, connections: {}",
            p.host, p.port, p.tls, p.max_conns
        ));
    }

    kept.sort_by_key(|p| (p.group_id, p.level));
    let mut last_group: Option<i32> = None;
    let mut deduped: Vec<Provider> = Vec::new();
    for p in kept {
        // every group-0 server stays; each nonzero group keeps its first
        // (lowest-level) member from the sorted order
        if p.group_id == 0 || last_group != Some(p.group_id) {
            if p.group_id > 0 {
                last_group = Some(p.group_id);
            }
            deduped.push(p);
        }
    }

    reporter.verbose("All active news servers AFTER filtering and sorting on NZBGet ServerX.Group:");
    for p in &deduped {
        reporter.verbose(format!(
            "* {}:{}, SSL: {}, connections: {}",
            p.host, p.port, p.tls, p.max_conns
        ));
    }

    if deduped.is_empty() {
        reporter.warning(
            "No news servers after filtering, marking NZB as FAILED or BAD. \
             May run in Verbose mode and check your settings!",
        );
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;

    fn options(extra: &[(&str, &str)]) -> Options {
        let mut env: HashMap<String, String> = HashMap::from([
            ("NZBOP_CONTROLIP".into(), "127.0.0.1".into()),
            ("NZBOP_CONTROLPORT".into(), "6789".into()),
            ("NZBOP_CONTROLUSERNAME".into(), "u".into()),
            ("NZBOP_CONTROLPASSWORD".into(), "p".into()),
            ("NZBOP_TEMPDIR".into(), "/tmp".into()),
            ("NZBOP_NZBDIR".into(), "/tmp".into()),
        ]);
        for (k, v) in extra {
            env.insert((*k).into(), (*v).into());
        }
        Config::from_lookup(|k| env.get(k).cloned()).unwrap().options
    }

    fn provider(id: u32, level: i32, group: i32) -> Provider {
        Provider {
            id,
            level,
            group_id: group,
            host: format!("news{id}.example.com"),
            port: 119,
            tls: false,
            username: "u".into(),
            password: "p".into(),
            max_conns: 8,
            retention_days: 0.0,
            is_fill: false,
            active: true,
        }
    }

    #[test]
    fn test_from_lookup_reads_server_block() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NZBOP_Server1.Active", "yes"),
            ("NZBOP_Server1.Level", "0"),
            ("NZBOP_Server1.Group", "2"),
            ("NZBOP_Server1.Host", "ssl.news.example.com"),
            ("NZBOP_Server1.Port", "563"),
            ("NZBOP_Server1.Username", "user"),
            ("NZBOP_Server1.Password", "pass"),
            ("NZBOP_Server1.Encryption", "yes"),
            ("NZBOP_Server1.Connections", "20"),
            ("NZBOP_Server1.Retention", "3000"),
        ]);
        let opts = options(&[("NZBPO_FillServers", "1")]);
        let p =
            Provider::from_lookup(1, &|k| env.get(k).map(|v| v.to_string()), &opts).unwrap();
        assert_eq!(p.host, "ssl.news.example.com");
        assert_eq!(p.port, 563);
        assert!(p.tls);
        assert!(p.active);
        assert_eq!(p.group_id, 2);
        assert_eq!(p.max_conns, 20);
        assert_eq!(p.retention_days, 3000.0);
        assert!(p.is_fill);
    }

    #[test]
    fn test_empty_retention_means_unlimited() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NZBOP_Server3.Active", "yes"),
            ("NZBOP_Server3.Level", "1"),
            ("NZBOP_Server3.Group", "0"),
            ("NZBOP_Server3.Host", "h"),
            ("NZBOP_Server3.Port", "119"),
            ("NZBOP_Server3.Username", ""),
            ("NZBOP_Server3.Password", ""),
            ("NZBOP_Server3.Encryption", "no"),
            ("NZBOP_Server3.Connections", "4"),
            ("NZBOP_Server3.Retention", ""),
        ]);
        let opts = options(&[]);
        let p =
            Provider::from_lookup(3, &|k| env.get(k).map(|v| v.to_string()), &opts).unwrap();
        assert_eq!(p.retention_days, 0.0);
    }

    #[test]
    fn test_filter_drops_inactive() {
        let mut p = provider(1, 0, 0);
        p.active = false;
        let kept = filter_providers(vec![p], 3600, &options(&[]), &Reporter::default());
        assert!(kept.is_empty());
    }

    #[test]
    fn test_filter_allow_list() {
        let opts = options(&[("NZBPO_Servers", "1"), ("NZBPO_FillServers", "3")]);
        let mut fill = provider(3, 0, 0);
        fill.is_fill = true;
        let kept = filter_providers(
            vec![provider(1, 0, 0), provider(2, 0, 0), fill],
            // old enough that the fill server passes its age gate
            10 * 3600,
            &opts,
            &Reporter::default(),
        );
        let ids: Vec<u32> = kept.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_filter_fill_server_age_gate() {
        let opts = options(&[("NZBPO_AgeLimit", "4")]);
        let mut fill = provider(2, 1, 0);
        fill.is_fill = true;
        // two hours old: fill server filtered
        let kept = filter_providers(
            vec![provider(1, 0, 0), fill.clone()],
            2 * 3600,
            &opts,
            &Reporter::default(),
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, 1);
        // five hours old: fill server allowed
        let kept = filter_providers(
            vec![provider(1, 0, 0), fill],
            5 * 3600,
            &opts,
            &Reporter::default(),
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_filter_retention() {
        let mut p = provider(1, 0, 0);
        p.retention_days = 10.0;
        // 11 days old: outlived retention
        let kept = filter_providers(vec![p.clone()], 11 * 86_400, &options(&[]), &Reporter::default());
        assert!(kept.is_empty());
        // 9 days old: fine
        let kept = filter_providers(vec![p], 9 * 86_400, &options(&[]), &Reporter::default());
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_group_dedup_keeps_lowest_level() {
        let kept = filter_providers(
            vec![
                provider(1, 2, 1),
                provider(2, 0, 1),
                provider(3, 1, 0),
                provider(4, 5, 0),
                provider(5, 1, 2),
            ],
            3600,
            &options(&[]),
            &Reporter::default(),
        );
        let ids: Vec<u32> = kept.iter().map(|p| p.id).collect();
        // both group-0 servers stay; group 1 keeps id 2 (level 0); group 2 keeps id 5
        assert_eq!(ids, vec![3, 4, 2, 5]);
    }
}
