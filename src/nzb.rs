//! NZB descriptor parsing and probe sampling
//!
//! An NZB is the XML description of a binary release: `<file>` entries with
//! a `<groups>` block and `<segments>` holding one message-ID per article.
//! This module extracts the articles, splits par2 parity from payload files,
//! and samples the payload articles that the prober will `STAT`.
//!
//! Reference: https://sabnzbd.org/wiki/extra/nzb-spec

use crate::config::Options;
use crate::error::{CompletionError, DescriptorError, Result};
use crate::report::Reporter;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// One article extracted from the descriptor, before sampling
#[derive(Debug, Clone)]
pub struct NzbArticle {
    /// Subject of the containing `<file>`
    pub subject: String,
    /// Whether the containing file is par2 parity
    pub is_par: bool,
    /// Newsgroups of the containing file; the first is used for `GROUP`
    pub groups: Arc<Vec<String>>,
    /// Message-ID without angle brackets, XML entities unescaped
    pub message_id: String,
}

/// Parse counts reported in verbose mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArticleCounts {
    /// All articles in the descriptor
    pub total: usize,
    /// Payload (non-par) articles
    pub rar: usize,
    /// Par2 articles
    pub par: usize,
}

/// The sampled articles of one release, shared across provider runs
///
/// Descriptors are immutable; the confirmation column is a parallel vector
/// of atomics so concurrent sessions can stamp articles without locking.
/// A slot holds `-1` until some provider confirms the article, then the
/// 1-based ordinal of that provider. The first confirmation wins.
#[derive(Debug, Clone)]
pub struct ProbeSet {
    articles: Arc<Vec<NzbArticle>>,
    found: Arc<Vec<AtomicI32>>,
}

impl ProbeSet {
    /// Wrap sampled articles into a shareable probe set
    pub fn new(articles: Vec<NzbArticle>) -> Self {
        let found = (0..articles.len()).map(|_| AtomicI32::new(-1)).collect();
        Self {
            articles: Arc::new(articles),
            found: Arc::new(found),
        }
    }

    /// Number of sampled articles
    pub fn len(&self) -> usize {
        self.articles.len()
    }

    /// True when the sample is empty
    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    /// Article descriptor by sample index
    pub fn article(&self, index: usize) -> &NzbArticle {
        &self.articles[index]
    }

    /// Provider ordinal (1-based) that confirmed the article, if any
    pub fn found_on_provider(&self, index: usize) -> Option<u32> {
        match self.found[index].load(Ordering::Acquire) {
            n if n >= 1 => Some(n as u32),
            _ => None,
        }
    }

    /// Stamp an article as present on the given provider ordinal
    ///
    /// Returns false when an earlier provider already confirmed it.
    pub fn confirm(&self, index: usize, provider_ordinal: u32) -> bool {
        self.found[index]
            .compare_exchange(
                -1,
                provider_ordinal as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Number of articles confirmed on any provider
    pub fn confirmed_count(&self) -> usize {
        self.found
            .iter()
            .filter(|f| f.load(Ordering::Acquire) >= 1)
            .count()
    }
}

/// Parse descriptor XML into its articles
///
/// Single-line documents need no special handling here: the XML reader does
/// not care about physical lines. Message-IDs and subjects come out with XML
/// entities unescaped.
pub fn parse_articles(xml: &str) -> Result<Vec<NzbArticle>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut articles = Vec::new();
    let mut subject = String::new();
    let mut is_par = false;
    let mut groups: Arc<Vec<String>> = Arc::new(Vec::new());
    let mut pending_groups: Vec<String> = Vec::new();
    let mut in_groups = false;
    let mut in_segment = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"file" => {
                    subject.clear();
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"subject" {
                            subject = attr.unescape_value().unwrap_or_default().to_string();
                        }
                    }
                    is_par = subject.to_ascii_lowercase().contains(".par2");
                }
                b"groups" => {
                    in_groups = true;
                    pending_groups.clear();
                }
                b"segment" => in_segment = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"groups" => {
                    in_groups = false;
                    groups = Arc::new(std::mem::take(&mut pending_groups));
                }
                b"segment" => in_segment = false,
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if in_groups {
                    pending_groups.push(text);
                } else if in_segment {
                    articles.push(NzbArticle {
                        subject: subject.clone(),
                        is_par,
                        groups: Arc::clone(&groups),
                        message_id: text,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CompletionError::InvalidResponse(format!(
                    "NZB parse error: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(articles)
}

/// Select the payload articles to probe
///
/// Par articles never enter the sample but their count decides whether the
/// full-check branch applies. Otherwise every `stride`-th payload article is
/// taken, with the stride widened or narrowed to keep the sample between
/// `MinArticles` and `MaxArticles`.
pub fn sample_articles(
    articles: Vec<NzbArticle>,
    opts: &Options,
) -> std::result::Result<(Vec<NzbArticle>, ArticleCounts), DescriptorError> {
    let total = articles.len();
    let (rar, par): (Vec<_>, Vec<_>) = articles.into_iter().partition(|a| !a.is_par);
    let counts = ArticleCounts {
        total,
        rar: rar.len(),
        par: par.len(),
    };

    if rar.is_empty() {
        return Err(DescriptorError::NoRarArticles);
    }

    let stride = if opts.full_check_no_pars && counts.par <= 1 {
        1
    } else {
        let mut stride = (100 / opts.check_limit_percent.max(1)).max(1) as usize;
        if rar.len() / stride > opts.max_articles.max(1) {
            stride = (rar.len() / opts.max_articles.max(1)).max(1);
        } else if rar.len() / stride < opts.min_articles.max(1) {
            stride = (rar.len() / opts.min_articles.max(1)).max(1);
        }
        stride
    };

    let sampled: Vec<NzbArticle> = rar.into_iter().step_by(stride).collect();
    Ok((sampled, counts))
}

/// Load a descriptor file and produce the sampled probe set
///
/// The three descriptor failures are returned as [`DescriptorError`]; the
/// caller resumes the release with a warning for each of them.
pub fn load_probe_set(
    path: &Path,
    opts: &Options,
    reporter: &Reporter,
) -> std::result::Result<ProbeSet, DescriptorError> {
    if !path.is_file() {
        reporter.error("No such nzb file.");
        return Err(DescriptorError::NoSuchFile);
    }
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(_) => {
            reporter.error("No such nzb file.");
            return Err(DescriptorError::NoSuchFile);
        }
    };
    let xml = String::from_utf8_lossy(&raw);

    let articles = match parse_articles(&xml) {
        Ok(articles) => articles,
        Err(_) => {
            reporter.error("No message-ids found in NZB file");
            return Err(DescriptorError::Invalid);
        }
    };

    if articles.is_empty() {
        reporter.error("No message-ids found in NZB file");
        return Err(DescriptorError::Invalid);
    }
    if articles.iter().all(|a| a.groups.is_empty()) {
        reporter.error("No group found in NZB file.");
        return Err(DescriptorError::Invalid);
    }

    let (sampled, counts) = sample_articles(articles, opts)?;
    reporter.verbose(format!(
        "NZB contains {} articles, {} rar articles, {} par2 articles.",
        counts.total, counts.rar, counts.par
    ));
    reporter.verbose(format!("{} rar articles will be checked.", sampled.len()));
    Ok(ProbeSet::new(sampled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;

    const SIMPLE_NZB: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="up@example.com" date="1600000000" subject="&quot;release.part01.rar&quot; yEnc (1/2)">
    <groups>
      <group>alt.binaries.test</group>
      <group>alt.binaries.backup</group>
    </groups>
    <segments>
      <segment bytes="768000" number="1">rar-seg1@example.com</segment>
      <segment bytes="768000" number="2">rar-seg2@example.com</segment>
    </segments>
  </file>
  <file poster="up@example.com" date="1600000000" subject="&quot;release.vol00+01.PAR2&quot; yEnc (1/1)">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="50000" number="1">par-seg1@example.com</segment>
    </segments>
  </file>
</nzb>"#;

    fn test_options() -> Options {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NZBOP_CONTROLIP", "127.0.0.1"),
            ("NZBOP_CONTROLPORT", "6789"),
            ("NZBOP_CONTROLUSERNAME", "u"),
            ("NZBOP_CONTROLPASSWORD", "p"),
            ("NZBOP_TEMPDIR", "/tmp"),
            ("NZBOP_NZBDIR", "/tmp"),
        ]);
        Config::from_lookup(|k| env.get(k).map(|v| v.to_string()))
            .unwrap()
            .options
    }

    fn article(id: &str, par: bool) -> NzbArticle {
        NzbArticle {
            subject: if par { "x.par2".into() } else { "x.rar".into() },
            is_par: par,
            groups: Arc::new(vec!["alt.binaries.test".to_string()]),
            message_id: id.to_string(),
        }
    }

    #[test]
    fn test_parse_articles_groups_and_par_split() {
        let articles = parse_articles(SIMPLE_NZB).unwrap();
        assert_eq!(articles.len(), 3);
        assert!(!articles[0].is_par);
        assert!(!articles[1].is_par);
        assert!(articles[2].is_par);
        assert_eq!(articles[0].groups.len(), 2);
        assert_eq!(articles[0].groups[0], "alt.binaries.test");
        assert_eq!(articles[0].message_id, "rar-seg1@example.com");
        assert!(articles[0].subject.contains("release.part01.rar"));
    }

    #[test]
    fn test_parse_single_line_document() {
        let single_line = SIMPLE_NZB.replace('\n', "");
        let articles = parse_articles(&single_line).unwrap();
        assert_eq!(articles.len(), 3);
        assert_eq!(articles[2].message_id, "par-seg1@example.com");
    }

    #[test]
    fn test_parse_unescapes_message_ids() {
        let xml = r#"<nzb><file subject="a.rar"><groups><group>alt.test</group></groups>
            <segments><segment bytes="1" number="1">&lt;part1&amp;x@example.com&gt;</segment></segments>
            </file></nzb>"#;
        let articles = parse_articles(xml).unwrap();
        assert_eq!(articles[0].message_id, "<part1&x@example.com>");
    }

    #[test]
    fn test_sample_full_check_when_one_par() {
        let mut input: Vec<NzbArticle> =
            (0..200).map(|i| article(&format!("r{i}@x"), false)).collect();
        input.push(article("p@x", true));
        let (sampled, counts) = sample_articles(input, &test_options()).unwrap();
        // one par file and FullCheckNoPars on: every payload article sampled
        assert_eq!(sampled.len(), 200);
        assert_eq!(counts.par, 1);
        assert_eq!(counts.rar, 200);
    }

    #[test]
    fn test_sample_stride_from_check_limit() {
        // 1000 rar + enough pars to leave the normal branch
        let mut input: Vec<NzbArticle> =
            (0..1000).map(|i| article(&format!("r{i}@x"), false)).collect();
        for i in 0..10 {
            input.push(article(&format!("p{i}@x"), true));
        }
        let (sampled, _) = sample_articles(input, &test_options()).unwrap();
        // CheckLimit 10% -> stride 10 -> 100 samples
        assert_eq!(sampled.len(), 100);
        assert_eq!(sampled[0].message_id, "r0@x");
        assert_eq!(sampled[1].message_id, "r10@x");
    }

    #[test]
    fn test_sample_stride_widens_at_max_articles() {
        let mut opts = test_options();
        opts.max_articles = 20;
        let mut input: Vec<NzbArticle> =
            (0..1000).map(|i| article(&format!("r{i}@x"), false)).collect();
        input.push(article("p0@x", true));
        input.push(article("p1@x", true));
        let (sampled, _) = sample_articles(input, &opts).unwrap();
        // stride widened from 10 to 1000/20 = 50
        assert_eq!(sampled.len(), 20);
    }

    #[test]
    fn test_sample_stride_narrows_at_min_articles() {
        let mut input: Vec<NzbArticle> =
            (0..120).map(|i| article(&format!("r{i}@x"), false)).collect();
        input.push(article("p0@x", true));
        input.push(article("p1@x", true));
        let (sampled, _) = sample_articles(input, &test_options()).unwrap();
        // 120/10 = 12 < MinArticles 50 -> stride 120/50 = 2 -> 60 samples
        assert_eq!(sampled.len(), 60);
    }

    #[test]
    fn test_sample_no_rar_articles() {
        let input = vec![article("p@x", true)];
        let err = sample_articles(input, &test_options()).unwrap_err();
        assert_eq!(err, DescriptorError::NoRarArticles);
    }

    #[test]
    fn test_probe_set_first_confirmation_wins() {
        let set = ProbeSet::new(vec![article("a@x", false), article("b@x", false)]);
        assert_eq!(set.found_on_provider(0), None);
        assert!(set.confirm(0, 1));
        assert!(!set.confirm(0, 2));
        assert_eq!(set.found_on_provider(0), Some(1));
        assert_eq!(set.confirmed_count(), 1);
    }

    #[test]
    fn test_load_probe_set_missing_file() {
        let reporter = Reporter::default();
        let err = load_probe_set(
            Path::new("/nonexistent/release.nzb.queued"),
            &test_options(),
            &reporter,
        )
        .unwrap_err();
        assert_eq!(err, DescriptorError::NoSuchFile);
    }

    #[test]
    fn test_load_probe_set_invalid_nzb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.nzb.queued");
        std::fs::write(&path, "<nzb></nzb>").unwrap();
        let err = load_probe_set(&path, &test_options(), &Reporter::default()).unwrap_err();
        assert_eq!(err, DescriptorError::Invalid);
    }

    #[test]
    fn test_load_probe_set_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.nzb.queued");
        std::fs::write(&path, SIMPLE_NZB).unwrap();
        let set = load_probe_set(&path, &test_options(), &Reporter::default()).unwrap();
        // one par file in the release: full check of both rar articles
        assert_eq!(set.len(), 2);
        assert_eq!(set.article(0).message_id, "rar-seg1@example.com");
    }
}
