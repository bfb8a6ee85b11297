//! End-to-end prober scenarios against a scripted in-process news server

mod common;

use common::{MockNews, provider_at, sample_of, spawn_mock_news, test_config};
use nzbget_completion::{AvailabilityProber, Reporter};
use std::collections::HashSet;

fn ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}{i}@example.com")).collect()
}

/// One provider holding everything: miss-ratio 0, every article stamped
/// with provider 1, no further provider consulted.
#[tokio::test]
async fn test_all_good_single_provider() {
    let article_ids = ids("a", 10);
    let (addr, _server) = spawn_mock_news(MockNews::with_present(&article_ids)).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());
    let ratio = prober
        .probe(&sample, &[provider_at(addr, 4)], 10.0, None)
        .await;

    assert_eq!(ratio, 0.0);
    for i in 0..sample.len() {
        assert_eq!(sample.found_on_provider(i), Some(1), "article {i}");
    }
}

/// Authentication path: greeting, 480 on the first STAT, USER/PASS
/// exchange, then normal sampling.
#[tokio::test]
async fn test_auth_path() {
    let article_ids = ids("auth", 6);
    let mut behaviour = MockNews::with_present(&article_ids);
    behaviour.require_auth = true;
    let (addr, _server) = spawn_mock_news(behaviour).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());
    let ratio = prober
        .probe(&sample, &[provider_at(addr, 2)], 10.0, None)
        .await;

    assert_eq!(ratio, 0.0);
    assert_eq!(sample.confirmed_count(), 6);
}

/// Cross-provider merge: articles confirmed on provider 1 are skipped on
/// provider 2, and only provider 2's own misses count in the final ratio.
#[tokio::test]
async fn test_cross_provider_merge() {
    let article_ids = ids("m", 20);
    // provider A holds the first 15 articles
    let a_ids: Vec<String> = article_ids[..15].to_vec();
    // provider B holds everything except m17
    let b_ids: Vec<String> = article_ids
        .iter()
        .filter(|id| !id.starts_with("m17"))
        .cloned()
        .collect();
    let (addr_a, _server_a) = spawn_mock_news(MockNews::with_present(&a_ids)).await;
    let (addr_b, _server_b) = spawn_mock_news(MockNews::with_present(&b_ids)).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    // single session per provider keeps the issue order deterministic
    let providers = vec![provider_at(addr_a, 1), provider_at(addr_b, 1)];
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());
    let ratio = prober.probe(&sample, &providers, 10.0, None).await;

    // provider B misses only m17: 1/20 = 5 %, below the 10 % threshold
    assert_eq!(ratio, 5.0);
    // first confirmation wins: the first 15 stay stamped with provider 1
    for i in 0..15 {
        assert_eq!(sample.found_on_provider(i), Some(1), "article {i}");
    }
    assert_eq!(sample.found_on_provider(17), None);
    let on_second: usize = (15..20)
        .filter(|&i| sample.found_on_provider(i) == Some(2))
        .count();
    assert_eq!(on_second, 4);
    assert_eq!(sample.confirmed_count(), 19);
}

/// A provider that never answers is scored missing via synthesised replies
/// and contributes a 100 % miss.
#[tokio::test]
async fn test_silent_provider_scores_missing() {
    let article_ids = ids("s", 1);
    let mut behaviour = MockNews::with_present(&article_ids);
    behaviour.silent_after_greeting = true;
    let (addr, _server) = spawn_mock_news(behaviour).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());
    let ratio = prober
        .probe(&sample, &[provider_at(addr, 1)], 10.0, None)
        .await;

    assert_eq!(ratio, 100.0);
    assert_eq!(sample.found_on_provider(0), None);
}

/// Account errors kill every session; the provider contributes 100 % and
/// no article is falsely confirmed.
#[tokio::test]
async fn test_fatal_account_error() {
    let article_ids = ids("f", 8);
    let mut behaviour = MockNews::with_present(&article_ids);
    behaviour.fatal_code = Some(502);
    let (addr, _server) = spawn_mock_news(behaviour).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());
    let ratio = prober
        .probe(&sample, &[provider_at(addr, 2)], 10.0, None)
        .await;

    assert_eq!(ratio, 100.0);
    assert_eq!(sample.confirmed_count(), 0);
}

/// A broken first provider does not doom the release when a later provider
/// holds the articles.
#[tokio::test]
async fn test_second_provider_rescues() {
    let article_ids = ids("r", 10);
    let (addr_a, _server_a) =
        spawn_mock_news(MockNews::with_present(&Vec::<String>::new())).await;
    let (addr_b, _server_b) = spawn_mock_news(MockNews::with_present(&article_ids)).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    let providers = vec![provider_at(addr_a, 1), provider_at(addr_b, 2)];
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());
    let ratio = prober.probe(&sample, &providers, 10.0, None).await;

    assert_eq!(ratio, 0.0);
    for i in 0..sample.len() {
        assert_eq!(sample.found_on_provider(i), Some(2), "article {i}");
    }
}

/// Probing twice with everything available is idempotent: the second run
/// skips every confirmed article and still reports success.
#[tokio::test]
async fn test_repeat_probe_is_idempotent() {
    let article_ids = ids("i", 5);
    let (addr, _server) = spawn_mock_news(MockNews::with_present(&article_ids)).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    let providers = vec![provider_at(addr, 2)];
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());

    let first = prober.probe(&sample, &providers, 10.0, None).await;
    let second = prober.probe(&sample, &providers, 10.0, None).await;
    assert_eq!(first, 0.0);
    assert_eq!(second, 0.0);
    // stamps are unchanged by the second run
    let stamps: HashSet<Option<u32>> = (0..sample.len())
        .map(|i| sample.found_on_provider(i))
        .collect();
    assert_eq!(stamps, HashSet::from([Some(1)]));
}

/// Availability accounting never exceeds the sample size.
#[tokio::test]
async fn test_confirmations_bounded_by_sample() {
    let article_ids = ids("b", 12);
    let present: Vec<String> = article_ids[..6].to_vec();
    let (addr, _server) = spawn_mock_news(MockNews::with_present(&present)).await;

    let config = test_config(&[]);
    let sample = sample_of(&article_ids);
    let prober = AvailabilityProber::new(&config.tuning, &config.options, Reporter::default());
    // threshold high enough that the whole sample is probed
    let ratio = prober
        .probe(&sample, &[provider_at(addr, 3)], 80.0, None)
        .await;

    let confirmed = sample.confirmed_count();
    let missing = (ratio / 100.0 * sample.len() as f64).round() as usize;
    assert!(confirmed + missing <= sample.len());
    assert_eq!(confirmed, 6);
}
