//! Multi-provider availability prober
//!
//! Providers run strictly one after another in filtered order. Each run
//! stamps the articles it confirms with the provider's 1-based ordinal, so
//! later providers only probe what is still unconfirmed: an article missing
//! on server N but present on server N+1 is not a failure. The reported
//! miss-ratio is always the one of the last provider that ran.

use crate::config::{Options, Tuning};
use crate::nzb::ProbeSet;
use crate::pool::SessionPool;
use crate::providers::Provider;
use crate::report::Reporter;
use tokio::time::Instant;
use tracing::debug;

/// Drives the session pools across providers for one release
pub struct AvailabilityProber<'a> {
    tuning: &'a Tuning,
    max_failure: f64,
    reporter: Reporter,
}

impl<'a> AvailabilityProber<'a> {
    /// Create a prober with the probe tuning and the `MaxFailure` override
    pub fn new(tuning: &'a Tuning, options: &Options, reporter: Reporter) -> Self {
        Self {
            tuning,
            max_failure: options.max_failure,
            reporter,
        }
    }

    /// Probe the sample across the filtered providers
    ///
    /// Returns the final miss-ratio in percent. An empty provider list is a
    /// 100 % miss. Provider-scoped failures (no socket dialed, slow-session
    /// abandon) contribute 100 % for that provider only; the loop then moves
    /// on to the next provider.
    pub async fn probe(
        &self,
        sample: &ProbeSet,
        providers: &[Provider],
        threshold: f64,
        host_active_at: Option<Instant>,
    ) -> f64 {
        if providers.is_empty() || sample.is_empty() {
            return 100.0;
        }

        let mut miss_ratio = 0.0;
        for (k, provider) in providers.iter().enumerate() {
            if miss_ratio > self.max_failure && self.max_failure != 0.0 {
                self.reporter.warning("failure ratio > MaxFailure.");
                break;
            }

            self.reporter.info(format!("Using server: {}", provider.host));
            self.reporter.flush();
            let started = Instant::now();

            let pool = SessionPool::new(provider, self.tuning, self.reporter);
            let report = pool
                .run(
                    sample,
                    (k + 1) as u32,
                    threshold,
                    self.max_failure,
                    host_active_at,
                )
                .await;

            if report.dialed == 0 {
                self.reporter
                    .warning(format!("Skipping server: {}", provider.host));
                miss_ratio = 100.0;
                continue;
            }

            miss_ratio = if report.loop_failed {
                100.0
            } else {
                report.missing as f64 * 100.0 / sample.len() as f64
            };
            debug!(
                "provider {} sent {} missing {} ratio {:.1}",
                provider.host, report.sent, report.missing, miss_ratio
            );
            self.reporter.info(format!(
                "Failed ratio for server: {}: {:.1}%. Server check completed in {:.2} sec.",
                provider.host,
                miss_ratio,
                started.elapsed().as_secs_f64()
            ));

            // good enough on this provider: no need to consult the rest
            if miss_ratio < threshold || miss_ratio == 0.0 {
                break;
            }
        }
        miss_ratio
    }
}
