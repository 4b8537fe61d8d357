//! Admission control for page claims.
//!
//! The throttle is advisory backpressure: it tells a worker how long to wait
//! before claiming its next page so reindexing does not saturate the store that
//! also serves live traffic.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

/// Supplies the delay to wait before each page claim.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait ThrottleController: Send + Sync {
    /// Delay before the next claim. Errors are logged by the caller and
    /// treated as zero delay.
    async fn next_delay(&self) -> Result<Duration>;

    /// Observe that a page finished, with the number of resources it touched.
    async fn record_page(&self, _resources: u64, _elapsed: Duration) {}
}

/// Throttle that never delays.
pub struct NoOpThrottle;

#[async_trait]
impl ThrottleController for NoOpThrottle {
    async fn next_delay(&self) -> Result<Duration> {
        Ok(Duration::ZERO)
    }
}

/// Configuration for [`ResourceRateThrottle`].
#[derive(Debug, Clone)]
pub struct ResourceRateThrottleConfig {
    /// Resources the engine may reindex per minute before claims are delayed
    pub max_resources_per_minute: u64,
    /// Delay applied to every claim, even under budget
    pub min_delay: Duration,
    /// Random extra delay, up to this fraction of the computed delay, so that
    /// workers released together do not claim in lockstep
    pub jitter_ratio: f64,
    pub enabled: bool,
}

impl Default for ResourceRateThrottleConfig {
    fn default() -> Self {
        Self {
            max_resources_per_minute: 50_000,
            min_delay: Duration::ZERO,
            jitter_ratio: 0.1,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
struct PageRecord {
    finished_at: Instant,
    resources: u64,
}

/// Sliding-window throttle keyed on resources processed in the last minute.
pub struct ResourceRateThrottle {
    pages: Mutex<VecDeque<PageRecord>>,
    config: ResourceRateThrottleConfig,
}

impl ResourceRateThrottle {
    pub fn new(config: ResourceRateThrottleConfig) -> Self {
        Self {
            pages: Mutex::new(VecDeque::new()),
            config,
        }
    }

    fn prune(pages: &mut VecDeque<PageRecord>, now: Instant) {
        while let Some(front) = pages.front() {
            if now.duration_since(front.finished_at) > WINDOW {
                pages.pop_front();
            } else {
                break;
            }
        }
    }

    fn resources_in_window(pages: &VecDeque<PageRecord>) -> u64 {
        pages.iter().map(|p| p.resources).sum()
    }

    /// Delay until enough of the window has expired to be under budget again.
    fn budget_delay(&self, pages: &VecDeque<PageRecord>, now: Instant) -> Duration {
        let mut in_window = Self::resources_in_window(pages);
        if in_window < self.config.max_resources_per_minute {
            return Duration::ZERO;
        }
        for page in pages {
            in_window -= page.resources;
            if in_window < self.config.max_resources_per_minute {
                return (page.finished_at + WINDOW).saturating_duration_since(now);
            }
        }
        WINDOW
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if delay.is_zero() || self.config.jitter_ratio <= 0.0 {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..self.config.jitter_ratio);
        delay + delay.mul_f64(extra)
    }

    /// Resources counted in the current window.
    pub async fn current_load(&self) -> u64 {
        let mut pages = self.pages.lock().await;
        Self::prune(&mut pages, Instant::now());
        Self::resources_in_window(&pages)
    }
}

#[async_trait]
impl ThrottleController for ResourceRateThrottle {
    async fn next_delay(&self) -> Result<Duration> {
        if !self.config.enabled {
            return Ok(Duration::ZERO);
        }
        let mut pages = self.pages.lock().await;
        let now = Instant::now();
        Self::prune(&mut pages, now);

        let delay = self.with_jitter(self.budget_delay(&pages, now));
        Ok(delay.max(self.config.min_delay))
    }

    async fn record_page(&self, resources: u64, _elapsed: Duration) {
        let mut pages = self.pages.lock().await;
        let now = Instant::now();
        Self::prune(&mut pages, now);
        pages.push_back(PageRecord {
            finished_at: now,
            resources,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(max_per_minute: u64) -> ResourceRateThrottleConfig {
        ResourceRateThrottleConfig {
            max_resources_per_minute: max_per_minute,
            min_delay: Duration::ZERO,
            jitter_ratio: 0.0,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_no_op_never_delays() {
        let throttle = NoOpThrottle;
        throttle.record_page(1_000_000, Duration::from_secs(1)).await;
        assert_eq!(throttle.next_delay().await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_under_budget_no_delay() {
        let throttle = ResourceRateThrottle::new(make_config(100));
        throttle.record_page(40, Duration::from_millis(5)).await;
        throttle.record_page(40, Duration::from_millis(5)).await;
        assert_eq!(throttle.next_delay().await.unwrap(), Duration::ZERO);
        assert_eq!(throttle.current_load().await, 80);
    }

    #[tokio::test]
    async fn test_over_budget_delays_within_window() {
        let throttle = ResourceRateThrottle::new(make_config(100));
        throttle.record_page(100, Duration::from_millis(5)).await;

        let delay = throttle.next_delay().await.unwrap();
        assert!(delay > Duration::ZERO);
        assert!(delay <= WINDOW);
    }

    #[tokio::test]
    async fn test_disabled_never_delays() {
        let throttle = ResourceRateThrottle::new(ResourceRateThrottleConfig {
            enabled: false,
            min_delay: Duration::from_secs(5),
            ..make_config(1)
        });
        throttle.record_page(1_000, Duration::from_millis(5)).await;
        assert_eq!(throttle.next_delay().await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_min_delay_applies_under_budget() {
        let throttle = ResourceRateThrottle::new(ResourceRateThrottleConfig {
            min_delay: Duration::from_millis(250),
            ..make_config(100)
        });
        assert_eq!(
            throttle.next_delay().await.unwrap(),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn test_jitter_only_adds() {
        let throttle = ResourceRateThrottle::new(ResourceRateThrottleConfig {
            jitter_ratio: 0.5,
            ..make_config(10)
        });
        throttle.record_page(10, Duration::from_millis(5)).await;
        let delay = throttle.next_delay().await.unwrap();
        assert!(delay > Duration::from_secs(50));
        assert!(delay <= WINDOW.mul_f64(1.5));
    }
}
