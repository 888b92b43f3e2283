use std::time::Duration;

use tokio::time::Instant;

/// Token-bucket pacer for one direction of a connection.
///
/// Tokens are bytes: they accrue at the configured rate and are spent by [RateMonitor::update]
///  as bytes actually move. [RateMonitor::limit] parks the caller until the requested transfer
///  fits under the average rate. The bucket is clamped to one request's worth of burst, so bytes
///  moved in any rolling window stay within the rate plus a single request.
///
/// The balance may go negative: the send loop asks for one packet and then emits a whole batch,
///  and the resulting debt stretches the next wait accordingly.
pub struct RateMonitor {
    tokens: f64,
    last_refill: Instant,
}

impl RateMonitor {
    pub fn new() -> RateMonitor {
        RateMonitor {
            tokens: 0.0,
            // backdated so the first request finds a full bucket
            last_refill: Instant::now() - Duration::from_secs(1),
        }
    }

    /// Returns once transferring `want_bytes` more bytes would not exceed `rate_bps` on average,
    ///  sleeping as long as necessary. With `block == false` it returns immediately, leaving it
    ///  to the caller to deal with an over-budget transfer.
    pub async fn limit(&mut self, want_bytes: usize, rate_bps: i64, block: bool) {
        let rate = rate_bps as f64;
        let capacity = want_bytes as f64;

        self.refill(rate, capacity);
        if self.tokens >= capacity || !block {
            return;
        }

        let wait = Duration::from_secs_f64((capacity - self.tokens) / rate);
        tokio::time::sleep(wait).await;
        self.refill(rate, capacity);
    }

    /// Records `n` bytes actually transferred.
    pub fn update(&mut self, n: usize) {
        self.tokens -= n as f64;
    }

    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_request_passes_immediately() {
        let mut monitor = RateMonitor::new();

        let before = Instant::now();
        monitor.limit(1024, 1024, true).await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_budget_recovers() {
        let mut monitor = RateMonitor::new();

        monitor.limit(1024, 1024, true).await;
        monitor.update(1024);

        // the bucket is empty, so the next request must wait roughly one second at 1024 B/s
        let before = Instant::now();
        monitor.limit(1024, 1024, true).await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(900), "waited only {:?}", waited);
        assert!(waited <= Duration::from_millis(1100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debt_stretches_the_wait() {
        let mut monitor = RateMonitor::new();

        monitor.limit(1024, 1024, true).await;
        // a batch overshoots what was asked for
        monitor.update(3072);

        let before = Instant::now();
        monitor.limit(1024, 1024, true).await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(2900), "waited only {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_returns_immediately() {
        let mut monitor = RateMonitor::new();
        monitor.update(1_000_000);

        let before = Instant::now();
        monitor.limit(1024, 1024, false).await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_does_not_bank_burst() {
        let mut monitor = RateMonitor::new();

        monitor.limit(1024, 1024, true).await;
        monitor.update(1024);

        // a long idle stretch must not allow more than one request's worth at once
        tokio::time::sleep(Duration::from_secs(60)).await;

        monitor.limit(1024, 1024, true).await;
        monitor.update(1024);

        let before = Instant::now();
        monitor.limit(1024, 1024, true).await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(900), "waited only {:?}", waited);
    }
}
