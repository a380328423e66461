use std::time::Duration;

use tokio::time::Instant;

/// Releases frame indices `1..=count` on a fixed cadence.
///
/// Index `i` is released no earlier than `(i - 1) * interval` after the
/// scheduler was created. Slots are computed from the fixed start, so a slow
/// consumer never pushes later slots back; it only finds them already due.
#[derive(Debug)]
pub struct FrameScheduler {
    count: u64,
    interval: Duration,
    start: Instant,
    next: u64,
}

impl FrameScheduler {
    pub fn new(count: u64, interval: Duration) -> FrameScheduler {
        FrameScheduler {
            count,
            interval,
            start: Instant::now(),
            next: 1,
        }
    }

    /// When frame `index` may be dispatched.
    pub fn slot(&self, index: u64) -> Instant {
        let periods = u32::try_from(index.saturating_sub(1)).unwrap_or(u32::MAX);
        self.start
            .checked_add(self.interval.saturating_mul(periods))
            .unwrap_or_else(far_future)
    }

    /// Waits for the next slot and returns its index, or `None` once every
    /// frame has been released.
    ///
    /// Cancel safe: dropping the future before it completes releases nothing.
    pub async fn next(&mut self) -> Option<u64> {
        if self.next > self.count {
            return None;
        }
        let index = self.next;
        tokio::time::sleep_until(self.slot(index)).await;
        self.next += 1;
        Some(index)
    }

    pub fn remaining(&self) -> u64 {
        // `next` never exceeds `count + 1`.
        self.count - (self.next - 1)
    }
}

/// A slot too far out to represent; roughly thirty years from now.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;

    const INTERVAL: Duration = Duration::from_millis(33);

    #[tokio::test(start_paused = true)]
    async fn releases_indices_on_their_slots() {
        let mut schedule = FrameScheduler::new(4, INTERVAL);
        let start = Instant::now();

        for i in 1..=4u64 {
            assert_eq!(schedule.next().await, Some(i));
            assert_eq!(start.elapsed(), INTERVAL * (i as u32 - 1));
        }
        assert_eq!(schedule.next().await, None);
        assert_eq!(schedule.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn next_frame_waits_for_its_slot() {
        let mut schedule = FrameScheduler::new(2, INTERVAL);
        assert_eq!(schedule.next().await, Some(1));

        let mut next = task::spawn(schedule.next());
        assert_pending!(next.poll());

        tokio::time::advance(INTERVAL - Duration::from_millis(1)).await;
        assert_pending!(next.poll());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_ready_eq!(next.poll(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_does_not_cause_drift() {
        let mut schedule = FrameScheduler::new(5, INTERVAL);
        let start = Instant::now();

        assert_eq!(schedule.next().await, Some(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Slots 2..=4 are already due at 100ms.
        for i in 2..=4u64 {
            assert_eq!(schedule.next().await, Some(i));
            assert_eq!(start.elapsed(), Duration::from_millis(100));
        }
        assert_eq!(schedule.next().await, Some(5));
        assert_eq!(start.elapsed(), INTERVAL * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_frames_release_nothing() {
        let mut schedule = FrameScheduler::new(0, INTERVAL);
        assert_eq!(schedule.remaining(), 0);
        assert_eq!(schedule.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_releases_nothing() {
        let mut schedule = FrameScheduler::new(3, INTERVAL);
        assert_eq!(schedule.next().await, Some(1));

        let cancelled = tokio::time::timeout(Duration::from_millis(5), schedule.next()).await;
        assert!(cancelled.is_err());
        assert_eq!(schedule.remaining(), 2);
        assert_eq!(schedule.next().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn largest_count_reports_what_remains() {
        let mut schedule = FrameScheduler::new(u64::MAX, INTERVAL);
        assert_eq!(schedule.remaining(), u64::MAX);
        assert_eq!(schedule.next().await, Some(1));
        assert_eq!(schedule.remaining(), u64::MAX - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_interval_does_not_overflow_the_clock() {
        let mut schedule = FrameScheduler::new(3, Duration::MAX);
        assert_eq!(schedule.next().await, Some(1));
        assert!(schedule.slot(2) > Instant::now());

        let mut next = task::spawn(schedule.next());
        assert_pending!(next.poll());
    }
}
