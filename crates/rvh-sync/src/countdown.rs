use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Fan-in barrier: waiters wake once `count_down` has been called `expected` times.
#[derive(Debug)]
pub struct Countdown {
    remaining: AtomicUsize,
    reached_zero: Notify,
}

impl Countdown {
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            reached_zero: Notify::new(),
        }
    }

    /// Extra calls after zero are ignored.
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.reached_zero.notify_waiters();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// `true` if the count reached zero before `timeout` elapsed.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let reached = async {
            loop {
                let notified = self.reached_zero.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.remaining() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, reached).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn zero_expected_is_already_done() {
        assert!(Countdown::new(0).wait(Duration::from_millis(1)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wakes_when_all_parties_arrive() {
        let countdown = Arc::new(Countdown::new(3));
        for delay in [5u64, 10, 15] {
            let countdown = countdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                countdown.count_down();
            });
        }
        assert!(countdown.wait(Duration::from_secs(5)).await);
        assert_eq!(countdown.remaining(), 0);
    }

    #[tokio::test]
    async fn times_out_when_a_party_is_missing() {
        let countdown = Countdown::new(2);
        countdown.count_down();
        assert!(!countdown.wait(Duration::from_millis(30)).await);
        assert_eq!(countdown.remaining(), 1);
    }

    #[test]
    fn extra_count_downs_saturate_at_zero() {
        let countdown = Countdown::new(1);
        countdown.count_down();
        countdown.count_down();
        assert_eq!(countdown.remaining(), 0);
    }
}
