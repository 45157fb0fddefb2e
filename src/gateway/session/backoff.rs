use std::time::Duration;

/// First retry after a drop is quick; every retry after that waits the
/// longer "failed reconnect" delay. There is no attempt limit.
pub(super) struct Backoff {
    initial: Duration,
    failed: Duration,
    attempt: u32,
}

impl Backoff {
    pub(super) fn new(initial: Duration, failed: Duration) -> Self {
        Self {
            initial,
            failed,
            attempt: 0,
        }
    }

    pub(super) fn next(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt == 1 {
            self.initial
        } else {
            self.failed
        }
    }

    pub(super) fn reset(&mut self) {
        self.attempt = 0;
    }
}
