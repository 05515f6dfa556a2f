use tokio::time::Instant;

/// Monotonic millisecond clock.
///
/// All schedule deadlines are expressed as u64 milliseconds relative to the
/// clock's epoch, so comparisons stay valid over the whole value range and
/// never observe platform tick wraparound. Built on the runtime clock so
/// paused-time tests drive it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::Clock;

    #[tokio::test]
    async fn monotonic() {
        let clock = Clock::start();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_runtime_clock() {
        let clock = Clock::start();
        assert_eq!(clock.now_ms(), 0);
        tokio::time::advance(std::time::Duration::from_millis(1234)).await;
        assert_eq!(clock.now_ms(), 1234);
    }
}
