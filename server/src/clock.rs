//! Monotonic server clock.
//!
//! All session and connection timestamps are milliseconds since the server
//! started. The clock is built on `tokio::time::Instant`, so tests running on
//! a paused runtime can advance it deterministically.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    started: Instant,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Milliseconds elapsed since start.
    pub fn now_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// Low 32 bits of [`now_ms`](Self::now_ms), the form used on the wire.
    pub fn now_wire(&self) -> u32 {
        self.now_ms() as u32
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = ServerClock::new();
        assert_eq!(clock.now_ms(), 0);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_ms(), 1_500);
        assert_eq!(clock.now_wire(), 1_500);
    }
}
