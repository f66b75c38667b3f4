//! Injectable timer source so every component can be driven by
//! `tokio::time::{pause, advance}` in tests instead of wall time.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::ports::Clock;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(dur))
    }
}

/// Test clock backed by the same `tokio::time` virtual clock used by
/// `#[tokio::test(start_paused = true)]`; distinct from [`SystemClock`]
/// only in name, so call sites document intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestClock;

impl Clock for TestClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(dur))
    }
}
