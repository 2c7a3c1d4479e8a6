/// Explicit engine context — constructed once at process start and passed by
/// reference into every engine operation. Nothing in the engine reaches for
/// ambient global state.
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source. Abstracted so the buffering window and record
/// timestamps are deterministic under test.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production clock backed by the system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Engine-wide context.
#[derive(Clone)]
pub struct EngineContext {
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        EngineContext { clock }
    }

    /// Context with the real system clock.
    pub fn system() -> Self {
        EngineContext {
            clock: Arc::new(SystemClock),
        }
    }

    /// Context with a fixed clock, for tests.
    pub fn for_tests(now_ms: u64) -> Self {
        struct Fixed(u64);
        impl Clock for Fixed {
            fn now_ms(&self) -> u64 {
                self.0
            }
        }
        EngineContext {
            clock: Arc::new(Fixed(now_ms)),
        }
    }
}
