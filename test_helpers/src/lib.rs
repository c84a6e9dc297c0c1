//! Shared helpers for the workspace's tests.

use std::{
    sync::Once,
    thread,
    time::{Duration, Instant},
};

pub mod tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

static LOG_SETUP: Once = Once::new();

/// Enable log output for tests when `TEST_LOG` is set, using `RUST_LOG` as
/// the filter (default `debug`).
///
/// Safe to call from every test; the subscriber is installed once.
pub fn maybe_start_logging() {
    let _ = dotenvy::dotenv();
    if std::env::var_os("TEST_LOG").is_some() {
        start_logging();
    }
}

/// Install a global fmt subscriber writing to the test output.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}

/// Poll `f` every 10ms until it returns true or `timeout` elapses, returning
/// the last result.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Assert that `cond` becomes true within `timeout`, polling like
/// [`wait_until`].
#[macro_export]
macro_rules! assert_eventually {
    ($timeout:expr, $cond:expr $(,)?) => {
        assert!(
            $crate::wait_until($timeout, || $cond),
            "condition not met within {:?}: {}",
            $timeout,
            stringify!($cond)
        )
    };
    ($timeout:expr, $cond:expr, $($arg:tt)+) => {
        assert!($crate::wait_until($timeout, || $cond), $($arg)+)
    };
}
