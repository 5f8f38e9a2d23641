//! Bounded readiness probe for background helpers.

use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info};

use crate::error::ProvisionError;

/// Poll a TCP address until a connection succeeds or `timeout` elapses.
///
/// `alive` is checked before every attempt and once more one interval after
/// the first successful connect; its error aborts the wait. This catches a
/// helper that died at startup while a stale listener still answers on `addr`.
///
/// Returns how long it took to become reachable.
pub fn wait_for_tcp<F>(
    what: &str,
    addr: SocketAddr,
    timeout: Duration,
    interval: Duration,
    mut alive: F,
) -> Result<Duration>
where
    F: FnMut() -> Result<()>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        alive()?;
        let now = Instant::now();
        let budget = deadline.saturating_duration_since(now).min(interval);
        if !budget.is_zero() && TcpStream::connect_timeout(&addr, budget).is_ok() {
            thread::sleep(interval);
            alive()?;
            let waited = start.elapsed();
            info!(what, %addr, attempts, waited_ms = waited.as_millis() as u64, "ready");
            return Ok(waited);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ProvisionError::Readiness {
                what: what.to_string(),
                waited_secs: timeout.as_secs(),
            }
            .into());
        }
        debug!(what, %addr, attempts, "not ready yet");
        thread::sleep(interval.min(deadline - now));
    }
}
