/*!
Wait probe

A bounded retry loop around `Driver::ping`, used by the external CLI's
`wait` command and by `--wait` on other commands to ride out a database
that's still coming up (a freshly-started container, a cold Aurora
instance). Logs "Waiting for database..." on the first retry and a dot
per subsequent retry.
*/
use std::time::{Duration, Instant};

use crate::driver::Driver;
use crate::errors::*;

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Ping `driver` until it succeeds or `timeout` elapses. Returns the last
/// error on timeout.
pub fn wait_for(driver: &dyn Driver, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;
    let mut last_err = None;

    loop {
        match driver.ping() {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt == 0 {
                    log::info!("Waiting for database...");
                } else {
                    log::info!(".");
                }
                last_err = Some(e);
            }
        }
        attempt += 1;
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(RETRY_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }

    Err(last_err.unwrap_or_else(|| Error::from(ErrorKind::Connectivity("timed out waiting for database".into()))))
}
