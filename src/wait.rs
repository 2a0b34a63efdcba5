/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Polling wait on state that is updated elsewhere.

use std::time::Duration;

use tokio::time::{self, Instant};

use crate::types::RendererError;

/// Interval between two evaluations of the check.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `check` every [`POLL_INTERVAL`] until it returns true.
///
/// Fails with [`RendererError::Timeout`] once `timeout` has elapsed. A `None`
/// or zero timeout polls indefinitely. Every poll sleeps on the runtime, so
/// the tasks updating the observed state keep running in between.
pub async fn wait_until(
    check: impl Fn() -> bool,
    timeout: Option<Duration>,
) -> Result<(), RendererError> {
    let timeout = timeout.filter(|t| !t.is_zero());
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if check() {
            return Ok(());
        }

        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                return Err(RendererError::Timeout(timeout));
            }
        }

        time::sleep(POLL_INTERVAL).await;
    }
}
