//! Two-way sync between a working collection and a bundle store.

mod client;

pub use client::SyncClient;

use crate::settings::RetryPolicy;
use crate::{Error, Result};

/// Repeat a sync step until it reports nothing left to do.
///
/// `step` returns `Ok(true)` when it should run again. Errors other than an
/// unsettled step end the loop immediately; running out of attempts yields
/// [`Error::SyncFailed`].
pub fn run_until_settled(
    policy: &RetryPolicy,
    operation: &str,
    mut step: impl FnMut() -> Result<bool>,
) -> Result<()> {
    let attempts = policy.attempts();
    policy.run(
        |e| matches!(e, Error::SyncFailed { .. }),
        || {
            if step()? {
                Err(Error::SyncFailed {
                    operation: operation.to_string(),
                    attempts,
                })
            } else {
                Ok(())
            }
        },
    )
}
