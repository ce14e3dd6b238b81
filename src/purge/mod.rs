//! Retention enforcement.
//!
//! Periodically walks ledger rows older than the retention window, deletes
//! the corresponding remote objects and then removes the rows. Only paths
//! recorded in the ledger are ever deleted.

use crate::error::Error;
use crate::ledger::Ledger;
use crate::transfer::Transfer;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Consecutive delete failures for one row before it is reported at ERROR.
const FAILURE_THRESHOLD: u32 = 3;

pub struct Purger {
    ledger: Ledger,
    transfer: Arc<dyn Transfer>,
    retention: Duration,
    interval: Duration,
    token: CancellationToken,
    /// Per-row delete failure counts, cleared on success.
    failures: HashMap<String, u32>,
}

impl Purger {
    pub fn new(
        ledger: Ledger,
        transfer: Arc<dyn Transfer>,
        retention: Duration,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Purger {
            ledger,
            transfer,
            retention,
            interval,
            token,
            failures: HashMap::new(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting purge task");
        loop {
            match self.pass().await {
                Ok(()) => {}
                Err(e) => {
                    if e.downcast_ref::<Error>().map(Error::is_fatal).unwrap_or(false) {
                        return Err(e);
                    }
                    error!("Purge pass failed: {e:#}");
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One purge pass. Running it twice is equivalent to running it once.
    async fn pass(&mut self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;

        let rows = self.ledger.older_than(cutoff).await?;
        if rows.is_empty() {
            debug!("Nothing to purge");
            return Ok(());
        }

        let mut deleted_any = false;
        for (event_id, remote_path) in rows {
            if self.token.is_cancelled() {
                break;
            }

            // Skip markers have no remote object to delete.
            if remote_path.is_empty() {
                self.ledger.delete(&event_id).await?;
                continue;
            }

            info!("Purging event {event_id}");
            match self.transfer.delete(&remote_path).await {
                Ok(()) => {
                    self.ledger.delete(&event_id).await?;
                    self.failures.remove(&event_id);
                    deleted_any = true;
                    debug!("  Deleted: {remote_path}");
                }
                Err(e) => {
                    let count = self.failures.entry(event_id.clone()).or_insert(0);
                    *count += 1;
                    if *count > FAILURE_THRESHOLD {
                        error!(
                            "Failed to delete `{remote_path}` {count} passes in a row: {e:#}"
                        );
                    } else {
                        warn!("Failed to delete `{remote_path}`, will retry next pass: {e:#}");
                    }
                }
            }
        }

        if deleted_any {
            self.transfer.tidy().await?;
        }
        Ok(())
    }
}
