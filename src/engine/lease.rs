//! Lease keeper: renews a pair's claim in the background.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::ClaimContext;
use crate::store::OwnershipRegistry;

/// Renew every `lease / 3` until `stop` fires.
///
/// Cancels `lost` when the registry refuses a renewal, or when renewals
/// keep failing past the point the lease must have run out. Either way the
/// pair is no longer ours to touch.
pub(crate) fn spawn_lease_keeper(
    registry: Arc<dyn OwnershipRegistry>,
    ctx: ClaimContext,
    lease: Duration,
    lost: CancellationToken,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let interval = (lease / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut expires = Instant::now() + lease;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let attempted_at = Instant::now();
            match registry.renew(&ctx, lease).await {
                Ok(true) => {
                    expires = attempted_at + lease;
                    debug!(pair = %ctx.pair, "lease renewed");
                }
                Ok(false) => {
                    warn!(pair = %ctx.pair, worker = %ctx.worker_id, "lease renewal rejected");
                    lost.cancel();
                    return;
                }
                Err(e) if Instant::now() + interval >= expires => {
                    warn!(pair = %ctx.pair, error = %e, "lease expired while renewals were failing");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    warn!(pair = %ctx.pair, error = %e, "lease renewal failed, will retry");
                }
            }
        }
    })
}
