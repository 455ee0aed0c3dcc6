//! Flood Relay
//!
//! Every packet that survives duplicate suppression and still has hop
//! budget is rebroadcast on all active links except the one it arrived
//! on. The rebroadcast copy carries ttl − 1 and is delayed by a uniform
//! random jitter in [10 ms, 100 ms]: radios in range of each other would
//! otherwise retransmit in lockstep and collide.
//!
//! Planning is pure and synchronous; execution is a spawned task holding
//! the link driver, so the node loop never waits out the jitter itself.

use crate::link::{LinkDriver, LinkId};
use crate::packet::Packet;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Lower jitter bound.
pub const RELAY_JITTER_MIN_MS: u64 = 10;

/// Upper jitter bound, inclusive.
pub const RELAY_JITTER_MAX_MS: u64 = 100;

/// A scheduled rebroadcast: the re-encoded frame, when to send it, and
/// which link to skip.
#[derive(Clone, Debug)]
pub struct RelayPlan {
    /// Wire bytes with ttl already decremented. The original signature is
    /// carried unchanged.
    pub frame: Vec<u8>,
    /// Jitter to wait before transmitting.
    pub delay: Duration,
    /// Inbound link, excluded from the rebroadcast. None for locally
    /// originated packets.
    pub exclude: Option<LinkId>,
}

/// Decide whether a packet is relayed, and how.
///
/// Returns None when the hop budget is exhausted.
pub fn plan(packet: &Packet, inbound: Option<LinkId>) -> Option<RelayPlan> {
    if packet.ttl == 0 {
        return None;
    }

    let mut copy = packet.clone();
    copy.ttl -= 1;

    let jitter_ms = rand::thread_rng().gen_range(RELAY_JITTER_MIN_MS..=RELAY_JITTER_MAX_MS);

    Some(RelayPlan {
        frame: copy.encode(),
        delay: Duration::from_millis(jitter_ms),
        exclude: inbound,
    })
}

/// Execute a plan: wait out the jitter, then transmit on every active
/// link except the excluded one. Aborts promptly on shutdown.
pub fn schedule(
    plan: RelayPlan,
    driver: Arc<dyn LinkDriver>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(plan.delay) => {}
            _ = shutdown.changed() => {
                trace!("relay cancelled by shutdown");
                return;
            }
        }

        for link in driver.links() {
            if Some(link) == plan.exclude {
                continue;
            }
            if let Err(e) = driver.send(link, &plan.frame) {
                debug!(link = %link, error = %e, "relay transmit failed");
            }
        }
    });
}
