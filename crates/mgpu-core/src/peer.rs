use serde::Serialize;
use tracing::debug;

use crate::context::DeviceGroupContext;
use crate::error::{GroupError, Result};
use crate::events::GroupEvent;

/// Directed permission for `source` to access `dest`'s memory without host
/// staging. `(A, B)` says nothing about `(B, A)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PeerAccessLink {
    pub source: usize,
    pub dest: usize,
}

impl DeviceGroupContext {
    /// Establish a directed peer link. Enabling an existing link, or a GPU
    /// onto itself, succeeds without changing anything.
    pub fn enable_peer_access(&mut self, source: usize, dest: usize) -> Result<()> {
        self.check_index(source)?;
        self.check_index(dest)?;

        let link = PeerAccessLink { source, dest };
        if source == dest || self.peer_links.contains(&link) {
            return Ok(());
        }

        let src_pd = self.config.gpus[source].physical_device;
        let dst_pd = self.config.gpus[dest].physical_device;
        if !self.backend.peer_access_supported(src_pd, dst_pd) {
            return Err(GroupError::Unsupported(format!(
                "GPU {} cannot access memory of GPU {} without host staging",
                source, dest
            )));
        }

        self.peer_links.insert(link);
        self.events.emit(&GroupEvent::PeerAccessChanged {
            source,
            dest,
            enabled: true,
        });
        Ok(())
    }

    /// Remove a directed peer link; removing an absent link succeeds.
    pub fn disable_peer_access(&mut self, source: usize, dest: usize) -> Result<()> {
        self.check_index(source)?;
        self.check_index(dest)?;

        if self.peer_links.remove(&PeerAccessLink { source, dest }) {
            self.events.emit(&GroupEvent::PeerAccessChanged {
                source,
                dest,
                enabled: false,
            });
        } else {
            debug!(source, dest, "peer link not present");
        }
        Ok(())
    }

    /// Whether a transfer from `source` to `dest` may skip host staging.
    pub fn has_peer_access(&self, source: usize, dest: usize) -> bool {
        if source == dest {
            return source < self.gpu_count();
        }
        self.peer_links.contains(&PeerAccessLink { source, dest })
    }

    /// Every enabled link, ordered by (source, dest).
    pub fn peer_links(&self) -> Vec<PeerAccessLink> {
        self.peer_links.iter().copied().collect()
    }
}
