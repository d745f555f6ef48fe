//! Recovery snapshots.
//!
//! A joining or lagging node obtains the exported configuration history and
//! an application-level state blob from a peer, then replays the decided
//! log tail via `RecoverLearn` messages. Snapshot preference is ordered by
//! `(boot_key, log_start, log_end)` so a recipient keeps only the best one.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::site::SiteDef;
use crate::synode::Synode;

/// One entry of the exported configuration history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub site: SiteDef,
}

/// The full recovery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcsSnapshot {
    /// Configuration history, oldest first.
    pub configs: Vec<ConfigSnapshot>,
    /// Application state blob, opaque to the engine.
    pub app_snap: Bytes,
    /// The log below `log_start` is covered by `app_snap`.
    pub log_start: Synode,
    /// Highest slot the sender can replay.
    pub log_end: Synode,
}

impl GcsSnapshot {
    /// Identity of the newest configuration carried by this snapshot.
    #[must_use]
    pub fn highest_boot_key(&self) -> Synode {
        self.configs
            .iter()
            .map(|c| c.site.boot_key)
            .max()
            .unwrap_or(Synode::NULL)
    }

    /// Preference key: a snapshot is better if it knows a newer
    /// configuration, or the same configuration with an older log start
    /// (more replayable history is ordered *behind* a fresher start here:
    /// the later `log_start`, the less there is left to replay), or the
    /// same start with a longer replayable tail.
    #[must_use]
    pub fn preference(&self) -> (Synode, Synode, Synode) {
        (self.highest_boot_key(), self.log_start, self.log_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{NodeAddress, SiteDef};
    use crate::synode::{GroupId, NodeNo};

    fn syn(msgno: u64, node: u16) -> Synode {
        Synode::new(GroupId(7), msgno, NodeNo(node))
    }

    fn snap(boot: u64, start: u64, end: u64) -> GcsSnapshot {
        let mut site = SiteDef::new(vec![NodeAddress::new("a:1", vec![1])], 10);
        site.boot_key = syn(boot, 0);
        GcsSnapshot {
            configs: vec![ConfigSnapshot { site }],
            app_snap: Bytes::new(),
            log_start: syn(start, 0),
            log_end: syn(end, 0),
        }
    }

    #[test]
    fn preference_orders_by_boot_key_then_log_bounds() {
        assert!(snap(5, 1, 9).preference() > snap(4, 3, 20).preference());
        assert!(snap(5, 3, 9).preference() > snap(5, 1, 9).preference());
        assert!(snap(5, 3, 12).preference() > snap(5, 3, 9).preference());
    }

    #[test]
    fn highest_boot_key_of_empty_history_is_null() {
        let s = GcsSnapshot {
            configs: Vec::new(),
            app_snap: Bytes::new(),
            log_start: Synode::NULL,
            log_end: Synode::NULL,
        };
        assert_eq!(s.highest_boot_key(), Synode::NULL);
    }
}
