//! The configuration history: an append-only, start-ordered list of sites.
//!
//! Slots never hold references to sites; every lookup goes through
//! [`ConfigHistory::find`] keyed by synode, which keeps the slot/site/peer
//! graph acyclic.

use groupcast_core::{ConfigSnapshot, GcsSnapshot, SiteDef, Synode};

#[derive(Debug, Default)]
pub struct ConfigHistory {
    /// Ascending by `start`.
    sites: Vec<SiteDef>,
    my_uuid: Vec<u8>,
}

impl ConfigHistory {
    #[must_use]
    pub fn new(my_uuid: Vec<u8>) -> Self {
        Self {
            sites: Vec::new(),
            my_uuid,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Install a new generation. Starts arrive in increasing order; a
    /// duplicate start replaces the previous entry (forced config).
    pub fn install(&mut self, mut site: SiteDef) {
        site.set_nodeno_for(&self.my_uuid);
        match self.sites.iter().position(|s| s.start >= site.start) {
            Some(i) if self.sites[i].start == site.start => self.sites[i] = site,
            Some(i) => self.sites.insert(i, site),
            None => self.sites.push(site),
        }
    }

    /// The site governing `synode`: largest `start` at or below it.
    #[must_use]
    pub fn find(&self, synode: Synode) -> Option<&SiteDef> {
        self.sites.iter().rev().find(|s| s.start <= synode)
    }

    pub fn find_mut(&mut self, synode: Synode) -> Option<&mut SiteDef> {
        self.sites.iter_mut().rev().find(|s| s.start <= synode)
    }

    /// Newest installed generation.
    #[must_use]
    pub fn latest(&self) -> Option<&SiteDef> {
        self.sites.last()
    }

    pub fn latest_mut(&mut self) -> Option<&mut SiteDef> {
        self.sites.last_mut()
    }

    /// Earliest future generation (relative to `executed`) that changes the
    /// event horizon. Bounds how far ahead proposals may run.
    #[must_use]
    pub fn first_event_horizon_reconfig(&self, executed: Synode) -> Option<&SiteDef> {
        let active = self.find(executed)?;
        self.sites
            .iter()
            .filter(|s| s.start > active.start)
            .find(|s| s.event_horizon != active.event_horizon)
    }

    /// Latest future generation changing the event horizon; used when
    /// computing the start of yet another reconfiguration.
    #[must_use]
    pub fn latest_event_horizon_reconfig(&self, executed: Synode) -> Option<&SiteDef> {
        let active = self.find(executed)?;
        self.sites
            .iter()
            .filter(|s| s.start > active.start)
            .filter(|s| s.event_horizon != active.event_horizon)
            .next_back()
    }

    /// Drop generations retired by delivery progress: everything strictly
    /// older than the one governing `delivered`.
    pub fn gc(&mut self, delivered: Synode) {
        let Some(active_start) = self.find(delivered).map(|s| s.start) else {
            return;
        };
        self.sites.retain(|s| s.start >= active_start);
    }

    /// Exported history for a snapshot, oldest first.
    #[must_use]
    pub fn export(&self) -> Vec<ConfigSnapshot> {
        self.sites
            .iter()
            .map(|site| ConfigSnapshot { site: site.clone() })
            .collect()
    }

    /// Replace the history with a snapshot's, recomputing node numbers.
    pub fn import(&mut self, snapshot: &GcsSnapshot) {
        self.sites.clear();
        for cfg in &snapshot.configs {
            self.install(cfg.site.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupcast_core::{GroupId, NodeAddress, NodeNo};

    fn syn(msgno: u64) -> Synode {
        Synode::new(GroupId(7), msgno, NodeNo(0))
    }

    fn site(start: u64, eh: u32) -> SiteDef {
        let mut s = SiteDef::new(
            vec![NodeAddress::new("a:1", vec![1]), NodeAddress::new("b:1", vec![2])],
            eh,
        );
        s.start = syn(start);
        s.boot_key = syn(start.saturating_sub(1));
        s
    }

    fn history(sites: impl IntoIterator<Item = SiteDef>) -> ConfigHistory {
        let mut h = ConfigHistory::new(vec![1]);
        for s in sites {
            h.install(s);
        }
        h
    }

    #[test]
    fn find_returns_largest_start_not_above() {
        let h = history([site(1, 10), site(20, 10), site(40, 10)]);
        assert_eq!(h.find(syn(5)).unwrap().start, syn(1));
        assert_eq!(h.find(syn(20)).unwrap().start, syn(20));
        assert_eq!(h.find(syn(39)).unwrap().start, syn(20));
        assert_eq!(h.find(syn(100)).unwrap().start, syn(40));
        assert!(h.find(syn(0)).is_none());
    }

    #[test]
    fn install_recomputes_nodeno() {
        let mut h = ConfigHistory::new(vec![2]);
        h.install(site(1, 10));
        assert_eq!(h.latest().unwrap().nodeno, NodeNo(1));
    }

    #[test]
    fn event_horizon_reconfigs_are_found_in_order() {
        let h = history([site(1, 10), site(20, 50), site(40, 80)]);
        assert_eq!(
            h.first_event_horizon_reconfig(syn(5)).unwrap().start,
            syn(20)
        );
        assert_eq!(
            h.latest_event_horizon_reconfig(syn(5)).unwrap().start,
            syn(40)
        );
        // Nothing pending once executed is in the last generation.
        assert!(h.first_event_horizon_reconfig(syn(45)).is_none());
    }

    #[test]
    fn gc_keeps_governing_site() {
        let mut h = history([site(1, 10), site(20, 10), site(40, 10)]);
        h.gc(syn(25));
        assert_eq!(h.find(syn(25)).unwrap().start, syn(20));
        assert!(h.find(syn(5)).is_none());
        assert_eq!(h.find(syn(50)).unwrap().start, syn(40));
    }

    #[test]
    fn forced_config_replaces_same_start() {
        let mut h = history([site(1, 10)]);
        let mut replacement = site(1, 10);
        replacement.nodes.pop();
        h.install(replacement);
        assert_eq!(h.latest().unwrap().nodes.len(), 1);
        assert_eq!(h.export().len(), 1);
    }
}
