//! Online reconfiguration: add/remove members, change the event horizon,
//! force a configuration past liveness checks.
//!
//! Commands are validated *before* any Paxos round; a command that fails a
//! precondition is refused with no slot consumed. A command that was valid
//! when submitted but is made obsolete by a concurrent change decides to a
//! no-op: the executor simply installs nothing.

use tokio::time::Instant;

use tracing::{info, warn};

use groupcast_core::{
    AppData, Cargo, EVENT_HORIZON_MAX, EVENT_HORIZON_MIN, NodeAddress, NodeNo, ProtoVersion,
    SiteDef, Synode,
};

use crate::config::DETECTOR_LIVENESS_LAG;
use crate::machine::force_slot;
use crate::state::Core;

/// Validate an admin command against the current configuration. The error
/// is the reason sent back to the client.
pub(crate) fn validate(core: &Core, cargo: &Cargo) -> Result<(), String> {
    let Some(site) = core.sites.latest() else {
        return Err("no configuration installed".into());
    };
    match cargo {
        Cargo::AddNode(nodes) => validate_add(site, nodes),
        Cargo::RemoveNode(nodes) => validate_remove(site, nodes),
        Cargo::SetEventHorizon(h) => validate_event_horizon(site, *h),
        Cargo::ForceConfig(nodes) => validate_force(core, site, nodes),
        _ => Ok(()),
    }
}

fn validate_add(site: &SiteDef, nodes: &[NodeAddress]) -> Result<(), String> {
    if nodes.is_empty() {
        return Err("no nodes to add".into());
    }
    for node in nodes {
        if site.find_uuid(&node.uuid).is_some() || site.contains_address(&node.address) {
            return Err(format!("node {} already in the group", node.address));
        }
        // A node that cannot follow event-horizon reconfigurations may only
        // join a group still running the default horizon.
        if node.proto_max < ProtoVersion::FIRST_EVENT_HORIZON_AWARE
            && site.event_horizon != EVENT_HORIZON_MIN
        {
            return Err(format!(
                "node {} cannot follow event horizon {}",
                node.address, site.event_horizon
            ));
        }
        if site.x_proto < ProtoVersion::FIRST_IPV6_AWARE && !node.has_ipv4_address() {
            return Err(format!(
                "node {} has no IPv4 address but the group predates IPv6 support",
                node.address
            ));
        }
    }
    Ok(())
}

fn validate_remove(site: &SiteDef, nodes: &[NodeAddress]) -> Result<(), String> {
    if nodes.is_empty() {
        return Err("no nodes to remove".into());
    }
    for node in nodes {
        if site.find_uuid(&node.uuid).is_none() {
            return Err(format!("node {} is not in the group", node.address));
        }
    }
    Ok(())
}

fn validate_event_horizon(site: &SiteDef, horizon: u32) -> Result<(), String> {
    if !(EVENT_HORIZON_MIN..=EVENT_HORIZON_MAX).contains(&horizon) {
        return Err(format!(
            "event horizon {horizon} outside [{EVENT_HORIZON_MIN}, {EVENT_HORIZON_MAX}]"
        ));
    }
    if !site.all_nodes_reconfigurable() {
        return Err("some members do not support event horizon reconfiguration".into());
    }
    Ok(())
}

fn validate_force(core: &Core, site: &SiteDef, nodes: &[NodeAddress]) -> Result<(), String> {
    if nodes.is_empty() {
        return Err("forced configuration is empty".into());
    }
    let now = Instant::now();
    for node in nodes {
        let Some(no) = site.find_uuid(&node.uuid) else {
            // A node outside the current site has no liveness record.
            return Err(format!("node {} is not a current member", node.address));
        };
        if no == site.nodeno {
            continue;
        }
        let alive = core
            .last_detected(no)
            .is_some_and(|t| now.saturating_duration_since(t) < DETECTOR_LIVENESS_LAG);
        if !alive {
            return Err(format!("node {} is not alive", node.address));
        }
    }
    Ok(())
}

/// Apply a decided configuration command. Returns the installed site, or
/// `None` when a concurrent change made the command a no-op.
pub(crate) fn handle_config(core: &mut Core, app: &AppData, forced: bool) -> Option<SiteDef> {
    let installed = match &app.body {
        Cargo::UnifiedBoot(nodes) => {
            // Already installed via the FSM on the booting path; a learned
            // boot on a running node is a no-op.
            if core.sites.is_empty() {
                Some(install_node_group(core, nodes.clone(), app.app_key))
            } else {
                None
            }
        }
        Cargo::AddNode(nodes) => handle_add_node(core, nodes, app.app_key),
        Cargo::RemoveNode(nodes) => handle_remove_node(core, nodes, app.app_key),
        Cargo::SetEventHorizon(h) => handle_event_horizon(core, *h, app.app_key),
        Cargo::ForceConfig(nodes) => {
            Some(install_node_group(core, nodes.clone(), app.app_key))
        }
        _ => None,
    };

    if let Some(site) = &installed {
        info!(
            start = %site.start,
            boot_key = %site.boot_key,
            members = site.nodes.len(),
            forced,
            "installed configuration"
        );
    }
    installed
}

/// Clone the active site, mutate it, and install with the standard start:
/// one horizon past the deciding slot.
fn install_derived(core: &mut Core, app_key: Synode, mutate: impl FnOnce(&mut SiteDef)) -> SiteDef {
    let mut site = core
        .sites
        .latest()
        .cloned()
        .unwrap_or_else(|| SiteDef::new(Vec::new(), EVENT_HORIZON_MIN));
    mutate(&mut site);
    site.start = core.add_event_horizon(app_key);
    site.boot_key = app_key;
    core.sites.install(site.clone());
    core.last_received_config = app_key;
    site
}

pub(crate) fn handle_add_node(
    core: &mut Core,
    nodes: &[NodeAddress],
    app_key: Synode,
) -> Option<SiteDef> {
    let Some(site) = core.sites.latest() else {
        return None;
    };
    if validate_add(site, nodes).is_err() {
        // Obsoleted by a concurrent change; decide to a no-op.
        warn!("add_node made obsolete by a concurrent configuration change");
        return None;
    }
    Some(install_derived(core, app_key, |site| {
        site.nodes.extend(nodes.iter().cloned());
        let n = site.max_nodes();
        site.global_node_set = groupcast_core::NodeSet::full(n);
    }))
}

pub(crate) fn handle_remove_node(
    core: &mut Core,
    nodes: &[NodeAddress],
    app_key: Synode,
) -> Option<SiteDef> {
    let Some(site) = core.sites.latest() else {
        return None;
    };
    if validate_remove(site, nodes).is_err() {
        warn!("remove_node made obsolete by a concurrent configuration change");
        return None;
    }
    Some(install_derived(core, app_key, |site| {
        site.nodes
            .retain(|n| !nodes.iter().any(|r| r.uuid == n.uuid));
        let n = site.max_nodes();
        site.global_node_set = groupcast_core::NodeSet::full(n);
    }))
}

pub(crate) fn handle_event_horizon(
    core: &mut Core,
    horizon: u32,
    app_key: Synode,
) -> Option<SiteDef> {
    let Some(site) = core.sites.latest() else {
        return None;
    };
    if validate_event_horizon(site, horizon).is_err() {
        warn!("set_event_horizon made obsolete by a concurrent configuration change");
        return None;
    }
    if site.event_horizon == horizon {
        return None;
    }
    Some(install_derived(core, app_key, |site| {
        site.event_horizon = horizon;
    }))
}

/// Install a site built from an explicit member list (boot or forced
/// config).
pub(crate) fn install_node_group(
    core: &mut Core,
    nodes: Vec<NodeAddress>,
    app_key: Synode,
) -> SiteDef {
    let horizon = core
        .sites
        .latest()
        .map_or(EVENT_HORIZON_MIN, |s| s.event_horizon);
    let mut site = SiteDef::new(nodes, horizon);
    if core.sites.is_empty() {
        // Bootstrap: the group begins at slot 1.
        site.start = Synode::new(core.group_id, 1, NodeNo(0));
        site.boot_key = Synode::new(core.group_id, 0, NodeNo(0));
    } else {
        site.start = core.add_event_horizon(app_key);
        site.boot_key = app_key;
    }
    core.sites.install(site.clone());
    core.last_received_config = app_key;
    site
}

/// Begin driving a forced configuration: every slot in the pipeline up to
/// `max_synode` is marked forced so it eventually finishes, and the new
/// site is remembered as the quorum basis for those rounds.
pub(crate) fn start_force_config(core: &mut Core, site: SiteDef, enforcer: bool, now: Instant) {
    let end = core.add_event_horizon(site.boot_key);
    if end > core.max_synode {
        core.set_max_synode(end);
    }
    core.forced_config = Some(site);
    let start = core.executed_msg;
    let stop = core.max_synode;
    force_interval(core, start, stop, enforcer, now);
}

/// Mark every slot in `[start, end]` as forced. The enforcer flag spreads
/// to new instances so re-issued configs extend the forced range.
pub(crate) fn force_interval(
    core: &mut Core,
    start: Synode,
    end: Synode,
    mut enforcer: bool,
    now: Instant,
) {
    let mut s = start;
    while s <= end {
        let Some(site) = core.sites.find(s) else {
            break;
        };
        if site.nodeno.is_void() {
            break;
        }
        let max_nodes = site.max_nodes();
        let slot = core.cache.force_get(s, now);
        if slot.enforcer {
            enforcer = true;
        }
        force_slot(slot, enforcer);
        slot.proposer.prep_nodeset.zero();
        slot.proposer.prop_nodeset.zero();
        s = s.incr(max_nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use groupcast_core::GroupId;

    fn addr(address: &str, uuid: u8) -> NodeAddress {
        NodeAddress::new(address, vec![uuid])
    }

    fn old_addr(address: &str, uuid: u8) -> NodeAddress {
        let mut a = addr(address, uuid);
        a.proto_max = ProtoVersion::V1_3;
        a
    }

    fn syn(msgno: u64, node: u16) -> Synode {
        Synode::new(GroupId(7), msgno, NodeNo(node))
    }

    fn booted_core(nodes: Vec<NodeAddress>, eh: u32) -> Core {
        let mut core = Core::new(&EngineConfig::default(), vec![1], 1, GroupId(7));
        let mut site = SiteDef::new(nodes, eh);
        site.start = syn(1, 0);
        site.boot_key = syn(0, 0);
        core.sites.install(site);
        core.executed_msg = syn(1, 0);
        core
    }

    fn two_nodes() -> Vec<NodeAddress> {
        vec![addr("a:1", 1), addr("b:1", 2)]
    }

    #[test]
    fn add_rejects_duplicates() {
        let core = booted_core(two_nodes(), 10);
        let err = validate(&core, &Cargo::AddNode(vec![addr("a:1", 1)])).unwrap_err();
        assert!(err.contains("already"));
        // Same address, different uuid: still a duplicate.
        assert!(validate(&core, &Cargo::AddNode(vec![addr("a:1", 9)])).is_err());
        assert!(validate(&core, &Cargo::AddNode(vec![addr("c:1", 3)])).is_ok());
    }

    #[test]
    fn add_rejects_nodes_that_cannot_follow_the_horizon() {
        let core = booted_core(two_nodes(), 50);
        assert!(validate(&core, &Cargo::AddNode(vec![old_addr("c:1", 3)])).is_err());
        // With the default horizon the old node is fine.
        let core = booted_core(two_nodes(), EVENT_HORIZON_MIN);
        assert!(validate(&core, &Cargo::AddNode(vec![old_addr("c:1", 3)])).is_ok());
    }

    #[test]
    fn add_rejects_ipv6_only_nodes_in_old_groups() {
        let mut core = booted_core(two_nodes(), 10);
        core.sites.latest_mut().unwrap().x_proto = ProtoVersion::V1_4;
        assert!(validate(&core, &Cargo::AddNode(vec![addr("[::1]:7", 3)])).is_err());
        core.sites.latest_mut().unwrap().x_proto = ProtoVersion::V1_5;
        assert!(validate(&core, &Cargo::AddNode(vec![addr("[::1]:7", 3)])).is_ok());
    }

    #[test]
    fn remove_requires_existing_uid() {
        let core = booted_core(two_nodes(), 10);
        assert!(validate(&core, &Cargo::RemoveNode(vec![addr("b:1", 2)])).is_ok());
        assert!(validate(&core, &Cargo::RemoveNode(vec![addr("x:1", 9)])).is_err());
    }

    #[test]
    fn event_horizon_bounds_are_enforced() {
        let core = booted_core(two_nodes(), 10);
        assert!(validate(&core, &Cargo::SetEventHorizon(9)).is_err());
        assert!(validate(&core, &Cargo::SetEventHorizon(201)).is_err());
        assert!(validate(&core, &Cargo::SetEventHorizon(50)).is_ok());

        let mut nodes = two_nodes();
        nodes[1] = old_addr("b:1", 2);
        let core = booted_core(nodes, 10);
        assert!(validate(&core, &Cargo::SetEventHorizon(50)).is_err());
    }

    #[test]
    fn force_config_requires_live_members() {
        let mut core = booted_core(two_nodes(), 10);
        core.sites.latest_mut().unwrap().nodeno = NodeNo(0);
        // Node b never detected: refused.
        assert!(validate(&core, &Cargo::ForceConfig(two_nodes())).is_err());

        core.note_detected(NodeNo(1), Instant::now());
        assert!(validate(&core, &Cargo::ForceConfig(two_nodes())).is_ok());
    }

    #[test]
    fn add_node_installs_one_horizon_ahead() {
        let mut core = booted_core(two_nodes(), 10);
        core.executed_msg = syn(5, 0);
        let mut app = AppData::new(Cargo::AddNode(vec![addr("c:1", 3)]));
        app.app_key = syn(5, 0);

        let site = handle_config(&mut core, &app, false).unwrap();
        // start = app_key + H + 1 = 16, boot_key = app_key.
        assert_eq!(site.start, syn(16, 0));
        assert_eq!(site.boot_key, syn(5, 0));
        assert_eq!(site.nodes.len(), 3);
    }

    #[test]
    fn obsolete_add_decides_to_noop() {
        let mut core = booted_core(two_nodes(), 10);
        let mut app = AppData::new(Cargo::AddNode(vec![addr("a:1", 1)]));
        app.app_key = syn(5, 0);
        assert!(handle_config(&mut core, &app, false).is_none());
    }

    #[test]
    fn remove_node_shrinks_membership() {
        let mut core = booted_core(two_nodes(), 10);
        let mut app = AppData::new(Cargo::RemoveNode(vec![addr("b:1", 2)]));
        app.app_key = syn(20, 1);
        let site = handle_config(&mut core, &app, false).unwrap();
        assert_eq!(site.nodes.len(), 1);
        assert_eq!(site.start, syn(31, 0));
    }

    #[test]
    fn force_interval_marks_pipeline() {
        let mut core = booted_core(two_nodes(), 10);
        core.executed_msg = syn(2, 0);
        core.set_max_synode(syn(3, 1));
        let now = Instant::now();
        force_interval(&mut core, syn(2, 0), syn(3, 1), true, now);

        let slot = core.cache.get_no_touch(syn(2, 1)).unwrap();
        assert!(slot.force_delivery);
        assert!(slot.enforcer);
        assert!(slot.proposer.bal.cnt > 0);
    }
}
