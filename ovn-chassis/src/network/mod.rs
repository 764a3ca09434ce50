use std::collections::{BTreeMap, BTreeSet};
use anyhow::Context;
use serde::Serialize;
use ovn_chassis_schemas::desired_state::{DesiredTopology, InterfaceIdentifier};
use ovn_chassis_schemas::settings::{OvsSettings, MANAGED_BRIDGE_MARKER};
use crate::exec::CommandRunner;
use crate::network::resolver::InterfaceResolver;
use crate::ovsdb::vsctl::OvsVsctl;
use crate::ovsdb::SimpleOvsdb;

pub mod interface_requests;
pub mod resolver;

pub const BRIDGE_TABLE: &str = "bridge";
pub const PORT_TABLE: &str = "port";
pub const OPEN_VSWITCH_TABLE: &str = "Open_vSwitch";
pub const BRIDGE_MAPPINGS_KEY: &str = "ovn-bridge-mappings";
pub const CMS_OPTIONS_KEY: &str = "ovn-cms-options";
pub const GATEWAY_CMS_OPTION: &str = "enable-chassis-as-gw";

/// What one convergence pass changed, empty when the host already matched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvergeReport {
    pub bridges_added: Vec<String>,
    pub bridges_removed: Vec<String>,
    /// (bridge, port)
    pub ports_added: Vec<(String, String)>,
    pub ports_removed: Vec<(String, String)>,
    /// `Open_vSwitch` external-id keys that were set or removed
    pub external_ids_changed: Vec<String>,
    pub bridge_mappings: String,
}

impl ConvergeReport {
    pub fn is_noop(&self) -> bool {
        self.bridges_added.is_empty()
            && self.bridges_removed.is_empty()
            && self.ports_added.is_empty()
            && self.ports_removed.is_empty()
            && self.external_ids_changed.is_empty()
    }
}

/// Resolve the interface identifiers of every bridge to device names. Addresses that don't match any
/// device are skipped and bridges left without interfaces are dropped.
pub async fn resolve_topology(
    desired: &DesiredTopology,
    resolver: &dyn InterfaceResolver,
) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    let mut resolved = BTreeMap::new();
    for (bridge, identifiers) in &desired.bridge_interfaces {
        let mut interfaces: Vec<String> = Vec::new();
        for identifier in identifiers {
            let name = match identifier {
                InterfaceIdentifier::Name(name) => Some(name.clone()),
                InterfaceIdentifier::Mac(mac) => {
                    let name = resolver
                        .resolve_mac(mac)
                        .await
                        .with_context(|| format!("resolving {mac} for bridge {bridge}"))?;
                    if name.is_none() {
                        tracing::warn!("no device with address {mac} found, skipping it for bridge {bridge}");
                    }
                    name
                }
            };
            match name {
                Some(name) if !interfaces.contains(&name) => interfaces.push(name),
                _ => {}
            }
        }
        if interfaces.is_empty() {
            tracing::warn!("bridge {bridge} has no usable interfaces, not creating it");
            continue;
        }
        resolved.insert(bridge.clone(), interfaces);
    }
    Ok(resolved)
}

/// The combined `network:bridge` string for `ovn-bridge-mappings`, restricted to resolved bridges
/// and sorted so the value only changes when the mapping does.
pub fn bridge_mappings(
    bridge_networks: &BTreeMap<String, BTreeSet<String>>,
    resolved: &BTreeMap<String, Vec<String>>,
) -> String {
    let mut mappings: Vec<String> = bridge_networks
        .iter()
        .filter(|(bridge, _)| resolved.contains_key(*bridge))
        .flat_map(|(bridge, networks)| networks.iter().map(move |network| format!("{network}:{bridge}")))
        .collect();
    mappings.sort();
    mappings.join(",")
}

/// Drop interfaces that are already a port on some other bridge, they are never moved. Bridges
/// left without interfaces are dropped like in `resolve_topology`.
pub fn attachable_interfaces(
    resolved: &BTreeMap<String, Vec<String>>,
    port_owners: &BTreeMap<String, String>,
) -> BTreeMap<String, Vec<String>> {
    let mut attachable = BTreeMap::new();
    for (bridge, interfaces) in resolved {
        let mut usable = Vec::new();
        for interface in interfaces {
            match port_owners.get(interface) {
                Some(owner) if owner != bridge => {
                    tracing::warn!("{interface} is already a port on bridge {owner}, not attaching it to {bridge}");
                }
                _ => usable.push(interface.clone()),
            }
        }
        if usable.is_empty() {
            tracing::warn!("bridge {bridge} has no usable interfaces, not creating it");
            continue;
        }
        attachable.insert(bridge.clone(), usable);
    }
    attachable
}

/// Converges the bridges and ports on the local Open vSwitch to the desired topology. Only objects
/// carrying the ownership external-id are ever removed.
pub struct BridgeConverger<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    settings: &'a OvsSettings,
    resolver: &'a dyn InterfaceResolver,
}

impl<'a, R: CommandRunner + ?Sized> BridgeConverger<'a, R> {
    pub fn new(
        runner: &'a R,
        settings: &'a OvsSettings,
        resolver: &'a dyn InterfaceResolver,
    ) -> Self {
        Self {
            runner,
            settings,
            resolver,
        }
    }

    pub async fn converge(&self, desired: &DesiredTopology) -> anyhow::Result<ConvergeReport> {
        let resolved = resolve_topology(desired, self.resolver).await?;
        let mut report = ConvergeReport::default();
        let vsctl = OvsVsctl::new(self.runner, &self.settings.vsctl);
        let key = self.settings.ownership_key.as_str();

        // remove what we own but is no longer wanted
        for bridge in self.managed_bridges().await? {
            let Some(interfaces) = resolved.get(&bridge) else {
                vsctl.del_bridge(&bridge).await?;
                report.bridges_removed.push(bridge);
                continue;
            };
            for port in self.managed_ports(&bridge).await? {
                if !interfaces.contains(&port) {
                    vsctl.del_port(&bridge, &port).await?;
                    report.ports_removed.push((bridge.clone(), port));
                }
            }
        }

        // add what is missing, anything already present is left alone
        let (live_bridges, port_owners) = self.live_layout().await?;
        let attachable = attachable_interfaces(&resolved, &port_owners);
        report.bridge_mappings = bridge_mappings(&desired.bridge_networks, &attachable);
        for (bridge, interfaces) in &attachable {
            if !live_bridges.contains(bridge) {
                vsctl.add_bridge(bridge, Some((key, MANAGED_BRIDGE_MARKER))).await?;
                report.bridges_added.push(bridge.clone());
            }
            for interface in interfaces {
                if port_owners.get(interface) == Some(bridge) {
                    continue;
                }
                vsctl.add_port(bridge, interface, Some((key, bridge.as_str()))).await?;
                report.ports_added.push((bridge.clone(), interface.clone()));
            }
        }

        report.external_ids_changed = self
            .apply_external_ids(&report.bridge_mappings, desired.prefer_chassis_as_gw)
            .await?;
        if report.is_noop() {
            tracing::debug!("bridges and ports already converged");
        } else {
            tracing::info!(
                "converged bridges: added {:?}, removed {:?}, ports added {:?}, ports removed {:?}",
                report.bridges_added, report.bridges_removed, report.ports_added, report.ports_removed,
            );
        }
        Ok(report)
    }

    /// Bridges owned by the agent with the ports it attached to each.
    pub async fn managed_topology(&self) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
        let mut topology = BTreeMap::new();
        for bridge in self.managed_bridges().await? {
            let ports = self.managed_ports(&bridge).await?;
            topology.insert(bridge, ports);
        }
        Ok(topology)
    }

    async fn managed_bridges(&self) -> anyhow::Result<Vec<String>> {
        let filter = format!("external_ids:{}={}", self.settings.ownership_key, MANAGED_BRIDGE_MARKER);
        self.find_names(BRIDGE_TABLE, &filter).await
    }

    /// Ports are tagged with the bridge they were attached to.
    async fn managed_ports(&self, bridge: &str) -> anyhow::Result<Vec<String>> {
        let filter = format!("external_ids:{}={}", self.settings.ownership_key, bridge);
        self.find_names(PORT_TABLE, &filter).await
    }

    async fn find_names(&self, table: &str, filter: &str) -> anyhow::Result<Vec<String>> {
        let db = SimpleOvsdb::new(self.runner, &self.settings.vsctl, table);
        let records = db
            .find(filter)
            .await
            .with_context(|| format!("querying {table} where {filter}"))?;
        let mut names: Vec<String> = records.filter_map(|r| r.get_str("name").map(String::from)).collect();
        names.sort();
        Ok(names)
    }

    /// Every live bridge, and the bridge each live port is attached to.
    async fn live_layout(&self) -> anyhow::Result<(BTreeSet<String>, BTreeMap<String, String>)> {
        let ports = SimpleOvsdb::new(self.runner, &self.settings.vsctl, PORT_TABLE)
            .list_all()
            .await
            .with_context(|| format!("listing {PORT_TABLE}"))?;
        let port_names: BTreeMap<String, String> = ports
            .filter_map(|r| Some((r.uuid()?.to_string(), r.get_str("name")?.to_string())))
            .collect();

        let bridges = SimpleOvsdb::new(self.runner, &self.settings.vsctl, BRIDGE_TABLE)
            .list_all()
            .await
            .with_context(|| format!("listing {BRIDGE_TABLE}"))?;
        let mut live_bridges = BTreeSet::new();
        let mut port_owners = BTreeMap::new();
        for record in bridges {
            let Some(bridge) = record.get_str("name") else {
                continue;
            };
            for uuid in record.get_uuids("ports") {
                if let Some(port) = port_names.get(&uuid) {
                    port_owners.insert(port.clone(), bridge.to_string());
                }
            }
            live_bridges.insert(bridge.to_string());
        }
        Ok((live_bridges, port_owners))
    }

    /// Set or clear the bridge mappings and the gateway option, only touching keys whose value
    /// differs from what is there already.
    async fn apply_external_ids(
        &self,
        mappings: &str,
        prefer_chassis_as_gw: bool,
    ) -> anyhow::Result<Vec<String>> {
        let open_vswitch = SimpleOvsdb::new(self.runner, &self.settings.vsctl, OPEN_VSWITCH_TABLE);
        let current = open_vswitch
            .list_all()
            .await
            .context("reading Open_vSwitch external-ids")?
            .next()
            .map(|record| record.get_map("external_ids"))
            .unwrap_or_default();

        let wanted: [(&str, Option<&str>); 2] = if mappings.is_empty() {
            [(BRIDGE_MAPPINGS_KEY, None), (CMS_OPTIONS_KEY, None)]
        } else {
            [
                (BRIDGE_MAPPINGS_KEY, Some(mappings)),
                (CMS_OPTIONS_KEY, prefer_chassis_as_gw.then_some(GATEWAY_CMS_OPTION)),
            ]
        };

        let mut changed = Vec::new();
        for (key, value) in wanted {
            match (value, current.get(key)) {
                (Some(value), Some(existing)) if existing == value => {}
                (Some(value), _) => {
                    tracing::info!("setting external-id {key}={value}");
                    open_vswitch.set(".", &format!("external_ids:{key}"), value).await?;
                    changed.push(key.to_string());
                }
                (None, Some(_)) => {
                    tracing::info!("removing external-id {key}");
                    open_vswitch.remove(".", "external_ids", key).await?;
                    changed.push(key.to_string());
                }
                (None, None) => {}
            }
        }
        Ok(changed)
    }
}
