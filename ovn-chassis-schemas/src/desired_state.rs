use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Formatter;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Struct to represent mac addresses, to validate the string to make sure it is a valid mac
/// address. The address is normalised to lower case so it can be compared against what the kernel
/// reports for a device.
#[derive(Debug, Clone, Deserialize, Serialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MacAddress {
    pub address: String,
    pub as_bytes: u64,
}

impl MacAddress {
    pub fn new(
        address: &str,
    ) -> anyhow::Result<Self> {
        let address = address.to_lowercase();
        let as_bytes = Self::get_mac_as_bytes(&address)?;
        Ok(Self { address, as_bytes })
    }

    /// Cheap check used to decide whether an interface identifier is a hardware address or a
    /// device name.
    pub fn is_mac(candidate: &str) -> bool {
        let split: Vec<_> = candidate.split(':').collect();
        split.len() == 6
            && split.iter().all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
    }

    fn get_mac_as_bytes(address: &str) -> anyhow::Result<u64> {
        let split: Vec<_> = address.split(':').collect();
        // make sure the right number of colons
        if split.len() != 6 {
            bail!("mac address not 48 bit format {address}");
        }
        let mut mac_bytes = 0;
        for octet in split {
            if octet.len() != 2 {
                bail!("octet {octet} in mac {address} is not correct");
            }
            let byte = u8::from_str_radix(octet, 16)
                .with_context(|| format!("converting octet {octet} in mac {address} to hex"))?;
            mac_bytes = (mac_bytes << 8) | u64::from(byte);
        }
        Ok(mac_bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// An interface in `bridge-interface-mappings` can be given either by its device name or by its
/// hardware address, the latter has to be resolved to a device name on the host.
#[derive(Debug, Clone, Deserialize, Serialize, Eq, PartialEq, Hash)]
pub enum InterfaceIdentifier {
    Name(String),
    Mac(MacAddress),
}

impl InterfaceIdentifier {
    pub fn parse(identifier: &str) -> anyhow::Result<Self> {
        if MacAddress::is_mac(identifier) {
            Ok(InterfaceIdentifier::Mac(MacAddress::new(identifier)?))
        } else {
            Ok(InterfaceIdentifier::Name(identifier.to_string()))
        }
    }
}

impl fmt::Display for InterfaceIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceIdentifier::Name(name) => f.write_str(name),
            InterfaceIdentifier::Mac(mac) => write!(f, "{mac}"),
        }
    }
}

/// Desired bridge layout for one reconciliation pass.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DesiredTopology {
    /// bridge name to interfaces in the order they were configured, without duplicates
    pub bridge_interfaces: BTreeMap<String, Vec<InterfaceIdentifier>>,
    /// bridge name to the logical networks it carries
    pub bridge_networks: BTreeMap<String, BTreeSet<String>>,
    pub prefer_chassis_as_gw: bool,
}

impl DesiredTopology {
    pub fn parse(
        bridge_interface_mappings: &str,
        ovn_bridge_mappings: &str,
        prefer_chassis_as_gw: bool,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            bridge_interfaces: parse_bridge_interface_mappings(bridge_interface_mappings)
                .context("parsing bridge-interface-mappings")?,
            bridge_networks: parse_ovn_bridge_mappings(ovn_bridge_mappings)
                .context("parsing ovn-bridge-mappings")?,
            prefer_chassis_as_gw,
        })
    }
}

/// Parse `interface-or-mac:bridge` pairs. The split is on the last colon since a hardware address
/// contains colons itself.
pub fn parse_bridge_interface_mappings(
    mappings: &str,
) -> anyhow::Result<BTreeMap<String, Vec<InterfaceIdentifier>>> {
    let mut bridge_interfaces: BTreeMap<String, Vec<InterfaceIdentifier>> = BTreeMap::new();
    for pair in mappings.split_whitespace() {
        if MacAddress::is_mac(pair) {
            bail!("mapping `{pair}` has no bridge");
        }
        let (interface, bridge) = match pair.rsplit_once(':') {
            Some((interface, bridge)) if !interface.is_empty() && !bridge.is_empty() => (interface, bridge),
            _ => bail!("mapping `{pair}` is not in `interface:bridge` format"),
        };
        let identifier = InterfaceIdentifier::parse(interface)?;
        let interfaces = bridge_interfaces.entry(bridge.to_string()).or_default();
        if !interfaces.contains(&identifier) {
            interfaces.push(identifier);
        }
    }
    Ok(bridge_interfaces)
}

/// Parse `network:bridge` pairs, keyed by bridge.
pub fn parse_ovn_bridge_mappings(
    mappings: &str,
) -> anyhow::Result<BTreeMap<String, BTreeSet<String>>> {
    let mut bridge_networks: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for pair in mappings.split_whitespace() {
        let (network, bridge) = match pair.split_once(':') {
            Some((network, bridge)) if !network.is_empty() && !bridge.is_empty() && !bridge.contains(':') => (network, bridge),
            _ => bail!("mapping `{pair}` is not in `network:bridge` format"),
        };
        bridge_networks
            .entry(bridge.to_string())
            .or_default()
            .insert(network.to_string());
    }
    Ok(bridge_networks)
}

/// Split the semicolon separated criteria list, empty entries are dropped.
pub fn parse_notrack_criteria(criteria: &str) -> Vec<String> {
    criteria
        .split(';')
        .map(str::trim)
        .filter(|criterion| !criterion.is_empty())
        .map(String::from)
        .collect()
}
