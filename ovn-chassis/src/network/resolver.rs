use std::path::PathBuf;
use async_trait::async_trait;
use ovn_chassis_schemas::desired_state::MacAddress;

/// Resolves the hardware addresses used in `bridge-interface-mappings` to device names on the host.
#[async_trait]
pub trait InterfaceResolver: Send + Sync {
    /// `Ok(None)` when no device on the host has the address.
    async fn resolve_mac(&self, mac: &MacAddress) -> anyhow::Result<Option<String>>;
}

/// Looks the address up in sysfs. Addresses are compared case-insensitively and when several
/// devices share an address (bond members and their bond, VLAN devices and their parent) the first
/// device name in lexical order wins.
#[derive(Debug, Clone)]
pub struct SysfsInterfaceResolver {
    root: PathBuf,
}

impl Default for SysfsInterfaceResolver {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

impl SysfsInterfaceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl InterfaceResolver for SysfsInterfaceResolver {
    async fn resolve_mac(&self, mac: &MacAddress) -> anyhow::Result<Option<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut matches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            // devices can disappear while we look, skip anything unreadable
            let address = match tokio::fs::read_to_string(entry.path().join("address")).await {
                Ok(address) => address,
                Err(_) => continue,
            };
            if address.trim().eq_ignore_ascii_case(&mac.address) {
                matches.push(name);
            }
        }
        matches.sort();
        if matches.len() > 1 {
            tracing::debug!("devices {matches:?} share address {mac}, using {}", matches[0]);
        }
        Ok(matches.into_iter().next())
    }
}
