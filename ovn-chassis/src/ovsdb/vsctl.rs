use std::collections::BTreeMap;
use crate::exec::CommandRunner;
use crate::ovsdb::{run_checked, OvsdbError};
use crate::vec_of_strings;

/// Bridge and port level operations on the local Open vSwitch that the generic record accessor
/// can't express, creating and destroying rows goes through the dedicated `ovs-vsctl` verbs.
pub struct OvsVsctl<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    tool: String,
}

impl<'a, R: CommandRunner + ?Sized> OvsVsctl<'a, R> {
    pub fn new(runner: &'a R, tool: impl Into<String>) -> Self {
        Self {
            runner,
            tool: tool.into(),
        }
    }

    /// Add a bridge and optionally tag it with an external-id in the same transaction.
    pub async fn add_bridge(
        &self,
        bridge: &str,
        external_id: Option<(&str, &str)>,
    ) -> Result<(), OvsdbError> {
        tracing::info!("adding bridge {bridge}");
        let mut cmd = vec_of_strings![&self.tool, "--may-exist", "add-br", bridge];
        if let Some((key, value)) = external_id {
            cmd.extend(vec_of_strings!["--", "br-set-external-id", bridge, key, value]);
        }
        run_checked(self.runner, cmd).await?;
        Ok(())
    }

    /// Add a port to a bridge and optionally tag the port with an external-id in the same
    /// transaction.
    pub async fn add_port(
        &self,
        bridge: &str,
        port: &str,
        external_id: Option<(&str, &str)>,
    ) -> Result<(), OvsdbError> {
        tracing::info!("adding port {port} to bridge {bridge}");
        let mut cmd = vec_of_strings![&self.tool, "--may-exist", "add-port", bridge, port];
        if let Some((key, value)) = external_id {
            cmd.extend(vec_of_strings!["--", "set", "Port", port, format!("external_ids:{key}={value}")]);
        }
        run_checked(self.runner, cmd).await?;
        Ok(())
    }

    /// Add a port with an interface of the given type and external-ids, as requested by a
    /// principal workload for its own netdevs.
    pub async fn add_interface(
        &self,
        bridge: &str,
        name: &str,
        interface_type: &str,
        external_ids: &BTreeMap<String, String>,
    ) -> Result<(), OvsdbError> {
        tracing::info!("adding {interface_type} interface {name} to bridge {bridge}");
        let mut cmd = vec_of_strings![
            &self.tool, "--may-exist", "add-port", bridge, name,
            "--", "set", "Interface", name, format!("type={interface_type}")
        ];
        if !external_ids.is_empty() {
            cmd.extend(vec_of_strings!["--", "set", "Interface", name]);
            cmd.extend(external_ids.iter().map(|(k, v)| format!("external_ids:{k}={v}")));
        }
        run_checked(self.runner, cmd).await?;
        Ok(())
    }

    /// Delete a bridge, its ports go with it.
    pub async fn del_bridge(&self, bridge: &str) -> Result<(), OvsdbError> {
        tracing::info!("deleting bridge {bridge}");
        run_checked(self.runner, vec_of_strings![&self.tool, "--if-exists", "del-br", bridge]).await?;
        Ok(())
    }

    pub async fn del_port(&self, bridge: &str, port: &str) -> Result<(), OvsdbError> {
        tracing::info!("deleting port {port} from bridge {bridge}");
        run_checked(self.runner, vec_of_strings![&self.tool, "--if-exists", "del-port", bridge, port]).await?;
        Ok(())
    }

    /// Read a single column value, i.e. `get_value("Open_vSwitch", ".", "external_ids:hostname")`.
    /// Surrounding quotes are stripped from string values.
    pub async fn get_value(
        &self,
        table: &str,
        record: &str,
        column: &str,
    ) -> Result<String, OvsdbError> {
        let result = run_checked(self.runner, vec_of_strings![&self.tool, "get", table, record, column]).await?;
        Ok(unquote(result.output.trim()).to_string())
    }
}

/// Strip one pair of matching quotes around a value, quotes inside it are kept.
fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| value.strip_prefix(*quote)?.strip_suffix(*quote))
        .unwrap_or(value)
}
