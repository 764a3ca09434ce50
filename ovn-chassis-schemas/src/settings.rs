use std::fmt;
use std::fmt::Formatter;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use validator::{Validate, ValidationError};
use crate::CHASSIS_SETTINGS_FOLDER;
use crate::desired_state::{parse_notrack_criteria, DesiredTopology};

/// iptables refuses chain names longer than this
pub const IPTABLES_MAX_CHAIN_NAME_LEN: usize = 28;

/// Value of the ownership external-id on bridges created by the agent. Ports carry the name of the
/// bridge they were attached to instead, so the same interface can be tracked per bridge.
pub const MANAGED_BRIDGE_MARKER: &str = "managed";

/// This is the chassis configuration. It mirrors the options the orchestration layer hands to the
/// agent when the configuration or relation data changes. The string encoded mappings are kept in
/// their wire format here and only turned into typed values by `desired_topology`, so that the
/// file can be generated by the orchestration layer without knowing about the agent's types.
#[derive(Deserialize, Serialize, Debug, Clone, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct ChassisConfig {
    /// whitespace separated list of `interface-or-mac:bridge` pairs
    #[serde(default)]
    pub bridge_interface_mappings: String,
    /// whitespace separated list of `network:bridge` pairs
    #[serde(default)]
    pub ovn_bridge_mappings: String,
    /// advertise this chassis as a candidate gateway when it has bridge mappings
    #[serde(default)]
    pub prefer_chassis_as_gw: bool,
    #[serde(default)]
    pub enable_notrack_rules: bool,
    /// semicolon separated list of iptables rule criteria, i.e. `-p udp --dport 6081`
    #[serde(default = "default_notrack_rule_criteria")]
    pub notrack_rule_criteria: String,
    #[serde(default)]
    #[validate]
    pub ovs: OvsSettings,
    #[serde(default)]
    #[validate]
    pub iptables: IptablesSettings,
}

impl Default for ChassisConfig {
    fn default() -> Self {
        Self {
            bridge_interface_mappings: String::new(),
            ovn_bridge_mappings: String::new(),
            prefer_chassis_as_gw: false,
            enable_notrack_rules: false,
            notrack_rule_criteria: default_notrack_rule_criteria(),
            ovs: OvsSettings::default(),
            iptables: IptablesSettings::default(),
        }
    }
}

/// How the agent talks to the local Open vSwitch database.
#[derive(Deserialize, Serialize, Debug, Clone, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct OvsSettings {
    #[serde(default = "default_vsctl")]
    #[validate(length(min = 1))]
    pub vsctl: String,
    /// external-id key used to mark bridges and ports as owned by the agent
    #[serde(default = "default_ownership_key")]
    #[validate(length(min = 1))]
    pub ownership_key: String,
}

impl Default for OvsSettings {
    fn default() -> Self {
        Self {
            vsctl: default_vsctl(),
            ownership_key: default_ownership_key(),
        }
    }
}

/// Where and how the NOTRACK chain is installed.
#[derive(Deserialize, Serialize, Debug, Clone, Validate)]
#[serde(rename_all = "kebab-case")]
#[validate(schema(function = "validate_chain_names"))]
pub struct IptablesSettings {
    #[serde(default = "default_iptables_command")]
    #[validate(length(min = 1))]
    pub command: String,
    #[serde(default = "default_table")]
    #[validate(length(min = 1))]
    pub table: String,
    #[serde(default = "default_chain_name")]
    #[validate(length(min = 1))]
    pub chain_name: String,
    #[serde(default = "default_temp_chain_suffix")]
    #[validate(length(min = 1))]
    pub temp_chain_suffix: String,
    /// built-in chains the NOTRACK chain is attached to, in attach order
    #[serde(default = "default_entry_points")]
    #[validate(length(min = 1))]
    pub entry_points: Vec<String>,
    #[serde(default = "default_rule_comment")]
    pub rule_comment: String,
}

impl Default for IptablesSettings {
    fn default() -> Self {
        Self {
            command: default_iptables_command(),
            table: default_table(),
            chain_name: default_chain_name(),
            temp_chain_suffix: default_temp_chain_suffix(),
            entry_points: default_entry_points(),
            rule_comment: default_rule_comment(),
        }
    }
}

impl IptablesSettings {
    pub fn temp_chain_name(&self) -> String {
        format!("{}{}", self.chain_name, self.temp_chain_suffix)
    }
}

fn validate_chain_names(settings: &IptablesSettings) -> Result<(), ValidationError> {
    if settings.temp_chain_name().len() > IPTABLES_MAX_CHAIN_NAME_LEN {
        return Err(ValidationError::new("temp_chain_name_too_long"));
    }
    if settings.entry_points.iter().any(|entry| entry.eq(&settings.chain_name)) {
        return Err(ValidationError::new("chain_is_entry_point"));
    }
    Ok(())
}

fn default_notrack_rule_criteria() -> String {"-p udp --dport 6081".to_string()}
fn default_vsctl() -> String {"ovs-vsctl".to_string()}
fn default_ownership_key() -> String {"charm-ovn-chassis".to_string()}
fn default_iptables_command() -> String {"iptables".to_string()}
fn default_table() -> String {"raw".to_string()}
fn default_chain_name() -> String {"och-nfnotrack".to_string()}
fn default_temp_chain_suffix() -> String {"-temp".to_string()}
fn default_entry_points() -> Vec<String> {vec!["PREROUTING".into(), "OUTPUT".into()]}
fn default_rule_comment() -> String {"This rule is managed by ovn-chassis. Do not modify.".to_string()}

impl fmt::Display for ChassisConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string_pretty(&self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

impl ChassisConfig {
    pub fn default_location() -> PathBuf {
        PathBuf::from(format!("{CHASSIS_SETTINGS_FOLDER}config/chassis.yaml"))
    }

    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        tracing::trace!("expected chassis config location: {:?}", path);
        if !path.is_file() {
            bail!("could not read chassis config at {path:?}");
        }
        let text = tokio::fs::read_to_string(path).await.with_context(|| "Reading chassis config file")?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let value: Self = serde_yaml::from_str(text).with_context(|| "Parsing chassis config YAML")?;
        value.validate().with_context(|| "Validating chassis config semantics")?;
        Ok(value)
    }

    pub async fn save_to<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let mut file = File::create(path).await?;
        let to_string = serde_yaml::to_string(&self)?;
        file.write_all(&to_string.into_bytes()).await?;
        Ok(())
    }

    /// Turn the string encoded bridge options into the typed desired topology.
    pub fn desired_topology(&self) -> anyhow::Result<DesiredTopology> {
        DesiredTopology::parse(
            &self.bridge_interface_mappings,
            &self.ovn_bridge_mappings,
            self.prefer_chassis_as_gw,
        )
    }

    pub fn notrack_criteria(&self) -> Vec<String> {
        parse_notrack_criteria(&self.notrack_rule_criteria)
    }
}

#[cfg(test)]
mod tests {
    use crate::desired_state::InterfaceIdentifier;
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = ChassisConfig::from_yaml("{}").unwrap();
        assert!(!config.enable_notrack_rules);
        assert_eq!(config.notrack_rule_criteria, "-p udp --dport 6081");
        assert_eq!(config.ovs.vsctl, "ovs-vsctl");
        assert_eq!(config.ovs.ownership_key, "charm-ovn-chassis");
        assert_eq!(config.iptables.table, "raw");
        assert_eq!(config.iptables.temp_chain_name(), "och-nfnotrack-temp");
        assert_eq!(config.iptables.entry_points, vec!["PREROUTING".to_string(), "OUTPUT".to_string()]);
    }

    #[test]
    fn test_kebab_case_keys() {
        let yaml = r#"
bridge-interface-mappings: "eth1:br-ex"
ovn-bridge-mappings: "physnet1:br-ex"
prefer-chassis-as-gw: true
enable-notrack-rules: true
notrack-rule-criteria: "-p udp --dport 6081;-p udp --dport 4789"
iptables:
  chain-name: my-notrack
"#;
        let config = ChassisConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.bridge_interface_mappings, "eth1:br-ex");
        let desired = config.desired_topology().unwrap();
        assert_eq!(desired.bridge_interfaces["br-ex"], vec![InterfaceIdentifier::Name("eth1".into())]);
        assert!(config.prefer_chassis_as_gw);
        assert!(config.enable_notrack_rules);
        assert_eq!(config.notrack_criteria().len(), 2);
        assert_eq!(config.iptables.temp_chain_name(), "my-notrack-temp");
        // untouched keys of a partially specified section still get defaults
        assert_eq!(config.iptables.command, "iptables");
    }

    #[test]
    fn test_chain_name_too_long_is_rejected() {
        let yaml = r#"
iptables:
  chain-name: this-chain-name-is-far-too-long
"#;
        assert!(ChassisConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_no_entry_points_is_rejected() {
        let yaml = r#"
iptables:
  entry-points: []
"#;
        assert!(ChassisConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_chain_cannot_be_an_entry_point() {
        let yaml = r#"
iptables:
  chain-name: OUTPUT
"#;
        assert!(ChassisConfig::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chassis.yaml");
        let mut config = ChassisConfig::default();
        config.ovn_bridge_mappings = "physnet1:br-ex".into();
        config.save_to(&path).await.unwrap();
        let loaded = ChassisConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.ovn_bridge_mappings, "physnet1:br-ex");
        assert_eq!(loaded.iptables.chain_name, config.iptables.chain_name);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ChassisConfig::load_from_file(dir.path().join("nope.yaml")).await.is_err());
    }
}
