//! Interfaces a co-located workload asks the agent to create on its behalf. The request arrives as a
//! json document keyed by bridge then interface name, and is acknowledged with a digest of the raw
//! document so the requester knows which version was handled.

use std::collections::BTreeMap;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use crate::exec::CommandRunner;
use crate::ovsdb::vsctl::OvsVsctl;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    #[serde(rename = "type", default = "default_interface_type")]
    pub interface_type: String,
    #[serde(rename = "external-ids", default)]
    pub external_ids: BTreeMap<String, String>,
}

fn default_interface_type() -> String {
    "internal".to_string()
}

/// bridge name to interface name to request
pub type InterfaceRequests = BTreeMap<String, BTreeMap<String, InterfaceRequest>>;

pub fn parse_interface_requests(raw: &str) -> anyhow::Result<InterfaceRequests> {
    serde_json::from_str(raw).context("parsing interface requests")
}

/// Hex encoded SHA-224 of the request document exactly as received.
pub fn request_digest(raw: &str) -> String {
    format!("{:x}", Sha224::digest(raw.as_bytes()))
}

/// Create every requested interface, existing ones are updated in place. Returns the digest to
/// acknowledge the request with.
pub async fn apply_interface_requests<R: CommandRunner + ?Sized>(
    runner: &R,
    vsctl_tool: &str,
    raw: &str,
) -> anyhow::Result<String> {
    let requests = parse_interface_requests(raw)?;
    let vsctl = OvsVsctl::new(runner, vsctl_tool);
    for (bridge, interfaces) in &requests {
        for (name, request) in interfaces {
            vsctl
                .add_interface(bridge, name, &request.interface_type, &request.external_ids)
                .await
                .with_context(|| format!("creating interface {name} on bridge {bridge}"))?;
        }
    }
    Ok(request_digest(raw))
}
