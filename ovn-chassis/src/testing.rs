//! Stateful fakes of the external tools for unit tests. They understand just enough of the command
//! lines the agent produces to keep a model of the host up to date, so that a pass can be run twice
//! against the same model.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use serde_json::{json, Value};
use crate::exec::testing::ScriptedRunner;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeBridge {
    pub external_ids: BTreeMap<String, String>,
    pub ports: BTreeSet<String>,
}

/// Model of the bits of the Open vSwitch database the agent touches.
#[derive(Debug, Clone, Default)]
pub struct FakeOvs {
    pub bridges: BTreeMap<String, FakeBridge>,
    /// port name to the port's external-ids
    pub ports: BTreeMap<String, BTreeMap<String, String>>,
    /// interface name to (type, external-ids)
    pub interfaces: BTreeMap<String, (String, BTreeMap<String, String>)>,
    pub open_vswitch: BTreeMap<String, String>,
}

impl FakeOvs {
    pub fn with_bridge(mut self, name: &str, external_ids: &[(&str, &str)]) -> Self {
        self.bridges.insert(name.to_string(), FakeBridge {
            external_ids: to_map(external_ids),
            ports: BTreeSet::new(),
        });
        self
    }

    pub fn with_port(mut self, bridge: &str, name: &str, external_ids: &[(&str, &str)]) -> Self {
        self.bridges.entry(bridge.to_string()).or_default().ports.insert(name.to_string());
        self.ports.insert(name.to_string(), to_map(external_ids));
        self
    }

    pub fn with_open_vswitch(mut self, external_ids: &[(&str, &str)]) -> Self {
        self.open_vswitch = to_map(external_ids);
        self
    }

    pub fn into_runner(self) -> (Arc<Mutex<FakeOvs>>, ScriptedRunner) {
        let state = Arc::new(Mutex::new(self));
        let shared = state.clone();
        let runner = ScriptedRunner::new(move |argv| Ok(shared.lock().unwrap().handle(argv)));
        (state, runner)
    }

    pub fn handle(&mut self, argv: &[String]) -> (i32, String) {
        let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
        if let ["-f", "json", "find", table, rest @ ..] = args.as_slice() {
            return self.find(table, rest.first().copied());
        }
        if let ["get", _table, _record, column] = args.as_slice() {
            let key = column.trim_start_matches("external_ids:");
            return match self.open_vswitch.get(key) {
                Some(value) => (0, format!("\"{value}\"\n")),
                None => (1, format!("ovs-vsctl: no key \"{key}\" in Open_vSwitch record \".\" column external_ids")),
            };
        }
        for clause in args.split(|arg| *arg == "--") {
            let clause: Vec<&str> = clause.iter().copied().filter(|arg| !arg.starts_with("--")).collect();
            let result = match clause.as_slice() {
                [] => Ok(()),
                ["add-br", bridge] => {
                    self.bridges.entry(bridge.to_string()).or_default();
                    Ok(())
                }
                ["br-set-external-id", bridge, key, value] => match self.bridges.get_mut(*bridge) {
                    Some(found) => {
                        found.external_ids.insert(key.to_string(), value.to_string());
                        Ok(())
                    }
                    None => Err(format!("no bridge named {bridge}")),
                },
                ["add-port", bridge, port] => match self.bridges.get_mut(*bridge) {
                    Some(found) => {
                        found.ports.insert(port.to_string());
                        self.ports.entry(port.to_string()).or_default();
                        Ok(())
                    }
                    None => Err(format!("no bridge named {bridge}")),
                },
                ["set", "Port", port, assignments @ ..] => {
                    let ids = self.ports.entry(port.to_string()).or_default();
                    for assignment in assignments {
                        if let Some((k, v)) = external_id_assignment(assignment) {
                            ids.insert(k, v);
                        }
                    }
                    Ok(())
                }
                ["set", "Interface", name, assignments @ ..] => {
                    let (iface_type, ids) = self.interfaces.entry(name.to_string()).or_default();
                    for assignment in assignments {
                        if let Some(t) = assignment.strip_prefix("type=") {
                            *iface_type = t.to_string();
                        } else if let Some((k, v)) = external_id_assignment(assignment) {
                            ids.insert(k, v);
                        }
                    }
                    Ok(())
                }
                ["set", "Open_vSwitch", ".", assignment] => match external_id_assignment(assignment) {
                    Some((k, v)) => {
                        self.open_vswitch.insert(k, v);
                        Ok(())
                    }
                    None => Err(format!("unsupported assignment {assignment}")),
                },
                ["remove", "Open_vSwitch", ".", "external_ids", key] => {
                    self.open_vswitch.remove(*key);
                    Ok(())
                }
                ["del-br", bridge] => {
                    if let Some(removed) = self.bridges.remove(*bridge) {
                        for port in removed.ports {
                            self.ports.remove(&port);
                        }
                    }
                    Ok(())
                }
                ["del-port", bridge, port] => {
                    if let Some(found) = self.bridges.get_mut(*bridge) {
                        found.ports.remove(*port);
                    }
                    self.ports.remove(*port);
                    Ok(())
                }
                other => Err(format!("unsupported command {other:?}")),
            };
            if let Err(err) = result {
                return (1, format!("ovs-vsctl: {err}"));
            }
        }
        (0, String::new())
    }

    fn find(&self, table: &str, condition: Option<&str>) -> (i32, String) {
        let filter = condition.and_then(|c| external_id_assignment(c));
        let matches = |ids: &BTreeMap<String, String>| match &filter {
            Some((k, v)) => ids.get(k) == Some(v),
            None => true,
        };
        let (headings, data): (Value, Vec<Value>) = match table.to_lowercase().as_str() {
            "bridge" => (
                json!(["_uuid", "name", "external_ids", "ports"]),
                self.bridges
                    .iter()
                    .filter(|(_, bridge)| matches(&bridge.external_ids))
                    .map(|(name, bridge)| json!([
                        ["uuid", format!("uuid-br-{name}")],
                        name,
                        map_value(&bridge.external_ids),
                        port_refs(&bridge.ports),
                    ]))
                    .collect(),
            ),
            "port" => (
                json!(["_uuid", "name", "external_ids"]),
                self.ports
                    .iter()
                    .filter(|(_, ids)| matches(ids))
                    .map(|(name, ids)| json!([["uuid", format!("uuid-port-{name}")], name, map_value(ids)]))
                    .collect(),
            ),
            "open_vswitch" => (
                json!(["_uuid", "external_ids"]),
                vec![json!([["uuid", "uuid-ovs"], map_value(&self.open_vswitch)])],
            ),
            other => return (1, format!("ovs-vsctl: unknown table \"{other}\"")),
        };
        (0, json!({"data": data, "headings": headings}).to_string())
    }
}

/// Whether a recorded `ovs-vsctl` command changes the database.
pub fn is_ovs_mutation(argv: &[String]) -> bool {
    !argv.iter().any(|arg| arg == "find" || arg == "get")
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn map_value(map: &BTreeMap<String, String>) -> Value {
    let pairs: Vec<Value> = map.iter().map(|(k, v)| json!([k, v])).collect();
    json!(["map", pairs])
}

/// A set with one member is written as the bare reference, like ovs-vsctl does.
fn port_refs(ports: &BTreeSet<String>) -> Value {
    let refs: Vec<Value> = ports.iter().map(|port| json!(["uuid", format!("uuid-port-{port}")])).collect();
    match refs.as_slice() {
        [single] => single.clone(),
        _ => json!(["set", refs]),
    }
}

fn external_id_assignment(assignment: &str) -> Option<(String, String)> {
    let (key, value) = assignment.strip_prefix("external_ids:")?.split_once('=')?;
    Some((key.to_string(), value.to_string()))
}

/// Model of the iptables table the NOTRACK chain lives in.
#[derive(Debug, Clone, Default)]
pub struct FakeIptables {
    /// chain name to the rules in it, user chains only
    pub chains: BTreeMap<String, Vec<String>>,
    /// entry point to the chains it jumps to, in order
    pub jumps: BTreeMap<String, Vec<String>>,
    /// criteria that iptables can't parse, `-C` answers them with exit code 2
    pub invalid_criteria: BTreeSet<String>,
    /// operation flags (i.e. `-N`) that fail with exit code 1
    pub failing_ops: BTreeSet<String>,
}

impl FakeIptables {
    pub fn with_entry_points(entry_points: &[&str]) -> Self {
        Self {
            jumps: entry_points.iter().map(|e| (e.to_string(), Vec::new())).collect(),
            ..Default::default()
        }
    }

    pub fn with_chain(mut self, chain: &str, rules: &[&str], attached_to: &[&str]) -> Self {
        self.chains.insert(chain.to_string(), rules.iter().map(|r| r.to_string()).collect());
        for entry in attached_to {
            self.jumps.entry(entry.to_string()).or_default().push(chain.to_string());
        }
        self
    }

    pub fn is_attached(&self, chain: &str, entry: &str) -> bool {
        self.jumps.get(entry).map(|jumps| jumps.iter().any(|j| j == chain)).unwrap_or(false)
    }

    pub fn attached_everywhere(&self, chain: &str) -> bool {
        !self.jumps.is_empty() && self.jumps.keys().all(|entry| self.is_attached(chain, entry))
    }

    pub fn handle(&mut self, argv: &[String]) -> (i32, String) {
        let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
        let ["-t", _table, op, chain, rest @ ..] = args.as_slice() else {
            return (2, "iptables v1.8.7 (legacy): unknown arguments".to_string());
        };
        if self.failing_ops.contains(*op) {
            return (1, format!("iptables: simulated failure of {op}"));
        }
        let chain = chain.to_string();
        match (*op, rest) {
            ("-N", []) => {
                if self.chains.contains_key(&chain) {
                    return (1, "iptables: Chain already exists.".to_string());
                }
                self.chains.insert(chain, Vec::new());
                (0, String::new())
            }
            ("-X", []) => {
                let attached = self.jumps.values().any(|jumps| jumps.contains(&chain));
                match self.chains.get(&chain) {
                    None => (1, "iptables: No chain/target/match by that name.".to_string()),
                    Some(rules) if !rules.is_empty() || attached => {
                        (1, "iptables: Directory not empty.".to_string())
                    }
                    Some(_) => {
                        self.chains.remove(&chain);
                        (0, String::new())
                    }
                }
            }
            ("-F", []) => match self.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.clear();
                    (0, String::new())
                }
                None => (1, "iptables: No chain/target/match by that name.".to_string()),
            },
            ("-L", []) => match self.chains.get(&chain) {
                Some(_) => (0, format!("Chain {chain} (0 references)\n")),
                None => (1, "iptables: No chain/target/match by that name.".to_string()),
            },
            ("-E", [new_name]) => {
                if self.chains.contains_key(*new_name) {
                    return (1, "iptables: File exists.".to_string());
                }
                match self.chains.remove(&chain) {
                    Some(rules) => {
                        self.chains.insert(new_name.to_string(), rules);
                        for jumps in self.jumps.values_mut() {
                            for jump in jumps.iter_mut().filter(|j| **j == chain) {
                                *jump = new_name.to_string();
                            }
                        }
                        (0, String::new())
                    }
                    None => (1, "iptables: No chain/target/match by that name.".to_string()),
                }
            }
            ("-A", ["-j", target]) if self.jumps.contains_key(&chain) => {
                if !self.chains.contains_key(*target) {
                    return (2, "iptables v1.8.7 (legacy): Couldn't load target".to_string());
                }
                self.jumps.entry(chain).or_default().push(target.to_string());
                (0, String::new())
            }
            ("-D", ["-j", target]) if self.jumps.contains_key(&chain) => {
                let jumps = self.jumps.entry(chain).or_default();
                match jumps.iter().position(|j| j == target) {
                    Some(index) => {
                        jumps.remove(index);
                        (0, String::new())
                    }
                    None => (1, "iptables: Bad rule (does a matching rule exist in that chain?).".to_string()),
                }
            }
            ("-C", ["-j", target]) if self.jumps.contains_key(&chain) => {
                if self.is_attached(target, &chain) {
                    (0, String::new())
                } else {
                    (1, "iptables: Bad rule (does a matching rule exist in that chain?).".to_string())
                }
            }
            ("-C", criteria) => {
                let criteria = criteria.join(" ");
                if self.invalid_criteria.contains(&criteria) {
                    return (2, format!("iptables v1.8.7 (legacy): unknown option \"{criteria}\""));
                }
                match self.chains.get(&chain) {
                    Some(rules) if rules.iter().any(|r| r.starts_with(&criteria)) => (0, String::new()),
                    _ => (1, "iptables: Bad rule (does a matching rule exist in that chain?).".to_string()),
                }
            }
            ("-A", rule) => match self.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.push(rule.join(" "));
                    (0, String::new())
                }
                None => (1, "iptables: No chain/target/match by that name.".to_string()),
            },
            _ => (2, "iptables v1.8.7 (legacy): unknown arguments".to_string()),
        }
    }
}
