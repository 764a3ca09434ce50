use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Reconciles Open vSwitch bridges and iptables NOTRACK rules on an OVN chassis")]
pub struct Opts {
    #[arg(long, help = "Chassis configuration file, defaults to /var/lib/ovn-chassis/config/chassis.yaml")]
    pub config: Option<PathBuf>,
    #[arg(short, long)]
    pub verbosity: Option<String>,
    #[command(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Subcommand, Debug, Deserialize, Serialize)]
pub enum SubCommand {
    #[command(about = "Converge bridges, ports and NOTRACK rules with the configuration")]
    Reconcile,
    #[command(about = "Converge OVS bridges and ports with the configuration")]
    Bridges,
    #[command(about = "Converge the iptables NOTRACK chain with the configuration")]
    Notrack,
    #[command(about = "Remove the iptables NOTRACK chains")]
    RemoveNotrack,
    #[command(about = "Create interfaces requested by a principal workload")]
    InterfaceRequests(InterfaceRequestsCmd),
    #[command(about = "Print the chassis name and whether OVN is configured")]
    ChassisInfo,
    #[command(about = "Print bridges and ports managed by this agent")]
    Show,
}

impl SubCommand {
    pub fn name(&self) -> String {
        match &self {
            SubCommand::Reconcile => "reconcile".into(),
            SubCommand::Bridges => "bridges".into(),
            SubCommand::Notrack => "notrack".into(),
            SubCommand::RemoveNotrack => "remove notrack".into(),
            SubCommand::InterfaceRequests(_) => "interface requests".into(),
            SubCommand::ChassisInfo => "chassis info".into(),
            SubCommand::Show => "show".into(),
        }
    }

    /// Whether the command changes the dataplane, used to decide on status reporting.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, SubCommand::ChassisInfo | SubCommand::Show)
    }
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct InterfaceRequestsCmd {
    #[clap(long, help = "File holding the raw `create-interfaces` relation payload")]
    pub payload: PathBuf,
}
