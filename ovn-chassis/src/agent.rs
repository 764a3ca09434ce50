use std::collections::BTreeMap;
use anyhow::Context;
use serde::Serialize;
use ovn_chassis_schemas::settings::ChassisConfig;
use crate::exec::CommandRunner;
use crate::iptables::notrack::{NotrackChainState, NotrackOrchestrator};
use crate::network::interface_requests::apply_interface_requests;
use crate::network::resolver::{InterfaceResolver, SysfsInterfaceResolver};
use crate::network::{BridgeConverger, ConvergeReport, OPEN_VSWITCH_TABLE};
use crate::ovsdb::vsctl::OvsVsctl;
use crate::ovsdb::OvsdbError;
use crate::status::{report_status, ChassisStatus, StatusSender};

/// What the chassis publishes to the workloads it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChassisInfo {
    pub chassis_name: String,
    pub ovn_configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub bridges: ConvergeReport,
    pub notrack: NotrackChainState,
}

/// Entry point for the outer layer, runs reconciliation passes for one chassis configuration.
pub struct ChassisAgent<R: CommandRunner> {
    runner: R,
    config: ChassisConfig,
    resolver: Box<dyn InterfaceResolver>,
    status: Option<StatusSender>,
}

impl<R: CommandRunner> ChassisAgent<R> {
    pub fn new(runner: R, config: ChassisConfig) -> Self {
        Self {
            runner,
            config,
            resolver: Box::new(SysfsInterfaceResolver::default()),
            status: None,
        }
    }

    pub fn with_resolver(mut self, resolver: impl InterfaceResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_status(mut self, sender: StatusSender) -> Self {
        self.status = Some(sender);
        self
    }

    pub fn config(&self) -> &ChassisConfig {
        &self.config
    }

    pub async fn configure_bridges(&self) -> anyhow::Result<ConvergeReport> {
        self.status(ChassisStatus::Maintenance("Configuring bridges".into())).await;
        let desired = self.config.desired_topology()?;
        BridgeConverger::new(&self.runner, &self.config.ovs, self.resolver.as_ref())
            .converge(&desired)
            .await
            .context("configuring bridges")
    }

    /// Install or remove the NOTRACK chain depending on `enable-notrack-rules`.
    pub async fn configure_notrack_rules(&self) -> anyhow::Result<NotrackChainState> {
        if !self.config.enable_notrack_rules {
            return self.remove_notrack_rules().await;
        }
        self.status(ChassisStatus::Maintenance("Enabling iptables NOTRACK rules".into())).await;
        let criteria = self.config.notrack_criteria();
        NotrackOrchestrator::new(&self.runner, &self.config.iptables)
            .converge(&criteria)
            .await
            .context("configuring NOTRACK rules")
    }

    pub async fn remove_notrack_rules(&self) -> anyhow::Result<NotrackChainState> {
        self.status(ChassisStatus::Maintenance("Disabling iptables NOTRACK rules".into())).await;
        NotrackOrchestrator::new(&self.runner, &self.config.iptables)
            .remove()
            .await
            .context("removing NOTRACK rules")
    }

    /// Run a full pass, bridges first. The pass stops at the first failure and reports blocked,
    /// whatever was applied until then stays applied.
    pub async fn reconcile(&self) -> anyhow::Result<ReconcileReport> {
        let result = async {
            let bridges = self.configure_bridges().await?;
            let notrack = self.configure_notrack_rules().await?;
            Ok::<_, anyhow::Error>(ReconcileReport { bridges, notrack })
        }
        .await;
        match &result {
            Ok(_) => self.status(ChassisStatus::Active("Unit is ready".into())).await,
            Err(err) => self.status(ChassisStatus::Blocked(format!("{err:#}"))).await,
        }
        result
    }

    /// Returns the digest acknowledging the request.
    pub async fn apply_interface_requests(&self, raw: &str) -> anyhow::Result<String> {
        self.status(ChassisStatus::Maintenance("Creating requested interfaces".into())).await;
        apply_interface_requests(&self.runner, &self.config.ovs.vsctl, raw).await
    }

    pub async fn chassis_info(&self) -> anyhow::Result<ChassisInfo> {
        let vsctl = OvsVsctl::new(&self.runner, &self.config.ovs.vsctl);
        let chassis_name = vsctl
            .get_value(OPEN_VSWITCH_TABLE, ".", "external_ids:hostname")
            .await
            .context("reading chassis name")?;
        // a missing key is a failed command, anything else is a real problem
        let ovn_configured = match vsctl.get_value(OPEN_VSWITCH_TABLE, ".", "external_ids:ovn-remote").await {
            Ok(_) => true,
            Err(OvsdbError::CommandFailed { .. }) => false,
            Err(err) => return Err(err).context("reading ovn-remote"),
        };
        Ok(ChassisInfo {
            chassis_name,
            ovn_configured,
        })
    }

    pub async fn managed_topology(&self) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
        BridgeConverger::new(&self.runner, &self.config.ovs, self.resolver.as_ref())
            .managed_topology()
            .await
    }

    pub async fn notrack_state(&self) -> anyhow::Result<NotrackChainState> {
        Ok(NotrackOrchestrator::new(&self.runner, &self.config.iptables).current_state().await?)
    }

    async fn status(&self, status: ChassisStatus) {
        report_status(self.status.as_ref(), status).await;
    }
}
