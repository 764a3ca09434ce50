use std::fmt;
use serde::Serialize;
use ovn_chassis_schemas::settings::IptablesSettings;
use crate::exec::CommandRunner;
use crate::iptables::{IptablesError, IptablesHelper};

/// Where the NOTRACK chain is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotrackChainState {
    /// neither chain is installed
    Absent,
    /// the temporary chain exists and is being filled, nothing jumps to it yet
    Building,
    /// the temporary chain is attached to every entry point, alongside the old chain if there is one
    Staged,
    /// the canonical chain is attached to every entry point
    Active,
    /// the old canonical chain is being detached and deleted
    Decommissioning,
}

impl fmt::Display for NotrackChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            NotrackChainState::Absent => "absent",
            NotrackChainState::Building => "building",
            NotrackChainState::Staged => "staged",
            NotrackChainState::Active => "active",
            NotrackChainState::Decommissioning => "decommissioning",
        };
        f.write_str(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapStep {
    RepairStale,
    Validate,
    Build,
    Stage,
    Decommission,
    Promote,
    Done,
}

/// Replaces the NOTRACK chain without a window where no rules are installed. The new rule set is
/// built under the temporary name and attached next to the old chain before the old chain is
/// removed, then the temporary chain takes over the canonical name.
///
/// No progress is persisted. A pass that fails part way leaves the host as it was at the failing
/// step and the next pass starts by removing whatever temporary chain was left behind.
pub struct NotrackOrchestrator<'a, R: CommandRunner + ?Sized> {
    ipt: IptablesHelper<'a, R>,
    settings: &'a IptablesSettings,
}

impl<'a, R: CommandRunner + ?Sized> NotrackOrchestrator<'a, R> {
    pub fn new(runner: &'a R, settings: &'a IptablesSettings) -> Self {
        Self {
            ipt: IptablesHelper::new(runner, &settings.command),
            settings,
        }
    }

    pub async fn configure(
        &self,
        enabled: bool,
        criteria: &[String],
    ) -> Result<NotrackChainState, IptablesError> {
        if enabled {
            self.converge(criteria).await
        } else {
            self.remove().await
        }
    }

    /// Install `criteria` as the rule set of the canonical chain, one NOTRACK rule per entry in the
    /// given order. Every criterion is validated before anything is changed.
    pub async fn converge(&self, criteria: &[String]) -> Result<NotrackChainState, IptablesError> {
        let table = &self.settings.table;
        let chain = &self.settings.chain_name;
        let temp = self.settings.temp_chain_name();

        let mut state = NotrackChainState::Absent;
        let mut step = SwapStep::RepairStale;
        while step != SwapStep::Done {
            tracing::debug!("notrack chain {state}, next step {step:?}");
            step = match step {
                SwapStep::RepairStale => {
                    if self.deinit_chain(&temp).await? {
                        tracing::warn!("removed stale chain `{temp}` left by an earlier pass");
                    }
                    SwapStep::Validate
                }
                SwapStep::Validate => {
                    for criterion in criteria {
                        self.ipt.check_criteria_ok(criterion, &temp, table).await?;
                    }
                    SwapStep::Build
                }
                SwapStep::Build => {
                    self.ipt.chain_create(&temp, table).await?;
                    state = NotrackChainState::Building;
                    for criterion in criteria {
                        self.ipt
                            .chain_append_notrack_rule(&temp, criterion, table, &self.settings.rule_comment)
                            .await?;
                    }
                    SwapStep::Stage
                }
                SwapStep::Stage => {
                    for entry_point in &self.settings.entry_points {
                        self.ipt.chain_attach_to(&temp, entry_point, table).await?;
                    }
                    state = NotrackChainState::Staged;
                    SwapStep::Decommission
                }
                SwapStep::Decommission => {
                    state = NotrackChainState::Decommissioning;
                    self.deinit_chain(chain).await?;
                    SwapStep::Promote
                }
                SwapStep::Promote => {
                    self.ipt.chain_rename(&temp, chain, table).await?;
                    state = NotrackChainState::Active;
                    SwapStep::Done
                }
                SwapStep::Done => SwapStep::Done,
            };
        }
        tracing::info!("notrack chain `{chain}` {state} with {} rule(s)", criteria.len());
        Ok(state)
    }

    /// Remove the canonical chain and any temporary chain.
    pub async fn remove(&self) -> Result<NotrackChainState, IptablesError> {
        let removed = self.deinit_chain(&self.settings.chain_name).await?;
        let removed_temp = self.deinit_chain(&self.settings.temp_chain_name()).await?;
        if removed || removed_temp {
            tracing::info!("removed notrack chain `{}`", self.settings.chain_name);
        }
        Ok(NotrackChainState::Absent)
    }

    /// Detach `chain` from the entry points that jump to it, flush and delete it. Returns whether
    /// the chain existed.
    pub async fn deinit_chain(&self, chain: &str) -> Result<bool, IptablesError> {
        let table = &self.settings.table;
        if !self.ipt.chain_exists(chain, table).await? {
            return Ok(false);
        }
        let jump = format!("-j {chain}");
        for entry_point in &self.settings.entry_points {
            if self.ipt.rule_exists(&jump, entry_point, table).await? {
                self.ipt.chain_detach_from(chain, entry_point, table).await?;
            }
        }
        // a chain can't be deleted while it still has rules
        self.ipt.chain_flush(chain, table).await?;
        self.ipt.chain_delete(chain, table).await?;
        Ok(true)
    }

    /// Inspect the host without changing anything.
    pub async fn current_state(&self) -> Result<NotrackChainState, IptablesError> {
        let table = &self.settings.table;
        let chain = &self.settings.chain_name;
        let temp = self.settings.temp_chain_name();
        let canonical_exists = self.ipt.chain_exists(chain, table).await?;
        if self.ipt.chain_exists(&temp, table).await? {
            if !self.attached_everywhere(&temp).await? {
                return Ok(NotrackChainState::Building);
            }
            // the old chain is only partly attached once its removal has started
            if canonical_exists && !self.attached_everywhere(chain).await? {
                return Ok(NotrackChainState::Decommissioning);
            }
            return Ok(NotrackChainState::Staged);
        }
        match (canonical_exists, self.attached_everywhere(chain).await?) {
            (false, _) => Ok(NotrackChainState::Absent),
            (true, true) => Ok(NotrackChainState::Active),
            // left over from an interrupted removal
            (true, false) => Ok(NotrackChainState::Decommissioning),
        }
    }

    async fn attached_everywhere(&self, chain: &str) -> Result<bool, IptablesError> {
        let table = &self.settings.table;
        if !self.ipt.chain_exists(chain, table).await? {
            return Ok(false);
        }
        let jump = format!("-j {chain}");
        for entry_point in &self.settings.entry_points {
            if !self.ipt.rule_exists(&jump, entry_point, table).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
