use thiserror::Error;
use crate::exec::{CommandOutput, CommandRunner};
use crate::vec_of_strings;

pub mod notrack;

/// Target every rule appended by the agent jumps to.
pub const NOTRACK_TARGET: &str = "NOTRACK";
/// `iptables -C` exits with this code when it can't parse the rule, as opposed to 1 for a rule that
/// is simply not there.
pub const INVALID_RULE_EXIT_CODE: i32 = 2;

#[derive(Error, Debug)]
pub enum IptablesError {
    #[error("Could not {operation} in table `{table}`, command: `{command}`, error code: `{exit_code}`, command output: {output}")]
    ChainOperation {
        /// what was attempted, including the chain names involved
        operation: String,
        table: String,
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("Given iptables criteria `{criteria}` for chain `{chain}` and table `{table}` is not valid, command: `{command}`, error code: `{exit_code}`, command output: {output}")]
    InvalidCriteria {
        criteria: String,
        chain: String,
        table: String,
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("could not launch `{command}`")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Chain level operations on iptables, one command per operation. Mutating operations fail with
/// `IptablesError::ChainOperation` on any nonzero exit, the checks return a boolean instead.
pub struct IptablesHelper<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    command: String,
}

impl<'a, R: CommandRunner + ?Sized> IptablesHelper<'a, R> {
    pub fn new(runner: &'a R, command: impl Into<String>) -> Self {
        Self {
            runner,
            command: command.into(),
        }
    }

    pub async fn chain_create(&self, chain: &str, table: &str) -> Result<(), IptablesError> {
        tracing::info!("ipt: creating chain `{chain}` in table `{table}`");
        self.exec_checked(table, vec_of_strings!["-N", chain], || {
            format!("create iptables chain `{chain}`")
        })
        .await
    }

    /// The chain has to be empty and unreferenced.
    pub async fn chain_delete(&self, chain: &str, table: &str) -> Result<(), IptablesError> {
        tracing::info!("ipt: deleting chain `{chain}` in table `{table}`");
        self.exec_checked(table, vec_of_strings!["-X", chain], || {
            format!("delete iptables chain `{chain}`")
        })
        .await
    }

    pub async fn chain_flush(&self, chain: &str, table: &str) -> Result<(), IptablesError> {
        tracing::info!("ipt: flushing chain `{chain}` in table `{table}`");
        self.exec_checked(table, vec_of_strings!["-F", chain], || {
            format!("flush iptables chain `{chain}`")
        })
        .await
    }

    /// Jumps referencing the chain follow the rename.
    pub async fn chain_rename(
        &self,
        chain: &str,
        new_name: &str,
        table: &str,
    ) -> Result<(), IptablesError> {
        tracing::info!("ipt: renaming chain `{chain}` to `{new_name}` in table `{table}`");
        self.exec_checked(table, vec_of_strings!["-E", chain, new_name], || {
            format!("rename iptables chain `{chain}` to new name `{new_name}`")
        })
        .await
    }

    /// Append a jump to `chain` at the end of `entry_point`.
    pub async fn chain_attach_to(
        &self,
        chain: &str,
        entry_point: &str,
        table: &str,
    ) -> Result<(), IptablesError> {
        tracing::info!("ipt: attaching chain `{chain}` to `{entry_point}` in table `{table}`");
        self.exec_checked(table, vec_of_strings!["-A", entry_point, "-j", chain], || {
            format!("attach iptables chain `{chain}` to chain `{entry_point}`")
        })
        .await
    }

    pub async fn chain_detach_from(
        &self,
        chain: &str,
        entry_point: &str,
        table: &str,
    ) -> Result<(), IptablesError> {
        tracing::info!("ipt: detaching chain `{chain}` from `{entry_point}` in table `{table}`");
        self.exec_checked(table, vec_of_strings!["-D", entry_point, "-j", chain], || {
            format!("detach iptables chain `{chain}` from chain `{entry_point}`")
        })
        .await
    }

    /// Append a NOTRACK rule matching `criteria` to `chain`, marked with `comment` so it can be
    /// told apart from rules the agent doesn't own.
    pub async fn chain_append_notrack_rule(
        &self,
        chain: &str,
        criteria: &str,
        table: &str,
        comment: &str,
    ) -> Result<(), IptablesError> {
        tracing::info!("ipt: appending rule with criteria `{criteria}` to chain `{chain}` in table `{table}`");
        let mut args = vec_of_strings!["-A", chain];
        args.extend(criteria.split_whitespace().map(String::from));
        args.extend(vec_of_strings!["-j", NOTRACK_TARGET, "-m", "comment", "--comment", comment]);
        self.exec_checked(table, args, || {
            format!("append iptables rule with criteria `{criteria}` to chain `{chain}`")
        })
        .await
    }

    pub async fn chain_exists(&self, chain: &str, table: &str) -> Result<bool, IptablesError> {
        tracing::debug!("ipt: checking if chain `{chain}` exists in table `{table}`");
        let result = self.exec(table, vec_of_strings!["-L", chain]).await?;
        Ok(result.success())
    }

    /// Whether a rule matching `criteria` is in `chain`, i.e. `rule_exists("-j my-chain", "OUTPUT", "raw")`.
    pub async fn rule_exists(
        &self,
        criteria: &str,
        chain: &str,
        table: &str,
    ) -> Result<bool, IptablesError> {
        tracing::debug!("ipt: checking rule with criteria `{criteria}` exists in chain `{chain}` and table `{table}`");
        let result = self.exec(table, check_args(criteria, chain)).await?;
        Ok(result.success())
    }

    /// Let iptables parse `criteria` as a rule of `chain`. Only exit code 2 means the criteria are
    /// invalid, any other failure is the rule (or chain) not being there.
    pub async fn check_criteria_ok(
        &self,
        criteria: &str,
        chain: &str,
        table: &str,
    ) -> Result<(), IptablesError> {
        tracing::debug!("ipt: checking criteria `{criteria}`");
        let result = self.exec(table, check_args(criteria, chain)).await?;
        if result.exit_code == INVALID_RULE_EXIT_CODE {
            return Err(IptablesError::InvalidCriteria {
                criteria: criteria.to_string(),
                chain: chain.to_string(),
                table: table.to_string(),
                command: result.command,
                exit_code: result.exit_code,
                output: result.output,
            });
        }
        Ok(())
    }

    async fn exec(&self, table: &str, args: Vec<String>) -> Result<CommandOutput, IptablesError> {
        let mut cmd = vec_of_strings![&self.command, "-t", table];
        cmd.extend(args);
        self.runner
            .execute(&cmd)
            .await
            .map_err(|source| IptablesError::Launch { command: cmd.join(" "), source })
    }

    async fn exec_checked(
        &self,
        table: &str,
        args: Vec<String>,
        operation: impl FnOnce() -> String,
    ) -> Result<(), IptablesError> {
        let result = self.exec(table, args).await?;
        if !result.success() {
            return Err(IptablesError::ChainOperation {
                operation: operation(),
                table: table.to_string(),
                command: result.command,
                exit_code: result.exit_code,
                output: result.output,
            });
        }
        Ok(())
    }
}

fn check_args(criteria: &str, chain: &str) -> Vec<String> {
    let mut args = vec_of_strings!["-C", chain];
    args.extend(criteria.split_whitespace().map(String::from));
    args
}
