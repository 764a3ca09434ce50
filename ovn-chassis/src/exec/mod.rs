use std::io;
use async_trait::async_trait;
use tokio::process::Command;

#[cfg(test)]
pub mod testing;

/// Helper macro to convert Vec<&str> to Vec<String> to avoid having to keep writing `.to_string()`
#[macro_export]
macro_rules! vec_of_strings {
    ($($x:expr),*) => (vec![$($x.to_string()),*]);
}

/// The result of running one external command. A nonzero exit code is not an error at this level,
/// callers decide what it means for the operation they attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// exit code of the process, -1 if it was terminated by a signal
    pub exit_code: i32,
    /// stdout followed by stderr
    pub output: String,
    /// the argument vector joined by spaces, for logs and error messages
    pub command: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands. This is the seam between the reconciliation logic and the host, in
/// unit testing a runner that records the argument vectors and answers from a script is used
/// instead so that the exact commands can be asserted without touching the host.
///
/// Only a failure to launch the process is returned as an error.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, argv: &[String]) -> io::Result<CommandOutput>;
}

/// Runs the command as a child process of the agent and waits for it to exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn execute(&self, argv: &[String]) -> io::Result<CommandOutput> {
        let command = argv.join(" ");
        tracing::debug!("running command: {command}");
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let sub_process = Command::new(program)
            .args(args)
            .output()
            .await?;

        let mut output = String::from_utf8_lossy(&sub_process.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&sub_process.stderr));
        let exit_code = sub_process.status.code().unwrap_or(-1);
        if exit_code != 0 {
            tracing::trace!("command ({command}) exited with {exit_code}: {}", output.trim());
        }
        Ok(CommandOutput {
            exit_code,
            output,
            command,
        })
    }
}
