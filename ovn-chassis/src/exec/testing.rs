use std::io;
use std::sync::Mutex;
use async_trait::async_trait;
use crate::exec::{CommandOutput, CommandRunner};

type Responder = Box<dyn Fn(&[String]) -> io::Result<(i32, String)> + Send + Sync>;

/// Runner used in tests instead of `SubprocessRunner`. Every argument vector is recorded and the
/// responder decides the exit code and output, so it can be a simple script or a stateful fake of
/// the external tool.
pub struct ScriptedRunner {
    calls: Mutex<Vec<Vec<String>>>,
    responder: Responder,
}

impl ScriptedRunner {
    pub fn new(
        responder: impl Fn(&[String]) -> io::Result<(i32, String)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Answer every command with the same exit code and output.
    pub fn always(exit_code: i32, output: &str) -> Self {
        let output = output.to_string();
        Self::new(move |_| Ok((exit_code, output.clone())))
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded commands joined by spaces, easier to compare in assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|argv| argv.join(" ")).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, argv: &[String]) -> io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(argv.to_vec());
        let (exit_code, output) = (self.responder)(argv)?;
        Ok(CommandOutput {
            exit_code,
            output,
            command: argv.join(" "),
        })
    }
}
