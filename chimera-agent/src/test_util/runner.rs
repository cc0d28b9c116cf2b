use std::sync::Mutex;

use async_trait::async_trait;

use crate::host::{CommandOutput, HostRunner};
use crate::store::lock;

/// Records every host command and answers from canned responses.
///
/// A response applies to every command line starting with its prefix; the
/// most recently registered match wins. Unmatched commands succeed with
/// empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        lock(&self.responses).push((prefix.to_string(), output));
    }

    /// Command lines run so far, program and arguments joined by spaces.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl HostRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        lock(&self.calls).push(line.clone());
        let output = lock(&self.responses)
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok(""));
        Ok(output)
    }
}
