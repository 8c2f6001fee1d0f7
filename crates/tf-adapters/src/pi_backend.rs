//! Argv construction for the `pi` agent.

use tf_core::AgentRequest;

/// How the agent is invoked: `{command} -p [--mode json] "{prompt}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiBackend {
    /// Binary name or path.
    pub command: String,
}

impl PiBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Builds `(command, args)` for one attempt.
    ///
    /// `--session` is never passed.
    pub fn build_command(&self, prompt: &str, json_mode: bool) -> (String, Vec<String>) {
        let mut args = vec!["-p".to_string()];
        if json_mode {
            args.push("--mode".to_string());
            args.push("json".to_string());
        }
        args.push(prompt.to_string());

        tracing::debug!(
            command = %self.command,
            args_count = args.len(),
            json_mode,
            "Built agent command"
        );
        tracing::trace!(prompt = %prompt, "Agent prompt");

        (self.command.clone(), args)
    }

    /// Full argv for `request`, command first.
    pub fn argv(&self, request: &AgentRequest) -> Vec<String> {
        let (command, args) = self.build_command(&request.prompt(), request.json_mode);
        std::iter::once(command).chain(args).collect()
    }
}

impl Default for PiBackend {
    fn default() -> Self {
        Self::new("pi")
    }
}
