//! Named command handlers.
//!
//! Commands are plugin-defined actions such as "restart deployment". Each
//! takes and returns arbitrary JSON, carried as opaque envelopes across the
//! process boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::context::PluginContext;
use crate::rpc::RpcStatus;

/// A single command implementation.
pub type CommandFn = dyn Fn(&PluginContext, Value) -> Result<Value, RpcStatus> + Send + Sync;

/// The command capability.
pub trait CommandProvider: Send + Sync {
    /// Names of the commands served, sorted.
    ///
    /// # Errors
    ///
    /// Returns the failure status when the provider is remote.
    fn commands(&self, ctx: &PluginContext) -> Result<Vec<String>, RpcStatus>;

    /// Runs `command` with `payload`.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for unknown commands, otherwise whatever the
    /// command reports.
    fn run(&self, ctx: &PluginContext, command: &str, payload: Value) -> Result<Value, RpcStatus>;
}

/// Dispatches commands to registered closures.
#[derive(Default, Clone)]
pub struct CommandRouter {
    handlers: BTreeMap<String, Arc<CommandFn>>,
}

impl CommandRouter {
    /// Creates a router with no commands.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any earlier handler.
    #[must_use]
    pub fn with_command<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&PluginContext, Value) -> Result<Value, RpcStatus> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }
}

impl CommandProvider for CommandRouter {
    fn commands(&self, _ctx: &PluginContext) -> Result<Vec<String>, RpcStatus> {
        Ok(self.handlers.keys().cloned().collect())
    }

    fn run(&self, ctx: &PluginContext, command: &str, payload: Value) -> Result<Value, RpcStatus> {
        let handler = self
            .handlers
            .get(command)
            .ok_or_else(|| RpcStatus::not_found(format!("command '{command}' not found")))?;
        handler(ctx, payload)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn router() -> CommandRouter {
        CommandRouter::new()
            .with_command("echo", |_, payload| Ok(payload))
            .with_command("whoami", |ctx, _| Ok(json!(ctx.requester_id())))
    }

    #[rstest]
    fn lists_commands_sorted() {
        let ctx = PluginContext::new("ui");
        assert_eq!(
            router().commands(&ctx).expect("commands"),
            ["echo", "whoami"]
        );
    }

    #[rstest]
    #[case::echo("echo", json!({ "n": 1 }), json!({ "n": 1 }))]
    #[case::context("whoami", Value::Null, json!("ui"))]
    fn runs_registered_commands(#[case] name: &str, #[case] payload: Value, #[case] expected: Value) {
        let ctx = PluginContext::new("ui");
        assert_eq!(router().run(&ctx, name, payload), Ok(expected));
    }

    #[rstest]
    fn unknown_command_is_not_found() {
        let ctx = PluginContext::new("ui");
        let status = router()
            .run(&ctx, "nope", Value::Null)
            .expect_err("unknown command");
        assert_eq!(status.code, crate::rpc::StatusCode::NotFound);
    }
}
