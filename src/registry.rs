//! Command registry consulted by the handler.
//!
//! Commands are registered explicitly under their wire name; the handler
//! resolves a call form's command against this fixed set and nothing
//! else. The registry also carries the opaque identity token both sides
//! compare during the validation handshake, so a client built against
//! one command set cannot silently talk to a handler exposing another.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    commanding::CallForm,
    value::{Fault, FaultKind, Value},
};

/// A dispatchable command: positional and keyword arguments in, value or
/// fault out.
pub type CommandFn =
    dyn Fn(&[Value], &std::collections::BTreeMap<String, Value>) -> Result<Value, Fault>
        + Send
        + Sync;

/// A named set of commands plus the identity token that names the set on
/// the wire.
pub struct CommandRegistry {
    identity: String,
    commands: HashMap<String, Box<CommandFn>>,
}

impl CommandRegistry {
    /// Create a registry under the given identity token. The built-in
    /// `time` command is always present; the session engine relies on it
    /// for keepalives.
    pub fn new(identity: impl Into<String>) -> Self {
        let mut registry = Self {
            identity: identity.into(),
            commands: HashMap::new(),
        };
        registry.register("time", |_pos, _kw| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| Fault::new(FaultKind::Runtime, e.to_string()))?;
            Ok(Value::Float(now.as_secs_f64()))
        });
        registry
    }

    /// The identity token exchanged during the handshake.
    #[must_use]
    pub fn identity(&self) -> &str { &self.identity }

    /// Register a command under its wire name, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, name: impl Into<String>, command: F)
    where
        F: Fn(&[Value], &std::collections::BTreeMap<String, Value>) -> Result<Value, Fault>
            + Send
            + Sync
            + 'static,
    {
        self.commands.insert(name.into(), Box::new(command));
    }

    /// Look a command up by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&CommandFn> {
        self.commands.get(name).map(AsRef::as_ref)
    }

    /// Resolve and execute a parsed call.
    ///
    /// # Errors
    /// An [`FaultKind::UnknownCommand`] fault when the name misses the
    /// registry, or whatever fault the command itself raises.
    pub fn dispatch(&self, call: &CallForm) -> Result<Value, Fault> {
        let command = self
            .lookup(&call.command)
            .ok_or_else(|| Fault::unknown_command(&call.command))?;
        command(&call.pos_args, &call.kw_args)
    }

    /// The registered command names, sorted.
    #[must_use]
    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new("test-v1");
        registry.register("upper", |pos, _kw| {
            let text = pos
                .first()
                .and_then(Value::as_text)
                .ok_or_else(|| Fault::new(FaultKind::Type, "upper needs one text argument"))?;
            Ok(Value::Text(text.to_uppercase()))
        });
        registry
    }

    #[test]
    fn time_command_is_always_registered() {
        let registry = CommandRegistry::new("any");
        let call = CallForm::new("time", vec![], BTreeMap::new());
        let value = registry.dispatch(&call).unwrap();
        assert!(matches!(value, Value::Float(secs) if secs > 0.0));
    }

    #[test]
    fn dispatch_runs_registered_commands() {
        let call = CallForm::new(
            "upper",
            vec![Value::Text("abc".to_owned())],
            BTreeMap::new(),
        );
        assert_eq!(
            registry().dispatch(&call).unwrap(),
            Value::Text("ABC".to_owned())
        );
    }

    #[test]
    fn unknown_command_raises_the_dedicated_fault() {
        let call = CallForm::new("missing", vec![], BTreeMap::new());
        let fault = registry().dispatch(&call).unwrap_err();
        assert_eq!(fault.kind, FaultKind::UnknownCommand);
    }

    #[test]
    fn command_faults_surface_unchanged() {
        let call = CallForm::new("upper", vec![Value::Int(3)], BTreeMap::new());
        let fault = registry().dispatch(&call).unwrap_err();
        assert_eq!(fault.kind, FaultKind::Type);
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(registry().command_names(), vec!["time", "upper"]);
    }
}
