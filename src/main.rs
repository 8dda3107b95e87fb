//! The formwire daemon: serves a small default command set over TCP.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use formwire::{
    config::{AppConfig, Cli},
    registry::CommandRegistry,
    server,
    value::{Fault, FaultKind, Value},
};
use tracing_subscriber::EnvFilter;

/// The command set the stock daemon exposes, alongside the built-in
/// `time` command.
fn default_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new("formwire-default-v1");
    registry.register("echo", |pos, _kw| Ok(Value::List(pos.to_vec())));
    registry.register("upper", |pos, _kw| {
        let text = pos
            .first()
            .and_then(Value::as_text)
            .ok_or_else(|| Fault::new(FaultKind::Type, "upper takes one text argument"))?;
        Ok(Value::Text(text.to_uppercase()))
    });
    registry.register("divide", |pos, _kw| {
        let (Some(a), Some(b)) = (
            pos.first().and_then(Value::as_float),
            pos.get(1).and_then(Value::as_float),
        ) else {
            return Err(Fault::new(FaultKind::Type, "divide takes two numbers"));
        };
        if b == 0.0 {
            return Err(Fault::new(FaultKind::Arithmetic, "zero divisor"));
        }
        Ok(Value::Float(a / b))
    });
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli)?;
    let session = cfg.session_config()?;
    let registry = Arc::new(default_registry());
    server::run(&cfg.bind, registry, session).await
}
