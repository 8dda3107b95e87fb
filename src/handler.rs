//! Handler side of a commanding session.
//!
//! After a successful handshake the handler serves requests forever:
//! each exchange is a `request` line answered with `ack\n`, one received
//! call form, a registry dispatch, and one reply form. Malformed calls
//! are answered with an error form rather than tearing the session down;
//! framing errors are fatal. The only way to wake a handler parked on
//! the `request` read is to close the stream, which the shutdown channel
//! does by ending the task.

use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tracing::{debug, warn};

use crate::{
    commanding::{CallForm, ErrorForm, ResultForm},
    connection::{Connection, StreamError},
    form::{Form, FormReceiver, FormSender},
    registry::CommandRegistry,
    session::{self, REQUEST_TOKEN, SessionConfig, SessionError},
    value::{Fault, FaultKind},
};

/// Serve one validated session until the peer hangs up, a framing error
/// occurs, or shutdown is signalled.
///
/// # Errors
/// [`SessionError::Incompatible`] when the handshake fails, a
/// [`SessionError::ProtocolViolation`] for a stray control token, or any
/// framing error. A peer that closes the stream between exchanges ends
/// the session cleanly.
pub async fn serve_session<S>(
    io: S,
    registry: Arc<CommandRegistry>,
    cfg: SessionConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(io);
    session::validate_handler(&mut conn, registry.identity(), &cfg).await?;

    loop {
        // The request read blocks indefinitely; only the peer or the
        // shutdown channel can end the wait.
        let line = tokio::select! {
            line = conn.recv_line(cfg.line_limit, None) => line,
            _ = shutdown.changed() => {
                debug!("handler shutting down");
                return Ok(());
            }
        };
        let line = match line {
            Ok(line) => line,
            Err(StreamError::EndOfStream) => {
                debug!("peer closed the session");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if line != REQUEST_TOKEN {
            return Err(SessionError::ProtocolViolation {
                expected: REQUEST_TOKEN,
                got: line,
            });
        }
        conn.send(b"ack\n", Some(cfg.timeout)).await?;

        let form = FormReceiver::new(
            &mut conn,
            &cfg.separation,
            cfg.timeout,
            cfg.line_limit,
            cfg.codec,
        )?
        .receive()
        .await?;

        let reply = build_reply(&form, &registry, &cfg)?;
        FormSender::new(&mut conn, &cfg.separation, cfg.timeout)?
            .send(&reply, true)
            .await?;
    }
}

/// Run one dispatch and shape the outcome as a reply form. A call that
/// fails to parse yields an error form carrying the parse failure.
fn build_reply(
    form: &Form,
    registry: &CommandRegistry,
    cfg: &SessionConfig,
) -> Result<Form, SessionError> {
    let outcome = match CallForm::from_form(form) {
        Ok(call) => {
            debug!(command = %call.command, "dispatching call");
            registry.dispatch(&call)
        }
        Err(err) => {
            warn!(error = %err, "received call failed to parse");
            Err(Fault::new(FaultKind::Value, err.to_string()))
        }
    };
    let reply = match outcome {
        Ok(value) => ResultForm::new(value).to_form(cfg.codec)?,
        Err(fault) => ErrorForm::new(fault).to_form(cfg.codec, &cfg.separation)?,
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{codec::CodecKind, value::Value};

    fn test_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new("ctx-v1");
        registry.register("upper", |pos, _kw| {
            let text = pos
                .first()
                .and_then(Value::as_text)
                .ok_or_else(|| Fault::new(FaultKind::Type, "upper needs text"))?;
            Ok(Value::Text(text.to_uppercase()))
        });
        registry
    }

    #[test]
    fn reply_for_a_good_call_is_a_result_form() {
        let cfg = SessionConfig::default();
        let call = CallForm::new(
            "upper",
            vec![Value::Text("abc".to_owned())],
            BTreeMap::new(),
        );
        let form = call.to_form(CodecKind::Json).unwrap();
        let reply = build_reply(&form, &test_registry(), &cfg).unwrap();
        let result = ResultForm::from_form(&reply).unwrap();
        assert_eq!(result.value, Value::Text("ABC".to_owned()));
    }

    #[test]
    fn reply_for_an_unknown_command_is_an_error_form() {
        let cfg = SessionConfig::default();
        let call = CallForm::new("missing", vec![], BTreeMap::new());
        let form = call.to_form(CodecKind::Json).unwrap();
        let reply = build_reply(&form, &test_registry(), &cfg).unwrap();
        let error = ErrorForm::from_form(&reply).unwrap();
        assert_eq!(error.fault.kind, FaultKind::UnknownCommand);
    }

    #[test]
    fn reply_for_a_malformed_call_is_an_error_form() {
        let cfg = SessionConfig::default();
        // A result form is not a call; the handler answers rather than
        // tearing the session down.
        let stray = ResultForm::new(Value::Int(1)).to_form(CodecKind::Json).unwrap();
        let reply = build_reply(&stray, &test_registry(), &cfg).unwrap();
        let error = ErrorForm::from_form(&reply).unwrap();
        assert_eq!(error.fault.kind, FaultKind::Value);
    }
}
