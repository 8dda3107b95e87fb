//! Shared session plumbing: configuration, control tokens, and the
//! validation handshake.
//!
//! Immediately after stream establishment both sides exchange one line
//! carrying their command-registry identity token — the handler sends
//! first and then reads, the client reads first and then sends — and
//! abort as incompatible on any mismatch. All later commanding traffic
//! is paced by the `request` / `ack` control tokens defined here.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::{
    codec::CodecKind,
    commanding::MalformedForm,
    connection::{Connection, DEFAULT_LINE_LIMIT, StreamError},
    form::{DEFAULT_SEPARATION, FrameError},
};

/// Control token opening a commanding exchange, sent with a newline.
pub const REQUEST_TOKEN: &str = "request";
/// Control token acknowledging a request line. Unlike the raw framing
/// acks, this one is terminated by a newline on the wire.
pub const ACK_TOKEN: &str = "ack";
/// Default per-exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound of the client's call queue.
pub const DEFAULT_QUEUE_SIZE: usize = 10;

/// Per-session tunables shared by both sides.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sentinel separating form bodies from their appendix markers.
    pub separation: String,
    /// Deadline applied to each blocking framing operation.
    pub timeout: Duration,
    /// Keepalive interval; `None` disables polling.
    pub poll_interval: Option<Duration>,
    /// Bound of the client's call queue.
    pub queue_size: usize,
    /// Appendix codec, which must match between peers.
    pub codec: CodecKind,
    /// Ceiling for a single received line.
    pub line_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            separation: DEFAULT_SEPARATION.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            codec: CodecKind::default(),
            line_limit: DEFAULT_LINE_LIMIT,
        }
    }
}

/// Errors that terminate a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Framing-layer failure; the session cannot continue.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// A received commanding form failed validation where the session
    /// could not answer with an error form.
    #[error(transparent)]
    Malformed(#[from] MalformedForm),
    /// The peer sent an unexpected control token.
    #[error("peer sent {got:?} where {expected:?} was required")]
    ProtocolViolation {
        /// The token the protocol requires at this point.
        expected: &'static str,
        /// What actually arrived.
        got: String,
    },
    /// The handshake identity tokens differ.
    #[error("incompatible command registries: ours {ours:?}, theirs {theirs:?}")]
    Incompatible {
        /// Our identity token.
        ours: String,
        /// The peer's identity token.
        theirs: String,
    },
}

impl From<StreamError> for SessionError {
    fn from(err: StreamError) -> Self { Self::Frame(FrameError::Stream(err)) }
}

/// Handler half of the validation handshake: send our token, then read
/// and compare the peer's.
///
/// # Errors
/// [`SessionError::Incompatible`] on mismatch, or stream errors.
pub async fn validate_handler<S>(
    conn: &mut Connection<S>,
    identity: &str,
    cfg: &SessionConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_identity(conn, identity, cfg).await?;
    let theirs = conn
        .recv_line(cfg.line_limit, Some(cfg.timeout))
        .await?;
    check_identity(identity, theirs)
}

/// Client half of the validation handshake: read the handler's token
/// first, then send ours.
///
/// # Errors
/// [`SessionError::Incompatible`] on mismatch, or stream errors.
pub async fn validate_client<S>(
    conn: &mut Connection<S>,
    identity: &str,
    cfg: &SessionConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let theirs = conn
        .recv_line(cfg.line_limit, Some(cfg.timeout))
        .await?;
    send_identity(conn, identity, cfg).await?;
    check_identity(identity, theirs)
}

async fn send_identity<S>(
    conn: &mut Connection<S>,
    identity: &str,
    cfg: &SessionConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = identity.as_bytes().to_vec();
    line.push(b'\n');
    conn.send(&line, Some(cfg.timeout)).await?;
    Ok(())
}

fn check_identity(ours: &str, theirs: String) -> Result<(), SessionError> {
    if theirs == ours {
        debug!(identity = ours, "handshake validated");
        Ok(())
    } else {
        Err(SessionError::Incompatible {
            ours: ours.to_owned(),
            theirs,
        })
    }
}

/// Open a commanding exchange from the client side: send `request` and
/// require the newline-terminated `ack` answer.
///
/// # Errors
/// [`SessionError::ProtocolViolation`] when anything but `ack` comes
/// back, or stream errors.
pub(crate) async fn send_request<S>(
    conn: &mut Connection<S>,
    cfg: &SessionConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(b"request\n", Some(cfg.timeout)).await?;
    let line = conn
        .recv_line(cfg.line_limit, Some(cfg.timeout))
        .await?;
    if line == ACK_TOKEN {
        Ok(())
    } else {
        Err(SessionError::ProtocolViolation {
            expected: ACK_TOKEN,
            got: line,
        })
    }
}
