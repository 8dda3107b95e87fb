//! Form framing: the three-part framed message and its wire halves.
//!
//! A form is a title line, a block of body lines, and an appendix blob
//! encoded by a pluggable codec. On the wire the sender emits the title,
//! then each body line, pacing itself on a three-byte `ack` after every
//! line; the body ends with a marker line made of the separation sentinel
//! immediately followed by the decimal byte length of the appendix. The
//! marker itself is never acked; the appendix bytes are, once received in
//! full.

use std::{fmt, sync::OnceLock, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::{
    codec::{CodecError, CodecKind},
    connection::{Connection, StreamError},
    value::Value,
};

/// Default sentinel separating the body from the appendix marker.
pub const DEFAULT_SEPARATION: &str = "$separation$";
/// The raw ack exchanged after each framed line (no terminator).
pub const ACK_BYTES: &[u8; 3] = b"ack";
/// Ceiling for a received appendix, mirroring the per-line ceiling's role.
pub const MAX_APPENDIX: usize = 1024 * 1024; // 1 MiB

/// Errors raised while framing forms on or off the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Stream-level failure.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Appendix codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The form does not qualify for transmission.
    #[error("form is not valid for transmission: {0}")]
    InvalidForm(&'static str),
    /// The separation sentinel must be a non-empty single line.
    #[error("separation must be a non-empty single-line string")]
    InvalidSeparation,
    /// A body line starts with the separation sentinel and adjustment is
    /// disabled.
    #[error("body line collides with the separation string")]
    BodyCollision,
    /// The peer answered something other than `ack`.
    #[error("peer answered {0:?} where an ack was required")]
    BadAck(Vec<u8>),
    /// The marker line does not carry a decimal appendix length.
    #[error("marker line {0:?} carries no parseable appendix length")]
    BadMarker(String),
    /// The announced appendix length exceeds the receive ceiling.
    #[error("appendix length {len} exceeds the {limit}-byte ceiling")]
    AppendixOverflow {
        /// Announced length.
        len: usize,
        /// Configured ceiling.
        limit: usize,
    },
}

/// A three-part framed message: title, body, appendix.
///
/// The encoded appendix is fixed at construction; received forms decode
/// it lazily on first access.
#[derive(Debug, Clone)]
pub struct Form {
    title: String,
    body: String,
    encoded: Vec<u8>,
    codec: CodecKind,
    decoded: OnceLock<Value>,
}

impl Form {
    /// Build a form from user inputs, encoding the appendix eagerly.
    ///
    /// # Errors
    /// [`FrameError::InvalidForm`] for a multi-line title, or a codec
    /// error when the appendix cannot be encoded.
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        appendix: Value,
        codec: CodecKind,
    ) -> Result<Self, FrameError> {
        let title = title.into();
        if title.contains('\n') {
            return Err(FrameError::InvalidForm("title must be a single line"));
        }
        let encoded = codec.codec().encode(&appendix)?;
        Ok(Self {
            title,
            body: body.into(),
            encoded,
            codec,
            decoded: OnceLock::from(appendix),
        })
    }

    /// Build a form from body lines rather than a joined string.
    ///
    /// # Errors
    /// As for [`Form::new`].
    pub fn from_lines(
        title: impl Into<String>,
        lines: &[impl AsRef<str>],
        appendix: Value,
        codec: CodecKind,
    ) -> Result<Self, FrameError> {
        let body = lines
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(title, body, appendix, codec)
    }

    /// Reassemble a form from received wire parts. The appendix stays
    /// encoded until first accessed.
    #[must_use]
    pub fn from_wire(title: String, body: String, encoded: Vec<u8>, codec: CodecKind) -> Self {
        Self {
            title,
            body,
            encoded,
            codec,
            decoded: OnceLock::new(),
        }
    }

    /// The single-line title.
    #[must_use]
    pub fn title(&self) -> &str { &self.title }

    /// The body as one newline-joined string.
    #[must_use]
    pub fn body(&self) -> &str { &self.body }

    /// The body split into lines; an empty body has no lines.
    #[must_use]
    pub fn body_lines(&self) -> Vec<&str> {
        if self.body.is_empty() {
            Vec::new()
        } else {
            self.body.split('\n').collect()
        }
    }

    /// The encoded appendix bytes.
    #[must_use]
    pub fn encoded_appendix(&self) -> &[u8] { &self.encoded }

    /// Which codec encodes this form's appendix.
    #[must_use]
    pub const fn codec_kind(&self) -> CodecKind { self.codec }

    /// The decoded appendix value, decoding on first access.
    ///
    /// # Errors
    /// Returns the codec's decode error when the stored bytes are not a
    /// valid encoding.
    pub fn appendix(&self) -> Result<&Value, CodecError> {
        if let Some(value) = self.decoded.get() {
            return Ok(value);
        }
        let value = self.codec.codec().decode(&self.encoded)?;
        Ok(self.decoded.get_or_init(|| value))
    }

    /// Whether both the body and the encoded appendix are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.body.is_empty() && self.encoded.is_empty() }

    /// A form is valid when its title has substance and it carries any
    /// payload at all.
    #[must_use]
    pub fn is_valid(&self) -> bool { !self.title.trim().is_empty() && !self.is_empty() }
}

impl PartialEq for Form {
    /// Structural equality: same title, same body lines in any order,
    /// same decoded appendix. Forms whose appendix fails to decode never
    /// compare equal.
    fn eq(&self, other: &Self) -> bool {
        if self.title != other.title {
            return false;
        }
        let mut ours = self.body_lines();
        let mut theirs = other.body_lines();
        ours.sort_unstable();
        theirs.sort_unstable();
        if ours != theirs {
            return false;
        }
        match (self.appendix(), other.appendix()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        for line in self.body_lines() {
            writeln!(f, "{line}")?;
        }
        match self.appendix() {
            Ok(Value::Map(entries)) => {
                writeln!(f, "{{")?;
                for (key, value) in entries {
                    writeln!(f, " {key}: {value}")?;
                }
                write!(f, "}}")
            }
            Ok(value) => write!(f, "{value}"),
            Err(_) => write!(f, "<{} undecoded bytes>", self.encoded.len()),
        }
    }
}

fn check_separation(separation: &str) -> Result<(), FrameError> {
    if separation.trim().is_empty() || separation.contains('\n') {
        return Err(FrameError::InvalidSeparation);
    }
    Ok(())
}

/// Transmitting half of the form protocol.
///
/// Writes one form per [`FormSender::send`] call, blocking on the peer's
/// raw `ack` after the title, after every body line, and after the
/// appendix bytes. The marker line gets no ack.
pub struct FormSender<'a, S> {
    conn: &'a mut Connection<S>,
    separation: &'a str,
    timeout: Duration,
}

impl<'a, S> FormSender<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a sender over a connection.
    ///
    /// # Errors
    /// [`FrameError::InvalidSeparation`] when the sentinel is empty or
    /// spans lines.
    pub fn new(
        conn: &'a mut Connection<S>,
        separation: &'a str,
        timeout: Duration,
    ) -> Result<Self, FrameError> {
        check_separation(separation)?;
        Ok(Self {
            conn,
            separation,
            timeout,
        })
    }

    /// Transmit one form.
    ///
    /// With `adjust_body` set, body lines that start with the separation
    /// sentinel are sent with one leading space; otherwise such a body
    /// fails with [`FrameError::BodyCollision`] before anything is
    /// written.
    ///
    /// # Errors
    /// Any stream error aborts transmission; the session cannot recover a
    /// partial form and must tear down.
    pub async fn send(&mut self, form: &Form, adjust_body: bool) -> Result<(), FrameError> {
        if !form.is_valid() {
            return Err(FrameError::InvalidForm(
                "title must have substance and body or appendix must be non-empty",
            ));
        }
        let lines = self.prepare_body(form, adjust_body)?;

        trace!(title = form.title(), lines = lines.len(), "sending form");
        self.send_line(form.title()).await?;
        self.wait_ack().await?;
        for line in &lines {
            self.send_line(line).await?;
            self.wait_ack().await?;
        }
        let marker = format!("{}{}", self.separation, form.encoded_appendix().len());
        self.send_line(&marker).await?;
        self.conn
            .send(form.encoded_appendix(), Some(self.timeout))
            .await?;
        self.wait_ack().await?;
        Ok(())
    }

    fn prepare_body(&self, form: &Form, adjust: bool) -> Result<Vec<String>, FrameError> {
        let mut lines = Vec::new();
        for line in form.body_lines() {
            if line.starts_with(self.separation) {
                if !adjust {
                    return Err(FrameError::BodyCollision);
                }
                lines.push(format!(" {line}"));
            } else {
                lines.push(line.to_owned());
            }
        }
        Ok(lines)
    }

    async fn send_line(&mut self, line: &str) -> Result<(), FrameError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.conn.send(&bytes, Some(self.timeout)).await?;
        Ok(())
    }

    async fn wait_ack(&mut self) -> Result<(), FrameError> {
        let reply = self
            .conn
            .recv_exact(ACK_BYTES.len(), Some(self.timeout))
            .await?;
        if reply != ACK_BYTES {
            return Err(FrameError::BadAck(reply));
        }
        Ok(())
    }
}

/// Receiving half of the form protocol.
///
/// Mirrors [`FormSender`]: acks the title and every body line, treats the
/// first line that extends the separation sentinel as the marker (no ack),
/// then reads exactly the announced appendix length and acks it.
pub struct FormReceiver<'a, S> {
    conn: &'a mut Connection<S>,
    separation: &'a str,
    timeout: Duration,
    line_limit: usize,
    codec: CodecKind,
}

impl<'a, S> FormReceiver<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a receiver over a connection.
    ///
    /// # Errors
    /// [`FrameError::InvalidSeparation`] when the sentinel is empty or
    /// spans lines.
    pub fn new(
        conn: &'a mut Connection<S>,
        separation: &'a str,
        timeout: Duration,
        line_limit: usize,
        codec: CodecKind,
    ) -> Result<Self, FrameError> {
        check_separation(separation)?;
        Ok(Self {
            conn,
            separation,
            timeout,
            line_limit,
            codec,
        })
    }

    /// Receive one complete form. The appendix is left encoded for lazy
    /// decoding.
    ///
    /// # Errors
    /// Any stream error, a marker without a parseable length, or an
    /// announced appendix length beyond [`MAX_APPENDIX`].
    pub async fn receive(&mut self) -> Result<Form, FrameError> {
        let title = self.recv_line().await?;
        self.send_ack().await?;

        let mut lines = Vec::new();
        let appendix_len = loop {
            let line = self.recv_line().await?;
            if let Some(len) = self.parse_marker(&line)? {
                break len;
            }
            lines.push(line);
            self.send_ack().await?;
        };
        if appendix_len > MAX_APPENDIX {
            return Err(FrameError::AppendixOverflow {
                len: appendix_len,
                limit: MAX_APPENDIX,
            });
        }

        let encoded = self
            .conn
            .recv_exact(appendix_len, Some(self.timeout))
            .await?;
        self.send_ack().await?;

        trace!(title = %title, lines = lines.len(), appendix = appendix_len, "received form");
        Ok(Form::from_wire(title, lines.join("\n"), encoded, self.codec))
    }

    /// A line is the marker iff it starts with the separation sentinel
    /// and is strictly longer than it; the excess must be the decimal
    /// appendix length.
    fn parse_marker(&self, line: &str) -> Result<Option<usize>, FrameError> {
        if line.len() <= self.separation.len() || !line.starts_with(self.separation) {
            return Ok(None);
        }
        let suffix = &line[self.separation.len()..];
        let len = suffix
            .trim()
            .parse::<usize>()
            .map_err(|_| FrameError::BadMarker(line.to_owned()))?;
        Ok(Some(len))
    }

    async fn recv_line(&mut self) -> Result<String, FrameError> {
        Ok(self
            .conn
            .recv_line(self.line_limit, Some(self.timeout))
            .await?)
    }

    async fn send_ack(&mut self) -> Result<(), FrameError> {
        self.conn.send(ACK_BYTES, Some(self.timeout)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::rstest;

    use super::*;

    fn small_form() -> Form {
        Form::new(
            "NOTICE",
            "first\nsecond",
            Value::Map(BTreeMap::from([("k".to_owned(), Value::Int(1))])),
            CodecKind::Json,
        )
        .unwrap()
    }

    #[test]
    fn multi_line_title_is_rejected() {
        let err = Form::new("a\nb", "", Value::List(vec![]), CodecKind::Json).unwrap_err();
        assert!(matches!(err, FrameError::InvalidForm(_)));
    }

    #[rstest]
    #[case("", "body", false)]
    #[case("   ", "body", false)]
    #[case("TITLE", "", true)] // empty body but non-empty appendix encoding
    #[case("TITLE", "body", true)]
    fn validity_tracks_title_and_payload(
        #[case] title: &str,
        #[case] body: &str,
        #[case] valid: bool,
    ) {
        let form = Form::new(title, body, Value::List(vec![Value::Int(1)]), CodecKind::Json)
            .unwrap();
        assert_eq!(form.is_valid(), valid);
    }

    #[test]
    fn empty_body_has_no_lines() {
        let form = Form::new("T", "", Value::List(vec![]), CodecKind::Json).unwrap();
        assert!(form.body_lines().is_empty());
        assert_eq!(small_form().body_lines(), vec!["first", "second"]);
    }

    #[test]
    fn equality_ignores_body_line_order() {
        let a = Form::new("T", "x:1\ny:2", Value::List(vec![]), CodecKind::Json).unwrap();
        let b = Form::new("T", "y:2\nx:1", Value::List(vec![]), CodecKind::Json).unwrap();
        let c = Form::new("T", "x:1\nz:3", Value::List(vec![]), CodecKind::Json).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn wire_form_decodes_lazily() {
        let form = Form::from_wire(
            "T".to_owned(),
            String::new(),
            b"[1, 2]".to_vec(),
            CodecKind::Json,
        );
        assert_eq!(
            form.appendix().unwrap(),
            &Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn zero_length_appendix_decodes_to_empty_list() {
        let form = Form::from_wire("T".to_owned(), "b".to_owned(), Vec::new(), CodecKind::Json);
        assert_eq!(form.codec_kind(), CodecKind::Json);
        assert_eq!(form.appendix().unwrap(), &Value::List(vec![]));
    }

    #[test]
    fn display_renders_title_body_and_appendix() {
        let rendered = small_form().to_string();
        assert_eq!(rendered, "NOTICE\nfirst\nsecond\n{\n k: 1\n}");
    }

    #[rstest]
    #[case("")]
    #[case("  ")]
    #[case("a\nb")]
    fn bad_separation_is_rejected(#[case] separation: &str) {
        assert!(matches!(check_separation(separation), Err(FrameError::InvalidSeparation)));
    }

    #[test]
    fn marker_detection_requires_numeric_suffix() {
        let (mut a, _b) = tokio::io::duplex(16);
        let mut conn = Connection::new(&mut a);
        let receiver = FormReceiver::new(
            &mut conn,
            DEFAULT_SEPARATION,
            Duration::from_secs(1),
            1024,
            CodecKind::Json,
        )
        .unwrap();
        assert_eq!(receiver.parse_marker("$separation$42").unwrap(), Some(42));
        assert_eq!(receiver.parse_marker("$separation$").unwrap(), None);
        assert_eq!(receiver.parse_marker("plain line").unwrap(), None);
        assert!(receiver.parse_marker("$separation$x1").is_err());
    }
}
