//! Commanding protocol: typed views over raw forms.
//!
//! Three form shapes carry the request/response exchange. A call form
//! (title `COMMAND`) names a command and packs its arguments into the
//! appendix; a result form (title `RETURN`) carries a returned value; an
//! error form (title `ERROR`) carries a fault either inside the appendix
//! or, when the codec cannot encode faults, as `name`/`message` body
//! lines. Each view converts both ways: synthesized from rich values on
//! the sending side, parsed and validated from a received form.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    codec::{CodecError, CodecKind},
    form::{Form, FrameError},
    value::{Fault, FaultKind, Value},
};

/// Title of a call form.
pub const CALL_TITLE: &str = "COMMAND";
/// Title of a result form.
pub const RESULT_TITLE: &str = "RETURN";
/// Title of an error form.
pub const ERROR_TITLE: &str = "ERROR";
/// The only defined handling mode for replies and errors.
pub const REPLY_MODE: &str = "reply";

/// Ways a received form can fail commanding-protocol validation.
#[derive(Debug, Error)]
pub enum MalformedForm {
    /// The form's title names a different commanding form.
    #[error("expected a {expected} form, got title {got:?}")]
    WrongTitle {
        /// Title required by the attempted view.
        expected: &'static str,
        /// Title actually carried by the form.
        got: String,
    },
    /// The form is not any commanding form.
    #[error("title {0:?} is not a commanding form")]
    UnknownTitle(String),
    /// A body line does not split into exactly one key and one value.
    #[error("body line {0:?} does not have exactly one ':'")]
    BadBodyLine(String),
    /// A required body key is absent.
    #[error("body is missing the {0:?} key")]
    MissingKey(&'static str),
    /// The appendix is not a mapping.
    #[error("appendix must be a mapping")]
    AppendixNotMap,
    /// A required appendix entry is absent.
    #[error("appendix is missing the {0:?} entry")]
    MissingEntry(&'static str),
    /// The `pos_args` entry is not a sequence.
    #[error("pos_args must be a sequence")]
    PosArgsNotList,
    /// The `kw_args` entry is not a mapping.
    #[error("kw_args must be a mapping")]
    KwArgsNotMap,
    /// The appendix `error` entry is not a fault value.
    #[error("the error entry must carry a fault")]
    ErrorEntryNotFault,
    /// The fault name is outside the allow-list.
    #[error("fault name {0:?} is not in the allow-list")]
    UnknownFaultName(String),
    /// The sanitized error message would read as a separation marker.
    #[error("error message would mimic the separation marker")]
    MarkerMimicry,
    /// The appendix failed to decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Split the form body into a key/value map, requiring exactly one `:`
/// per line.
fn body_map(form: &Form) -> Result<BTreeMap<String, String>, MalformedForm> {
    let mut map = BTreeMap::new();
    for line in form.body_lines() {
        let mut parts = line.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                map.insert(key.to_owned(), value.to_owned());
            }
            _ => return Err(MalformedForm::BadBodyLine(line.to_owned())),
        }
    }
    Ok(map)
}

fn require_title(form: &Form, expected: &'static str) -> Result<(), MalformedForm> {
    if form.title() == expected {
        Ok(())
    } else {
        Err(MalformedForm::WrongTitle {
            expected,
            got: form.title().to_owned(),
        })
    }
}

fn appendix_map(form: &Form) -> Result<&BTreeMap<String, Value>, MalformedForm> {
    form.appendix()?
        .as_map()
        .ok_or(MalformedForm::AppendixNotMap)
}

/// A command invocation: name plus positional and keyword arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CallForm {
    /// Name of the command to invoke.
    pub command: String,
    /// Ordered positional arguments.
    pub pos_args: Vec<Value>,
    /// Named keyword arguments.
    pub kw_args: BTreeMap<String, Value>,
    /// How the peer should handle the return value.
    pub return_mode: String,
    /// How the peer should handle a raised fault.
    pub error_mode: String,
}

impl CallForm {
    /// Create a call with the default `reply` handling modes.
    pub fn new(
        command: impl Into<String>,
        pos_args: Vec<Value>,
        kw_args: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            command: command.into(),
            pos_args,
            kw_args,
            return_mode: REPLY_MODE.to_owned(),
            error_mode: REPLY_MODE.to_owned(),
        }
    }

    /// Synthesize the raw form for this call.
    ///
    /// # Errors
    /// Codec failures while encoding the argument appendix.
    pub fn to_form(&self, codec: CodecKind) -> Result<Form, FrameError> {
        let lines = [
            format!("command:{}", self.command),
            format!("return_mode:{}", self.return_mode),
            format!("error_mode:{}", self.error_mode),
        ];
        let appendix = Value::Map(BTreeMap::from([
            ("pos_args".to_owned(), Value::List(self.pos_args.clone())),
            ("kw_args".to_owned(), Value::Map(self.kw_args.clone())),
        ]));
        Form::from_lines(CALL_TITLE, &lines, appendix, codec)
    }

    /// Parse and validate a received form as a call.
    ///
    /// # Errors
    /// [`MalformedForm`] when the title, a body key, or the appendix
    /// shape does not match the call contract.
    pub fn from_form(form: &Form) -> Result<Self, MalformedForm> {
        require_title(form, CALL_TITLE)?;
        let body = body_map(form)?;
        let command = body
            .get("command")
            .ok_or(MalformedForm::MissingKey("command"))?
            .trim()
            .to_owned();
        let return_mode = body
            .get("return_mode")
            .ok_or(MalformedForm::MissingKey("return_mode"))?
            .clone();
        let error_mode = body
            .get("error_mode")
            .ok_or(MalformedForm::MissingKey("error_mode"))?
            .clone();

        let appendix = appendix_map(form)?;
        let pos_args = appendix
            .get("pos_args")
            .ok_or(MalformedForm::MissingEntry("pos_args"))?
            .as_list()
            .ok_or(MalformedForm::PosArgsNotList)?
            .clone();
        let kw_args = appendix
            .get("kw_args")
            .ok_or(MalformedForm::MissingEntry("kw_args"))?
            .as_map()
            .ok_or(MalformedForm::KwArgsNotMap)?
            .clone();

        Ok(Self {
            command,
            pos_args,
            kw_args,
            return_mode,
            error_mode,
        })
    }
}

/// A successful command result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultForm {
    /// The returned value.
    pub value: Value,
}

impl ResultForm {
    /// Wrap a returned value.
    #[must_use]
    pub const fn new(value: Value) -> Self { Self { value } }

    /// Synthesize the raw form: one diagnostic `type` line and the value
    /// under the `return` entry.
    ///
    /// # Errors
    /// Codec failures while encoding the appendix.
    pub fn to_form(&self, codec: CodecKind) -> Result<Form, FrameError> {
        let body = format!("type:{}", self.value.type_tag());
        let appendix = Value::Map(BTreeMap::from([(
            "return".to_owned(),
            self.value.clone(),
        )]));
        Form::new(RESULT_TITLE, body, appendix, codec)
    }

    /// Parse a received form as a result. The `type` line is diagnostic
    /// only and is not enforced.
    ///
    /// # Errors
    /// [`MalformedForm`] for a wrong title or an appendix without a
    /// `return` entry.
    pub fn from_form(form: &Form) -> Result<Self, MalformedForm> {
        require_title(form, RESULT_TITLE)?;
        let appendix = appendix_map(form)?;
        let value = appendix
            .get("return")
            .ok_or(MalformedForm::MissingEntry("return"))?
            .clone();
        Ok(Self { value })
    }
}

/// A command failure in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorForm {
    /// The carried fault.
    pub fault: Fault,
}

impl ErrorForm {
    /// Wrap a fault.
    #[must_use]
    pub const fn new(fault: Fault) -> Self { Self { fault } }

    /// Single-line rendition of the fault message: `:` becomes `;` and
    /// newlines become spaces.
    #[must_use]
    pub fn sanitized_message(&self) -> String {
        self.fault.message.replace(':', ";").replace('\n', " ")
    }

    /// Synthesize the raw form. The appendix carries the fault when the
    /// codec can encode it and stays an empty mapping otherwise, leaving
    /// the `name`/`message` lines as the only carrier.
    ///
    /// A sanitized message that would itself read as a separation marker
    /// (the sentinel followed by a digit) is rejected outright rather
    /// than adjusted.
    ///
    /// # Errors
    /// [`MalformedForm::MarkerMimicry`] for marker-shaped messages, or
    /// codec failures while encoding the appendix.
    pub fn to_form(&self, codec: CodecKind, separation: &str) -> Result<Form, MalformedForm> {
        let message = self.sanitized_message();
        if let Some(rest) = message.strip_prefix(separation) {
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(MalformedForm::MarkerMimicry);
            }
        }
        let lines = [
            format!("name:{}", self.fault.kind),
            format!("message:{message}"),
        ];
        let fault_value = Value::Fault(self.fault.clone());
        let appendix = if codec.codec().can_encode(&fault_value) {
            Value::Map(BTreeMap::from([("error".to_owned(), fault_value)]))
        } else {
            Value::Map(BTreeMap::new())
        };
        Form::from_lines(ERROR_TITLE, &lines, appendix, codec).map_err(|e| match e {
            FrameError::Codec(codec_err) => MalformedForm::Codec(codec_err),
            // the title is a literal, so only codec failures can reach here
            other => MalformedForm::Codec(CodecError::Encode(other.to_string())),
        })
    }

    /// Parse a received form as an error. The fault is taken verbatim
    /// from the appendix when present; otherwise it is synthesized from
    /// the `name` and `message` lines, with the name resolved against
    /// the [`FaultKind`] allow-list. Nothing received is ever evaluated.
    ///
    /// # Errors
    /// [`MalformedForm`] for a wrong title, a missing line, an unlisted
    /// fault name, or a non-fault `error` entry.
    pub fn from_form(form: &Form) -> Result<Self, MalformedForm> {
        require_title(form, ERROR_TITLE)?;
        // An empty appendix (empty mapping, or the empty list a
        // zero-length appendix decodes to) defers to the body lines.
        match form.appendix()? {
            Value::Map(entries) if !entries.is_empty() => {
                let entry = entries
                    .get("error")
                    .ok_or(MalformedForm::MissingEntry("error"))?;
                let Value::Fault(fault) = entry else {
                    return Err(MalformedForm::ErrorEntryNotFault);
                };
                return Ok(Self {
                    fault: fault.clone(),
                });
            }
            Value::Map(_) => {}
            Value::List(items) if items.is_empty() => {}
            _ => return Err(MalformedForm::AppendixNotMap),
        }
        let body = body_map(form)?;
        let name = body.get("name").ok_or(MalformedForm::MissingKey("name"))?;
        let message = body
            .get("message")
            .ok_or(MalformedForm::MissingKey("message"))?;
        let kind = FaultKind::from_name(name)
            .ok_or_else(|| MalformedForm::UnknownFaultName(name.clone()))?;
        Ok(Self {
            fault: Fault::new(kind, message.clone()),
        })
    }
}

/// Any of the three commanding forms, dispatched on the raw form's title.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandingForm {
    /// A command invocation.
    Call(CallForm),
    /// A returned value.
    Result(ResultForm),
    /// A carried fault.
    Error(ErrorForm),
}

impl CommandingForm {
    /// Classify and parse a received form.
    ///
    /// # Errors
    /// [`MalformedForm::UnknownTitle`] for titles outside the protocol,
    /// or the parse errors of the matching view.
    pub fn from_form(form: &Form) -> Result<Self, MalformedForm> {
        match form.title() {
            CALL_TITLE => CallForm::from_form(form).map(Self::Call),
            RESULT_TITLE => ResultForm::from_form(form).map(Self::Result),
            ERROR_TITLE => ErrorForm::from_form(form).map(Self::Error),
            other => Err(MalformedForm::UnknownTitle(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::form::DEFAULT_SEPARATION;

    fn call() -> CallForm {
        CallForm::new(
            "upper",
            vec![Value::Text("abc".to_owned())],
            BTreeMap::new(),
        )
    }

    #[test]
    fn call_form_round_trips() {
        let original = call();
        let form = original.to_form(CodecKind::Json).unwrap();
        assert_eq!(form.title(), CALL_TITLE);
        let mut lines = form.body_lines();
        lines.sort_unstable();
        assert_eq!(
            lines,
            vec!["command:upper", "error_mode:reply", "return_mode:reply"]
        );
        let parsed = CallForm::from_form(&form).unwrap();
        assert_eq!(parsed, original);
    }

    #[rstest]
    #[case("command:upper\nreturn_mode:reply")]
    #[case("command:upper\nerror_mode:reply")]
    #[case("return_mode:reply\nerror_mode:reply")]
    fn call_parse_requires_every_body_key(#[case] body: &str) {
        let appendix = Value::Map(BTreeMap::from([
            ("pos_args".to_owned(), Value::List(vec![])),
            ("kw_args".to_owned(), Value::Map(BTreeMap::new())),
        ]));
        let form = Form::new(CALL_TITLE, body, appendix, CodecKind::Json).unwrap();
        assert!(matches!(
            CallForm::from_form(&form),
            Err(MalformedForm::MissingKey(_))
        ));
    }

    #[test]
    fn call_parse_rejects_non_list_pos_args() {
        let appendix = Value::Map(BTreeMap::from([
            ("pos_args".to_owned(), Value::Int(3)),
            ("kw_args".to_owned(), Value::Map(BTreeMap::new())),
        ]));
        let form = Form::new(
            CALL_TITLE,
            "command:x\nreturn_mode:reply\nerror_mode:reply",
            appendix,
            CodecKind::Json,
        )
        .unwrap();
        assert!(matches!(
            CallForm::from_form(&form),
            Err(MalformedForm::PosArgsNotList)
        ));
    }

    #[test]
    fn call_parse_rejects_wrong_title() {
        let form = call().to_form(CodecKind::Json).unwrap();
        assert!(matches!(
            ResultForm::from_form(&form),
            Err(MalformedForm::WrongTitle { expected: RESULT_TITLE, .. })
        ));
    }

    #[test]
    fn body_lines_need_exactly_one_colon() {
        let appendix = Value::Map(BTreeMap::new());
        let form = Form::new(CALL_TITLE, "command:a:b", appendix, CodecKind::Json).unwrap();
        assert!(matches!(
            CallForm::from_form(&form),
            Err(MalformedForm::BadBodyLine(_))
        ));
    }

    #[test]
    fn result_form_round_trips_with_type_tag() {
        let result = ResultForm::new(Value::Text("ABC".to_owned()));
        let form = result.to_form(CodecKind::Json).unwrap();
        assert_eq!(form.body(), "type:text");
        assert_eq!(ResultForm::from_form(&form).unwrap(), result);
    }

    #[test]
    fn error_form_without_appendix_rebuilds_from_body() {
        let error = ErrorForm::new(Fault::new(FaultKind::Arithmetic, "zero divisor"));
        let form = error.to_form(CodecKind::Json, DEFAULT_SEPARATION).unwrap();
        let mut lines = form.body_lines();
        lines.sort_unstable();
        assert_eq!(lines, vec!["message:zero divisor", "name:ArithmeticError"]);
        // The JSON codec cannot carry faults, so the appendix is empty.
        assert_eq!(
            form.appendix().unwrap(),
            &Value::Map(BTreeMap::new())
        );
        assert_eq!(ErrorForm::from_form(&form).unwrap(), error);
    }

    #[test]
    fn error_form_with_binary_codec_rides_the_appendix() {
        let fault = Fault::new(FaultKind::Key, "missing: the key\nline two");
        let error = ErrorForm::new(fault.clone());
        let form = error.to_form(CodecKind::Binary, DEFAULT_SEPARATION).unwrap();
        // Sanitized body, exact fault in the appendix.
        assert!(form.body().contains("message:missing; the key line two"));
        assert_eq!(ErrorForm::from_form(&form).unwrap().fault, fault);
    }

    #[test]
    fn marker_shaped_message_is_rejected() {
        let error = ErrorForm::new(Fault::new(FaultKind::Runtime, "$separation$123 went wrong"));
        assert!(matches!(
            error.to_form(CodecKind::Json, DEFAULT_SEPARATION),
            Err(MalformedForm::MarkerMimicry)
        ));
        // Without a digit after the sentinel the message is harmless.
        let ok = ErrorForm::new(Fault::new(FaultKind::Runtime, "$separation$ went wrong"));
        assert!(ok.to_form(CodecKind::Json, DEFAULT_SEPARATION).is_ok());
    }

    #[test]
    fn unlisted_fault_name_fails_parse() {
        let form = Form::new(
            ERROR_TITLE,
            "name:SegfaultError\nmessage:oops",
            Value::Map(BTreeMap::new()),
            CodecKind::Json,
        )
        .unwrap();
        assert!(matches!(
            ErrorForm::from_form(&form),
            Err(MalformedForm::UnknownFaultName(_))
        ));
    }

    #[test]
    fn classification_dispatches_on_title() {
        let form = call().to_form(CodecKind::Json).unwrap();
        assert!(matches!(
            CommandingForm::from_form(&form),
            Ok(CommandingForm::Call(_))
        ));
        let stray = Form::new("NOTICE", "x", Value::List(vec![]), CodecKind::Json).unwrap();
        assert!(matches!(
            CommandingForm::from_form(&stray),
            Err(MalformedForm::UnknownTitle(_))
        ));
    }
}
