use std::fmt;

use crate::{resource::FatalError, value::Value};

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Internal runtime error representation.
///
/// `Throw` is the recoverable path: every language-level fault and every
/// user `throw` travels this way and can be captured by `try`. `Fatal`
/// bypasses handlers entirely.
#[derive(Debug)]
pub(crate) enum RunError {
    Throw(Box<Thrown>),
    Fatal(FatalError),
}

/// An in-flight thrown exception.
#[derive(Debug)]
pub(crate) struct Thrown {
    pub payload: ThrownPayload,
    /// 1-based line of the throw site.
    pub line: u32,
    /// Stack frames accumulated while unwinding, innermost first.
    pub frames: Vec<StackFrame>,
}

/// The thrown value.
///
/// Runtime faults carry their message as a plain string and are only
/// materialized into a heap value when a `catch` binds them; user `throw`
/// statements carry the evaluated value directly.
#[derive(Debug)]
pub(crate) enum ThrownPayload {
    Msg(String),
    Val(Value),
}

impl RunError {
    /// Builds a recoverable runtime exception with a message payload.
    pub fn throw(message: impl Into<String>, line: u32) -> Self {
        Self::Throw(Box::new(Thrown {
            payload: ThrownPayload::Msg(message.into()),
            line,
            frames: Vec::new(),
        }))
    }

    /// Builds an exception from a user-thrown value.
    pub fn throw_value(value: Value, line: u32) -> Self {
        Self::Throw(Box::new(Thrown {
            payload: ThrownPayload::Val(value),
            line,
            frames: Vec::new(),
        }))
    }
}

impl From<FatalError> for RunError {
    fn from(err: FatalError) -> Self {
        Self::Fatal(err)
    }
}

/// One frame of an uncaught-exception backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name, or `<main>` for top-level code.
    pub function: String,
    pub file: String,
    /// 1-based line of the call site.
    pub line: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "    at {} ({}:{})", self.function, self.file, self.line)
    }
}

/// Public error surfaced by the interpreter and CLI.
///
/// Formats as `error: <file>:<line>: <message>`, followed by one backtrace
/// line per frame (innermost first) when the exception went uncaught.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    message: String,
    location: Option<(String, u32)>,
    frames: Vec<StackFrame>,
    fatal: bool,
}

impl Exception {
    #[must_use]
    pub fn new(message: String, location: Option<(String, u32)>, frames: Vec<StackFrame>) -> Self {
        Self {
            message,
            location,
            frames,
            fatal: false,
        }
    }

    /// Wraps a fatal error; `is_fatal` distinguishes exit code 2 paths.
    #[must_use]
    pub fn fatal(err: &FatalError, frames: Vec<StackFrame>) -> Self {
        Self {
            message: err.to_string(),
            location: None,
            frames,
            fatal: true,
        }
    }

    /// Builds the parse-failure exception from parser diagnostics.
    #[must_use]
    pub fn from_diagnostics(file: &str, diagnostics: &[crate::parser::Diagnostic]) -> Self {
        let first = diagnostics.first();
        Self {
            message: first.map_or_else(String::new, |d| d.message.clone()),
            location: first.map(|d| (file.to_owned(), d.line)),
            frames: Vec::new(),
            fatal: false,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    #[must_use]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some((file, line)) => write!(f, "error: {file}:{line}: {}", self.message)?,
            None => write!(f, "error: {}", self.message)?,
        }
        for frame in &self.frames {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_error_message_format() {
        let exc = Exception::new(
            "boom".to_owned(),
            Some(("main.hml".to_owned(), 3)),
            vec![
                StackFrame {
                    function: "inner".to_owned(),
                    file: "main.hml".to_owned(),
                    line: 7,
                },
                StackFrame {
                    function: "<main>".to_owned(),
                    file: "main.hml".to_owned(),
                    line: 12,
                },
            ],
        );
        assert_eq!(
            exc.to_string(),
            "error: main.hml:3: boom\n    at inner (main.hml:7)\n    at <main> (main.hml:12)"
        );
    }
}
