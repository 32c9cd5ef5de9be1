use std::fmt;

use failure::Fail;

/// Shortcut alias for `Result<T, Error>`, mirroring the rest of this crate's
/// convention of always surfacing a severity-tagged [`Error`].
pub type Result<T> = ::std::result::Result<T, Error>;

/// Severity drives how an engine reacts to an error, independently of what
/// kind of failure actually occurred.
///
/// This is the knob, not the exception type: a broker timeout and a bad
/// deserialization both arrive as plain errors, and it's the severity that
/// tells the engine whether to retry, shelve to a DLQ, or stop everything.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Severity {
    /// Bad data. Retryable by default, but a good candidate for DLQ policies.
    Input,
    /// Transient environmental failure (broker hiccup, network blip).
    Runtime,
    /// Unrecoverable. Engines stop and surface this to their caller.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Input => "input",
            Severity::Runtime => "runtime",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// What actually went wrong, orthogonal to severity.
#[derive(Debug)]
enum Kind {
    /// The well-known end-of-input sentinel. Not really an "error" but
    /// modelled as one so `Stream::next`/`MessagePool::next` can return a
    /// single `Result`, same as the reference source's `io.EOF` convention.
    Eof,
    /// Derived from a cancelled `CancelToken`. Never retried.
    Cancelled,
    /// A plain, owned message.
    Msg(String),
    /// Wraps another error (from this crate or a dependency).
    Cause(Box<dyn Fail>),
}

/// A severity-tagged error carrying an operation path and optional
/// structured context.
///
/// Errors compose by wrapping: each layer that adds meaning pushes its own
/// operation name onto the path and may attach key/value context, but the
/// original severity and cause survive to the top.
pub struct Error {
    op_path: Vec<&'static str>,
    severity: Severity,
    kind: Kind,
    context: Vec<(&'static str, String)>,
}

impl Error {
    /// Builds a new error rooted at `op` carrying a plain message.
    pub fn msg<S: Into<String>>(op: &'static str, severity: Severity, message: S) -> Error {
        Error {
            op_path: vec![op],
            severity,
            kind: Kind::Msg(message.into()),
            context: Vec::new(),
        }
    }

    /// Builds a new error rooted at `op`, wrapping some other failure.
    pub fn wrap<F: Fail>(op: &'static str, severity: Severity, cause: F) -> Error {
        Error {
            op_path: vec![op],
            severity,
            kind: Kind::Cause(Box::new(cause)),
            context: Vec::new(),
        }
    }

    /// The reserved end-of-input sentinel. `Stream`/`MessagePool` adapters
    /// return this once exhausted or closed; callers compare with
    /// [`Error::is_eof`] rather than matching on severity.
    pub fn eof(op: &'static str) -> Error {
        Error {
            op_path: vec![op],
            severity: Severity::Fatal,
            kind: Kind::Eof,
            context: Vec::new(),
        }
    }

    /// An error derived from cancellation. Engines treat this specially:
    /// it is never retried, regardless of the severity it would otherwise
    /// carry.
    pub fn cancelled(op: &'static str) -> Error {
        Error {
            op_path: vec![op],
            severity: Severity::Fatal,
            kind: Kind::Cancelled,
            context: Vec::new(),
        }
    }

    /// Pushes `op` onto the front of the operation path without losing the
    /// original severity, kind or context. Use this at each layer that
    /// propagates an error it didn't create.
    pub fn push_op(mut self, op: &'static str) -> Error {
        self.op_path.insert(0, op);
        self
    }

    /// Attaches a piece of structured context (queue name, partition,
    /// retry count, ...) that will show up in the error's `Display`.
    pub fn context<V: Into<String>>(mut self, key: &'static str, value: V) -> Error {
        self.context.push((key, value.into()));
        self
    }

    /// Overrides the severity. Useful when a layer knows better than the
    /// error it is wrapping, e.g. promoting a timeout to `Fatal`.
    pub fn with_severity(mut self, severity: Severity) -> Error {
        self.severity = severity;
        self
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, Kind::Eof)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, Kind::Cancelled)
    }

    /// The dot-joined operation path, innermost call first.
    pub fn op_path(&self) -> String {
        self.op_path.join(".")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: ", self.op_path(), self.severity)?;
        match &self.kind {
            Kind::Eof => f.write_str("end of input")?,
            Kind::Cancelled => f.write_str("cancelled")?,
            Kind::Msg(msg) => f.write_str(msg)?,
            Kind::Cause(cause) => write!(f, "{}", cause)?,
        }
        for (key, value) in &self.context {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error({})", self)
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        match &self.kind {
            Kind::Cause(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}
