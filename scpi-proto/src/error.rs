//! Errors produced while tokenizing and formatting the wire protocol.

/// A `Result` type for the parsing and reply-formatting half of the protocol.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// An error produced while tokenizing a command line.
///
/// Carries enough context (the offending position and the full source line)
/// that a session can echo the failure back to its client without having to
/// re-derive it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason} at byte {pos} in `{expression}`")]
pub struct ParseError {
    /// The full line (or heredoc-joined multi-line command) being parsed.
    pub expression: String,
    /// Byte offset into `expression` where the failure was detected.
    pub pos: usize,
    /// Human-readable description of what went wrong.
    pub reason: String,
    /// The smallest sub-expression (e.g. a `${...}` substitution) that
    /// triggered the failure, if the failure happened inside one.
    pub subexpression: Option<String>,
    /// The rendered message of the upstream cause, when the failure was
    /// forwarded from another component (e.g. a regex compile error inside a
    /// `${.../re/.../}`). Kept as text rather than a boxed `Error` so that
    /// `ParseError` stays `Clone`.
    pub cause: Option<String>,
}

impl ParseError {
    /// Creates a new parse error anchored at `pos` in `expression`.
    pub fn new(expression: impl Into<String>, pos: usize, reason: impl Into<String>) -> Self {
        ParseError {
            expression: expression.into(),
            pos,
            reason: reason.into(),
            subexpression: None,
            cause: None,
        }
    }

    /// Attaches the sub-expression responsible for the failure.
    pub fn with_subexpression(mut self, sub: impl Into<String>) -> Self {
        self.subexpression = Some(sub.into());
        self
    }

    /// Attaches the rendered message of an upstream cause.
    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

/// A protocol-level error covering both parsing and reply encoding.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// The command line could not be tokenized.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A heredoc was opened but never balanced before the input stream
    /// closed.
    #[error("unterminated heredoc `{tag}`")]
    UnterminatedHeredoc {
        /// The opening tag (e.g. `EOF` for `<<<EOF` or a `<tag>` name).
        tag: String,
    },

    /// A value could not be represented on the wire without ambiguity even
    /// when heredoc-wrapped (e.g. it contains the chosen heredoc tag).
    #[error("value cannot be safely quoted for the wire")]
    Unquotable,

    /// The underlying transport failed while framing a line.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}
