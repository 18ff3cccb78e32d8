//! The parsed argument triple produced by the tokenizer.
use std::fmt;

/// One tokenized argument of a command line.
///
/// `option` is `None` for positional arguments; `Some(name)` for a
/// `-name[=value]` argument (the leading `-` is stripped). `cooked` holds the
/// value after quote/escape/substitution processing; `raw` holds the
/// verbatim source slice (including surrounding whitespace) that produced
/// the part, which the session needs for things like hidden-argument log
/// scrubbing and reconstructing the original command line unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub option: Option<String>,
    pub cooked: String,
    pub raw: String,
    /// Set when this part's value passed through a `$<...>` hidden
    /// substitution. `raw` stays the true verbatim source (so parser
    /// round-tripping still holds); callers that log or echo commands back
    /// to a transport must check this flag and substitute a mask (`*`)
    /// instead of `raw` when it's set.
    pub hidden: bool,
}

impl Part {
    /// Builds a positional part.
    pub fn positional(cooked: impl Into<String>, raw: impl Into<String>) -> Self {
        Part {
            option: None,
            cooked: cooked.into(),
            raw: raw.into(),
            hidden: false,
        }
    }

    /// Builds a named (`-name=value`) part.
    pub fn named(
        name: impl Into<String>,
        cooked: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        Part {
            option: Some(name.into()),
            cooked: cooked.into(),
            raw: raw.into(),
            hidden: false,
        }
    }

    /// Marks this part as carrying a hidden (`$<...>`) substitution.
    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    /// Whether this part carried an option name.
    pub fn is_named(&self) -> bool {
        self.option.is_some()
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// The result of tokenizing one logical command line (which may have spanned
/// several physical lines via a heredoc).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedLine {
    /// The client-supplied numeric index, if the line began with one
    /// (`"42 VERSion?"`).
    pub index: Option<u64>,
    /// The dotted/colon-delimited command path, e.g. `LASer:POWer:SETTing`.
    pub command: String,
    /// The remaining arguments.
    pub parts: Vec<Part>,
    /// The full source text, including any heredoc continuation lines,
    /// joined by `\n`. Used to echo malformed input back to the client and
    /// to satisfy the `collapse(parse(line)) == line` round-trip invariant
    /// under `QuoteMode::Auto`.
    pub raw: String,
}
