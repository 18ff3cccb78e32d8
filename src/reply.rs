//! Wire reply formatting: `OK`/`NEXT`/`ERRor`/`MESSage`/`READy`
//! lines, CRLF-terminated, command-index echo, value quoting via
//! [`scpi_proto::quote`].

use crate::error::Error;
use scpi_proto::{quote, QuoteMode};

/// What a completed command echoes as its `<idx>`: the
/// client-supplied numeric index when present, the raw command text
/// otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Index {
    Numeric(u64),
    Raw(String),
}

impl std::fmt::Display for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Index::Numeric(n) => write!(f, "{}", n),
            Index::Raw(s) => f.write_str(s),
        }
    }
}

/// Renders an `OK <idx> ...outputs...` line. Each output is quoted per
/// `QuoteMode::Auto`.
pub fn ok_line(idx: &Index, outputs: &[String]) -> String {
    let mut line = format!("OK {}", idx);
    for value in outputs {
        line.push(' ');
        line.push_str(&quote(value, QuoteMode::Auto));
    }
    line
}

/// Renders a `NEXT <idx>` line.
pub fn next_line(idx: &Index) -> String {
    format!("NEXT {}", idx)
}

/// Renders an `ERRor <idx> [<QualifiedErrorId>] -attr=value … --> <description>`
/// line for `err`.
pub fn error_line(idx: &Index, err: &Error) -> String {
    let id = err.id();
    let mut line = format!("ERRor {} [{}]", idx, id);
    for (key, value) in err.attributes() {
        line.push_str(&format!(" -{}={}", key, quote(&value, QuoteMode::Auto)));
    }
    line.push_str(" --> ");
    line.push_str(&err.to_string());
    line
}

/// Renders a `MESSage <topic> [<timestamp>] [<level>] <parts…>` line.
/// `timestamp` is RFC 3339; callers pass `chrono::Utc::now()` formatted at
/// the call site so this module stays clock-free and testable.
pub fn message_line(topic: &str, timestamp: &str, level: &str, parts: &[String]) -> String {
    let mut line = format!("MESSage {} {} {}", quote(topic, QuoteMode::Auto), timestamp, level);
    for part in parts {
        line.push(' ');
        line.push_str(&quote(part, QuoteMode::Auto));
    }
    line
}

/// Renders the initial `READy [-key=value …]` handshake line.
pub fn ready_line(attrs: &[(&str, &str)]) -> String {
    let mut line = "READy".to_string();
    for (key, value) in attrs {
        line.push_str(&format!(" -{}={}", key, quote(value, QuoteMode::Auto)));
    }
    line
}

/// Wraps a `ReturnCall` signal's streamed output in `<quote.output>...</quote.output>`,
/// appended immediately after an `OK` line.
pub fn quote_output_segment(text: &str) -> String {
    format!("<quote.output>{}</quote.output>", text)
}

/// Appends the CRLF line terminator the wire protocol requires.
pub fn terminate(line: &str) -> String {
    format!("{}\r\n", line)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ok_line_quotes_outputs() {
        let line = ok_line(&Index::Numeric(7), &["hello world".to_string()]);
        assert_eq!(line, "OK 7 \"hello world\"");
    }

    #[test]
    fn error_line_matches_unknown_command_example() {
        let err = Error::UnknownCommand { branch: String::new(), command: "NOPE".to_string() };
        let line = error_line(&Index::Raw("NOPE".to_string()), &err);
        assert_eq!(line, "ERRor NOPE [App.Core.UnknownCommand] -command=NOPE --> NOPE <-- Unknown Command");
    }

    #[test]
    fn next_line_echoes_index() {
        assert_eq!(next_line(&Index::Numeric(7)), "NEXT 7");
    }

    #[test]
    fn ready_line_with_attrs() {
        assert_eq!(ready_line(&[("version", "1.0")]), "READy -version=1.0");
    }

    #[test]
    fn terminate_appends_crlf() {
        assert_eq!(terminate("OK 1"), "OK 1\r\n");
    }
}
