//! The recursive argument tokenizer.
//!
//! [`Tokenizer::parse_line`] turns one logical command line — possibly
//! spanning several physical lines via a balanced heredoc — into a
//! [`ParsedLine`]. Substitutions (`${...}`, `$(...)`, `$[...]`, `$N`/`$@`,
//! `$<...>`) are resolved by calling back into a [`Substituter`] supplied by
//! the caller, since resolving them needs session/command-tree state this
//! crate doesn't have.

use crate::error::ParseError;
use crate::escape;
use crate::part::{ParsedLine, Part};
use crate::variable::VarExpr;

/// What a `$N` / `$@` / `$/sep/` argument reference asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgRef {
    /// `$N`: the Nth output of the previously executed command.
    Index(usize),
    /// `$@`: all outputs, space-joined.
    All,
    /// `$/sep/`: all outputs joined by `sep`.
    Joined(String),
}

/// Callback surface the tokenizer uses to resolve substitutions. A session
/// implements this to reach into its variable scopes, re-enter the parser
/// for `$(...)`, and evaluate `$[...]` expressions.
pub trait Substituter {
    /// Resolves a compiled `${...}` expression.
    fn variable(&mut self, expr: &VarExpr) -> Result<String, ParseError>;
    /// Runs `text` as a nested command and returns its collapsed output.
    fn command(&mut self, text: &str) -> Result<String, ParseError>;
    /// Evaluates `text` as a `$[...]` expression (administrator-gated by
    /// the caller before this is ever invoked).
    fn expression(&mut self, text: &str) -> Result<String, ParseError>;
    /// Resolves a `$N`/`$@`/`$/sep/` reference against the previous
    /// command's outputs.
    fn arg_ref(&mut self, which: &ArgRef) -> Result<String, ParseError>;
    /// Resolves a `$<...>` hidden substitution (nested command text whose
    /// output should never be logged or echoed verbatim).
    fn hidden(&mut self, text: &str) -> Result<String, ParseError>;
}

/// A `Substituter` that resolves nothing; usable when substitutions are
/// known not to occur (e.g. re-tokenizing an already-cooked macro body for
/// round-trip tests).
pub struct NoSubstitutions;

impl Substituter for NoSubstitutions {
    fn variable(&mut self, expr: &VarExpr) -> Result<String, ParseError> {
        Err(ParseError::new(expr.name.clone(), 0, "variable substitution not available here"))
    }
    fn command(&mut self, text: &str) -> Result<String, ParseError> {
        Err(ParseError::new(text, 0, "command substitution not available here"))
    }
    fn expression(&mut self, text: &str) -> Result<String, ParseError> {
        Err(ParseError::new(text, 0, "expression substitution not available here"))
    }
    fn arg_ref(&mut self, _which: &ArgRef) -> Result<String, ParseError> {
        Err(ParseError::new("", 0, "argument reference not available here"))
    }
    fn hidden(&mut self, text: &str) -> Result<String, ParseError> {
        Err(ParseError::new(text, 0, "hidden substitution not available here"))
    }
}

/// Stateless tokenizer entry point.
pub struct Tokenizer;

impl Tokenizer {
    /// Parses one logical line. `first_line` is the text already read from
    /// the transport; `read_more` is called to fetch additional physical
    /// lines when a heredoc is left unbalanced at end of input (it returns
    /// `None` at end of stream, which surfaces as
    /// [`crate::error::ProtocolError::UnterminatedHeredoc`]).
    pub fn parse_line(
        first_line: &str,
        read_more: &mut dyn FnMut() -> Option<String>,
        subs: &mut dyn Substituter,
    ) -> Result<ParsedLine, ParseError> {
        let mut buf = Source::new(first_line.to_string());
        let raw_start = buf.text.clone();

        buf.skip_inline_whitespace();
        let index = buf.try_parse_index();
        buf.skip_inline_whitespace();

        let command = buf.scan_command_path()?;
        let mut parts = Vec::new();
        loop {
            buf.skip_inline_whitespace_with_continuation(read_more)?;
            if buf.at_end() {
                break;
            }
            if buf.at_comment() {
                break;
            }
            let part = scan_part(&mut buf, read_more, subs)?;
            parts.push(part);
        }

        Ok(ParsedLine {
            index,
            command,
            parts,
            raw: if buf.text == raw_start { raw_start } else { buf.text.clone() },
        })
    }
}

/// Mutable cursor over the (possibly growing, via heredoc continuation)
/// source text.
struct Source {
    text: String,
    chars: Vec<char>,
    pos: usize,
}

impl Source {
    fn new(text: String) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Source { text, chars, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn at_comment(&self) -> bool {
        self.peek() == Some('#')
    }

    fn skip_inline_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace() && c != '\n') {
            self.pos += 1;
        }
    }

    /// Skips whitespace, handling `\` + newline line continuations by
    /// pulling another physical line from `read_more` and appending it.
    fn skip_inline_whitespace_with_continuation(
        &mut self,
        read_more: &mut dyn FnMut() -> Option<String>,
    ) -> Result<(), ParseError> {
        loop {
            self.skip_inline_whitespace();
            if self.peek() == Some('\\') && self.peek_at(1) == Some('\n') {
                self.pos += 2;
                self.extend(read_more)?;
                continue;
            }
            break;
        }
        Ok(())
    }

    /// Appends another physical line (re-deriving `chars` for the new
    /// combined text), failing if the stream is exhausted.
    fn extend(&mut self, read_more: &mut dyn FnMut() -> Option<String>) -> Result<(), ParseError> {
        match read_more() {
            Some(line) => {
                if !self.text.ends_with('\n') {
                    self.text.push('\n');
                }
                self.text.push_str(&line);
                self.chars = self.text.chars().collect();
                Ok(())
            }
            None => Err(ParseError::new(self.text.clone(), self.pos, "unexpected end of input")),
        }
    }

    fn try_parse_index(&mut self) -> Option<u64> {
        let start = self.pos;
        let mut end = start;
        while matches!(self.chars.get(end), Some(c) if c.is_ascii_digit()) {
            end += 1;
        }
        if end == start {
            return None;
        }
        // An index must be followed by whitespace (else it's the start of a
        // command name, e.g. a leaf literally named with leading digits).
        if !matches!(self.chars.get(end), Some(c) if c.is_whitespace()) {
            return None;
        }
        let text: String = self.chars[start..end].iter().collect();
        let value = text.parse().ok()?;
        self.pos = end;
        Some(value)
    }

    fn scan_command_path(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_whitespace()) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(ParseError::new(self.text.clone(), start, "missing command"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }
}

/// Scans one `(option, cooked, raw)` part starting at the current cursor
/// position.
fn scan_part(
    src: &mut Source,
    read_more: &mut dyn FnMut() -> Option<String>,
    subs: &mut dyn Substituter,
) -> Result<Part, ParseError> {
    let raw_start = src.pos;
    let mut option = None;

    if src.peek() == Some('-') && src.peek_at(1).map_or(false, |c| c.is_alphabetic() || c == '_') {
        let name_start = src.pos + 1;
        let mut end = name_start;
        while matches!(src.chars.get(end), Some(c) if c.is_alphanumeric() || *c == '_' || *c == '-') {
            end += 1;
        }
        let name: String = src.chars[name_start..end].iter().collect();
        src.pos = end;
        if src.peek() == Some('=') {
            src.pos += 1;
        } else {
            // Boolean-flag style option with no value: `-exclusive`.
            let raw: String = src.chars[raw_start..src.pos].iter().collect();
            return Ok(Part::named(name, "true", raw));
        }
        option = Some(name);
    }

    let (cooked, hidden) = scan_value(src, read_more, subs)?;
    let raw: String = src.chars[raw_start..src.pos].iter().collect();
    Ok(match option {
        Some(name) => Part::named(name, cooked, raw).with_hidden(hidden),
        None => Part::positional(cooked, raw).with_hidden(hidden),
    })
}

/// Scans one value: a quoted literal, a heredoc, or a bare (possibly
/// substitution-bearing) word. Returns the cooked text and whether any
/// `$<...>` hidden substitution contributed to it.
fn scan_value(
    src: &mut Source,
    read_more: &mut dyn FnMut() -> Option<String>,
    subs: &mut dyn Substituter,
) -> Result<(String, bool), ParseError> {
    match src.peek() {
        Some('\'') => scan_single_quoted(src).map(|v| (v, false)),
        Some('"') => scan_double_quoted(src, read_more, subs),
        Some('<') if src.peek_at(1) == Some('<') && src.peek_at(2) == Some('<') => {
            scan_triple_heredoc(src, read_more).map(|v| (v, false))
        }
        Some('<') => scan_tagged_heredoc(src, read_more).map(|v| (v, false)),
        _ => scan_bare_word(src, read_more, subs),
    }
}

fn scan_single_quoted(src: &mut Source) -> Result<String, ParseError> {
    let open = src.pos;
    src.pos += 1;
    let start = src.pos;
    while matches!(src.peek(), Some(c) if c != '\'') {
        src.pos += 1;
    }
    if src.at_end() {
        return Err(ParseError::new(src.text.clone(), open, "unterminated single-quoted literal"));
    }
    let value: String = src.chars[start..src.pos].iter().collect();
    src.pos += 1; // closing quote
    Ok(value)
}

fn scan_double_quoted(
    src: &mut Source,
    read_more: &mut dyn FnMut() -> Option<String>,
    subs: &mut dyn Substituter,
) -> Result<(String, bool), ParseError> {
    let open = src.pos;
    src.pos += 1;
    let mut out = String::new();
    let mut hidden = false;
    loop {
        if src.at_end() {
            src.extend(read_more).map_err(|_| {
                ParseError::new(src.text.clone(), open, "unterminated double-quoted literal")
            })?;
        }
        match src.peek() {
            None => {
                return Err(ParseError::new(src.text.clone(), open, "unterminated double-quoted literal"));
            }
            Some('"') => {
                src.pos += 1;
                break;
            }
            Some('\\') => {
                let (ch, consumed) = escape::unescape_one(&src.chars, src.pos)
                    .map_err(|e| e.with_subexpression(src.text.clone()))?;
                out.push_str(&ch);
                src.pos += consumed;
            }
            Some('$') => {
                let (text, was_hidden) = scan_dollar(src, subs)?;
                out.push_str(&text);
                hidden |= was_hidden;
            }
            Some(c) => {
                out.push(c);
                src.pos += 1;
            }
        }
    }
    Ok((out, hidden))
}

/// `<<<...>>>` — a raw, unprocessed multi-line literal whose body is
/// everything up to the matching balanced `>>>`, counting nested `<<<`/`>>>`
/// occurrences.
fn scan_triple_heredoc(
    src: &mut Source,
    read_more: &mut dyn FnMut() -> Option<String>,
) -> Result<String, ParseError> {
    let open = src.pos;
    src.pos += 3;
    let start = src.pos;
    let mut depth = 1i32;
    loop {
        if src.at_end() {
            src.extend(read_more).map_err(|_| {
                ParseError::new(src.text.clone(), open, "unterminated `<<<...>>>` heredoc")
            })?;
            continue;
        }
        if src.peek() == Some('<') && src.peek_at(1) == Some('<') && src.peek_at(2) == Some('<') {
            depth += 1;
            src.pos += 3;
            continue;
        }
        if src.peek() == Some('>') && src.peek_at(1) == Some('>') && src.peek_at(2) == Some('>') {
            depth -= 1;
            if depth == 0 {
                let value: String = src.chars[start..src.pos].iter().collect();
                src.pos += 3;
                return Ok(value);
            }
            src.pos += 3;
            continue;
        }
        src.pos += 1;
    }
}

/// `<tag>...</tag>` — a raw literal balanced on nested occurrences of the
/// same tag, à la XML CDATA-without-escaping.
fn scan_tagged_heredoc(
    src: &mut Source,
    read_more: &mut dyn FnMut() -> Option<String>,
) -> Result<String, ParseError> {
    let open = src.pos;
    src.pos += 1;
    let tag_start = src.pos;
    while matches!(src.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '.' || c == '-') {
        src.pos += 1;
    }
    if src.peek() != Some('>') {
        return Err(ParseError::new(src.text.clone(), open, "malformed heredoc tag"));
    }
    let tag: String = src.chars[tag_start..src.pos].iter().collect();
    src.pos += 1;
    let open_marker = format!("<{}>", tag);
    let close_marker = format!("</{}>", tag);
    let body_start = src.pos;
    let mut depth = 1i32;
    loop {
        if src.at_end() {
            src.extend(read_more).map_err(|_| {
                ParseError::new(src.text.clone(), open, format!("unterminated `<{}>` heredoc", tag))
            })?;
            continue;
        }
        if matches_at(src, &open_marker) {
            depth += 1;
            src.pos += open_marker.chars().count();
            continue;
        }
        if matches_at(src, &close_marker) {
            depth -= 1;
            src.pos += close_marker.chars().count();
            if depth == 0 {
                let end = src.pos - close_marker.chars().count();
                return Ok(src.chars[body_start..end].iter().collect());
            }
            continue;
        }
        src.pos += 1;
    }
}

fn matches_at(src: &Source, needle: &str) -> bool {
    let needle_chars: Vec<char> = needle.chars().collect();
    if src.pos + needle_chars.len() > src.chars.len() {
        return false;
    }
    src.chars[src.pos..src.pos + needle_chars.len()] == needle_chars[..]
}

/// A bare word: read until unescaped whitespace, resolving `$...`
/// substitutions as encountered. Unlike double quotes, backslash is not an
/// escape character here (only the preceding line-continuation check
/// handles `\` specially, and only before whitespace has been skipped).
fn scan_bare_word(
    src: &mut Source,
    _read_more: &mut dyn FnMut() -> Option<String>,
    subs: &mut dyn Substituter,
) -> Result<(String, bool), ParseError> {
    let mut out = String::new();
    let mut hidden = false;
    while let Some(c) = src.peek() {
        if c.is_whitespace() {
            break;
        }
        if c == '$' {
            let (text, was_hidden) = scan_dollar(src, subs)?;
            out.push_str(&text);
            hidden |= was_hidden;
            continue;
        }
        out.push(c);
        src.pos += 1;
    }
    Ok((out, hidden))
}

/// Dispatches on the character following an unconsumed `$`. Returns the
/// resolved text and whether this was a `$<...>` hidden substitution.
fn scan_dollar(src: &mut Source, subs: &mut dyn Substituter) -> Result<(String, bool), ParseError> {
    let dollar_pos = src.pos;
    src.pos += 1; // consume '$'
    match src.peek() {
        Some('{') => {
            let end = find_matching(src, '{', '}')
                .ok_or_else(|| ParseError::new(src.text.clone(), dollar_pos, "unterminated `${...}`"))?;
            let inner: String = src.chars[src.pos + 1..end].iter().collect();
            src.pos = end + 1;
            let expr = VarExpr::compile(&inner).map_err(|e| e.with_subexpression(inner.clone()))?;
            let value = subs.variable(&expr).map_err(|e| e.with_subexpression(inner))?;
            Ok((value, false))
        }
        Some('(') => {
            let end = find_matching(src, '(', ')')
                .ok_or_else(|| ParseError::new(src.text.clone(), dollar_pos, "unterminated `$(...)`"))?;
            let inner: String = src.chars[src.pos + 1..end].iter().collect();
            src.pos = end + 1;
            let value = subs.command(&inner).map_err(|e| e.with_subexpression(inner))?;
            Ok((value, false))
        }
        Some('[') => {
            let end = find_matching(src, '[', ']')
                .ok_or_else(|| ParseError::new(src.text.clone(), dollar_pos, "unterminated `$[...]`"))?;
            let inner: String = src.chars[src.pos + 1..end].iter().collect();
            src.pos = end + 1;
            let value = subs.expression(&inner).map_err(|e| e.with_subexpression(inner))?;
            Ok((value, false))
        }
        Some('<') => {
            let end = find_matching(src, '<', '>')
                .ok_or_else(|| ParseError::new(src.text.clone(), dollar_pos, "unterminated `$<...>`"))?;
            let inner: String = src.chars[src.pos + 1..end].iter().collect();
            src.pos = end + 1;
            let value = subs.hidden(&inner).map_err(|e| e.with_subexpression(inner))?;
            Ok((value, true))
        }
        Some('@') => {
            src.pos += 1;
            Ok((subs.arg_ref(&ArgRef::All)?, false))
        }
        Some('/') => {
            src.pos += 1;
            let start = src.pos;
            while matches!(src.peek(), Some(c) if c != '/') {
                src.pos += 1;
            }
            if src.at_end() {
                return Err(ParseError::new(src.text.clone(), dollar_pos, "unterminated `$/sep/`"));
            }
            let sep: String = src.chars[start..src.pos].iter().collect();
            src.pos += 1;
            Ok((subs.arg_ref(&ArgRef::Joined(sep))?, false))
        }
        Some(c) if c.is_ascii_digit() => {
            let start = src.pos;
            while matches!(src.peek(), Some(c) if c.is_ascii_digit()) {
                src.pos += 1;
            }
            let text: String = src.chars[start..src.pos].iter().collect();
            let n: usize = text.parse().unwrap_or(0);
            Ok((subs.arg_ref(&ArgRef::Index(n))?, false))
        }
        _ => {
            // A lone `$` with no recognized follow-on is literal.
            Ok(("$".to_string(), false))
        }
    }
}

/// Finds the index (in `src.chars`) of the `close` that balances the `open`
/// at `src.pos`, counting nested occurrences of both.
fn find_matching(src: &Source, open: char, close: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut i = src.pos;
    while i < src.chars.len() {
        if src.chars[i] == open {
            depth += 1;
        } else if src.chars[i] == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoOp;
    impl Substituter for NoOp {
        fn variable(&mut self, expr: &VarExpr) -> Result<String, ParseError> {
            Ok(format!("<{}>", expr.name))
        }
        fn command(&mut self, text: &str) -> Result<String, ParseError> {
            Ok(format!("({})", text))
        }
        fn expression(&mut self, text: &str) -> Result<String, ParseError> {
            Ok(format!("[{}]", text))
        }
        fn arg_ref(&mut self, which: &ArgRef) -> Result<String, ParseError> {
            Ok(match which {
                ArgRef::Index(n) => format!("${}", n),
                ArgRef::All => "$@".to_string(),
                ArgRef::Joined(sep) => format!("$/{}/", sep),
            })
        }
        fn hidden(&mut self, text: &str) -> Result<String, ParseError> {
            Ok(format!("!{}!", text))
        }
    }

    fn parse(line: &str) -> ParsedLine {
        let mut subs = NoOp;
        Tokenizer::parse_line(line, &mut || None, &mut subs).expect("parses")
    }

    #[test]
    fn index_and_command() {
        let line = parse("42 VERSion?");
        assert_eq!(line.index, Some(42));
        assert_eq!(line.command, "VERSion?");
        assert!(line.parts.is_empty());
    }

    #[test]
    fn positional_and_named_parts() {
        let line = parse("LASer:POWer:SETTing 50 -unit=mW");
        assert_eq!(line.command, "LASer:POWer:SETTing");
        assert_eq!(line.parts.len(), 2);
        assert_eq!(line.parts[0].cooked, "50");
        assert_eq!(line.parts[1].option.as_deref(), Some("unit"));
        assert_eq!(line.parts[1].cooked, "mW");
    }

    #[test]
    fn boolean_flag_option() {
        let line = parse("ACCess Full -exclusive");
        assert_eq!(line.parts[1].option.as_deref(), Some("exclusive"));
        assert_eq!(line.parts[1].cooked, "true");
    }

    #[test]
    fn single_quoted_is_literal() {
        let line = parse("ECHO '${not a var}'");
        assert_eq!(line.parts[0].cooked, "${not a var}");
    }

    #[test]
    fn double_quoted_runs_substitutions_and_escapes() {
        let line = parse("ECHO \"hi ${x}\\n\"");
        assert_eq!(line.parts[0].cooked, "hi <x>\n");
    }

    #[test]
    fn bare_word_variable_substitution() {
        let line = parse("ECHO ${x}");
        assert_eq!(line.parts[0].cooked, "<x>");
    }

    #[test]
    fn triple_heredoc_is_raw() {
        let line = parse("ECHO <<<hello ${x} world>>>");
        assert_eq!(line.parts[0].cooked, "hello ${x} world");
    }

    #[test]
    fn tagged_heredoc_is_raw_and_balanced() {
        let line = parse("ECHO <body>outer <body>inner</body> tail</body>");
        assert_eq!(line.parts[0].cooked, "outer <body>inner</body> tail");
    }

    #[test]
    fn comment_terminates_parsing() {
        let line = parse("VERSion? # trailing comment");
        assert!(line.parts.is_empty());
    }

    #[test]
    fn command_substitution_nested() {
        let line = parse("ECHO $(OTHER:PATH)");
        assert_eq!(line.parts[0].cooked, "(OTHER:PATH)");
    }

    #[test]
    fn hidden_substitution_is_flagged() {
        let line = parse("LOGin $<password>");
        assert_eq!(line.parts[0].cooked, "!password!");
        assert!(line.parts[0].hidden);
    }

    #[test]
    fn arg_ref_forms() {
        assert_eq!(parse("ECHO $1").parts[0].cooked, "$1");
        assert_eq!(parse("ECHO $@").parts[0].cooked, "$@");
        assert_eq!(parse("ECHO $/,/").parts[0].cooked, "$/,/");
    }
}
