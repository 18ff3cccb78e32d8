//! The string "protector" used when formatting reply values.
use crate::escape::escape;

/// Bytes that force heredoc wrapping rather than double-quote escaping:
/// control bytes below 0x20 other than tab, and DEL (0x7F).
fn forces_heredoc(value: &str) -> bool {
    value
        .chars()
        .any(|c| (c as u32) < 0x20 && c != '\t' || (c as u32) == 0x7F)
}

/// Characters that require the value to be quoted at all.
fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace() || "$()<>[]{}'\"\\".contains(c)
        })
}

/// Picks a heredoc tag that does not occur (as an opening or closing tag)
/// inside `value`, starting from `quote` and falling back to `quote1`,
/// `quote2`, ... This mirrors how the `ReturnCall` streamed segment uses the
/// fixed tag `quote.output` but generalizes it to arbitrary
/// values that might legitimately contain that exact tag.
fn pick_heredoc_tag(value: &str) -> String {
    let mut tag = "quote".to_string();
    let mut suffix = 0u32;
    while value.contains(&format!("<{}>", tag)) || value.contains(&format!("</{}>", tag)) {
        suffix += 1;
        tag = format!("quote{}", suffix);
    }
    tag
}

/// Wraps `value` in a balanced tagged heredoc: `<tag>value</tag>`.
pub fn heredoc_wrap(value: &str) -> String {
    let tag = pick_heredoc_tag(value);
    format!("<{tag}>{value}</{tag}>", tag = tag, value = value)
}

/// How a value should be quoted for the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuoteMode {
    /// Pick the cheapest representation that round-trips: bare if safe,
    /// double-quoted if it merely needs escaping, heredoc if it contains
    /// bytes that double-quoting cannot represent.
    Auto,
    /// Always double-quote (escaping as needed), never heredoc-wrap.
    Double,
    /// Always heredoc-wrap.
    Heredoc,
}

/// Renders `value` for the wire under the given quoting policy.
pub fn quote(value: &str, mode: QuoteMode) -> String {
    match mode {
        QuoteMode::Heredoc => heredoc_wrap(value),
        QuoteMode::Double => format!("\"{}\"", escape(value)),
        QuoteMode::Auto => {
            if forces_heredoc(value) {
                heredoc_wrap(value)
            } else if needs_quoting(value) {
                format!("\"{}\"", escape(value))
            } else {
                value.to_owned()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_when_safe() {
        assert_eq!(quote("abc123", QuoteMode::Auto), "abc123");
    }

    #[test]
    fn double_quoted_when_whitespace() {
        assert_eq!(quote("hello world", QuoteMode::Auto), "\"hello world\"");
    }

    #[test]
    fn heredoc_when_binary() {
        let value = "a\u{0001}b";
        let wrapped = quote(value, QuoteMode::Auto);
        assert!(wrapped.starts_with("<quote>"));
        assert!(wrapped.ends_with("</quote>"));
    }

    #[test]
    fn heredoc_tag_avoids_collision() {
        let value = "contains <quote>nested</quote> already";
        let wrapped = heredoc_wrap(value);
        assert!(wrapped.starts_with("<quote1>"));
    }
}
