//! Backslash-escape processing for double-quoted literals.
use crate::error::ParseError;

/// Resolves backslash escapes inside a double-quoted literal.
///
/// Recognizes `\n \r \t \' \" \$ \\`, octal `\NNN` (one to three octal
/// digits), hex `\xNN`, and Unicode `\uNNNN` / `\UNNNNNNNN`. Any other
/// backslash-letter pair is left as the literal character following the
/// backslash (the backslash itself is dropped), matching how permissive
/// shell-like tokenizers treat unrecognized escapes.
pub fn unescape(input: &str) -> Result<String, ParseError> {
    let bytes: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != '\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let (text, consumed) = unescape_one(&bytes, i)?;
        out.push_str(&text);
        i += consumed;
    }
    Ok(out)
}

/// Resolves a single backslash escape starting at `chars[backslash_pos]`
/// (which must be `'\\'`). Returns the decoded text and the number of
/// `chars` consumed, including the backslash itself. Shared between
/// [`unescape`] (whole-literal processing) and the tokenizer, which must
/// interleave escape handling with `$`-substitution scanning inside
/// double-quoted literals.
pub fn unescape_one(chars: &[char], backslash_pos: usize) -> Result<(String, usize), ParseError> {
    let esc = match chars.get(backslash_pos + 1) {
        Some(e) => *e,
        None => {
            let source: String = chars.iter().collect();
            return Err(ParseError::new(source, backslash_pos + 1, "trailing backslash in literal"));
        }
    };
    let i = backslash_pos + 1;
    Ok(match esc {
        'n' => ("\n".to_string(), 2),
        'r' => ("\r".to_string(), 2),
        't' => ("\t".to_string(), 2),
        '\'' => ("'".to_string(), 2),
        '"' => ("\"".to_string(), 2),
        '$' => ("$".to_string(), 2),
        '\\' => ("\\".to_string(), 2),
        'x' => {
            let (value, consumed) = read_hex(chars, i + 1, 2)?;
            (value.to_string(), 1 + 1 + consumed)
        }
        'u' => {
            let (value, consumed) = read_hex(chars, i + 1, 4)?;
            (value.to_string(), 1 + 1 + consumed)
        }
        'U' => {
            let (value, consumed) = read_hex(chars, i + 1, 8)?;
            (value.to_string(), 1 + 1 + consumed)
        }
        '0'..='7' => {
            let (value, consumed) = read_octal(chars, i);
            (value.to_string(), 1 + consumed)
        }
        other => (other.to_string(), 2),
    })
}

fn read_hex(chars: &[char], start: usize, digits: usize) -> Result<(char, usize), ParseError> {
    let end = (start + digits).min(chars.len());
    let s: String = chars[start..end].iter().collect();
    let code = u32::from_str_radix(&s, 16).map_err(|e| {
        ParseError::new(
            chars.iter().collect::<String>(),
            start,
            format!("invalid hex escape: {}", e),
        )
    })?;
    let c = char::from_u32(code).ok_or_else(|| {
        ParseError::new(
            chars.iter().collect::<String>(),
            start,
            "hex escape is not a valid unicode scalar value",
        )
    })?;
    Ok((c, end - start))
}

fn read_octal(chars: &[char], start: usize) -> (char, usize) {
    let mut end = start;
    while end < chars.len() && end < start + 3 && ('0'..='7').contains(&chars[end]) {
        end += 1;
    }
    let s: String = chars[start..end].iter().collect();
    let code = u32::from_str_radix(&s, 8).unwrap_or(0);
    (char::from_u32(code).unwrap_or('\u{FFFD}'), end - start)
}

/// Produces the double-quoted-literal spelling of `input`: backslash-escapes
/// `\\`, `"`, `$`, and all non-printable-ASCII bytes. Printable ASCII other
/// than those three characters passes through unchanged, so escaping a
/// string made entirely of safe characters is a no-op (length-invariant).
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || (c as u32) == 0x7F => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escape_unescape_closure() {
        let cases = [
            "plain text",
            "needs \"quotes\" and a $ sign",
            "tab\there\nand\rnewlines",
            "control\u{0001}byte",
        ];
        for case in cases {
            let escaped = escape(case);
            let roundtripped = unescape(&escaped).unwrap();
            assert_eq!(roundtripped, case);
        }
    }

    #[test]
    fn escape_is_length_invariant_for_safe_ascii() {
        let safe = "hello world 123";
        assert_eq!(escape(safe), safe);
    }

    #[test]
    fn unescape_known_forms() {
        assert_eq!(unescape("a\\nb").unwrap(), "a\nb");
        assert_eq!(unescape("\\x41").unwrap(), "A");
        assert_eq!(unescape("\\101").unwrap(), "A");
        assert_eq!(unescape("\\u0041").unwrap(), "A");
        assert_eq!(unescape("\\U00000041").unwrap(), "A");
    }
}
