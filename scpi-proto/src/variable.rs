//! Compiled `${...}` variable-reference grammar.
//!
//! A `${...}` expression names a variable and chains zero or more
//! operators onto it: an optional `[subkey]` index, then at most one of a
//! substring/regex replace, a slice, a `:+`/`:-` alternate, or a `?:`
//! ternary, and an optional leading `#` that replaces the final result with
//! its length. The alternate form follows shell convention, requiring
//! `:+text` / `:-text` (see `DESIGN.md`, "variable alternate operator").
use crate::error::ParseError;
use regex::Regex;

/// One variable value as seen by the operator grammar: either a scalar
/// string or an ordered list of strings (so that `[subkey]` and length can
/// apply to list-typed session variables, e.g. `x=["foo","bar"]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarValue {
    Scalar(String),
    List(Vec<String>),
}

impl VarValue {
    /// Collapses to a single string the way positional expansion does:
    /// scalars pass through; lists join with a single space.
    pub fn collapse(&self) -> String {
        match self {
            VarValue::Scalar(s) => s.clone(),
            VarValue::List(items) => items.join(" "),
        }
    }

    fn len(&self) -> usize {
        match self {
            VarValue::Scalar(s) => s.chars().count(),
            VarValue::List(items) => items.len(),
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            VarValue::Scalar(s) => !s.is_empty() && s != "0" && s != "false",
            VarValue::List(items) => !items.is_empty(),
        }
    }
}

/// A compiled slice descriptor: `start:len:step`, any field optional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<i64>,
    pub len: Option<i64>,
    pub step: Option<i64>,
}

/// A single chained operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarOp {
    /// `[search/replace]`, or `[/search/replace]` for regex when the search
    /// text begins with an extra `/`.
    Replace { search: String, replace: String, regex: bool },
    /// `:start:len:step`.
    Slice(Slice),
    /// `:+text` (use `text` if the value is truthy) or `:-text` (use `text`
    /// if the value is falsy/absent).
    Alternate { text: String, on_truthy: bool },
    /// `?if_true:if_false`.
    Ternary { if_true: String, if_false: String },
}

/// A fully compiled `${...}` expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarExpr {
    pub name: String,
    pub subkey: Option<String>,
    pub ops: Vec<VarOp>,
    pub length: bool,
}

impl VarExpr {
    /// Compiles the content between `${` and the matching `}` (exclusive of
    /// the braces themselves).
    pub fn compile(content: &str) -> Result<VarExpr, ParseError> {
        let mut chars: Vec<char> = content.chars().collect();
        let mut pos = 0usize;
        let length = if chars.first() == Some(&'#') {
            pos += 1;
            true
        } else {
            false
        };

        let name_start = pos;
        while pos < chars.len() && !"[/:?".contains(chars[pos]) {
            pos += 1;
        }
        if pos == name_start {
            return Err(ParseError::new(content, pos, "empty variable name"));
        }
        let name: String = chars[name_start..pos].iter().collect();

        let mut subkey = None;
        if chars.get(pos) == Some(&'[') {
            let end = find_matching(&chars, pos, '[', ']')
                .ok_or_else(|| ParseError::new(content, pos, "unterminated `[subkey]`"))?;
            subkey = Some(chars[pos + 1..end].iter().collect::<String>());
            pos = end + 1;
        }

        let mut ops = Vec::new();
        while pos < chars.len() {
            match chars[pos] {
                '/' => {
                    let (op, next) = parse_replace(&chars, pos, content)?;
                    ops.push(op);
                    pos = next;
                }
                ':' => {
                    let (op, next) = parse_colon_op(&chars, pos, content)?;
                    ops.push(op);
                    pos = next;
                }
                '?' => {
                    let (op, next) = parse_ternary(&chars, pos, content)?;
                    ops.push(op);
                    pos = next;
                }
                other => {
                    return Err(ParseError::new(
                        content,
                        pos,
                        format!("unexpected character `{}` in variable expression", other),
                    ));
                }
            }
        }
        let _ = &mut chars;
        Ok(VarExpr { name, subkey, ops, length })
    }

    /// Applies the compiled operators to a resolved base value, producing
    /// the final cooked string.
    pub fn apply(&self, mut value: VarValue) -> Result<String, ParseError> {
        if let Some(ref sub) = self.subkey {
            value = match &value {
                VarValue::List(items) => {
                    let idx: usize = sub.parse().map_err(|_| {
                        ParseError::new(sub.clone(), 0, "subkey is not a valid list index")
                    })?;
                    VarValue::Scalar(items.get(idx).cloned().unwrap_or_default())
                }
                VarValue::Scalar(s) => VarValue::Scalar(s.clone()),
            };
        }

        for op in &self.ops {
            value = match op {
                VarOp::Replace { search, replace, regex } => {
                    let base = value.collapse();
                    let replaced = if *regex {
                        let re = Regex::new(search)
                            .map_err(|e| ParseError::new(search.clone(), 0, e.to_string()))?;
                        re.replace_all(&base, replace.as_str()).into_owned()
                    } else {
                        base.replace(search.as_str(), replace)
                    };
                    VarValue::Scalar(replaced)
                }
                VarOp::Slice(slice) => VarValue::Scalar(apply_slice(&value.collapse(), slice)),
                VarOp::Alternate { text, on_truthy } => {
                    if value.is_truthy() == *on_truthy {
                        VarValue::Scalar(text.clone())
                    } else {
                        value
                    }
                }
                VarOp::Ternary { if_true, if_false } => {
                    if value.is_truthy() {
                        VarValue::Scalar(if_true.clone())
                    } else {
                        VarValue::Scalar(if_false.clone())
                    }
                }
            };
        }

        if self.length {
            Ok(value.len().to_string())
        } else {
            Ok(value.collapse())
        }
    }
}

fn find_matching(chars: &[char], open_pos: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut i = open_pos;
    while i < chars.len() {
        if chars[i] == open {
            depth += 1;
        } else if chars[i] == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn parse_replace(chars: &[char], pos: usize, content: &str) -> Result<(VarOp, usize), ParseError> {
    // pos points at the first '/'. `//search/replace/` (double leading
    // slash) marks regex mode.
    let mut i = pos + 1;
    let regex = chars.get(i) == Some(&'/');
    if regex {
        i += 1;
    }
    let search_start = i;
    while i < chars.len() && chars[i] != '/' {
        i += 1;
    }
    if i >= chars.len() {
        return Err(ParseError::new(content, pos, "unterminated `/search/replace/`"));
    }
    let search: String = chars[search_start..i].iter().collect();
    i += 1; // skip '/'
    let replace_start = i;
    while i < chars.len() && !"[/:?".contains(chars[i]) {
        i += 1;
    }
    let replace: String = chars[replace_start..i].iter().collect();
    Ok((VarOp::Replace { search, replace, regex }, i))
}

fn parse_colon_op(chars: &[char], pos: usize, content: &str) -> Result<(VarOp, usize), ParseError> {
    let next = chars.get(pos + 1).copied();
    if next == Some('+') || next == Some('-') {
        let on_truthy = next == Some('+');
        let text_start = pos + 2;
        let mut i = text_start;
        while i < chars.len() && !"[/:?".contains(chars[i]) {
            i += 1;
        }
        let text: String = chars[text_start..i].iter().collect();
        return Ok((VarOp::Alternate { text, on_truthy }, i));
    }

    // Numeric slice: start:len:step, each field optional, fields end at the
    // next field-separating ':' or a following operator character.
    let mut i = pos + 1;
    let mut fields: Vec<Option<i64>> = Vec::new();
    loop {
        let field_start = i;
        if chars.get(i) == Some(&'-') {
            i += 1;
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let field: String = chars[field_start..i].iter().collect();
        fields.push(if field.is_empty() || field == "-" {
            None
        } else {
            Some(field.parse().map_err(|_| {
                ParseError::new(content, field_start, "invalid integer in slice operator")
            })?)
        });
        if chars.get(i) == Some(&':') && fields.len() < 3 {
            i += 1;
            continue;
        }
        break;
    }
    while fields.len() < 3 {
        fields.push(None);
    }
    Ok((
        VarOp::Slice(Slice {
            start: fields[0],
            len: fields[1],
            step: fields[2],
        }),
        i,
    ))
}

fn parse_ternary(chars: &[char], pos: usize, content: &str) -> Result<(VarOp, usize), ParseError> {
    let mut i = pos + 1;
    let true_start = i;
    while i < chars.len() && chars[i] != ':' {
        i += 1;
    }
    if i >= chars.len() {
        return Err(ParseError::new(content, pos, "ternary operator missing `:`"));
    }
    let if_true: String = chars[true_start..i].iter().collect();
    i += 1;
    let false_start = i;
    while i < chars.len() && !"[/:?".contains(chars[i]) {
        i += 1;
    }
    let if_false: String = chars[false_start..i].iter().collect();
    Ok((VarOp::Ternary { if_true, if_false }, i))
}

fn apply_slice(value: &str, slice: &Slice) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len() as i64;
    let step = slice.step.unwrap_or(1);
    if step == 0 {
        return String::new();
    }
    let resolve = |v: i64| -> i64 {
        if v < 0 {
            (len + v).max(0)
        } else {
            v.min(len)
        }
    };
    let start = resolve(slice.start.unwrap_or(0));
    let count = slice.len.unwrap_or(len);
    let mut out = String::new();
    if step > 0 {
        let mut i = start;
        let mut taken = 0i64;
        while i < len && taken < count {
            out.push(chars[i as usize]);
            i += step;
            taken += 1;
        }
    } else {
        let mut i = start;
        let mut taken = 0i64;
        while i >= 0 && taken < count {
            out.push(chars[i as usize]);
            i += step;
            taken += 1;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compiles_subkey() {
        let expr = VarExpr::compile("x[1]").unwrap();
        assert_eq!(expr.name, "x");
        assert_eq!(expr.subkey.as_deref(), Some("1"));
        let value = VarValue::List(vec!["foo".into(), "bar".into()]);
        assert_eq!(expr.apply(value).unwrap(), "bar");
    }

    #[test]
    fn compiles_plain_replace() {
        let expr = VarExpr::compile("x/bar/baz").unwrap();
        let value = VarValue::Scalar("foo bar".into());
        assert_eq!(expr.apply(value).unwrap(), "foo baz");
    }

    #[test]
    fn compiles_length_prefix() {
        let expr = VarExpr::compile("#x").unwrap();
        assert!(expr.length);
        assert_eq!(expr.apply(VarValue::Scalar("hello".into())).unwrap(), "5");
    }

    #[test]
    fn compiles_ternary() {
        let expr = VarExpr::compile("x?yes:no").unwrap();
        assert_eq!(expr.apply(VarValue::Scalar("1".into())).unwrap(), "yes");
        assert_eq!(expr.apply(VarValue::Scalar("".into())).unwrap(), "no");
    }

    #[test]
    fn compiles_alternate() {
        let expr = VarExpr::compile("x:-default").unwrap();
        assert_eq!(expr.apply(VarValue::Scalar("".into())).unwrap(), "default");
        let expr = VarExpr::compile("x:+set").unwrap();
        assert_eq!(expr.apply(VarValue::Scalar("anything".into())).unwrap(), "set");
    }

    #[test]
    fn compiles_slice() {
        let expr = VarExpr::compile("x:1:2").unwrap();
        assert_eq!(expr.apply(VarValue::Scalar("hello".into())).unwrap(), "el");
    }
}
