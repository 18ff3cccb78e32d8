//! The parameter model: typed, named/positional, repeating leaf inputs,
//! and the binding algorithm that matches a parsed command line's
//! [`Part`]s against a leaf's declared parameter list.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use scpi_proto::Part;

/// The primitive types a [`Parameter`] may hold.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamType {
    Boolean,
    Integer,
    Real,
    String,
    StringList,
    Enum(Vec<String>),
    Lookup(IndexMap<String, String>),
    /// The "command-element"/raw type: binds verbatim text without
    /// conversion, and (when used on a repeating positional) absorbs
    /// subsequent parts wholesale, including ones that look like options.
    Tuple,
}

/// Controls whether the leaf receives the cooked value, the raw source
/// slice, or the full `(option, value, raw)` triple for a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamForm {
    Object,
    String,
    Raw,
    Tuple,
}

/// Inclusive repeat bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepeatSpec {
    pub min: u32,
    pub max: Option<u32>,
}

/// A numeric bound pair.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeSpec {
    pub min: f64,
    pub max: f64,
}

/// A composite-value separator with its own repeat bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitSpec {
    pub separator: String,
    pub min: u32,
    pub max: Option<u32>,
}

/// One declared leaf input or output.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub ty: ParamType,
    pub named: bool,
    pub default: Option<String>,
    pub range: Option<RangeSpec>,
    pub repeats: Option<RepeatSpec>,
    pub split: Option<SplitSpec>,
    pub hidden: bool,
    pub secret: bool,
    pub form: ParamForm,
}

impl Parameter {
    /// A required positional parameter of the given type.
    pub fn positional(name: impl Into<String>, ty: ParamType) -> Self {
        Parameter {
            name: name.into(),
            ty,
            named: false,
            default: None,
            range: None,
            repeats: None,
            split: None,
            hidden: false,
            secret: false,
            form: ParamForm::Object,
        }
    }

    /// A `-name=value` parameter of the given type.
    pub fn named(name: impl Into<String>, ty: ParamType) -> Self {
        Parameter { named: true, ..Parameter::positional(name, ty) }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(RangeSpec { min, max });
        self
    }

    pub fn with_repeats(mut self, min: u32, max: Option<u32>) -> Self {
        self.repeats = Some(RepeatSpec { min, max });
        self
    }

    pub fn with_split(mut self, separator: impl Into<String>, min: u32, max: Option<u32>) -> Self {
        self.split = Some(SplitSpec { separator: separator.into(), min, max });
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn with_form(mut self, form: ParamForm) -> Self {
        self.form = form;
        self
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    pub fn is_repeating(&self) -> bool {
        self.repeats.is_some()
    }
}

/// Normalizes a leaf's declared parameter list: any optional positional
/// parameter appearing before a required positional
/// parameter is promoted to `named`, and at most one repeating positional
/// and one repeating named parameter may exist, each the last of its kind.
pub fn normalize_params(mut params: Vec<Parameter>) -> Result<Vec<Parameter>> {
    // Promote optional positionals that precede a later required positional.
    let mut seen_required_positional_after = vec![false; params.len()];
    let mut required_seen = false;
    for i in (0..params.len()).rev() {
        seen_required_positional_after[i] = required_seen;
        if !params[i].named && params[i].is_required() && !params[i].is_repeating() {
            required_seen = true;
        }
    }
    for (i, flag) in seen_required_positional_after.into_iter().enumerate() {
        if flag && !params[i].named && !params[i].is_required() && !params[i].is_repeating() {
            params[i].named = true;
        }
    }

    let repeating_positional: Vec<usize> =
        params.iter().enumerate().filter(|(_, p)| !p.named && p.is_repeating()).map(|(i, _)| i).collect();
    let repeating_named: Vec<usize> =
        params.iter().enumerate().filter(|(_, p)| p.named && p.is_repeating()).map(|(i, _)| i).collect();

    if repeating_positional.len() > 1 {
        return Err(Error::internal("at most one repeating positional parameter is allowed per leaf"));
    }
    if repeating_named.len() > 1 {
        return Err(Error::internal("at most one repeating named parameter is allowed per leaf"));
    }
    if let Some(&idx) = repeating_positional.first() {
        let last_positional = params.iter().enumerate().filter(|(_, p)| !p.named).map(|(i, _)| i).max();
        if last_positional != Some(idx) {
            return Err(Error::internal("the repeating positional parameter must be the last positional"));
        }
    }
    if let Some(&idx) = repeating_named.first() {
        let last_named = params.iter().enumerate().filter(|(_, p)| p.named).map(|(i, _)| i).max();
        if last_named != Some(idx) {
            return Err(Error::internal("the repeating named parameter must be the last named parameter"));
        }
    }

    Ok(params)
}

/// A converted argument value, ready to hand to a leaf's `run`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    List(Vec<String>),
    /// `form = raw`: the verbatim source slice, unconverted.
    Raw(String),
    /// `form = tuple`: `(option, cooked, raw)`.
    Tuple(Option<String>, String, String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Raw(s) => Some(s),
            Value::Tuple(_, s, _) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }
}

/// The bound arguments for one leaf invocation: every parameter name maps
/// to one or more converted values (more than one only for repeating
/// parameters).
#[derive(Clone, Debug, Default)]
pub struct BoundArgs(pub IndexMap<String, Vec<Value>>);

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).and_then(|v| v.first())
    }

    pub fn get_all(&self, name: &str) -> &[Value] {
        self.0.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Converts a cooked string into the declared type of `param`, applying
/// range/enum validation after conversion.
fn convert_scalar(param: &Parameter, cooked: &str) -> Result<Value> {
    let value = match &param.ty {
        ParamType::Boolean => Value::Bool(parse_bool(cooked).ok_or_else(|| Error::ConversionFailed {
            parameter: param.name.clone(),
            value: cooked.to_string(),
            expected: "boolean".to_string(),
        })?),
        ParamType::Integer => {
            let n: i64 = cooked.parse().map_err(|_| Error::ConversionFailed {
                parameter: param.name.clone(),
                value: cooked.to_string(),
                expected: "integer".to_string(),
            })?;
            if let Some(range) = &param.range {
                let f = n as f64;
                if f < range.min || f > range.max {
                    return Err(Error::OutOfRange {
                        parameter: param.name.clone(),
                        value: cooked.to_string(),
                        min: range.min.to_string(),
                        max: range.max.to_string(),
                    });
                }
            }
            Value::Int(n)
        }
        ParamType::Real => {
            let n: f64 = cooked.parse().map_err(|_| Error::ConversionFailed {
                parameter: param.name.clone(),
                value: cooked.to_string(),
                expected: "real".to_string(),
            })?;
            if let Some(range) = &param.range {
                if n < range.min || n > range.max {
                    return Err(Error::OutOfRange {
                        parameter: param.name.clone(),
                        value: cooked.to_string(),
                        min: range.min.to_string(),
                        max: range.max.to_string(),
                    });
                }
            }
            Value::Real(n)
        }
        ParamType::String => Value::Str(cooked.to_string()),
        ParamType::StringList => {
            let sep = param.split.as_ref().map(|s| s.separator.as_str()).unwrap_or(",");
            let items: Vec<String> = if cooked.is_empty() {
                Vec::new()
            } else {
                cooked.split(sep).map(|s| s.to_string()).collect()
            };
            if let Some(split) = &param.split {
                let len = items.len() as u32;
                if len < split.min {
                    return Err(Error::TooFewRepeats { parameter: param.name.clone(), min: split.min, got: len });
                }
                if let Some(max) = split.max {
                    if len > max {
                        return Err(Error::TooManyRepeats { parameter: param.name.clone(), max, got: len });
                    }
                }
            }
            Value::List(items)
        }
        ParamType::Enum(options) => {
            if !options.iter().any(|o| o.eq_ignore_ascii_case(cooked)) {
                return Err(Error::InvalidEnumValue { parameter: param.name.clone(), value: cooked.to_string() });
            }
            Value::Str(cooked.to_string())
        }
        ParamType::Lookup(map) => {
            let resolved = map
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(cooked))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::InvalidEnumValue { parameter: param.name.clone(), value: cooked.to_string() })?;
            Value::Str(resolved)
        }
        ParamType::Tuple => Value::Raw(cooked.to_string()),
    };
    Ok(value)
}

/// Converts one bound [`Part`] into a [`Value`] honoring `param.form`.
fn convert_part(param: &Parameter, part: &Part) -> Result<Value> {
    match param.form {
        ParamForm::Raw => Ok(Value::Raw(part.raw.clone())),
        ParamForm::Tuple => Ok(Value::Tuple(part.option.clone(), part.cooked.clone(), part.raw.clone())),
        ParamForm::String => Ok(Value::Str(part.cooked.clone())),
        ParamForm::Object => convert_scalar(param, &part.cooked),
    }
}

/// Classification of a leaf's parameter list used while walking parts.
struct Partitioned<'p> {
    positional: Vec<&'p Parameter>,
    repeating_positional: Option<&'p Parameter>,
    named: IndexMap<String, &'p Parameter>,
    repeating_named: Option<&'p Parameter>,
}

fn partition(params: &[Parameter]) -> Partitioned<'_> {
    let mut positional = Vec::new();
    let mut repeating_positional = None;
    let mut named = IndexMap::new();
    let mut repeating_named = None;
    for p in params {
        if p.named {
            if p.is_repeating() {
                repeating_named = Some(p);
            } else {
                named.insert(p.name.to_lowercase(), p);
            }
        } else if p.is_repeating() {
            repeating_positional = Some(p);
        } else {
            positional.push(p);
        }
    }
    Partitioned { positional, repeating_positional, named, repeating_named }
}

/// Binds a leaf invocation's parsed parts against its declared parameter
/// list. `leaf_name` is used only to
/// annotate errors.
pub fn bind(leaf_name: &str, params: &[Parameter], parts: &[Part]) -> Result<BoundArgs> {
    let partitioned = partition(params);
    let mut bound: IndexMap<String, Vec<Value>> = IndexMap::new();
    let mut positional_cursor = 0usize;
    let mut raw_absorb = false;

    for part in parts {
        if raw_absorb {
            let target = partitioned.repeating_positional.expect("raw_absorb implies repeating positional");
            bound.entry(target.name.clone()).or_default().push(Value::Raw(part.raw.clone()));
            continue;
        }

        if let Some(option_name) = &part.option {
            let key = option_name.to_lowercase();
            if let Some(&param) = partitioned.named.get(&key) {
                let value = convert_part(param, part)?;
                bound.entry(param.name.clone()).or_default().push(value);
            } else if let Some(param) = partitioned.repeating_named {
                let value = convert_part(param, part)?;
                bound.entry(param.name.clone()).or_default().push(value);
            } else {
                return Err(Error::NoSuchCommandOption { leaf: leaf_name.to_string(), option: option_name.clone() });
            }
            continue;
        }

        if positional_cursor < partitioned.positional.len() {
            let param = partitioned.positional[positional_cursor];
            positional_cursor += 1;
            let value = convert_part(param, part)?;
            bound.entry(param.name.clone()).or_default().push(value);
            continue;
        }

        if let Some(param) = partitioned.repeating_positional {
            let value = convert_part(param, part)?;
            bound.entry(param.name.clone()).or_default().push(value);
            if matches!(param.ty, ParamType::Tuple) {
                raw_absorb = true;
            }
            continue;
        }

        return Err(Error::ExtraArgument { leaf: leaf_name.to_string(), value: part.cooked.clone() });
    }

    // Fill unset parameters: required ones are an error, optional ones take
    // their default.
    for param in params {
        if bound.contains_key(&param.name) {
            continue;
        }
        if param.is_required() && !param.is_repeating() {
            return Err(Error::MissingArgument { leaf: leaf_name.to_string(), parameter: param.name.clone() });
        }
        if let Some(default) = &param.default {
            let value = match param.form {
                ParamForm::Raw => Value::Raw(default.clone()),
                ParamForm::Tuple => Value::Tuple(None, default.clone(), default.clone()),
                ParamForm::String => Value::Str(default.clone()),
                ParamForm::Object => convert_scalar(param, default)?,
            };
            bound.insert(param.name.clone(), vec![value]);
        } else if param.is_repeating() {
            bound.insert(param.name.clone(), Vec::new());
        }
    }

    // Validate repeat counts.
    for param in params.iter().filter(|p| p.is_repeating()) {
        let got = bound.get(&param.name).map(|v| v.len()).unwrap_or(0) as u32;
        if let Some(spec) = &param.repeats {
            if got < spec.min {
                return Err(Error::TooFewRepeats { parameter: param.name.clone(), min: spec.min, got });
            }
            if let Some(max) = spec.max {
                if got > max {
                    return Err(Error::TooManyRepeats { parameter: param.name.clone(), max, got });
                }
            }
        }
    }

    Ok(BoundArgs(bound))
}

/// Renders a value back to wire text honoring `param`'s split separator,
/// the inverse of [`bind`].
pub fn format_value(param: &Parameter, value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Str(s) => s.clone(),
        Value::Raw(s) => s.clone(),
        Value::Tuple(_, s, _) => s.clone(),
        Value::List(items) => {
            let sep = param.split.as_ref().map(|s| s.separator.as_str()).unwrap_or(",");
            items.join(sep)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use scpi_proto::Part;

    fn leaf_params() -> Vec<Parameter> {
        vec![
            Parameter::positional("power", ParamType::Real).with_range(0.0, 100.0),
            Parameter::named("unit", ParamType::String).with_default("mW"),
        ]
    }

    #[test]
    fn binds_positional_and_named() {
        let parts = vec![Part::positional("50", "50"), Part::named("unit", "mW", "-unit=mW")];
        let bound = bind("LEAF", &leaf_params(), &parts).unwrap();
        assert_eq!(bound.get("power").unwrap().as_real(), Some(50.0));
        assert_eq!(bound.str("unit"), Some("mW"));
    }

    #[test]
    fn missing_required_is_an_error() {
        let parts: Vec<Part> = vec![];
        let err = bind("LEAF", &leaf_params(), &parts).unwrap_err();
        assert!(matches!(err, Error::MissingArgument { .. }));
    }

    #[test]
    fn extra_positional_is_an_error() {
        let parts = vec![Part::positional("50", "50"), Part::positional("60", "60")];
        let err = bind("LEAF", &leaf_params(), &parts).unwrap_err();
        assert!(matches!(err, Error::ExtraArgument { .. }));
    }

    #[test]
    fn unknown_option_is_an_error() {
        let parts = vec![Part::positional("50", "50"), Part::named("bogus", "x", "-bogus=x")];
        let err = bind("LEAF", &leaf_params(), &parts).unwrap_err();
        assert!(matches!(err, Error::NoSuchCommandOption { .. }));
    }

    #[test]
    fn out_of_range_is_an_error() {
        let parts = vec![Part::positional("500", "500")];
        let err = bind("LEAF", &leaf_params(), &parts).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn normalization_promotes_optional_before_required() {
        let params = vec![
            Parameter::positional("opt", ParamType::String).with_default("x"),
            Parameter::positional("req", ParamType::String),
        ];
        let normalized = normalize_params(params).unwrap();
        assert!(normalized[0].named);
        assert!(!normalized[1].named);
    }

    #[test]
    fn repeating_positional_collects_many() {
        let params = vec![Parameter::positional("items", ParamType::String).with_repeats(0, None)];
        let parts = vec![Part::positional("a", "a"), Part::positional("b", "b"), Part::positional("c", "c")];
        let bound = bind("LEAF", &params, &parts).unwrap();
        assert_eq!(bound.get_all("items").len(), 3);
    }

    #[test]
    fn repeat_bounds_enforced() {
        let params = vec![Parameter::positional("items", ParamType::String).with_repeats(2, Some(2))];
        let parts = vec![Part::positional("a", "a")];
        let err = bind("LEAF", &params, &parts).unwrap_err();
        assert!(matches!(err, Error::TooFewRepeats { .. }));
    }
}
