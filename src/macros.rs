//! User-defined macros: a leaf whose body is stored text, substituted
//! with the invocation's bound arguments and re-entered through the
//! tokenizer, then dispatched either in a fresh child session or inline
//! in the caller's own session.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::leaf::{Leaf, LeafBehavior, LeafCapabilities, Outcome};
use crate::node::{Node, NodeKind};
use crate::param::{BoundArgs, ParamType, Parameter};
use async_trait::async_trait;
use scpi_proto::{NoSubstitutions, ProtocolError, Tokenizer};
use std::sync::Arc;

/// Whether a macro body runs in a fresh child session (the default) or
/// shares the caller's own session, scope, and variables (`inline`
/// macros).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacroMode {
    Nested,
    Inline,
}

/// The stored definition of a user macro: its declared
/// parameter names, bound the same way any leaf's positional parameters
/// are, plus `$@`/`$0`/`$N` access to the raw invocation text.
pub struct MacroBehavior {
    body: String,
    mode: MacroMode,
}

impl MacroBehavior {
    /// Substitutes `$name` (a declared parameter), `$@`/`$0` (all raw
    /// arguments, space-joined), and `$N` (the Nth raw argument, 1-based)
    /// into the stored body.
    fn expand(&self, args: &BoundArgs, raw_args: &[String]) -> String {
        let mut out = String::with_capacity(self.body.len());
        let mut chars = self.body.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some((_, '@')) => {
                    chars.next();
                    out.push_str(&raw_args.join(" "));
                }
                Some((_, d)) if d.is_ascii_digit() => {
                    let mut num = String::new();
                    while let Some((_, d)) = chars.peek().copied() {
                        if d.is_ascii_digit() {
                            num.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let idx: usize = num.parse().unwrap_or(0);
                    if idx == 0 {
                        out.push_str(&raw_args.join(" "));
                    } else {
                        out.push_str(raw_args.get(idx - 1).map(String::as_str).unwrap_or(""));
                    }
                }
                Some((_, c2)) if c2.is_alphabetic() || c2 == '_' => {
                    let mut name = String::new();
                    while let Some((_, c2)) = chars.peek().copied() {
                        if c2.is_alphanumeric() || c2 == '_' {
                            name.push(c2);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(args.str(&name).unwrap_or(""));
                }
                _ => out.push('$'),
            }
        }
        out
    }
}

#[async_trait]
impl LeafBehavior for MacroBehavior {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let raw_args: Vec<String> = ctx.raw_parts.iter().map(|p| p.cooked.clone()).collect();
        let text = self.expand(&ctx.args, &raw_args);

        let mut no_sub = NoSubstitutions;
        let parsed = Tokenizer::parse_line(&text, &mut || None, &mut no_sub)
            .map_err(|e| Error::from(ProtocolError::Parse(e)))?;

        match self.mode {
            MacroMode::Inline => {
                ctx.host
                    .clone()
                    .invoke_nested(ctx.engine.root(), parsed.command, parsed.parts)
                    .await
            }
            MacroMode::Nested => ctx.host.clone().run_macro_body(ctx.engine.root(), parsed).await,
        }
    }

    fn macro_body(&self) -> Option<&str> {
        Some(&self.body)
    }
}

/// Builds the leaf mounted for a user macro named by `MACRo+`: its
/// parameters bind positionally by the names the define call declared,
/// each as a plain string.
pub fn build_macro_leaf(params: Vec<String>, body: String, mode: MacroMode) -> Result<Leaf> {
    let declared: Vec<Parameter> =
        params.iter().map(|name| Parameter::positional(name.clone(), ParamType::String)).collect();
    let declared = crate::param::normalize_params(declared)?;
    Ok(Leaf::new(declared, LeafCapabilities::default(), Arc::new(MacroBehavior { body, mode })))
}

/// A node wrapping a freshly built macro leaf, ready for
/// `Engine::mount`.
pub fn macro_node(leaf: Leaf) -> Node {
    Node {
        full_name: String::new(),
        parent: None,
        defaults: indexmap::IndexMap::new(),
        hidden: false,
        access: crate::access::Access::Guest,
        modify_access: crate::access::Access::Administrator,
        kind: NodeKind::Leaf(leaf),
    }
}

/// Whether `node`'s leaf is a user-defined macro, and if so, its stored
/// body text.
pub fn body_of(node: &Node) -> Option<&str> {
    node.kind.as_leaf().and_then(|leaf| leaf.behavior.macro_body())
}
