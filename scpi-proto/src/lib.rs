//! The SCPI-style wire protocol: tokenizing, escaping, and reply-quoting,
//! with no knowledge of a command tree, a session, or access control. It
//! only knows how to turn a line of text into [`Part`]s and how to turn a
//! value back into wire-safe text; the `scpi-server` crate builds the
//! command-processing engine on top of these primitives.

#[cfg(all(feature = "bytes", feature = "tokio-util"))]
pub mod codec;
pub mod error;
pub mod escape;
pub mod expr;
pub mod part;
pub mod quote;
pub mod signal;
pub mod tokenizer;
pub mod variable;

#[cfg(all(feature = "bytes", feature = "tokio-util"))]
pub use codec::LineCodec;
pub use error::{ParseError, ProtocolError, Result};
pub use expr::{evaluate, ExprValue};
pub use part::{ParsedLine, Part};
pub use quote::{quote, QuoteMode};
pub use signal::{MethodRef, Signal};
pub use tokenizer::{ArgRef, NoSubstitutions, Substituter, Tokenizer};
pub use variable::{VarExpr, VarValue};
