//! The per-invocation handle a leaf's [`crate::leaf::LeafBehavior`] receives:
//! its bound arguments plus narrow, trait-object access back into the
//! owning session and engine, so a leaf never needs to know about
//! [`crate::session::Session`] or [`crate::engine::Engine`] directly.

use crate::access::Access;
use crate::error::Result;
use crate::leaf::Outcome;
use crate::node::NodeId;
use crate::param::BoundArgs;
use crate::pubsub::SubscriptionId;
use scpi_proto::{ParsedLine, Part};
use std::sync::Arc;

/// The session-side operations a running leaf may need: emitting an
/// out-of-band `MESSage` line, reading/writing the three variable scopes,
/// publishing to the pub/sub bus, and the handful of operations the
/// built-in `common` branch leaves need to reach back into their owning
/// session. Implemented by [`crate::session::Session`]; kept as a trait
/// here so `leaf.rs`/`context.rs` don't need to depend on the session
/// runtime's concrete type.
#[async_trait::async_trait]
pub trait SessionHost: Send + Sync {
    fn session_id(&self) -> u64;
    fn access(&self) -> Access;

    /// Sends an unsolicited `MESSage` line to this session's client.
    async fn emit_message(&self, text: &str);

    /// Looks up `name` across the session/branch/global variable scopes, in
    /// that order.
    fn get_variable(&self, name: &str) -> Option<String>;

    /// Sets `name` in the named scope (`"session"`, `"branch"`, or
    /// `"global"`); branch scope resolves relative to `branch`.
    fn set_variable(&self, scope: &str, branch: NodeId, name: &str, value: String);

    /// Removes `name` from whichever scope currently holds it, searching
    /// session/branch/global in that order.
    fn unset_variable(&self, branch: NodeId, name: &str);

    /// Publishes `text` under `topic` at `level`. The host
    /// passes its own session id as the publication's originating session
    /// so subscriptions with `includeSession = false` can suppress it.
    async fn publish(&self, topic: &str, text: &str, level: u8);

    /// Raises or lowers this session's working access level, gated by its
    /// connection-time access limit.
    fn set_access(&self, level: Access) -> Result<()>;

    /// Attempts to acquire process-wide exclusive access at `level`
    /// (`ACCess -exclusive`).
    fn acquire_exclusive(&self, level: Access) -> Result<()>;

    /// Exempts (or un-exempts) this session from the exclusive-access cap
    /// other sessions are held to (`ACCess -stealth`).
    fn set_stealth(&self, stealth: bool);

    /// Records a subscription so session teardown can unsubscribe it
    /// (`SUBScribe`).
    fn track_subscription(&self, id: SubscriptionId);

    /// Forgets a subscription this session previously tracked
    /// (`UNSUBscribe`).
    fn untrack_subscription(&self, id: SubscriptionId);

    /// Marks this session's input stream for clean closure after the
    /// current reply is sent.
    fn request_exit(&self);

    /// Resolves and dispatches `command` within this session's own
    /// dispatch pipeline, sharing its variables and access level
    /// (`$(...)` command substitution, inline macro execution).
    async fn invoke_nested(self: Arc<Self>, scope: NodeId, command: String, parts: Vec<Part>) -> Result<Outcome>;

    /// Runs an already-tokenized line on a fresh child session of the
    /// `Macro` kind (non-inline user macros). The child's resolution is
    /// collected and handed back as an `Outcome` rather than written to the
    /// wire directly, so the caller's own dispatch writes the single reply
    /// line the invoking client actually sees.
    async fn run_macro_body(self: Arc<Self>, scope: NodeId, parsed: ParsedLine) -> Result<Outcome>;
}

/// One leaf invocation's full context: what it was bound with, who asked,
/// and the handles needed to act beyond its own return value.
pub struct Context {
    pub engine: Arc<crate::engine::Engine>,
    pub host: Arc<dyn SessionHost>,
    pub node: NodeId,
    pub leaf_name: String,
    pub args: BoundArgs,
    /// The raw parsed parts, kept for leaves that need verbatim text (e.g.
    /// macro bodies re-tokenizing their arguments).
    pub raw_parts: Vec<Part>,
}

impl Context {
    pub fn access(&self) -> Access {
        self.host.access()
    }

    pub async fn emit_message(&self, text: &str) {
        self.host.emit_message(text).await
    }

    pub async fn publish(&self, topic: &str, text: &str, level: u8) {
        self.host.publish(topic, text, level).await
    }

    /// Resolves a command path relative to this leaf's parent branch,
    /// falling through to an absolute lookup on a leading colon.
    pub fn locate(&self, path: &str) -> Result<NodeId> {
        let parent = self.engine.arena().get(self.node).parent.unwrap_or_else(|| self.engine.arena().root());
        let (id, _) = self.engine.locate(parent, path)?;
        Ok(id)
    }
}
