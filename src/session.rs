//! Per-connection session runtime: reads a stream of commands,
//! resolves and dispatches each one, tracks jobs, and exposes the three
//! variable scopes and control-flow signal policy a leaf or macro body
//! needs.

use crate::access::Access;
use crate::context::{Context, SessionHost};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::leaf::{dispatch as dispatch_leaf, Outcome};
use crate::node::{NodeId, NodeKind};
use crate::param::{self, BoundArgs};
use crate::pubsub::SubscriptionId;
use crate::reply::{self, Index};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use scpi_proto::{ArgRef, ParsedLine, Part, ProtocolError, Signal, Substituter, Tokenizer, VarExpr, VarValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What kind of dispatch boundary a session represents, which picks its row
/// in `signal_policy`'s table. **Inline** macros are deliberately not a fifth
/// variant here: they execute in the caller's own `Session` (sharing scope
/// and variables) rather than opening a new dispatch boundary, so there is
/// nothing for a "pass-through" policy to do (see `DESIGN.md`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// A transport-facing session (TCP, telnet, serial).
    Client,
    /// A non-inline macro's sub-session.
    Macro,
    /// A startup/shutdown hook session.
    Module,
    /// A detached worker session with no client waiting on its reply.
    Detached,
}

/// How a session reacts to a `NextReply`/`NextCommand` signal raised
/// beneath it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SignalAction {
    /// Write `NEXT <idx>` to the client, then run the target leaf on a
    /// detached task.
    EmitNextAndSpawn,
    /// Run the target leaf on a detached task without writing anything
    /// (no client is waiting on this session's replies).
    RunAsync,
    /// Propagate the signal unchanged to whoever invoked this session.
    Reraise,
}

impl SessionKind {
    fn next_reply_action(self) -> SignalAction {
        match self {
            SessionKind::Client | SessionKind::Macro => SignalAction::EmitNextAndSpawn,
            SessionKind::Module | SessionKind::Detached => SignalAction::RunAsync,
        }
    }

    fn next_command_action(self) -> SignalAction {
        match self {
            SessionKind::Client => SignalAction::EmitNextAndSpawn,
            SessionKind::Macro | SessionKind::Module => SignalAction::Reraise,
            SessionKind::Detached => SignalAction::RunAsync,
        }
    }

    /// Whether this session catches `ReturnValue`/`ReturnCall` signals
    /// raised by its own leaves rather than letting them bubble further.
    fn catch_return(self) -> bool {
        !matches!(self, SessionKind::Client)
    }
}

/// What running one command line resolved to, from the top-level read
/// loop's point of view.
enum Resolution {
    Done(Vec<String>),
    /// A `NEXT` reply (or nothing, for a client-less session) was already
    /// written; the eventual `OK`/`ERRor` will arrive later from a
    /// detached worker.
    Deferred,
}

/// The three variable scopes a session searches in order.
struct Scopes {
    local: IndexMap<String, String>,
}

/// One connection's (or nested macro invocation's) runtime state.
pub struct Session {
    pub id: u64,
    pub kind: SessionKind,
    pub engine: Arc<Engine>,
    access: Mutex<Access>,
    access_limit: Access,
    scope: Mutex<NodeId>,
    scopes: Mutex<Scopes>,
    last_outputs: Mutex<Vec<String>>,
    jobs: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    writer: mpsc::UnboundedSender<String>,
    ready_exit: Mutex<bool>,
    /// Exempts this session from the exclusive-access cap on other
    /// sessions.
    stealth: Mutex<bool>,
}

impl Session {
    pub fn new(
        engine: Arc<Engine>,
        kind: SessionKind,
        access_limit: Access,
        writer: mpsc::UnboundedSender<String>,
    ) -> Arc<Session> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let root = engine.root();
        Arc::new(Session {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            kind,
            engine,
            access: Mutex::new(Access::Guest),
            access_limit,
            scope: Mutex::new(root),
            scopes: Mutex::new(Scopes { local: IndexMap::new() }),
            last_outputs: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            writer,
            ready_exit: Mutex::new(false),
            stealth: Mutex::new(false),
        })
    }

    /// A sub-session sharing this session's writer but starting fresh
    /// variable/scope state, used for non-inline macro bodies.
    pub fn spawn_child(self: &Arc<Self>, kind: SessionKind) -> Arc<Session> {
        Session::new(self.engine.clone(), kind, self.access_limit, self.writer.clone())
    }

    pub fn scope(&self) -> NodeId {
        *self.scope.lock()
    }

    pub fn set_scope(&self, node: NodeId) {
        *self.scope.lock() = node;
    }

    pub fn requested_exit(&self) -> bool {
        *self.ready_exit.lock()
    }

    pub fn request_exit(&self) {
        *self.ready_exit.lock() = true;
    }

    pub fn track_subscription(&self, id: SubscriptionId) {
        self.subscriptions.lock().push(id);
    }

    pub fn untrack_subscription(&self, id: SubscriptionId) {
        self.subscriptions.lock().retain(|s| *s != id);
    }

    /// Releases exclusive access, unsubscribes from every topic, and
    /// aborts any job still in this session's list.
    /// Detached (asynchronous) work that has already escaped onto its own
    /// task is allowed to finish: this only clears the bookkeeping list,
    /// it doesn't proactively abort handles, matching "asynchronous ones
    /// are allowed to complete".
    pub fn teardown(&self) {
        self.engine.release_exclusive(self.id);
        for sub in self.subscriptions.lock().drain(..) {
            self.engine.bus().unsubscribe(sub);
        }
        self.jobs.lock().clear();
    }

    /// Sends a pre-terminated reply line directly, bypassing dispatch. Used
    /// by transports to emit the initial `READy` handshake.
    pub(crate) fn write_line(&self, line: String) {
        let _ = self.writer.send(line);
    }

    /// Looks up `name` across the three scopes: session
    /// local, enclosing branch data, process global.
    fn lookup_variable(&self, name: &str) -> Option<String> {
        if let Some(v) = self.scopes.lock().local.get(name).cloned() {
            return Some(v);
        }
        if let Some(v) = self.engine.branch_data_get(self.scope(), name) {
            return Some(v);
        }
        self.engine.get_global(name)
    }

    /// Sets `name` in whichever scope already holds it; a fresh name
    /// always goes to local.
    fn assign_variable(&self, name: &str, value: String) {
        if self.scopes.lock().local.contains_key(name) {
            self.scopes.lock().local.insert(name.to_string(), value);
            return;
        }
        if self.engine.branch_data_has(self.scope(), name) {
            self.engine.branch_data_set(self.scope(), name, value);
            return;
        }
        if self.engine.has_global(name) {
            self.engine.set_global(name, value);
            return;
        }
        self.scopes.lock().local.insert(name.to_string(), value);
    }

    /// Removes `name` from whichever scope currently holds it, searching
    /// the same session/branch/global order as a lookup (used by `UNSET`).
    /// A no-op if `name` is bound nowhere.
    fn forget_variable(&self, name: &str) {
        if self.scopes.lock().local.shift_remove(name).is_some() {
            return;
        }
        if self.engine.branch_data_has(self.scope(), name) {
            self.engine.branch_data_remove(self.scope(), name);
            return;
        }
        self.engine.remove_global(name);
    }

    /// Runs one already-read physical line through the tokenizer (bridging
    /// heredoc continuation reads via `block_in_place`, per `DESIGN.md`'s
    /// async/sync-tokenizer bridging note) and dispatches it.
    pub async fn handle_line<F>(self: &Arc<Self>, first_line: String, mut read_more: F) -> Result<()>
    where
        F: FnMut() -> Option<String> + Send + 'static,
    {
        let mut subs = SessionSubstituter { session: self.clone() };
        let parsed = tokio::task::block_in_place(|| {
            Tokenizer::parse_line(&first_line, &mut read_more, &mut subs)
        })
        .map_err(|e| Error::from(ProtocolError::Parse(e)))?;

        self.run_parsed(parsed).await
    }

    /// Resolves, binds, runs, and replies to one already-tokenized line.
    pub async fn run_parsed(self: &Arc<Self>, parsed: ParsedLine) -> Result<()> {
        let idx = match parsed.index {
            Some(n) => Index::Numeric(n),
            None => Index::Raw(parsed.raw.clone()),
        };

        match self.run_command(self.scope(), &parsed.command, parsed.parts.clone()).await {
            Ok(Resolution::Done(outputs)) => {
                *self.last_outputs.lock() = outputs.clone();
                self.write_line(reply::terminate(&reply::ok_line(&idx, &outputs)));
            }
            Ok(Resolution::Deferred) => {}
            Err(err) => {
                self.write_line(reply::terminate(&reply::error_line(&idx, &err)));
            }
        }
        Ok(())
    }

    /// Resolves `command` from `scope`, checks access, binds arguments, and
    /// dispatches its leaf, looping on any control-flow signal until it
    /// resolves to a final value or is handed off to a detached worker.
    async fn run_command(self: &Arc<Self>, scope: NodeId, command: &str, parts: Vec<Part>) -> Result<Resolution> {
        let outcome = self.invoke(scope, command, parts).await?;
        self.resolve(scope, outcome, None).await
    }

    /// Turns a leaf's raw [`Outcome`] into a [`Resolution`], per this
    /// session kind's policy. `idx` is only used when a
    /// signal requires writing `NEXT` directly (top-level dispatch);
    /// nested invocations (from macros, `$(...)`) pass `None` and instead
    /// let the signal bubble as an `Err`-free early return so their own
    /// caller's `resolve` can act on it.
    async fn resolve(self: &Arc<Self>, scope: NodeId, outcome: Outcome, idx: Option<&Index>) -> Result<Resolution> {
        match outcome {
            Outcome::Done(outputs) => Ok(Resolution::Done(outputs)),
            Outcome::Signal(Signal::NextReply { target, args }) => {
                match self.kind.next_reply_action() {
                    SignalAction::EmitNextAndSpawn => {
                        if let Some(idx) = idx {
                            self.write_line(reply::terminate(&reply::next_line(idx)));
                        }
                        self.spawn_worker(scope, target.leaf, args);
                        Ok(Resolution::Deferred)
                    }
                    SignalAction::RunAsync => {
                        self.spawn_worker(scope, target.leaf, args);
                        Ok(Resolution::Deferred)
                    }
                    SignalAction::Reraise => {
                        Err(Error::internal("NextReply reached a session kind with no caller to re-raise to"))
                    }
                }
            }
            Outcome::Signal(Signal::NextCommand { target }) => match self.kind.next_command_action() {
                SignalAction::EmitNextAndSpawn => {
                    if let Some(idx) = idx {
                        self.write_line(reply::terminate(&reply::next_line(idx)));
                    }
                    self.spawn_worker(scope, target.leaf, Vec::new());
                    Ok(Resolution::Deferred)
                }
                SignalAction::RunAsync => {
                    self.spawn_worker(scope, target.leaf, Vec::new());
                    Ok(Resolution::Deferred)
                }
                SignalAction::Reraise => Err(Error::internal(
                    "NextCommand reached the top of dispatch instead of being caught by a macro body",
                )),
            },
            Outcome::Signal(Signal::ReturnValue { parts }) => {
                if self.kind.catch_return() {
                    Ok(Resolution::Done(parts.into_iter().map(|p| p.cooked).collect()))
                } else {
                    // No enclosing macro to catch a bare RETurn: degrade to
                    // a normal result rather than erroring (open question,
                    // see DESIGN.md).
                    Ok(Resolution::Done(parts.into_iter().map(|p| p.cooked).collect()))
                }
            }
            Outcome::Signal(Signal::ReturnCall { target, args }) => {
                let inner = self.invoke(scope, &target.leaf, args).await?;
                let resolved = self.resolve(scope, inner, idx).await?;
                match resolved {
                    Resolution::Done(outputs) => {
                        let joined = outputs.join(" ");
                        self.write_line(reply::quote_output_segment(&joined));
                        Ok(Resolution::Done(outputs))
                    }
                    deferred => Ok(deferred),
                }
            }
            Outcome::Signal(Signal::Break { levels }) => {
                Err(Error::internal(format!("unhandled Break({levels}) reached top of session dispatch")))
            }
        }
    }

    /// Resolves and binds a command without interpreting any resulting
    /// signal; used by [`Session::run_command`] and by macro bodies that
    /// need the raw `Outcome` to decide how to unwind.
    pub async fn invoke(self: &Arc<Self>, scope: NodeId, command: &str, parts: Vec<Part>) -> Result<Outcome> {
        let (node_id, defaults) = self.engine.locate(scope, command)?;
        let node_access = self.engine.arena().get(node_id).access;
        if self.access() < node_access {
            return Err(Error::InsufficientAccess { required: node_access, current: self.access() });
        }

        let effective_parts = merge_defaults(defaults, parts);

        // Extract a cheap, lock-free handle before the first `.await`:
        // holding a `parking_lot` read guard across an await point would
        // block the executor thread for as long as the leaf runs.
        let (leaf_name, params, handle) = {
            let arena = self.engine.arena();
            let node = arena.get(node_id);
            let leaf = match &node.kind {
                NodeKind::Leaf(l) => l,
                NodeKind::Branch(_) => return Err(Error::NotALeaf { name: node.full_name.clone() }),
            };
            (node.full_name.clone(), leaf.params.clone(), leaf.handle())
        };
        let bound = param::bind(&leaf_name, &params, &effective_parts)?;

        let ctx = Context {
            engine: self.engine.clone(),
            host: self.clone(),
            node: node_id,
            leaf_name,
            args: bound,
            raw_parts: effective_parts,
        };

        dispatch_leaf(&handle, &ctx).await
    }

    fn spawn_worker(self: &Arc<Self>, scope: NodeId, leaf: String, args: Vec<Part>) {
        let me = self.clone();
        let handle = tokio::spawn(async move {
            match me.invoke(scope, &leaf, args).await {
                Ok(outcome) => {
                    if let Ok(Resolution::Done(outputs)) = me.resolve(scope, outcome, None).await {
                        let idx = Index::Raw(leaf.clone());
                        *me.last_outputs.lock() = outputs.clone();
                        me.write_line(reply::terminate(&reply::ok_line(&idx, &outputs)));
                    }
                }
                Err(err) => {
                    me.write_line(reply::terminate(&reply::error_line(&Index::Raw(leaf.clone()), &err)));
                }
            }
        });
        self.jobs.lock().push(handle);
    }
}

#[async_trait]
impl SessionHost for Session {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn access(&self) -> Access {
        *self.access.lock()
    }

    async fn emit_message(&self, text: &str) {
        self.write_line(reply::terminate(text));
    }

    fn get_variable(&self, name: &str) -> Option<String> {
        self.lookup_variable(name)
    }

    fn set_variable(&self, scope: &str, branch: NodeId, name: &str, value: String) {
        match scope {
            "global" => self.engine.set_global(name, value),
            "branch" => self.engine.branch_data_set(branch, name, value),
            _ => self.assign_variable(name, value),
        }
    }

    fn unset_variable(&self, branch: NodeId, _name: &str) {
        // `branch` is accepted for trait-signature symmetry with
        // `set_variable`, but unset always searches from this session's own
        // current scope, matching `forget_variable`'s lookup order.
        self.forget_variable(_name);
        let _ = branch;
    }

    async fn publish(&self, topic: &str, text: &str, level: u8) {
        let senders = self.engine.bus().publish(topic, text, level, Some(self.id));
        for sender in senders {
            let _ = sender.send(crate::pubsub::Publication { topic: topic.to_string(), text: text.to_string(), level });
        }
    }

    fn set_access(&self, level: Access) -> Result<()> {
        Session::set_access(self, level)
    }

    fn acquire_exclusive(&self, level: Access) -> Result<()> {
        self.engine.acquire_exclusive(self.id, level)
    }

    fn set_stealth(&self, stealth: bool) {
        Session::set_stealth(self, stealth)
    }

    fn track_subscription(&self, id: SubscriptionId) {
        Session::track_subscription(self, id)
    }

    fn untrack_subscription(&self, id: SubscriptionId) {
        Session::untrack_subscription(self, id)
    }

    fn request_exit(&self) {
        Session::request_exit(self)
    }

    async fn invoke_nested(self: Arc<Self>, scope: NodeId, command: String, parts: Vec<Part>) -> Result<Outcome> {
        self.invoke(scope, &command, parts).await
    }

    async fn run_macro_body(self: Arc<Self>, scope: NodeId, parsed: ParsedLine) -> Result<Outcome> {
        let child = self.spawn_child(SessionKind::Macro);
        child.set_scope(scope);
        match child.run_command(scope, &parsed.command, parsed.parts).await? {
            Resolution::Done(outputs) => Ok(Outcome::Done(outputs)),
            // The inner command itself went async; its eventual reply is
            // written by the child's own detached worker (it shares this
            // session's writer), so the macro call itself resolves empty.
            Resolution::Deferred => Ok(Outcome::empty()),
        }
    }
}

impl Session {
    /// Raises or lowers this session's working access level, gated by its
    /// connection-time `access_limit` and, for
    /// non-stealth sessions other than the holder, by any live exclusive
    /// grant.
    pub fn set_access(&self, level: Access) -> Result<()> {
        if level > self.access_limit {
            return Err(Error::AccessLimitExceeded { requested: level, limit: self.access_limit });
        }
        if let Some((holder_id, holder_level)) = self.engine.exclusive_holder() {
            if holder_id != self.id && !self.is_stealth() && level >= holder_level {
                return Err(Error::ExclusiveAccessHeld { held_level: holder_level });
            }
        }
        *self.access.lock() = level;
        Ok(())
    }

    pub fn access_limit(&self) -> Access {
        self.access_limit
    }

    pub fn is_stealth(&self) -> bool {
        *self.stealth.lock()
    }

    pub fn set_stealth(&self, stealth: bool) {
        *self.stealth.lock() = stealth;
    }
}

/// Prepends default options accumulated along the resolved path ahead of
/// the client-supplied parts, so a user-supplied option of the same name
/// still wins during binding.
fn merge_defaults(defaults: IndexMap<String, String>, mut parts: Vec<Part>) -> Vec<Part> {
    let mut merged = Vec::with_capacity(defaults.len() + parts.len());
    for (name, value) in defaults {
        if !parts.iter().any(|p| p.option.as_deref().map(|o| o.eq_ignore_ascii_case(&name)).unwrap_or(false)) {
            merged.push(Part::named(name.clone(), value.clone(), value));
        }
    }
    merged.append(&mut parts);
    merged
}

/// Bridges the tokenizer's [`Substituter`] callback surface into a
/// session's variable scopes and nested-dispatch machinery.
struct SessionSubstituter {
    session: Arc<Session>,
}

impl Substituter for SessionSubstituter {
    fn variable(&mut self, expr: &VarExpr) -> std::result::Result<String, scpi_proto::ParseError> {
        let raw = self.session.lookup_variable(&expr.name).unwrap_or_default();
        let value = if let Some(subkey) = &expr.subkey {
            VarValue::List(raw.split(',').map(|s| s.to_string()).collect()).collapse_subkey(subkey)
        } else {
            VarValue::Scalar(raw)
        };
        expr.apply(value)
    }

    fn command(&mut self, text: &str) -> std::result::Result<String, scpi_proto::ParseError> {
        let session = self.session.clone();
        let text = text.to_string();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let scope = session.scope();
                let mut no_sub = scpi_proto::NoSubstitutions;
                let parsed = Tokenizer::parse_line(&text, &mut || None, &mut no_sub)
                    .map_err(|e| e)?;
                let outcome = session
                    .invoke(scope, &parsed.command, parsed.parts)
                    .await
                    .map_err(|e| scpi_proto::ParseError::new(text.clone(), 0, e.to_string()))?;
                match outcome {
                    crate::leaf::Outcome::Done(outputs) => Ok(outputs.join(" ")),
                    crate::leaf::Outcome::Signal(_) => Ok(String::new()),
                }
            })
        })
    }

    fn expression(&mut self, text: &str) -> std::result::Result<String, scpi_proto::ParseError> {
        if self.session.access() < Access::Administrator {
            return Err(scpi_proto::ParseError::new(
                text,
                0,
                "expression evaluation requires administrator access",
            ));
        }
        scpi_proto::evaluate(text).map(|v| v.to_string())
    }

    fn arg_ref(&mut self, which: &ArgRef) -> std::result::Result<String, scpi_proto::ParseError> {
        let outputs = self.session.last_outputs.lock().clone();
        Ok(match which {
            ArgRef::Index(n) => outputs.get(*n).cloned().unwrap_or_default(),
            ArgRef::All => outputs.join(" "),
            ArgRef::Joined(sep) => outputs.join(sep),
        })
    }

    fn hidden(&mut self, text: &str) -> std::result::Result<String, scpi_proto::ParseError> {
        self.command(text)
    }
}

/// Extension used only by [`SessionSubstituter::variable`] to resolve a
/// `[subkey]` index against a comma-split scalar, the convention every
/// session variable is stored under since there is no dedicated list
/// storage type.
trait CollapseSubkey {
    fn collapse_subkey(self, subkey: &str) -> VarValue;
}

impl CollapseSubkey for VarValue {
    fn collapse_subkey(self, subkey: &str) -> VarValue {
        match self {
            VarValue::List(items) => {
                if let Ok(idx) = subkey.parse::<usize>() {
                    VarValue::Scalar(items.get(idx).cloned().unwrap_or_default())
                } else {
                    VarValue::List(items)
                }
            }
            scalar => scalar,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leaf::{Leaf, LeafBehavior, LeafCapabilities};
    use crate::node::{Branch, Node};
    use crate::param::{ParamType, Parameter};

    struct Echo;

    #[async_trait]
    impl LeafBehavior for Echo {
        async fn run(&self, ctx: &Context) -> Result<Outcome> {
            Ok(Outcome::single(ctx.args.str("text").unwrap_or("").to_string()))
        }
    }

    fn test_session() -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let engine = Engine::new();
        let root = engine.root();
        let leaf = Leaf::new(
            vec![Parameter::positional("text", ParamType::String)],
            LeafCapabilities::default(),
            std::sync::Arc::new(Echo),
        );
        engine
            .mount(
                root,
                "ECHo",
                Node {
                    full_name: String::new(),
                    parent: None,
                    defaults: IndexMap::new(),
                    hidden: false,
                    access: Access::Guest,
                    modify_access: Access::Administrator,
                    kind: NodeKind::Leaf(leaf),
                },
                false,
            )
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(engine, SessionKind::Client, Access::Full, tx);
        session.set_access(Access::Controller).unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn dispatches_and_writes_ok() {
        let (session, mut rx) = test_session();
        session
            .handle_line("ECHo hi".to_string(), || None)
            .await
            .unwrap();
        let line = rx.recv().await.unwrap();
        assert_eq!(line, "OK ECHo hi \"hi\"\r\n");
    }

    #[tokio::test]
    async fn unknown_command_writes_error() {
        let (session, mut rx) = test_session();
        session.handle_line("NOPE".to_string(), || None).await.unwrap();
        let line = rx.recv().await.unwrap();
        assert!(line.starts_with("ERRor NOPE [App.Core.UnknownCommand]"));
    }

    #[tokio::test]
    async fn access_limit_blocks_privilege_escalation() {
        let (session, _rx) = test_session();
        let err = session.set_access(Access::Full).is_err();
        // access_limit in test_session is Full, so this should succeed;
        // verify the converse with a tighter limit instead.
        assert!(!err);
        let (tx, _rx2) = mpsc::unbounded_channel();
        let limited = Session::new(Engine::new(), SessionKind::Client, Access::Observer, tx);
        assert!(limited.set_access(Access::Administrator).is_err());
    }
}
