//! Leaf dispatch: a uniform [`Leaf`] struct carrying capability
//! flags in place of dynamic mixin subclassing, plus the [`LeafBehavior`]
//! trait its owner implements to do actual work.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::param::Parameter;
use scpi_proto::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which of the three orthogonal behaviors this leaf
/// carries. Any combination is valid; `dispatch` below interprets them in a
/// fixed order (Singleton guard, then Asynchronous/Background scheduling).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeafCapabilities {
    /// `run` may raise `Signal::NextReply` to detach execution onto a
    /// worker after replying `NEXT` immediately.
    pub asynchronous: bool,
    /// `run` executes synchronously first; its returned parts are rebound
    /// and fed into a second, asynchronous invocation, combined here with
    /// `asynchronous` rather than a separate `next()` method.
    pub background: bool,
    /// At most one invocation of this leaf may be in flight at a time
    /// across the whole engine.
    pub singleton: bool,
}

/// What a leaf invocation produced: either its final output strings
/// (already formatted for the wire) or a control-flow [`Signal`] the
/// caller (session or macro interpreter) must act on.
pub enum Outcome {
    Done(Vec<String>),
    Signal(Signal),
}

impl Outcome {
    pub fn empty() -> Self {
        Outcome::Done(Vec::new())
    }

    pub fn single(value: impl Into<String>) -> Self {
        Outcome::Done(vec![value.into()])
    }
}

/// The behavior a concrete leaf implements: the actual work done by `run`,
/// plus optional `prerun`/`postrun` hooks around it. Async because a macro
/// body's `run` recursively re-enters the session's own async dispatch
/// pipeline.
#[async_trait::async_trait]
pub trait LeafBehavior: Send + Sync {
    /// Runs before access/parameter validation has any side effect visible
    /// to the leaf; used by built-ins that need to veto a call cheaply.
    /// Default: no-op.
    async fn prerun(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// The leaf's actual work.
    async fn run(&self, ctx: &Context) -> Result<Outcome>;

    /// Runs after `run` returns `Outcome::Done`, for cleanup that must see
    /// the final result (e.g. singleton release happens in `dispatch`
    /// itself, not here). Default: no-op.
    async fn postrun(&self, _ctx: &Context, _outcome: &Outcome) -> Result<()> {
        Ok(())
    }

    /// The stored body text, for a leaf that is itself a user-defined
    /// macro. `None` for every other behavior.
    fn macro_body(&self) -> Option<&str> {
        None
    }
}

/// A behavior that always returns an empty result; used for placeholder
/// nodes in tests and for leaves still under construction.
pub struct NoopBehavior;

#[async_trait::async_trait]
impl LeafBehavior for NoopBehavior {
    async fn run(&self, _ctx: &Context) -> Result<Outcome> {
        Ok(Outcome::Done(Vec::new()))
    }
}

/// One leaf node's payload: its declared parameters, capability flags, and
/// the behavior object that actually runs.
pub struct Leaf {
    pub params: Vec<Parameter>,
    pub capabilities: LeafCapabilities,
    pub behavior: Arc<dyn LeafBehavior>,
    /// Set while a `Singleton` leaf has an invocation in flight.
    running: Arc<AtomicBool>,
}

impl Leaf {
    pub fn new(params: Vec<Parameter>, capabilities: LeafCapabilities, behavior: Arc<dyn LeafBehavior>) -> Self {
        Leaf { params, capabilities, behavior, running: Arc::new(AtomicBool::new(false)) }
    }

    /// A minimal leaf for tests and tree-construction stubs: no
    /// parameters, the given capability flags, `NoopBehavior`.
    pub fn stub(capabilities: LeafCapabilities) -> Self {
        Leaf::new(Vec::new(), capabilities, Arc::new(NoopBehavior))
    }

    /// A cheap, `Send + 'static` handle onto this leaf's dispatchable
    /// parts. Callers that need to invoke a leaf found behind an
    /// `Engine`'s tree-wide lock extract a handle and drop the lock before
    /// calling [`dispatch`], since holding a `parking_lot` guard across an
    /// `.await` would block the executor thread for the guard's whole
    /// scope.
    pub fn handle(&self) -> LeafHandle {
        LeafHandle {
            capabilities: self.capabilities,
            behavior: self.behavior.clone(),
            running: self.running.clone(),
        }
    }
}

/// See [`Leaf::handle`].
#[derive(Clone)]
pub struct LeafHandle {
    capabilities: LeafCapabilities,
    behavior: Arc<dyn LeafBehavior>,
    running: Arc<AtomicBool>,
}

/// Runs a leaf's prerun/run/postrun triad, enforcing the `Singleton`
/// capability. The `Asynchronous`/`Background` capabilities
/// affect only how the *caller* (the session's dispatcher) interprets a
/// returned `Signal::NextReply`; `dispatch` itself always runs `run` to
/// completion or to its first raised signal.
pub async fn dispatch(leaf: &LeafHandle, ctx: &Context) -> Result<Outcome> {
    if leaf.capabilities.singleton {
        if leaf.running.swap(true, Ordering::SeqCst) {
            return Err(Error::SingletonRunning { leaf: ctx.leaf_name.clone() });
        }
    }
    let result = run_triad(leaf, ctx).await;
    if leaf.capabilities.singleton {
        leaf.running.store(false, Ordering::SeqCst);
    }
    result
}

async fn run_triad(leaf: &LeafHandle, ctx: &Context) -> Result<Outcome> {
    leaf.behavior.prerun(ctx).await?;
    match leaf.behavior.run(ctx).await {
        Ok(outcome) => {
            leaf.behavior.postrun(ctx, &outcome).await?;
            Ok(outcome)
        }
        Err(err) => {
            let placeholder = Outcome::empty();
            leaf.behavior.postrun(ctx, &placeholder).await?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::access::Access;
    use crate::context::SessionHost;
    use crate::engine::Engine;
    use crate::node::NodeId;
    use crate::param::BoundArgs;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeHost;

    #[async_trait]
    impl SessionHost for FakeHost {
        fn session_id(&self) -> u64 {
            1
        }
        fn access(&self) -> Access {
            Access::Controller
        }
        async fn emit_message(&self, _text: &str) {}
        fn get_variable(&self, _name: &str) -> Option<String> {
            None
        }
        fn set_variable(&self, _scope: &str, _branch: NodeId, _name: &str, _value: String) {}
        fn unset_variable(&self, _branch: NodeId, _name: &str) {}
        async fn publish(&self, _topic: &str, _text: &str, _level: u8) {}
        fn set_access(&self, _level: Access) -> Result<()> {
            Ok(())
        }
        fn acquire_exclusive(&self, _level: Access) -> Result<()> {
            Ok(())
        }
        fn set_stealth(&self, _stealth: bool) {}
        fn track_subscription(&self, _id: crate::pubsub::SubscriptionId) {}
        fn untrack_subscription(&self, _id: crate::pubsub::SubscriptionId) {}
        fn request_exit(&self) {}
        async fn invoke_nested(
            self: Arc<Self>,
            _scope: NodeId,
            _command: String,
            _parts: Vec<scpi_proto::Part>,
        ) -> Result<Outcome> {
            Ok(Outcome::empty())
        }
        async fn run_macro_body(self: Arc<Self>, _scope: NodeId, _parsed: scpi_proto::ParsedLine) -> Result<Outcome> {
            Ok(Outcome::empty())
        }
    }

    fn ctx(engine: Arc<Engine>) -> Context {
        let node = engine.arena().root();
        Context {
            engine,
            host: Arc::new(FakeHost),
            node,
            leaf_name: "TEST".to_string(),
            args: BoundArgs::default(),
            raw_parts: Vec::new(),
        }
    }

    struct CountingBehavior(Arc<AtomicU32>);

    #[async_trait]
    impl LeafBehavior for CountingBehavior {
        async fn run(&self, _ctx: &Context) -> Result<Outcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Done(Vec::new()))
        }
    }

    #[tokio::test]
    async fn singleton_rejects_reentrant_dispatch() {
        let engine = Engine::new_for_test();
        let counter = Arc::new(AtomicU32::new(0));
        let leaf = Leaf::new(
            Vec::new(),
            LeafCapabilities { singleton: true, ..Default::default() },
            Arc::new(CountingBehavior(counter.clone())),
        );
        leaf.running.store(true, Ordering::SeqCst);
        let err = dispatch(&leaf.handle(), &ctx(engine)).await.unwrap_err();
        assert!(matches!(err, Error::SingletonRunning { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_singleton_runs_freely() {
        let engine = Engine::new_for_test();
        let counter = Arc::new(AtomicU32::new(0));
        let leaf = Leaf::new(Vec::new(), LeafCapabilities::default(), Arc::new(CountingBehavior(counter.clone())));
        dispatch(&leaf.handle(), &ctx(engine.clone())).await.unwrap();
        dispatch(&leaf.handle(), &ctx(engine)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    struct FailingRun(Arc<AtomicBool>);

    #[async_trait]
    impl LeafBehavior for FailingRun {
        async fn run(&self, _ctx: &Context) -> Result<Outcome> {
            Err(Error::internal("boom"))
        }

        async fn postrun(&self, _ctx: &Context, _outcome: &Outcome) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn postrun_runs_even_when_run_errors() {
        let engine = Engine::new_for_test();
        let postrun_ran = Arc::new(AtomicBool::new(false));
        let leaf = Leaf::new(Vec::new(), LeafCapabilities::default(), Arc::new(FailingRun(postrun_ran.clone())));
        let err = dispatch(&leaf.handle(), &ctx(engine)).await.unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert!(postrun_ran.load(Ordering::SeqCst));
    }

    struct AbortingPrerun(Arc<AtomicBool>);

    #[async_trait]
    impl LeafBehavior for AbortingPrerun {
        async fn prerun(&self, _ctx: &Context) -> Result<()> {
            Err(Error::internal("vetoed"))
        }

        async fn run(&self, _ctx: &Context) -> Result<Outcome> {
            Ok(Outcome::empty())
        }

        async fn postrun(&self, _ctx: &Context, _outcome: &Outcome) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn postrun_skipped_when_prerun_aborts() {
        let engine = Engine::new_for_test();
        let postrun_ran = Arc::new(AtomicBool::new(false));
        let leaf = Leaf::new(Vec::new(), LeafCapabilities::default(), Arc::new(AbortingPrerun(postrun_ran.clone())));
        assert!(dispatch(&leaf.handle(), &ctx(engine)).await.is_err());
        assert!(!postrun_ran.load(Ordering::SeqCst));
    }
}
