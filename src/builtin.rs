//! The `common` built-in command set: mounted directly under the tree
//! root so top-level commands like `VERSion?` resolve with no branch
//! prefix. Supplies the help, access-control, macro-management,
//! variable-scope, pub/sub, and session-control surface a complete
//! server ships alongside its own command tree.

use crate::access::Access;
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::leaf::{Leaf, LeafBehavior, LeafCapabilities, Outcome};
use crate::macros::{body_of, build_macro_leaf, macro_node, MacroMode};
use crate::node::{Node, NodeKind};
use crate::param::{ParamType, Parameter, Value};
use crate::reply;
use async_trait::async_trait;
use indexmap::IndexMap;
use scpi_proto::{MethodRef, Part, Signal};
use std::sync::Arc;

const VERSION: &str = "1.0.0";
const BUILD: &str = "42";

/// Mounts every `common` leaf as a direct child of `engine.root()`.
pub fn install(engine: &Arc<Engine>) -> Result<()> {
    mount(engine, "HELP", vec![Parameter::positional("path", ParamType::String).with_default("")], Access::Guest, Arc::new(Help))?;

    mount(engine, "VERSion?", vec![], Access::Guest, Arc::new(Version))?;

    mount(
        engine,
        "ACCess",
        vec![
            Parameter::positional("level", ParamType::String),
            Parameter::named("exclusive", ParamType::Boolean).with_default("false"),
            Parameter::named("stealth", ParamType::Boolean).with_default("false"),
        ],
        Access::Guest,
        Arc::new(AccessCmd),
    )?;

    mount(
        engine,
        "MACRo+",
        vec![
            Parameter::positional("name", ParamType::String),
            Parameter::named("inline", ParamType::Boolean).with_default("false"),
            Parameter::named("param", ParamType::String).with_repeats(0, None),
            Parameter::positional("body", ParamType::String),
        ],
        Access::Administrator,
        Arc::new(MacroDefine),
    )?;

    mount(
        engine,
        "MACRo-",
        vec![Parameter::positional("name", ParamType::String)],
        Access::Administrator,
        Arc::new(MacroRemove),
    )?;

    mount(
        engine,
        "MACRo?",
        vec![Parameter::positional("name", ParamType::String)],
        Access::Observer,
        Arc::new(MacroQuery),
    )?;

    mount(
        engine,
        "SET",
        vec![
            Parameter::positional("name", ParamType::String),
            Parameter::positional("value", ParamType::String),
            Parameter::named("scope", ParamType::Enum(vec!["session".into(), "branch".into(), "global".into()]))
                .with_default("session"),
        ],
        Access::Observer,
        Arc::new(SetVar),
    )?;

    mount(engine, "GET", vec![Parameter::positional("name", ParamType::String)], Access::Observer, Arc::new(GetVar))?;

    mount(engine, "UNSET", vec![Parameter::positional("name", ParamType::String)], Access::Observer, Arc::new(UnsetVar))?;

    mount(
        engine,
        "SUBScribe",
        vec![
            Parameter::positional("pattern", ParamType::String),
            Parameter::named("level", ParamType::Integer).with_default("0"),
            Parameter::named("excludeSelf", ParamType::Boolean).with_default("false"),
        ],
        Access::Observer,
        Arc::new(Subscribe),
    )?;

    mount(
        engine,
        "UNSUBscribe",
        vec![Parameter::positional("id", ParamType::Integer)],
        Access::Observer,
        Arc::new(Unsubscribe),
    )?;

    mount(
        engine,
        "PUBLish",
        vec![
            Parameter::positional("topic", ParamType::String),
            Parameter::named("level", ParamType::Integer).with_default("0"),
            Parameter::positional("text", ParamType::String).with_repeats(0, None),
        ],
        Access::Controller,
        Arc::new(Publish),
    )?;

    mount(
        engine,
        "RETurn",
        vec![Parameter::positional("value", ParamType::String).with_repeats(0, None)],
        Access::Guest,
        Arc::new(Return),
    )?;

    mount(engine, "EXIT", vec![], Access::Guest, Arc::new(ExitSession))?;
    mount(engine, "LOGOff", vec![], Access::Guest, Arc::new(ExitSession))?;

    mount_with_capabilities(
        engine,
        "RUN",
        vec![
            Parameter::positional("job", ParamType::String).with_default(""),
            Parameter::named("synchronous", ParamType::Boolean).with_default("false").hidden(),
        ],
        Access::Controller,
        LeafCapabilities { asynchronous: true, ..Default::default() },
        Arc::new(Run),
    )?;

    Ok(())
}

fn mount(
    engine: &Arc<Engine>,
    name: &str,
    params: Vec<Parameter>,
    access: Access,
    behavior: Arc<dyn LeafBehavior>,
) -> Result<()> {
    mount_with_capabilities(engine, name, params, access, LeafCapabilities::default(), behavior)
}

fn mount_with_capabilities(
    engine: &Arc<Engine>,
    name: &str,
    params: Vec<Parameter>,
    access: Access,
    capabilities: LeafCapabilities,
    behavior: Arc<dyn LeafBehavior>,
) -> Result<()> {
    let params = crate::param::normalize_params(params)?;
    let node = Node {
        full_name: String::new(),
        parent: None,
        defaults: IndexMap::new(),
        hidden: false,
        access,
        modify_access: Access::Administrator,
        kind: NodeKind::Leaf(Leaf::new(params, capabilities, behavior)),
    };
    let root = engine.root();
    engine.mount(root, name, node, false)?;
    Ok(())
}

/// Resolves the branch a `branch`-scoped `SET`/`UNSET` targets: the parent
/// of the leaf's own mount point. There is no dedicated "current directory"
/// command in this surface, so branch scope resolves relative to where the
/// variable leaf itself lives.
fn branch_scope(ctx: &Context) -> crate::node::NodeId {
    ctx.engine.arena().get(ctx.node).parent.unwrap_or_else(|| ctx.engine.root())
}

struct Help;

#[async_trait]
impl LeafBehavior for Help {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let path = ctx.args.str("path").unwrap_or("");
        let branch = if path.is_empty() {
            ctx.engine.root()
        } else {
            let (id, _) = ctx.engine.locate(ctx.engine.root(), path)?;
            id
        };
        if !ctx.engine.arena().get(branch).is_branch() {
            return Err(Error::NotABranch { name: path.to_string() });
        }
        let names: Vec<String> = ctx
            .engine
            .arena()
            .children(branch, false)
            .into_iter()
            .map(|id| ctx.engine.arena().get(id).full_name.clone())
            .collect();
        Ok(Outcome::Done(names))
    }
}

struct Version;

#[async_trait]
impl LeafBehavior for Version {
    async fn run(&self, _ctx: &Context) -> Result<Outcome> {
        Ok(Outcome::Done(vec![format!("-Version={}", VERSION), format!("-Build={}", BUILD)]))
    }
}

struct AccessCmd;

#[async_trait]
impl LeafBehavior for AccessCmd {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let name = ctx.args.str("level").unwrap_or("");
        let level = Access::parse(name).ok_or_else(|| Error::ConversionFailed {
            parameter: "level".to_string(),
            value: name.to_string(),
            expected: "access level".to_string(),
        })?;
        let stealth = ctx.args.bool("stealth").unwrap_or(false);
        let exclusive = ctx.args.bool("exclusive").unwrap_or(false);
        ctx.host.set_stealth(stealth);
        ctx.host.set_access(level)?;
        if exclusive {
            ctx.host.acquire_exclusive(level)?;
        }
        Ok(Outcome::empty())
    }
}

struct MacroDefine;

#[async_trait]
impl LeafBehavior for MacroDefine {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let name = ctx.args.str("name").unwrap_or("").to_string();
        let body = ctx.args.str("body").unwrap_or("").to_string();
        let params: Vec<String> =
            ctx.args.get_all("param").iter().filter_map(Value::as_str).map(|s| s.to_string()).collect();
        let mode = if ctx.args.bool("inline").unwrap_or(false) { MacroMode::Inline } else { MacroMode::Nested };
        let leaf = build_macro_leaf(params, body, mode)?;
        ctx.engine.mount(ctx.engine.root(), &name, macro_node(leaf), true)?;
        Ok(Outcome::empty())
    }
}

struct MacroRemove;

#[async_trait]
impl LeafBehavior for MacroRemove {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let name = ctx.args.str("name").unwrap_or("");
        ctx.engine.arena_mut().remove_child(ctx.engine.root(), name, ctx.access())?;
        Ok(Outcome::empty())
    }
}

struct MacroQuery;

#[async_trait]
impl LeafBehavior for MacroQuery {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let name = ctx.args.str("name").unwrap_or("");
        let (id, _) = ctx.engine.locate(ctx.engine.root(), name)?;
        let arena = ctx.engine.arena();
        let node = arena.get(id);
        let body = body_of(node).ok_or_else(|| Error::Run {
            leaf: "MACRo?".to_string(),
            message: format!("`{}` is not a macro", name),
            attributes: IndexMap::new(),
        })?;
        Ok(Outcome::single(body.to_string()))
    }
}

struct SetVar;

#[async_trait]
impl LeafBehavior for SetVar {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let name = ctx.args.str("name").unwrap_or("").to_string();
        let value = ctx.args.str("value").unwrap_or("").to_string();
        let scope = ctx.args.str("scope").unwrap_or("session").to_string();
        ctx.host.set_variable(&scope, branch_scope(ctx), &name, value);
        Ok(Outcome::empty())
    }
}

struct GetVar;

#[async_trait]
impl LeafBehavior for GetVar {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let name = ctx.args.str("name").unwrap_or("");
        Ok(Outcome::single(ctx.host.get_variable(name).unwrap_or_default()))
    }
}

struct UnsetVar;

#[async_trait]
impl LeafBehavior for UnsetVar {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let name = ctx.args.str("name").unwrap_or("");
        ctx.host.unset_variable(branch_scope(ctx), name);
        Ok(Outcome::empty())
    }
}

struct Subscribe;

#[async_trait]
impl LeafBehavior for Subscribe {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let pattern = ctx.args.str("pattern").unwrap_or("").to_string();
        let level = ctx.args.get("level").and_then(Value::as_int).unwrap_or(0).clamp(0, u8::MAX as i64) as u8;
        let exclude_self = ctx.args.bool("excludeSelf").unwrap_or(false);
        let (id, mut rx) = ctx
            .engine
            .bus()
            .subscribe(ctx.host.session_id(), &pattern, level, !exclude_self)
            .map_err(|e| Error::internal(e.to_string()))?;
        ctx.host.track_subscription(id);

        let host = ctx.host.clone();
        tokio::spawn(async move {
            while let Some(publication) = rx.recv().await {
                let timestamp = chrono::Utc::now().to_rfc3339();
                let line = reply::message_line(
                    &publication.topic,
                    &timestamp,
                    &publication.level.to_string(),
                    &[publication.text],
                );
                host.emit_message(&line).await;
            }
        });

        Ok(Outcome::single(id.as_u64().to_string()))
    }
}

struct Unsubscribe;

#[async_trait]
impl LeafBehavior for Unsubscribe {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let id = ctx.args.get("id").and_then(Value::as_int).unwrap_or(0);
        let sub_id = crate::pubsub::SubscriptionId::from_u64(id as u64);
        ctx.engine.bus().unsubscribe(sub_id);
        ctx.host.untrack_subscription(sub_id);
        Ok(Outcome::empty())
    }
}

struct Publish;

#[async_trait]
impl LeafBehavior for Publish {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        let topic = ctx.args.str("topic").unwrap_or("").to_string();
        let level = ctx.args.get("level").and_then(Value::as_int).unwrap_or(0).clamp(0, u8::MAX as i64) as u8;
        let text: Vec<String> =
            ctx.args.get_all("text").iter().filter_map(Value::as_str).map(|s| s.to_string()).collect();
        ctx.publish(&topic, &text.join(" "), level).await;
        Ok(Outcome::empty())
    }
}

struct Return;

#[async_trait]
impl LeafBehavior for Return {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        Ok(Outcome::Signal(Signal::ReturnValue { parts: ctx.raw_parts.clone() }))
    }
}

/// The asynchronous `RUN` job: scenario 3's canonical long-running command.
/// First invocation (the default, client-supplied `-synchronous` absent or
/// false) raises `NextReply` so the session answers `NEXT` immediately and
/// continues accepting lines; the detached worker that spawns re-invokes
/// this same leaf with `-synchronous=true` forced in, which runs the job
/// for real and returns its output as the eventual `OK`.
struct Run;

#[async_trait]
impl LeafBehavior for Run {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        if !ctx.args.bool("synchronous").unwrap_or(false) {
            let mut args: Vec<Part> = ctx.raw_parts.iter().filter(|p| p.option.as_deref() != Some("synchronous")).cloned().collect();
            args.push(Part::named("synchronous", "true", "true"));
            return Ok(Outcome::Signal(Signal::NextReply {
                target: MethodRef { leaf: ctx.leaf_name.clone(), method: "run".to_string() },
                args,
            }));
        }
        let job = ctx.args.str("job").unwrap_or("").to_string();
        Ok(Outcome::single(job))
    }
}

struct ExitSession;

#[async_trait]
impl LeafBehavior for ExitSession {
    async fn run(&self, ctx: &Context) -> Result<Outcome> {
        ctx.host.request_exit();
        Ok(Outcome::empty())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::{Session, SessionKind};
    use tokio::sync::mpsc;

    fn test_engine() -> Arc<Engine> {
        let engine = Engine::new();
        install(&engine).unwrap();
        engine
    }

    fn test_session(engine: Arc<Engine>) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(engine, SessionKind::Client, Access::Full, tx);
        session.set_access(Access::Administrator).unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn version_matches_scenario_one() {
        let engine = test_engine();
        let (session, mut rx) = test_session(engine);
        session.handle_line("1 VERSion?".to_string(), || None).await.unwrap();
        let line = rx.recv().await.unwrap();
        assert_eq!(line, format!("OK 1 -Version={} -Build={}\r\n", VERSION, BUILD));
    }

    #[tokio::test]
    async fn help_lists_root_children() {
        let engine = test_engine();
        let (session, mut rx) = test_session(engine);
        session.handle_line("HELP".to_string(), || None).await.unwrap();
        let line = rx.recv().await.unwrap();
        assert!(line.contains("VERSion?"));
        assert!(line.contains("HELP"));
    }

    #[tokio::test]
    async fn access_denies_escalation_past_stated_level() {
        let engine = test_engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::new(engine, SessionKind::Client, Access::Observer, tx);
        session.handle_line("ACCess Full".to_string(), || None).await.unwrap();
        let line = rx.recv().await.unwrap();
        assert!(line.starts_with("ERRor"));
        assert!(line.contains("AccessLimitExceeded"));
    }

    #[tokio::test]
    async fn macro_define_and_call_publishes_once() {
        let engine = test_engine();
        let (session, mut rx) = test_session(engine);
        session
            .handle_line(r#"MACRo+ Greet -param=name "PUBLish greetings.hello $name""#.to_string(), || None)
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().starts_with("OK"));

        session.handle_line("Greet Alice".to_string(), || None).await.unwrap();
        let line = rx.recv().await.unwrap();
        assert!(line.starts_with("OK"));
        // Exactly one OK line for the call: the macro body's inner PUBLish
        // must not also write its own reply to the shared writer.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_replies_next_then_ok_from_worker() {
        let engine = test_engine();
        let (session, mut rx) = test_session(engine);
        session.handle_line("7 RUN job-a".to_string(), || None).await.unwrap();
        let next = rx.recv().await.unwrap();
        assert_eq!(next, "NEXT 7\r\n");

        // The client stays free to issue more commands while the worker runs.
        session.handle_line("8 VERSion?".to_string(), || None).await.unwrap();
        let version = rx.recv().await.unwrap();
        assert!(version.starts_with("OK 8"));

        let run_ok = rx.recv().await.unwrap();
        assert_eq!(run_ok, "OK RUN job-a\r\n");
    }

    #[tokio::test]
    async fn set_get_unset_round_trip() {
        let engine = test_engine();
        let (session, mut rx) = test_session(engine);
        session.handle_line("SET x hello".to_string(), || None).await.unwrap();
        assert!(rx.recv().await.unwrap().starts_with("OK"));

        session.handle_line("GET x".to_string(), || None).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "OK GET x hello\r\n");

        session.handle_line("UNSET x".to_string(), || None).await.unwrap();
        assert!(rx.recv().await.unwrap().starts_with("OK"));

        session.handle_line("GET x".to_string(), || None).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "OK GET x \"\"\r\n");
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers_message() {
        let engine = test_engine();
        let (session, mut rx) = test_session(engine);
        session.handle_line("SUBScribe greetings.*".to_string(), || None).await.unwrap();
        assert!(rx.recv().await.unwrap().starts_with("OK"));

        session.handle_line("PUBLish greetings.hello World".to_string(), || None).await.unwrap();

        // The `OK` for `PUBLish` and the forwarded `MESSage` arrive on
        // independent tasks; only their combined presence is guaranteed.
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let both = format!("{first}{second}");
        assert!(both.contains("OK"));
        assert!(both.contains("MESSage"));
        assert!(both.contains("World"));
    }

    #[tokio::test]
    async fn exit_marks_session_for_closure() {
        let engine = test_engine();
        let (session, mut rx) = test_session(engine);
        session.handle_line("EXIT".to_string(), || None).await.unwrap();
        assert!(rx.recv().await.unwrap().starts_with("OK"));
        assert!(session.requested_exit());
    }
}
