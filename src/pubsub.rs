//! The publish/subscribe bus: named topics, glob/regex
//! subscription patterns, subscriptions registered before their topic
//! exists ("future" subscriptions), trigger-tag deferred publication, and
//! per-topic/per-subscriber minimum level filtering.

use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One delivered publication.
#[derive(Clone, Debug)]
pub struct Publication {
    pub topic: String,
    pub text: String,
    pub level: u8,
}

/// A live subscription: a compiled pattern plus the channel a matching
/// publication is delivered on.
struct Subscription {
    id: u64,
    session_id: u64,
    pattern: String,
    regex: Regex,
    /// This subscriber never sees a publication below this level.
    min_level: u8,
    /// Whether this subscriber still receives publications it made itself.
    include_session: bool,
    sender: mpsc::UnboundedSender<Publication>,
}

struct Topic {
    /// A publication below this level is dropped before dispatch, for
    /// every subscriber, regardless of their own `min_level`.
    min_level: u8,
    subscribers: Vec<Subscription>,
    /// Publications made under a trigger tag, held until that tag fires,
    /// each carrying its own level and publishing session for correct
    /// filtering at release.
    pending: IndexMap<String, Vec<(String, u8, Option<u64>)>>,
}

impl Topic {
    fn new(min_level: u8) -> Self {
        Topic { min_level, subscribers: Vec::new(), pending: IndexMap::new() }
    }

    fn deliverable(&self, level: u8, publisher: Option<u64>) -> Vec<mpsc::UnboundedSender<Publication>> {
        if level < self.min_level {
            return Vec::new();
        }
        self.subscribers
            .iter()
            .filter(|s| level >= s.min_level)
            .filter(|s| s.include_session || publisher != Some(s.session_id))
            .map(|s| s.sender.clone())
            .collect()
    }
}

/// A registered-but-not-yet-matched subscription, re-checked every time a
/// new topic is created.
#[derive(Clone)]
struct FutureSub {
    regex: Regex,
    pattern: String,
    id: u64,
    session_id: u64,
    min_level: u8,
    include_session: bool,
    sender: mpsc::UnboundedSender<Publication>,
}

/// Translates a shell-style glob (`*`, `?`, literal everything else) into an
/// anchored regex. Hand-rolled on top of the `regex` crate already in the
/// dependency tree rather than pulling in a dedicated glob crate.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// The bus. Cheaply cloneable (wraps an `Arc`); one instance lives on
/// [`crate::engine::Engine`].
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Mutex<BusState>>,
    next_id: Arc<AtomicU64>,
}

struct BusState {
    topics: IndexMap<String, Topic>,
    future: Vec<FutureSub>,
}

/// A handle a session keeps to later unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Renders as the token `SUBScribe` returns to the client and
    /// `UNSUBscribe` parses back.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        SubscriptionId(value)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            inner: Arc::new(Mutex::new(BusState { topics: IndexMap::new(), future: Vec::new() })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn ensure_topic<'a>(state: &'a mut BusState, name: &str) -> &'a mut Topic {
        if !state.topics.contains_key(name) {
            let mut topic = Topic::new(0);
            let matching: Vec<_> = state.future.iter().filter(|f| f.regex.is_match(name)).cloned().collect();
            for f in matching {
                topic.subscribers.push(Subscription {
                    id: f.id,
                    session_id: f.session_id,
                    pattern: f.pattern,
                    regex: f.regex,
                    min_level: f.min_level,
                    include_session: f.include_session,
                    sender: f.sender,
                });
            }
            state.topics.insert(name.to_string(), topic);
        }
        state.topics.get_mut(name).expect("just inserted")
    }

    /// Explicitly creates `name` at `min_level`. If
    /// the topic already exists, its minimum level is updated in place.
    pub fn add_topic(&self, name: &str, min_level: u8) {
        let mut state = self.inner.lock();
        let topic = Self::ensure_topic(&mut state, name);
        topic.min_level = min_level;
    }

    /// Subscribes `session_id` to every topic matching `pattern`
    /// (`SUBScribe`). Registers both against existing topics and as a
    /// future subscription for topics not yet created. `min_level` filters
    /// out any publication below it; `include_session` controls whether
    /// this subscriber also receives its own session's publications.
    pub fn subscribe(
        &self,
        session_id: u64,
        pattern: &str,
        min_level: u8,
        include_session: bool,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Publication>), regex::Error> {
        let regex = glob_to_regex(pattern)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock();
        for (name, topic) in state.topics.iter_mut() {
            if regex.is_match(name) {
                topic.subscribers.push(Subscription {
                    id,
                    session_id,
                    pattern: pattern.to_string(),
                    regex: regex.clone(),
                    min_level,
                    include_session,
                    sender: tx.clone(),
                });
            }
        }
        state.future.push(FutureSub {
            regex,
            pattern: pattern.to_string(),
            id,
            session_id,
            min_level,
            include_session,
            sender: tx,
        });
        Ok((SubscriptionId(id), rx))
    }

    /// Removes every subscription matching `id` across all topics and the
    /// future list.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.inner.lock();
        for topic in state.topics.values_mut() {
            topic.subscribers.retain(|s| s.id != id.0);
        }
        state.future.retain(|f| f.id != id.0);
    }

    /// Drops every subscription owned by `session_id` (used by session
    /// teardown).
    pub fn unsubscribe_session(&self, session_id: u64) {
        let mut state = self.inner.lock();
        for topic in state.topics.values_mut() {
            topic.subscribers.retain(|s| s.session_id != session_id);
        }
        state.future.retain(|f| f.session_id != session_id);
    }

    /// Publishes `text` under `topic` at `level`, immediately, to every
    /// current subscriber whose own `min_level` (and whose topic's
    /// `min_level`) the message clears. `publisher`
    /// is the originating session id, used to honor a subscription's
    /// `include_session = false`. Ensures the topic exists first so a
    /// publish to a brand-new topic name still resolves any matching
    /// future subscriptions.
    pub fn publish(&self, topic: &str, text: &str, level: u8, publisher: Option<u64>) -> Vec<mpsc::UnboundedSender<Publication>> {
        let mut state = self.inner.lock();
        let t = Self::ensure_topic(&mut state, topic);
        // Copy-on-iterate: clone the sender list before releasing the lock
        // so a subscriber that unsubscribes from inside its own delivery
        // handler doesn't race this iteration.
        t.deliverable(level, publisher)
    }

    /// Holds `text` under `topic`/`trigger_tag` without delivering it, for
    /// later release by [`Bus::fire_trigger`] (deferred publication).
    pub fn publish_deferred(&self, topic: &str, trigger_tag: &str, text: &str, level: u8, publisher: Option<u64>) {
        let mut state = self.inner.lock();
        let t = Self::ensure_topic(&mut state, topic);
        t.pending.entry(trigger_tag.to_string()).or_default().push((text.to_string(), level, publisher));
    }

    /// Releases every publication held under `trigger_tag` across all
    /// topics, delivering each to that topic's *current* subscribers
    /// (re-evaluating level/include-session filtering at release time,
    /// since subscribers may have come and gone since the hold).
    pub fn fire_trigger(&self, trigger_tag: &str) -> Vec<(String, String, u8, Vec<mpsc::UnboundedSender<Publication>>)> {
        let mut state = self.inner.lock();
        let mut released = Vec::new();
        for (name, topic) in state.topics.iter_mut() {
            if let Some(entries) = topic.pending.shift_remove(trigger_tag) {
                for (text, level, publisher) in entries {
                    let senders = topic.deliverable(level, publisher);
                    released.push((name.clone(), text, level, senders));
                }
            }
        }
        released
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.inner.lock().topics.keys().cloned().collect()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_publish() {
        let bus = Bus::new();
        let (_id, mut rx) = bus.subscribe(1, "laser.*", 0, true).unwrap();
        for sender in bus.publish("laser.power", "50", 0, None) {
            let _ = sender.send(Publication { topic: "laser.power".into(), text: "50".into(), level: 0 });
        }
        let pub_ = rx.recv().await.unwrap();
        assert_eq!(pub_.text, "50");
    }

    #[tokio::test]
    async fn non_matching_topic_is_silent() {
        let bus = Bus::new();
        let (_id, mut rx) = bus.subscribe(1, "laser.*", 0, true).unwrap();
        for sender in bus.publish("detector.count", "3", 0, None) {
            let _ = sender.send(Publication { topic: "detector.count".into(), text: "3".into(), level: 0 });
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn future_subscription_matches_topic_created_later() {
        let bus = Bus::new();
        let (_id, mut rx) = bus.subscribe(1, "sensor.*", 0, true).unwrap();
        // "sensor.temp" doesn't exist yet when subscribe() ran.
        for sender in bus.publish("sensor.temp", "22.5", 0, None) {
            let _ = sender.send(Publication { topic: "sensor.temp".into(), text: "22.5".into(), level: 0 });
        }
        assert_eq!(rx.recv().await.unwrap().text, "22.5");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let (id, mut rx) = bus.subscribe(1, "topic", 0, true).unwrap();
        bus.unsubscribe(id);
        for sender in bus.publish("topic", "x", 0, None) {
            let _ = sender.send(Publication { topic: "topic".into(), text: "x".into(), level: 0 });
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn trigger_tag_defers_delivery() {
        let bus = Bus::new();
        let (_id, mut rx) = bus.subscribe(1, "topic", 0, true).unwrap();
        bus.publish_deferred("topic", "arm", "held-value", 0, None);
        assert!(rx.try_recv().is_err());
        for (_topic, text, level, senders) in bus.fire_trigger("arm") {
            for sender in &senders {
                let _ = sender.send(Publication { topic: "topic".into(), text: text.clone(), level });
            }
        }
        assert_eq!(rx.recv().await.unwrap().text, "held-value");
    }

    #[tokio::test]
    async fn topic_minimum_level_drops_low_publications() {
        let bus = Bus::new();
        bus.add_topic("alerts", 3);
        let (_id, mut rx) = bus.subscribe(1, "alerts", 0, true).unwrap();
        assert!(bus.publish("alerts", "low", 1, None).is_empty());
        for sender in bus.publish("alerts", "high", 5, None) {
            let _ = sender.send(Publication { topic: "alerts".into(), text: "high".into(), level: 5 });
        }
        assert_eq!(rx.recv().await.unwrap().text, "high");
    }

    #[tokio::test]
    async fn subscriber_minimum_level_filters_independently_of_topic() {
        let bus = Bus::new();
        let (_id, mut rx) = bus.subscribe(1, "topic", 4, true).unwrap();
        assert!(bus.publish("topic", "low", 2, None).is_empty());
        for sender in bus.publish("topic", "high", 4, None) {
            let _ = sender.send(Publication { topic: "topic".into(), text: "high".into(), level: 4 });
        }
        assert_eq!(rx.recv().await.unwrap().text, "high");
    }

    #[tokio::test]
    async fn exclude_session_suppresses_own_publications() {
        let bus = Bus::new();
        let (_id, mut rx) = bus.subscribe(7, "topic", 0, false).unwrap();
        assert!(bus.publish("topic", "mine", 0, Some(7)).is_empty());
        for sender in bus.publish("topic", "theirs", 0, Some(9)) {
            let _ = sender.send(Publication { topic: "topic".into(), text: "theirs".into(), level: 0 });
        }
        assert_eq!(rx.recv().await.unwrap().text, "theirs");
    }
}
