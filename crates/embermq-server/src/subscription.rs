//! Subscription trie with per-node retained-message slots.
//!
//! Filters are split on `/` into a path of literal levels, with a
//! dedicated `+` child per node and a `#` subscriber list attached to
//! the node where the `#` appears (so `a/#` also matches `a` itself).
//! Shared subscriptions (`$share/{group}/{filter}`) live at the same
//! nodes, grouped by name with a round-robin cursor.
//!
//! The trie owns the subscription leaves; sessions keep only filter
//! strings as handles. Nodes are created lazily and pruned as soon as
//! they hold no children, no subscribers, and no retained message.

use std::collections::HashMap;
use std::rc::Rc;

use embermq_core::packet::{QoS, SubscriptionOptions};

use crate::session::SessionId;
use crate::store::StoredMessage;

/// A subscription leaf.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub session: SessionId,
    pub qos: QoS,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

/// Result of a subscribe: whether the session already held this filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    New,
    Replaced,
}

/// Members of one shared-subscription group at one node.
#[derive(Debug, Default)]
struct SharedGroup {
    members: Vec<Subscriber>,
    next: usize,
}

impl SharedGroup {
    fn add(&mut self, sub: Subscriber) -> SubscribeOutcome {
        if let Some(existing) = self.members.iter_mut().find(|m| m.session == sub.session) {
            *existing = sub;
            SubscribeOutcome::Replaced
        } else {
            self.members.push(sub);
            SubscribeOutcome::New
        }
    }

    fn remove(&mut self, session: SessionId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.session != session);
        self.members.len() != before
    }

    /// Pick the next member round-robin. Stable within one publish
    /// because each publish advances the cursor exactly once per group.
    fn pick(&mut self) -> Option<Subscriber> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.next % self.members.len();
        self.next = self.next.wrapping_add(1);
        Some(self.members[idx].clone())
    }
}

fn replace_or_push(list: &mut Vec<Subscriber>, sub: Subscriber) -> SubscribeOutcome {
    if let Some(existing) = list.iter_mut().find(|s| s.session == sub.session) {
        *existing = sub;
        SubscribeOutcome::Replaced
    } else {
        list.push(sub);
        SubscribeOutcome::New
    }
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    /// The `+` child.
    plus: Option<Box<Node>>,
    /// Subscribers whose filter terminates at this node.
    subscribers: Vec<Subscriber>,
    /// Subscribers whose filter ends in `#` at this node.
    hash_subs: Vec<Subscriber>,
    /// Shared groups terminating at this node.
    shared: HashMap<String, SharedGroup>,
    /// Shared groups ending in `#` at this node.
    hash_shared: HashMap<String, SharedGroup>,
    retained: Option<Rc<StoredMessage>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.plus.is_none()
            && self.subscribers.is_empty()
            && self.hash_subs.is_empty()
            && self.shared.is_empty()
            && self.hash_shared.is_empty()
            && self.retained.is_none()
    }

    fn insert(
        &mut self,
        levels: &[&str],
        sub: Subscriber,
        group: Option<&str>,
    ) -> SubscribeOutcome {
        if levels.is_empty() {
            return match group {
                None => replace_or_push(&mut self.subscribers, sub),
                Some(g) => self.shared.entry(g.to_string()).or_default().add(sub),
            };
        }
        match levels[0] {
            "#" => match group {
                None => replace_or_push(&mut self.hash_subs, sub),
                Some(g) => self.hash_shared.entry(g.to_string()).or_default().add(sub),
            },
            "+" => self
                .plus
                .get_or_insert_with(Default::default)
                .insert(&levels[1..], sub, group),
            level => self
                .children
                .entry(level.to_string())
                .or_default()
                .insert(&levels[1..], sub, group),
        }
    }

    fn remove(&mut self, levels: &[&str], session: SessionId, group: Option<&str>) -> bool {
        fn from_groups(
            groups: &mut HashMap<String, SharedGroup>,
            name: &str,
            session: SessionId,
        ) -> bool {
            let Some(g) = groups.get_mut(name) else {
                return false;
            };
            let removed = g.remove(session);
            if g.members.is_empty() {
                groups.remove(name);
            }
            removed
        }

        if levels.is_empty() {
            return match group {
                None => {
                    let before = self.subscribers.len();
                    self.subscribers.retain(|s| s.session != session);
                    self.subscribers.len() != before
                }
                Some(g) => from_groups(&mut self.shared, g, session),
            };
        }
        match levels[0] {
            "#" => match group {
                None => {
                    let before = self.hash_subs.len();
                    self.hash_subs.retain(|s| s.session != session);
                    self.hash_subs.len() != before
                }
                Some(g) => from_groups(&mut self.hash_shared, g, session),
            },
            "+" => {
                let mut removed = false;
                if let Some(plus) = &mut self.plus {
                    removed = plus.remove(&levels[1..], session, group);
                    if plus.is_empty() {
                        self.plus = None;
                    }
                }
                removed
            }
            level => {
                let mut removed = false;
                if let Some(child) = self.children.get_mut(level) {
                    removed = child.remove(&levels[1..], session, group);
                    if child.is_empty() {
                        self.children.remove(level);
                    }
                }
                removed
            }
        }
    }

    /// Point an existing leaf at a new session key (takeover).
    fn rewrite(&mut self, levels: &[&str], old: SessionId, new: SessionId, group: Option<&str>) {
        fn rewrite_list(list: &mut [Subscriber], old: SessionId, new: SessionId) {
            for sub in list.iter_mut() {
                if sub.session == old {
                    sub.session = new;
                }
            }
        }
        fn rewrite_groups(
            groups: &mut HashMap<String, SharedGroup>,
            name: &str,
            old: SessionId,
            new: SessionId,
        ) {
            if let Some(g) = groups.get_mut(name) {
                rewrite_list(&mut g.members, old, new);
            }
        }

        if levels.is_empty() {
            match group {
                None => rewrite_list(&mut self.subscribers, old, new),
                Some(g) => rewrite_groups(&mut self.shared, g, old, new),
            }
            return;
        }
        match levels[0] {
            "#" => match group {
                None => rewrite_list(&mut self.hash_subs, old, new),
                Some(g) => rewrite_groups(&mut self.hash_shared, g, old, new),
            },
            "+" => {
                if let Some(plus) = &mut self.plus {
                    plus.rewrite(&levels[1..], old, new, group);
                }
            }
            level => {
                if let Some(child) = self.children.get_mut(level) {
                    child.rewrite(&levels[1..], old, new, group);
                }
            }
        }
    }

    fn collect(&mut self, levels: &[&str], is_root: bool, out: &mut Vec<Subscriber>) {
        // MQTT-4.7.2-1: wildcards at the root never match "$" topics.
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            out.extend(self.hash_subs.iter().cloned());
            for g in self.hash_shared.values_mut() {
                if let Some(sub) = g.pick() {
                    out.push(sub);
                }
            }
        }

        if levels.is_empty() {
            out.extend(self.subscribers.iter().cloned());
            for g in self.shared.values_mut() {
                if let Some(sub) = g.pick() {
                    out.push(sub);
                }
            }
            return;
        }

        if !skip_wildcards {
            if let Some(plus) = &mut self.plus {
                plus.collect(&levels[1..], false, out);
            }
        }
        if let Some(child) = self.children.get_mut(levels[0]) {
            child.collect(&levels[1..], false, out);
        }
    }

    fn collect_retained(&self, levels: &[&str], is_root: bool, out: &mut Vec<Rc<StoredMessage>>) {
        if levels.is_empty() {
            if let Some(msg) = &self.retained {
                out.push(Rc::clone(msg));
            }
            return;
        }
        match levels[0] {
            "#" => {
                if is_root {
                    for (name, child) in &self.children {
                        if name.starts_with('$') {
                            continue;
                        }
                        child.collect_all_retained(out);
                    }
                } else {
                    // "a/#" also matches "a", so include this node.
                    self.collect_all_retained(out);
                }
            }
            "+" => {
                for (name, child) in &self.children {
                    if is_root && name.starts_with('$') {
                        continue;
                    }
                    child.collect_retained(&levels[1..], false, out);
                }
            }
            level => {
                if let Some(child) = self.children.get(level) {
                    child.collect_retained(&levels[1..], false, out);
                }
            }
        }
    }

    fn collect_all_retained(&self, out: &mut Vec<Rc<StoredMessage>>) {
        if let Some(msg) = &self.retained {
            out.push(Rc::clone(msg));
        }
        for child in self.children.values() {
            child.collect_all_retained(out);
        }
    }

    fn set_retained(&mut self, levels: &[&str], msg: Rc<StoredMessage>) -> bool {
        if levels.is_empty() {
            // Replacing the slot drops the old reference and takes the
            // new one in a single assignment.
            let was_empty = self.retained.is_none();
            self.retained = Some(msg);
            return was_empty;
        }
        self.children
            .entry(levels[0].to_string())
            .or_default()
            .set_retained(&levels[1..], msg)
    }

    fn clear_retained(&mut self, levels: &[&str]) -> bool {
        if levels.is_empty() {
            return self.retained.take().is_some();
        }
        let level = levels[0];
        let mut cleared = false;
        if let Some(child) = self.children.get_mut(level) {
            cleared = child.clear_retained(&levels[1..]);
            if child.is_empty() {
                self.children.remove(level);
            }
        }
        cleared
    }
}

/// The broker-wide subscription index.
#[derive(Default)]
pub struct SubscriptionTrie {
    root: Node,
    subscription_count: usize,
    retained_count: usize,
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `$share/{group}/{filter}` into group and filter.
    pub fn parse_shared(filter: &str) -> Option<(&str, &str)> {
        let rest = filter.strip_prefix("$share/")?;
        let slash = rest.find('/')?;
        if slash == 0 || slash == rest.len() - 1 {
            return None;
        }
        Some((&rest[..slash], &rest[slash + 1..]))
    }

    /// Insert or update a subscription. The filter has already been
    /// validated.
    pub fn subscribe(&mut self, filter: &str, sub: Subscriber) -> SubscribeOutcome {
        let (group, filter) = match Self::parse_shared(filter) {
            Some((g, f)) => (Some(g), f),
            None => (None, filter),
        };
        let levels: Vec<&str> = filter.split('/').collect();
        let outcome = self.root.insert(&levels, sub, group);
        if outcome == SubscribeOutcome::New {
            self.subscription_count += 1;
        }
        outcome
    }

    /// Remove one session's leaf for `filter`. Returns whether a leaf
    /// existed.
    pub fn unsubscribe(&mut self, filter: &str, session: SessionId) -> bool {
        let (group, filter) = match Self::parse_shared(filter) {
            Some((g, f)) => (Some(g), f),
            None => (None, filter),
        };
        let levels: Vec<&str> = filter.split('/').collect();
        let removed = self.root.remove(&levels, session, group);
        if removed {
            self.subscription_count -= 1;
        }
        removed
    }

    /// Rewrite the leaf for `filter` from one session key to another.
    pub fn rewrite_session(&mut self, filter: &str, old: SessionId, new: SessionId) {
        let (group, filter) = match Self::parse_shared(filter) {
            Some((g, f)) => (Some(g), f),
            None => (None, filter),
        };
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.rewrite(&levels, old, new, group);
    }

    /// Collect every recipient for a publish to `topic`: exact and
    /// wildcard leaves, plus one member per matching shared group.
    pub fn collect(&mut self, topic: &str, out: &mut Vec<Subscriber>) {
        out.clear();
        let levels: Vec<&str> = topic.split('/').collect();
        self.root.collect(&levels, true, out);
    }

    pub fn set_retained(&mut self, topic: &str, msg: Rc<StoredMessage>) {
        let levels: Vec<&str> = topic.split('/').collect();
        if self.root.set_retained(&levels, msg) {
            self.retained_count += 1;
        }
    }

    /// Drop the retained message at `topic`, pruning emptied nodes.
    pub fn clear_retained(&mut self, topic: &str) -> bool {
        let levels: Vec<&str> = topic.split('/').collect();
        let cleared = self.root.clear_retained(&levels);
        if cleared {
            self.retained_count -= 1;
        }
        cleared
    }

    /// Retained messages a new subscription to `filter` should receive.
    pub fn retained_for(&self, filter: &str, out: &mut Vec<Rc<StoredMessage>>) {
        out.clear();
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.collect_retained(&levels, true, out);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscription_count
    }

    pub fn retained_count(&self) -> usize {
        self.retained_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sub(session: SessionId, qos: QoS) -> Subscriber {
        Subscriber {
            session,
            qos,
            options: SubscriptionOptions {
                qos,
                ..Default::default()
            },
            subscription_id: None,
        }
    }

    fn retained_msg(topic: &str) -> Rc<StoredMessage> {
        Rc::new(StoredMessage::new(
            topic.into(),
            Bytes::from_static(b"r"),
            QoS::AtMostOnce,
            true,
            "src".into(),
            None,
            0,
            None,
            0,
        ))
    }

    fn matches(trie: &mut SubscriptionTrie, topic: &str) -> Vec<SessionId> {
        let mut out = Vec::new();
        trie.collect(topic, &mut out);
        let mut ids: Vec<_> = out.into_iter().map(|s| s.session).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_exact_and_wildcards() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("sensors/temp", sub(1, QoS::AtMostOnce));
        trie.subscribe("sensors/+/temp", sub(2, QoS::AtMostOnce));
        trie.subscribe("sensors/#", sub(3, QoS::AtMostOnce));

        assert_eq!(matches(&mut trie, "sensors/temp"), vec![1, 3]);
        assert_eq!(matches(&mut trie, "sensors/room1/temp"), vec![2, 3]);
        assert_eq!(matches(&mut trie, "other"), Vec::<SessionId>::new());
    }

    #[test]
    fn test_hash_matches_parent() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/#", sub(1, QoS::AtMostOnce));
        assert_eq!(matches(&mut trie, "a"), vec![1]);
        assert_eq!(matches(&mut trie, "a/b/c"), vec![1]);
    }

    #[test]
    fn test_dollar_topics_not_matched_by_root_wildcards() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("#", sub(1, QoS::AtMostOnce));
        trie.subscribe("+/broker", sub(2, QoS::AtMostOnce));
        trie.subscribe("$SYS/#", sub(3, QoS::AtMostOnce));

        assert_eq!(matches(&mut trie, "$SYS/broker"), vec![3]);
        assert_eq!(matches(&mut trie, "any/broker"), vec![1, 2]);
    }

    #[test]
    fn test_resubscribe_replaces_in_place() {
        let mut trie = SubscriptionTrie::new();
        assert_eq!(
            trie.subscribe("a/b", sub(1, QoS::AtMostOnce)),
            SubscribeOutcome::New
        );
        assert_eq!(
            trie.subscribe("a/b", sub(1, QoS::ExactlyOnce)),
            SubscribeOutcome::Replaced
        );
        assert_eq!(trie.subscription_count(), 1);

        let mut out = Vec::new();
        trie.collect("a/b", &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_unsubscribe_prunes_nodes() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b/c", sub(1, QoS::AtMostOnce));
        assert!(trie.unsubscribe("a/b/c", 1));
        assert!(!trie.unsubscribe("a/b/c", 1));
        assert_eq!(trie.subscription_count(), 0);
        assert!(trie.root.is_empty());
    }

    #[test]
    fn test_prune_keeps_retained_nodes() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b", sub(1, QoS::AtMostOnce));
        trie.set_retained("a/b", retained_msg("a/b"));
        trie.unsubscribe("a/b", 1);
        assert!(!trie.root.is_empty());

        let mut out = Vec::new();
        trie.retained_for("a/b", &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_retained_set_clear_roundtrip() {
        let mut trie = SubscriptionTrie::new();
        trie.set_retained("x/y", retained_msg("x/y"));
        assert_eq!(trie.retained_count(), 1);
        assert!(trie.clear_retained("x/y"));
        assert_eq!(trie.retained_count(), 0);
        assert!(trie.root.is_empty());
        assert!(!trie.clear_retained("x/y"));
    }

    #[test]
    fn test_retained_replacement_drops_old_reference() {
        let mut trie = SubscriptionTrie::new();
        let first = retained_msg("t");
        trie.set_retained("t", Rc::clone(&first));
        assert_eq!(Rc::strong_count(&first), 2);
        trie.set_retained("t", retained_msg("t"));
        assert_eq!(Rc::strong_count(&first), 1);
        assert_eq!(trie.retained_count(), 1);
    }

    #[test]
    fn test_retained_for_wildcards() {
        let mut trie = SubscriptionTrie::new();
        trie.set_retained("a/1/x", retained_msg("a/1/x"));
        trie.set_retained("a/2/x", retained_msg("a/2/x"));
        trie.set_retained("a/2/y", retained_msg("a/2/y"));
        trie.set_retained("$SYS/stat", retained_msg("$SYS/stat"));

        let mut out = Vec::new();
        trie.retained_for("a/+/x", &mut out);
        assert_eq!(out.len(), 2);

        trie.retained_for("a/#", &mut out);
        assert_eq!(out.len(), 3);

        // Root wildcard never fetches "$" retained messages.
        trie.retained_for("#", &mut out);
        assert_eq!(out.len(), 3);

        trie.retained_for("$SYS/#", &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_retained_for_hash_includes_parent() {
        let mut trie = SubscriptionTrie::new();
        trie.set_retained("a", retained_msg("a"));
        trie.set_retained("a/b", retained_msg("a/b"));
        let mut out = Vec::new();
        trie.retained_for("a/#", &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_shared_round_robin() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("$share/workers/jobs/+", sub(1, QoS::AtLeastOnce));
        trie.subscribe("$share/workers/jobs/+", sub(2, QoS::AtLeastOnce));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let mut out = Vec::new();
            trie.collect("jobs/build", &mut out);
            assert_eq!(out.len(), 1);
            seen.push(out[0].session);
        }
        assert_eq!(seen, vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_shared_and_plain_coexist() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("$share/g/t", sub(1, QoS::AtMostOnce));
        trie.subscribe("t", sub(2, QoS::AtMostOnce));
        assert_eq!(matches(&mut trie, "t"), vec![1, 2]);
    }

    #[test]
    fn test_parse_shared() {
        assert_eq!(
            SubscriptionTrie::parse_shared("$share/g/a/b"),
            Some(("g", "a/b"))
        );
        assert_eq!(SubscriptionTrie::parse_shared("$share/g/"), None);
        assert_eq!(SubscriptionTrie::parse_shared("$share//f"), None);
        assert_eq!(SubscriptionTrie::parse_shared("a/b"), None);
    }

    #[test]
    fn test_rewrite_session() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/+", sub(1, QoS::AtLeastOnce));
        trie.rewrite_session("a/+", 1, 9);
        assert_eq!(matches(&mut trie, "a/x"), vec![9]);
        // The old key no longer unsubscribes anything.
        assert!(!trie.unsubscribe("a/+", 1));
        assert!(trie.unsubscribe("a/+", 9));
    }
}
