//! Node selection strategies.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use micro_registry::Node;
use rand::Rng;

/// Strategy choosing one node from a resolved set.
pub trait Selector: Send + Sync {
    fn name(&self) -> &'static str;

    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node>;
}

/// Uniform random choice; the default.
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        if nodes.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..nodes.len());
        nodes.get(index)
    }
}

/// Cycles through nodes in order.
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        RoundRobinSelector {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        RoundRobinSelector::new()
    }
}

impl Selector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        if nodes.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes.get(index)
    }
}

/// Random choice weighted by the `weight` metadata entry (default 1).
pub struct WeightedSelector;

impl WeightedSelector {
    fn weight(node: &Node) -> u64 {
        node.metadata
            .get("weight")
            .and_then(|w| w.parse().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }
}

impl Selector for WeightedSelector {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        let total: u64 = nodes.iter().map(Self::weight).sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for node in nodes {
            let weight = Self::weight(node);
            if pick < weight {
                return Some(node);
            }
            pick -= weight;
        }
        nodes.last()
    }
}

/// Pins a key (session id, tenant, ...) to one node for as long as the
/// membership holds.
pub struct StickySelector {
    key: String,
}

impl StickySelector {
    pub fn new(key: impl Into<String>) -> Self {
        StickySelector { key: key.into() }
    }
}

impl Selector for StickySelector {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        if nodes.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        self.key.hash(&mut hasher);
        nodes.get((hasher.finish() % nodes.len() as u64) as usize)
    }
}
