//! Dependency tracking for cascade invalidation.

use std::collections::{HashMap, HashSet, VecDeque};

/// Records which keys are derived from which.
///
/// Both edge directions are kept so registration and cascade lookups are
/// cheap. Cycles are allowed; every key appears at most once in a cascade.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// key -> keys it was derived from
    depends_on: HashMap<String, HashSet<String>>,
    /// key -> keys derived from it
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` as derived from `dependencies`, replacing any previous
    /// registration of `key`.
    pub fn register<I>(&mut self, key: &str, dependencies: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.unregister(key);

        let deps: HashSet<String> = dependencies.into_iter().filter(|d| d != key).collect();
        if deps.is_empty() {
            return;
        }
        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.depends_on.insert(key.to_string(), deps);
    }

    /// Drops the edges from `key` to the keys it depends on.
    pub fn unregister(&mut self, key: &str) {
        let Some(deps) = self.depends_on.remove(key) else {
            return;
        };
        for dep in deps {
            if let Some(children) = self.dependents.get_mut(&dep) {
                children.remove(key);
                if children.is_empty() {
                    self.dependents.remove(&dep);
                }
            }
        }
    }

    /// Removes every trace of `key`: its own registration and its role as a
    /// dependency of other keys.
    pub fn forget(&mut self, key: &str) {
        self.unregister(key);
        if let Some(children) = self.dependents.remove(key) {
            for child in children {
                if let Some(parents) = self.depends_on.get_mut(&child) {
                    parents.remove(key);
                    if parents.is_empty() {
                        self.depends_on.remove(&child);
                    }
                }
            }
        }
    }

    /// All keys transitively derived from `key`, excluding `key` itself, in
    /// breadth-first order.
    pub fn dependents_closure(&self, key: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::from([key]);
        let mut queue: VecDeque<&str> = VecDeque::from([key]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.dependents.get(current) else {
                continue;
            };
            for child in children {
                if seen.insert(child.as_str()) {
                    out.push(child.clone());
                    queue.push_back(child.as_str());
                }
            }
        }
        out
    }

    /// True if `key` participates in any dependency edge.
    pub fn is_tracked(&self, key: &str) -> bool {
        self.depends_on.contains_key(key) || self.dependents.contains_key(key)
    }

    pub fn dependencies_of(&self, key: &str) -> Option<&HashSet<String>> {
        self.depends_on.get(key)
    }

    pub fn clear(&mut self) {
        self.depends_on.clear();
        self.dependents.clear();
    }

    /// Number of keys with at least one registered dependency.
    pub fn len(&self) -> usize {
        self.depends_on.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_direct_dependents() {
        let mut graph = DependencyGraph::new();
        graph.register("ast:b", deps(&["src:a"]));

        assert_eq!(graph.dependents_closure("src:a"), deps(&["ast:b"]));
        assert!(graph.dependents_closure("ast:b").is_empty());
    }

    #[test]
    fn test_transitive_closure() {
        let mut graph = DependencyGraph::new();
        graph.register("b", deps(&["a"]));
        graph.register("c", deps(&["b"]));
        graph.register("d", deps(&["c", "a"]));

        let mut closure = graph.dependents_closure("a");
        closure.sort();
        assert_eq!(closure, deps(&["b", "c", "d"]));
    }

    #[test]
    fn test_cycles_terminate() {
        let mut graph = DependencyGraph::new();
        graph.register("a", deps(&["b"]));
        graph.register("b", deps(&["a"]));

        assert_eq!(graph.dependents_closure("a"), deps(&["b"]));
    }

    #[test]
    fn test_self_dependency_ignored() {
        let mut graph = DependencyGraph::new();
        graph.register("a", deps(&["a"]));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_register_replaces_previous() {
        let mut graph = DependencyGraph::new();
        graph.register("b", deps(&["a"]));
        graph.register("b", deps(&["x"]));

        assert!(graph.dependents_closure("a").is_empty());
        assert_eq!(graph.dependents_closure("x"), deps(&["b"]));
    }

    #[test]
    fn test_forget_removes_both_directions() {
        let mut graph = DependencyGraph::new();
        graph.register("b", deps(&["a"]));
        graph.register("c", deps(&["b"]));

        graph.forget("b");

        assert!(graph.dependents_closure("a").is_empty());
        assert!(graph.dependencies_of("c").is_none());
        assert!(!graph.is_tracked("b"));
    }
}
