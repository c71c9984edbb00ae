//! Automatic merge of concurrent revisions
//!
//! Diverged heads are folded pairwise in ascending hash order. Each pair is
//! merged three-way against its nearest common ancestor; when several
//! ancestors tie (criss-cross history) they are merged recursively into a
//! virtual base first. Conflicting edits of one key resolve to the value
//! carried by the revision with the greater hash.

use crate::object::{Hash, Metadata, Value};
use crate::revision::{Revision, RevisionTree};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

impl RevisionTree {
    /// Collapse the head to a single revision.
    ///
    /// Returns an equal tree when the head already has at most one revision.
    pub fn merge(&self) -> RevisionTree {
        let head: Vec<Arc<Revision>> = self
            .head()
            .iter()
            .map(|r| Arc::clone(&self.nodes()[&r.hash()]))
            .collect();
        if head.len() <= 1 {
            return self.clone();
        }

        let mut merger = Merger {
            nodes: self.nodes().clone(),
        };
        let mut result = self.nodes().clone();
        let mut merged = Arc::clone(&head[0]);
        for next in &head[1..] {
            let revision = Arc::new(merger.merge_pair(&merged, next));
            merger.nodes.insert(revision.hash(), Arc::clone(&revision));
            result.insert(revision.hash(), Arc::clone(&revision));
            merged = revision;
        }

        tracing::debug!(
            "Merged {} heads of {} into {}",
            head.len(),
            self.content().short(),
            merged.hash().short()
        );
        RevisionTree::from_nodes(self.content(), result)
    }
}

/// Scratch state for one merge: the tree's nodes plus virtual merge bases
struct Merger {
    nodes: BTreeMap<Hash, Arc<Revision>>,
}

impl Merger {
    fn merge_pair(&mut self, a: &Revision, b: &Revision) -> Revision {
        let base = self.merge_base(a, b);
        let empty = Metadata::new();
        let (base_metadata, base_deleted) = match &base {
            Some(base) => (base.metadata(), base.is_deleted()),
            None => (&empty, false),
        };

        let metadata = three_way(base_metadata, a, b);
        Revision::new(
            a.content(),
            a.length(),
            [a.hash(), b.hash()],
            metadata,
            a.is_deleted() || b.is_deleted() || base_deleted,
        )
    }

    fn merge_base(&mut self, a: &Revision, b: &Revision) -> Option<Arc<Revision>> {
        let candidates = self.nearest_common_ancestors(a.hash(), b.hash());
        let mut bases = candidates.iter().filter_map(|h| self.nodes.get(h).cloned());
        let mut base = bases.next()?;
        let rest: Vec<Arc<Revision>> = bases.collect();
        for other in rest {
            let virtual_base = Arc::new(self.merge_pair(&base, &other));
            self.nodes.insert(virtual_base.hash(), Arc::clone(&virtual_base));
            base = virtual_base;
        }
        Some(base)
    }

    /// Walk from both sides toward the tail one layer at a time and stop at
    /// the first layer where the visited sets meet.
    fn nearest_common_ancestors(&self, a: Hash, b: Hash) -> BTreeSet<Hash> {
        let mut seen_a = BTreeSet::from([a]);
        let mut seen_b = BTreeSet::from([b]);
        let mut frontier_a = vec![a];
        let mut frontier_b = vec![b];

        loop {
            let common: BTreeSet<Hash> = seen_a.intersection(&seen_b).copied().collect();
            if !common.is_empty() {
                return self.lowest(common);
            }
            if frontier_a.is_empty() && frontier_b.is_empty() {
                return BTreeSet::new();
            }
            frontier_a = self.expand(&frontier_a, &mut seen_a);
            frontier_b = self.expand(&frontier_b, &mut seen_b);
        }
    }

    fn expand(&self, frontier: &[Hash], seen: &mut BTreeSet<Hash>) -> Vec<Hash> {
        let mut next = Vec::new();
        for hash in frontier {
            if let Some(node) = self.nodes.get(hash) {
                for parent in node.parents() {
                    if self.nodes.contains_key(parent) && seen.insert(*parent) {
                        next.push(*parent);
                    }
                }
            }
        }
        next
    }

    /// Drop candidates that are ancestors of other candidates
    fn lowest(&self, candidates: BTreeSet<Hash>) -> BTreeSet<Hash> {
        let mut shadowed = BTreeSet::new();
        for candidate in &candidates {
            shadowed.extend(self.ancestors(candidate));
        }
        candidates.difference(&shadowed).copied().collect()
    }

    fn ancestors(&self, revision: &Hash) -> BTreeSet<Hash> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![*revision];
        while let Some(hash) = stack.pop() {
            if let Some(node) = self.nodes.get(&hash) {
                for parent in node.parents() {
                    if self.nodes.contains_key(parent) && seen.insert(*parent) {
                        stack.push(*parent);
                    }
                }
            }
        }
        seen
    }
}

fn three_way(base: &Metadata, a: &Revision, b: &Revision) -> Metadata {
    let keys: BTreeSet<&String> = base
        .keys()
        .chain(a.metadata().keys())
        .chain(b.metadata().keys())
        .collect();

    let mut merged = Metadata::new();
    for key in keys {
        let original = base.get(key);
        let ours = a.metadata().get(key);
        let theirs = b.metadata().get(key);

        let value: Option<&Value> = if ours == theirs || theirs == original {
            ours
        } else if ours == original {
            theirs
        } else if a.hash() > b.hash() {
            ours
        } else {
            theirs
        };

        if let Some(value) = value {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::tests::{content, rev};
    use proptest::prelude::*;

    fn fields(revision: &Revision) -> Vec<(String, Value)> {
        revision.metadata().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    #[test]
    fn test_single_head_is_noop() {
        let a0 = rev(&[], &[("msg", "good morning".into())]);
        let a1 = rev(&[&a0], &[("msg", "hello".into())]);
        let tree = RevisionTree::of(content(), [a0, a1]).unwrap();
        assert_eq!(tree.merge(), tree);
    }

    #[test]
    fn test_three_way_merge() {
        let a0 = rev(&[], &[("msg", "good morning".into())]);
        let a1 = rev(&[&a0], &[("msg", "hello".into())]);
        let a2 = rev(&[&a1], &[("bool", false.into()), ("msg", "hello world".into())]);
        let a3 = rev(&[&a2], &[("bool", true.into()), ("msg", "hello world".into())]);
        let b2 = rev(&[&a1], &[("answer", 42i64.into()), ("msg", "hello".into())]);

        let tree = RevisionTree::of(content(), [a0, a1, a2, a3.clone(), b2.clone()]).unwrap();
        let merged = tree.merge();

        let head = merged.head();
        assert_eq!(head.len(), 1);
        assert_eq!(
            fields(head[0]),
            vec![
                ("answer".to_string(), Value::Int(42)),
                ("bool".to_string(), Value::Bool(true)),
                ("msg".to_string(), Value::Text("hello world".into())),
            ]
        );
        assert_eq!(head[0].parents(), &BTreeSet::from([a3.hash(), b2.hash()]));
        assert!(!head[0].is_deleted());
        assert_eq!(merged.len(), tree.len() + 1);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let a0 = rev(&[], &[("k", 0i64.into())]);
        let x = rev(&[&a0], &[("k", 1i64.into())]);
        let y = rev(&[&a0], &[("k", 2i64.into())]);
        let z = rev(&[&a0], &[("other", "z".into()), ("k", 0i64.into())]);
        let tree = RevisionTree::of(content(), [a0, x, y, z]).unwrap();

        let first = tree.merge();
        let second = tree.merge();
        assert_eq!(first, second);
        assert_eq!(first.head().len(), 1);
        assert_eq!(first.merge(), first);
    }

    #[test]
    fn test_conflict_prefers_greater_revision_hash() {
        let a0 = rev(&[], &[("msg", "base".into())]);
        let x = rev(&[&a0], &[("msg", "x".into())]);
        let y = rev(&[&a0], &[("msg", "y".into())]);
        let winner = if x.hash() > y.hash() { "x" } else { "y" };

        let merged = RevisionTree::of(content(), [a0, x, y]).unwrap().merge();
        let head = merged.latest().unwrap();
        assert_eq!(head.metadata()["msg"], Value::Text(winner.into()));
    }

    #[test]
    fn test_removal_on_one_side_applies() {
        let a0 = rev(&[], &[("keep", 1i64.into()), ("drop", 2i64.into())]);
        let x = rev(&[&a0], &[("keep", 1i64.into())]);
        let y = rev(&[&a0], &[("keep", 1i64.into()), ("drop", 2i64.into()), ("new", 3i64.into())]);

        let merged = RevisionTree::of(content(), [a0, x, y]).unwrap().merge();
        let head = merged.latest().unwrap();
        assert_eq!(
            fields(head),
            vec![("keep".to_string(), Value::Int(1)), ("new".to_string(), Value::Int(3))]
        );
    }

    #[test]
    fn test_deletion_dominates() {
        let a0 = rev(&[], &[("msg", "alive".into())]);
        let gone = Revision::new(content(), 11, [a0.hash()], a0.metadata().clone(), true);
        let x = rev(&[&gone], &[("msg", "x".into())]);
        let y = rev(&[&gone], &[("msg", "alive".into()), ("tag", "y".into())]);

        let merged = RevisionTree::of(content(), [a0, gone, x, y]).unwrap().merge();
        let head = merged.head();
        assert_eq!(head.len(), 1);
        assert!(head[0].is_deleted());
    }

    #[test]
    fn test_deleted_side_wins_over_live_edit() {
        let a0 = rev(&[], &[("msg", "alive".into())]);
        let gone = Revision::new(content(), 11, [a0.hash()], a0.metadata().clone(), true);
        let edit = rev(&[&a0], &[("msg", "edited".into())]);

        let merged = RevisionTree::of(content(), [a0, gone, edit]).unwrap().merge();
        let head = merged.latest().unwrap();
        assert!(head.is_deleted());
        assert_eq!(head.metadata()["msg"], Value::Text("edited".into()));
    }

    #[test]
    fn test_no_common_ancestor_takes_union() {
        let x = rev(&[], &[("author", "alice".into())]);
        let y = rev(&[], &[("size", 9i64.into())]);

        let merged = RevisionTree::of(content(), [x, y]).unwrap().merge();
        let head = merged.latest().unwrap();
        assert_eq!(
            fields(head),
            vec![("author".to_string(), Value::Text("alice".into())), ("size".to_string(), Value::Int(9))]
        );
    }

    #[test]
    fn test_criss_cross_uses_virtual_base() {
        // base -> {p, q}; m1 = merge(p, q) and m2 = merge(q, p) by hand with
        // different resolutions, then both continue.
        let base = rev(&[], &[("k", "base".into()), ("n", 0i64.into())]);
        let p = rev(&[&base], &[("k", "p".into()), ("n", 0i64.into())]);
        let q = rev(&[&base], &[("k", "base".into()), ("n", 1i64.into())]);
        let m1 = rev(&[&p, &q], &[("k", "p".into()), ("n", 1i64.into()), ("side", "one".into())]);
        let m2 = rev(&[&p, &q], &[("k", "p".into()), ("n", 1i64.into()), ("extra", true.into())]);

        let merged = RevisionTree::of(content(), [base, p, q, m1, m2]).unwrap().merge();
        let head = merged.latest().unwrap();
        assert_eq!(
            fields(head),
            vec![
                ("extra".to_string(), Value::Bool(true)),
                ("k".to_string(), Value::Text("p".into())),
                ("n".to_string(), Value::Int(1)),
                ("side".to_string(), Value::Text("one".into())),
            ]
        );
        // virtual bases never leak into the tree
        assert_eq!(merged.len(), 6);
    }

    #[test]
    fn test_octopus_revision_walks_all_parents() {
        let root = rev(&[], &[("k", 0i64.into())]);
        let x = rev(&[&root], &[("x", 1i64.into()), ("k", 0i64.into())]);
        let y = rev(&[&root], &[("y", 1i64.into()), ("k", 0i64.into())]);
        let z = rev(&[&root], &[("z", 1i64.into()), ("k", 0i64.into())]);
        let octopus = rev(&[&x, &y, &z], &[("x", 1i64.into()), ("y", 1i64.into()), ("z", 1i64.into()), ("k", 0i64.into())]);
        let side = rev(&[&z], &[("z", 1i64.into()), ("k", 5i64.into())]);

        let merged = RevisionTree::of(content(), [root, x, y, z, octopus, side]).unwrap().merge();
        let head = merged.latest().unwrap();
        assert_eq!(head.metadata()["k"], Value::Int(5));
        assert_eq!(head.metadata()["x"], Value::Int(1));
        assert_eq!(head.metadata().len(), 4);
    }

    /// Random DAG: octopus parents, random deletions and removed keys, and a
    /// mask dropping some revisions so parents can be absent.
    fn arb_dag() -> impl Strategy<Value = Vec<Revision>> {
        prop::collection::vec(
            (
                prop::collection::vec(any::<prop::sample::Index>(), 0..4),
                prop::option::of(0i64..4),
                prop::bool::weighted(0.1),
                prop::bool::weighted(0.2),
            ),
            1..14,
        )
        .prop_map(|nodes| {
            let mut all: Vec<Revision> = Vec::new();
            let mut kept = Vec::new();
            for (i, (picks, value, deleted, dropped)) in nodes.into_iter().enumerate() {
                let parents: Vec<Hash> = if all.is_empty() {
                    Vec::new()
                } else {
                    picks.iter().map(|ix| all[ix.index(all.len())].hash()).collect()
                };
                let mut metadata = Metadata::new();
                metadata.insert("id".into(), Value::Int(i as i64));
                if let Some(value) = value {
                    metadata.insert(format!("k{}", i % 3), Value::Int(value));
                }
                let revision = Revision::new(content(), 11, parents, metadata, deleted);
                if !dropped || kept.is_empty() {
                    kept.push(revision.clone());
                }
                all.push(revision);
            }
            kept
        })
    }

    proptest! {
        #[test]
        fn prop_merge_single_head_and_deterministic(history in arb_dag()) {
            let tree = RevisionTree::of(content(), history.clone()).unwrap();
            let merged = tree.merge();

            prop_assert_eq!(merged.head_hashes().len(), 1);
            for revision in tree.iter() {
                prop_assert!(merged.contains(&revision.hash()));
            }
            if tree.head().iter().any(|r| r.is_deleted()) {
                prop_assert!(merged.latest().unwrap().is_deleted());
            }

            let mut reversed = history;
            reversed.reverse();
            prop_assert_eq!(&merged, &RevisionTree::of(content(), reversed).unwrap().merge());
            prop_assert_eq!(&merged.merge(), &merged);
        }
    }
}
