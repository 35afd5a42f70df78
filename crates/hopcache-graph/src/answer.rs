//! The answer model: a distance value together with the edges justifying it.
//!
//! Merging follows one rule everywhere: a child's finite answer, incremented
//! by one when the traversed edge's type matches the question's own link
//! type, is adopted only if strictly better than what we have.  On adoption
//! the dependency set is *replaced* by the one justifying edge plus the
//! contributing child's full set, never unioned across redundant paths, so
//! the set always reflects only the currently-best derivation.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::DeleteDependency;

/// An in-flight distance value.  `Unknown` means "not yet evaluated";
/// `Infinite` means "no path found so far".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerValue {
    Unknown,
    Infinite,
    Finite(u32),
}

impl AnswerValue {
    pub fn is_finite(self) -> bool {
        matches!(self, AnswerValue::Finite(_))
    }

    pub fn finite(self) -> Option<u32> {
        match self {
            AnswerValue::Finite(v) => Some(v),
            _ => None,
        }
    }
}

/// A distance value plus its delete dependencies.
#[derive(Debug, Clone)]
pub struct Answer {
    value: AnswerValue,
    deps: AHashSet<DeleteDependency>,
}

impl Answer {
    pub fn unknown() -> Self {
        Self {
            value: AnswerValue::Unknown,
            deps: AHashSet::new(),
        }
    }

    pub fn infinite() -> Self {
        Self {
            value: AnswerValue::Infinite,
            deps: AHashSet::new(),
        }
    }

    pub fn finite(value: u32) -> Self {
        Self {
            value: AnswerValue::Finite(value),
            deps: AHashSet::new(),
        }
    }

    pub fn with_deps(value: AnswerValue, deps: impl IntoIterator<Item = DeleteDependency>) -> Self {
        Self {
            value,
            deps: deps.into_iter().collect(),
        }
    }

    pub fn value(&self) -> AnswerValue {
        self.value
    }

    pub fn deps(&self) -> impl Iterator<Item = &DeleteDependency> {
        self.deps.iter()
    }

    pub fn dep_count(&self) -> usize {
        self.deps.len()
    }

    pub fn has_dep(&self, dep: &DeleteDependency) -> bool {
        self.deps.contains(dep)
    }

    /// Fold one child edge into this answer.
    ///
    /// `increments` is true when the traversed edge's link type equals the
    /// question's own link type, i.e. when this hop counts.  `target` and
    /// `source` identify the edge itself, for the dependency record.
    pub fn merge(
        &mut self,
        child: &Answer,
        increments: bool,
        link_type: &str,
        target: &str,
        source: &str,
    ) {
        // Only a finite child can improve anything.
        let Some(child_value) = child.value.finite() else {
            return;
        };
        let candidate = if increments {
            child_value + 1
        } else {
            child_value
        };
        let adopt = match self.value {
            AnswerValue::Finite(current) => candidate < current,
            AnswerValue::Infinite | AnswerValue::Unknown => true,
        };
        if adopt {
            self.value = AnswerValue::Finite(candidate);
            self.deps = child.deps.clone();
            self.deps
                .insert(DeleteDependency::new(link_type, target, source));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(n: u32) -> DeleteDependency {
        DeleteDependency::new("link", format!("t{n}"), format!("s{n}"))
    }

    #[test]
    fn merge_adopts_strictly_better_only() {
        let mut a = Answer::finite(3);
        let child = Answer::with_deps(AnswerValue::Finite(2), [dep(1)]);

        // 2 + 1 == 3: not strictly better, nothing changes.
        a.merge(&child, true, "link", "t", "s");
        assert_eq!(a.value(), AnswerValue::Finite(3));
        assert_eq!(a.dep_count(), 0);

        // Non-incrementing edge: 2 < 3, adopted.
        a.merge(&child, false, "other", "t", "s");
        assert_eq!(a.value(), AnswerValue::Finite(2));
        assert_eq!(a.dep_count(), 2);
        assert!(a.has_dep(&DeleteDependency::new("other", "t", "s")));
        assert!(a.has_dep(&dep(1)));
    }

    #[test]
    fn merge_replaces_dependency_set_on_adoption() {
        let mut a = Answer::with_deps(AnswerValue::Finite(5), [dep(9)]);
        let child = Answer::with_deps(AnswerValue::Finite(1), [dep(1), dep(2)]);
        a.merge(&child, true, "link", "t", "s");
        assert_eq!(a.value(), AnswerValue::Finite(2));
        // Old justification is gone entirely.
        assert!(!a.has_dep(&dep(9)));
        assert_eq!(a.dep_count(), 3);
    }

    #[test]
    fn merge_ignores_non_finite_children() {
        let mut a = Answer::infinite();
        a.merge(&Answer::infinite(), true, "link", "t", "s");
        assert_eq!(a.value(), AnswerValue::Infinite);
        a.merge(&Answer::unknown(), true, "link", "t", "s");
        assert_eq!(a.value(), AnswerValue::Infinite);
    }

    #[test]
    fn merge_fills_unknown() {
        let mut a = Answer::unknown();
        a.merge(&Answer::finite(0), true, "link", "t", "");
        assert_eq!(a.value(), AnswerValue::Finite(1));
    }
}
