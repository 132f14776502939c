//! Declared "is assignable to" relations between Rust types.
//!
//! Rust has no subtyping between concrete types, so the registry is told
//! explicitly that a `Sub` may stand in for a `Super` and how to turn one into
//! the other. Relations compose: if `A -> B` and `B -> C` are declared, an `A`
//! is assignable to `C` at distance two.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::value::{TypeKey, Value};

pub(crate) type UpcastFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
struct Edge {
    to: TypeKey,
    upcast: UpcastFn,
}

/// Chain of upcasts from one type to an ancestor.
#[derive(Clone)]
pub(crate) struct Upcast {
    steps: Vec<UpcastFn>,
}

impl Upcast {
    /// Number of declared relations traversed. Zero for the identity.
    pub(crate) fn distance(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn apply(&self, value: &Value) -> Option<Value> {
        let mut current = value.clone();
        for step in &self.steps {
            current = step(&current)?;
        }
        Some(current)
    }
}

#[derive(Clone, Default)]
pub(crate) struct Hierarchy {
    supers: HashMap<TypeKey, Vec<Edge>>,
}

impl Hierarchy {
    /// Declares `sub` assignable to `sup`. Re-declaring a pair replaces its
    /// upcast and keeps its position.
    pub(crate) fn declare(&mut self, sub: TypeKey, sup: TypeKey, upcast: UpcastFn) {
        let edges = self.supers.entry(sub).or_default();
        match edges.iter_mut().find(|e| e.to == sup) {
            Some(edge) => edge.upcast = upcast,
            None => edges.push(Edge { to: sup, upcast }),
        }
    }

    /// Shortest upcast chain from `from` to `to`, if `from` is assignable to
    /// `to`. Among equally short chains the one through earlier declarations
    /// wins.
    pub(crate) fn path(&self, from: TypeKey, to: TypeKey) -> Option<Upcast> {
        if from == to {
            return Some(Upcast { steps: Vec::new() });
        }
        let mut visited = HashSet::from([from]);
        let mut queue = VecDeque::from([(from, Vec::<UpcastFn>::new())]);
        while let Some((current, steps)) = queue.pop_front() {
            for edge in self.supers.get(&current).into_iter().flatten() {
                if !visited.insert(edge.to) {
                    continue;
                }
                let mut next = steps.clone();
                next.push(Arc::clone(&edge.upcast));
                if edge.to == to {
                    return Some(Upcast { steps: next });
                }
                queue.push_back((edge.to, next));
            }
        }
        None
    }

    pub(crate) fn is_assignable(&self, from: TypeKey, to: TypeKey) -> bool {
        self.path(from, to).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Puppy(String);
    #[derive(Clone)]
    struct Dog(String);
    #[derive(Clone)]
    struct Animal(String);

    fn edge<A, B>(f: fn(&A) -> B) -> UpcastFn
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
    {
        Arc::new(move |v: &Value| v.downcast_ref::<A>().map(|a| Value::new(f(a))))
    }

    fn lattice() -> Hierarchy {
        let mut h = Hierarchy::default();
        h.declare(
            TypeKey::of::<Puppy>(),
            TypeKey::of::<Dog>(),
            edge::<Puppy, Dog>(|p| Dog(p.0.clone())),
        );
        h.declare(
            TypeKey::of::<Dog>(),
            TypeKey::of::<Animal>(),
            edge::<Dog, Animal>(|d| Animal(d.0.clone())),
        );
        h
    }

    #[test]
    fn transitive_path_composes_upcasts() {
        let h = lattice();
        let up = h
            .path(TypeKey::of::<Puppy>(), TypeKey::of::<Animal>())
            .unwrap();
        assert_eq!(up.distance(), 2);
        let animal = up.apply(&Value::new(Puppy("rex".into()))).unwrap();
        assert_eq!(animal.downcast_ref::<Animal>().unwrap().0, "rex");
    }

    #[test]
    fn relation_is_directed() {
        let h = lattice();
        assert!(h.is_assignable(TypeKey::of::<Dog>(), TypeKey::of::<Animal>()));
        assert!(!h.is_assignable(TypeKey::of::<Animal>(), TypeKey::of::<Dog>()));
    }

    #[test]
    fn identity_has_zero_distance() {
        let h = Hierarchy::default();
        let up = h.path(TypeKey::of::<Dog>(), TypeKey::of::<Dog>()).unwrap();
        assert_eq!(up.distance(), 0);
    }

    #[test]
    fn cycles_terminate() {
        let mut h = lattice();
        h.declare(
            TypeKey::of::<Animal>(),
            TypeKey::of::<Puppy>(),
            edge::<Animal, Puppy>(|a| Puppy(a.0.clone())),
        );
        assert!(h.path(TypeKey::of::<Dog>(), TypeKey::of::<String>()).is_none());
    }
}
