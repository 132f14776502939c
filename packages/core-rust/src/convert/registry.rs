use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::hierarchy::{Hierarchy, UpcastFn};
use super::{ConverterExists, ConverterStatistics, TypeConverterLoader};
use crate::error::TypeConversionError;
use crate::value::{TypeKey, Value};

type ConvertFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    seq: u64,
    convert: ConvertFn,
}

/// Immutable snapshot swapped in on every registration.
#[derive(Clone)]
struct Table {
    /// source -> target -> converter
    exact: HashMap<TypeKey, HashMap<TypeKey, Entry>>,
    hierarchy: Hierarchy,
    intermediates: Vec<TypeKey>,
    policy: ConverterExists,
}

impl Table {
    fn get(&self, from: TypeKey, to: TypeKey) -> Option<&Entry> {
        self.exact.get(&from).and_then(|targets| targets.get(&to))
    }
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

/// Registry of `(source, target) -> function` converters.
///
/// Lookups read an immutable snapshot and never block; registrations copy the
/// table, modify the copy and swap it in, so a `convert` running concurrently
/// with `add_converter` sees either the old or the new table, never a mix.
///
/// Lookup order for `convert(target, value)`:
///
/// 1. the value already is, or is declared assignable to, `target`;
/// 2. an exact `(source, target)` converter;
/// 3. a converter from `source` to a type assignable to `target`, nearest
///    ancestor first, earliest registration on ties;
/// 4. two hops through an intermediate type (`String`, then `Vec<u8>` by
///    default).
pub struct TypeConverterRegistry {
    table: ArcSwap<Table>,
    write: Mutex<()>,
    next_seq: AtomicU64,
    counters: Counters,
}

impl Default for TypeConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeConverterRegistry")
            .field("converters", &self.size())
            .finish_non_exhaustive()
    }
}

impl TypeConverterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(Table {
                exact: HashMap::new(),
                hierarchy: Hierarchy::default(),
                intermediates: vec![TypeKey::of::<String>(), TypeKey::of::<Vec<u8>>()],
                policy: ConverterExists::default(),
            }),
            write: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Creates a registry preloaded with the built-in converters.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::builtin::install(&registry);
        registry
    }

    fn update(&self, f: impl FnOnce(&mut Table)) {
        let _guard = self.write.lock();
        let mut next = Table::clone(&self.table.load());
        f(&mut next);
        self.table.store(Arc::new(next));
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a converter from `S` to `T`.
    ///
    /// Re-registering a pair follows the [`ConverterExists`] policy.
    ///
    /// # Errors
    ///
    /// Returns [`TypeConversionError::ConverterExists`] if the pair is already
    /// registered and the policy is [`ConverterExists::Fail`].
    pub fn add_converter<S, T, F>(&self, convert: F) -> Result<(), TypeConversionError>
    where
        S: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(&S) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.register(convert, None)
    }

    pub(crate) fn register<S, T, F>(
        &self,
        convert: F,
        policy: Option<ConverterExists>,
    ) -> Result<(), TypeConversionError>
    where
        S: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(&S) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let from = TypeKey::of::<S>();
        let to = TypeKey::of::<T>();
        let erased: ConvertFn = Arc::new(move |value: &Value| {
            let source = value.downcast_ref::<S>().ok_or_else(|| {
                anyhow::anyhow!("expected {} but got {}", from, value.type_name())
            })?;
            convert(source).map(Value::new)
        });
        self.insert(from, to, erased, policy)
    }

    fn insert(
        &self,
        from: TypeKey,
        to: TypeKey,
        convert: ConvertFn,
        policy: Option<ConverterExists>,
    ) -> Result<(), TypeConversionError> {
        let mut outcome = Ok(());
        self.update(|table| {
            let policy = policy.unwrap_or(table.policy);
            if table.get(from, to).is_some() {
                match policy {
                    ConverterExists::Ignore => {
                        trace!(%from, %to, "type converter already registered, ignoring");
                        return;
                    }
                    ConverterExists::Fail => {
                        outcome = Err(TypeConversionError::ConverterExists { from, to });
                        return;
                    }
                    ConverterExists::Override => {}
                }
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            table
                .exact
                .entry(from)
                .or_default()
                .insert(to, Entry { seq, convert });
            debug!(%from, %to, seq, "type converter registered");
        });
        outcome
    }

    /// Removes the converter for `S -> T`. Returns `true` if one was present.
    pub fn remove_converter<S: 'static, T: 'static>(&self) -> bool {
        let (from, to) = (TypeKey::of::<S>(), TypeKey::of::<T>());
        let mut removed = false;
        self.update(|table| {
            if let Some(targets) = table.exact.get_mut(&from) {
                removed = targets.remove(&to).is_some();
            }
        });
        removed
    }

    /// Declares that a `Sub` may be used wherever a `Super` is wanted.
    pub fn declare_assignable<Sub, Super, F>(&self, upcast: F)
    where
        Sub: Send + Sync + 'static,
        Super: Send + Sync + 'static,
        F: Fn(&Sub) -> Super + Send + Sync + 'static,
    {
        let upcast: UpcastFn = Arc::new(move |value: &Value| {
            value.downcast_ref::<Sub>().map(|sub| Value::new(upcast(sub)))
        });
        self.update(|table| {
            table
                .hierarchy
                .declare(TypeKey::of::<Sub>(), TypeKey::of::<Super>(), upcast);
        });
    }

    /// Replaces the intermediate types tried for two-hop conversions, in order.
    pub fn set_intermediates(&self, intermediates: Vec<TypeKey>) {
        self.update(|table| table.intermediates = intermediates);
    }

    pub fn set_converter_exists_policy(&self, policy: ConverterExists) {
        self.update(|table| table.policy = policy);
    }

    #[must_use]
    pub fn converter_exists_policy(&self) -> ConverterExists {
        self.table.load().policy
    }

    /// Runs a collaborator-supplied loader against this registry.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error.
    pub fn load(&self, loader: &dyn TypeConverterLoader) -> anyhow::Result<()> {
        loader.load(self)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn has_converter(&self, from: TypeKey, to: TypeKey) -> bool {
        self.table.load().get(from, to).is_some()
    }

    /// Number of registered `(source, target)` pairs.
    #[must_use]
    pub fn size(&self) -> usize {
        self.table.load().exact.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_assignable(&self, from: TypeKey, to: TypeKey) -> bool {
        self.table.load().hierarchy.is_assignable(from, to)
    }

    /// Converts `value` to `target`.
    ///
    /// Returns `Ok(None)` when no conversion path exists.
    ///
    /// # Errors
    ///
    /// Returns [`TypeConversionError::Failed`] when a converter was found but
    /// failed on this value.
    pub fn convert(
        &self,
        target: TypeKey,
        value: &Value,
    ) -> Result<Option<Value>, TypeConversionError> {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let result = self.lookup(target, value);
        match &result {
            Ok(Some(_)) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            Ok(None) => self.counters.misses.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Like [`convert`](Self::convert) but collapses failures into `None`.
    #[must_use]
    pub fn try_convert(&self, target: TypeKey, value: &Value) -> Option<Value> {
        self.convert(target, value).ok().flatten()
    }

    /// Like [`convert`](Self::convert) but a missing conversion is an error.
    ///
    /// # Errors
    ///
    /// Returns [`TypeConversionError::NoConversionAvailable`] or
    /// [`TypeConversionError::Failed`].
    pub fn mandatory_convert(
        &self,
        target: TypeKey,
        value: &Value,
    ) -> Result<Value, TypeConversionError> {
        self.convert(target, value)?
            .ok_or(TypeConversionError::NoConversionAvailable {
                from: value.type_key(),
                to: target,
            })
    }

    /// Typed [`convert`](Self::convert).
    ///
    /// # Errors
    ///
    /// See [`convert`](Self::convert).
    pub fn convert_to<T>(&self, value: &Value) -> Result<Option<T>, TypeConversionError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let target = TypeKey::of::<T>();
        match self.convert(target, value)? {
            None => Ok(None),
            Some(converted) => converted.cloned::<T>().map(Some).ok_or_else(|| {
                TypeConversionError::Failed {
                    from: value.type_key(),
                    to: target,
                    message: format!("converter produced {}", converted.type_name()),
                }
            }),
        }
    }

    /// Typed [`try_convert`](Self::try_convert).
    #[must_use]
    pub fn try_convert_to<T>(&self, value: &Value) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.convert_to::<T>(value).ok().flatten()
    }

    /// Typed [`mandatory_convert`](Self::mandatory_convert).
    ///
    /// # Errors
    ///
    /// See [`mandatory_convert`](Self::mandatory_convert).
    pub fn mandatory_convert_to<T>(&self, value: &Value) -> Result<T, TypeConversionError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.convert_to::<T>(value)?
            .ok_or(TypeConversionError::NoConversionAvailable {
                from: value.type_key(),
                to: TypeKey::of::<T>(),
            })
    }

    fn lookup(&self, target: TypeKey, value: &Value) -> Result<Option<Value>, TypeConversionError> {
        let table = self.table.load();
        let source = value.type_key();
        let run = |entry: &Entry, input: &Value, to: TypeKey| {
            (entry.convert)(input).map_err(|err| TypeConversionError::Failed {
                from: input.type_key(),
                to,
                message: format!("{err:#}"),
            })
        };

        // 1. already the target, or assignable to it
        if let Some(up) = table.hierarchy.path(source, target) {
            if let Some(v) = up.apply(value) {
                return Ok(Some(v));
            }
        }

        // 2. exact
        if let Some(entry) = table.get(source, target) {
            return run(entry, value, target).map(Some);
        }

        // 3. nearest converter whose output is assignable to the target
        let candidate = table
            .exact
            .get(&source)
            .into_iter()
            .flat_map(HashMap::iter)
            .filter_map(|(to, entry)| {
                table
                    .hierarchy
                    .path(*to, target)
                    .map(|up| (up.distance(), entry.seq, *to, entry, up))
            })
            .min_by_key(|(distance, seq, ..)| (*distance, *seq));
        if let Some((distance, _, to, entry, up)) = candidate {
            trace!(%source, via = %to, %target, distance, "assignable type converter");
            let converted = run(entry, value, to)?;
            return up
                .apply(&converted)
                .map(Some)
                .ok_or_else(|| TypeConversionError::Failed {
                    from: to,
                    to: target,
                    message: "upcast rejected converted value".to_string(),
                });
        }

        // 4. two hops through an intermediate
        for &via in &table.intermediates {
            if via == source || via == target {
                continue;
            }
            if let (Some(first), Some(second)) = (table.get(source, via), table.get(via, target)) {
                trace!(%source, %via, %target, "two-hop type conversion");
                let middle = run(first, value, via)?;
                return run(second, &middle, target).map(Some);
            }
        }

        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn statistics(&self) -> ConverterStatistics {
        ConverterStatistics {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset_statistics(&self) {
        self.counters.attempts.store(0, Ordering::Relaxed);
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.failures.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    fn parse_registry() -> TypeConverterRegistry {
        let registry = TypeConverterRegistry::new();
        registry
            .add_converter::<String, i64, _>(|s| Ok(s.trim().parse::<i64>()?))
            .unwrap();
        registry
    }

    #[test]
    fn string_to_integer_found_and_failed() {
        let registry = parse_registry();

        let v = registry
            .convert(TypeKey::of::<i64>(), &Value::from("42"))
            .unwrap()
            .unwrap();
        assert_eq!(v.cloned::<i64>(), Some(42));

        let err = registry
            .convert(TypeKey::of::<i64>(), &Value::from("abc"))
            .unwrap_err();
        assert!(matches!(err, TypeConversionError::Failed { .. }));
        assert!(registry.try_convert_to::<i64>(&Value::from("abc")).is_none());
    }

    #[test]
    fn missing_conversion_is_none_or_error() {
        let registry = parse_registry();
        let v = Value::from(true);
        assert!(registry.convert(TypeKey::of::<i64>(), &v).unwrap().is_none());
        assert!(matches!(
            registry.mandatory_convert(TypeKey::of::<i64>(), &v),
            Err(TypeConversionError::NoConversionAvailable { .. })
        ));
    }

    #[test]
    fn identity_returns_same_allocation() {
        let registry = TypeConverterRegistry::new();
        let v = Value::from("same");
        let out = registry.mandatory_convert(TypeKey::of::<String>(), &v).unwrap();
        assert!(out.ptr_eq(&v));
    }

    #[test]
    fn converter_exists_policies() {
        let registry = parse_registry();
        registry
            .add_converter::<String, i64, _>(|_| Ok(1))
            .unwrap();
        assert_eq!(registry.try_convert_to::<i64>(&Value::from("9")), Some(1));

        registry.set_converter_exists_policy(ConverterExists::Ignore);
        registry
            .add_converter::<String, i64, _>(|_| Ok(2))
            .unwrap();
        assert_eq!(registry.try_convert_to::<i64>(&Value::from("9")), Some(1));

        registry.set_converter_exists_policy(ConverterExists::Fail);
        let err = registry
            .add_converter::<String, i64, _>(|_| Ok(3))
            .unwrap_err();
        assert!(matches!(err, TypeConversionError::ConverterExists { .. }));
        assert_eq!(registry.size(), 1);
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Shape(&'static str);
    #[derive(Clone)]
    struct Polygon(&'static str);
    #[derive(Clone)]
    struct Square;
    #[derive(Clone)]
    struct Circle;

    fn shapes() -> TypeConverterRegistry {
        let registry = TypeConverterRegistry::new();
        registry.declare_assignable::<Polygon, Shape, _>(|p| Shape(p.0));
        registry.declare_assignable::<Square, Polygon, _>(|_| Polygon("square"));
        registry.declare_assignable::<Circle, Shape, _>(|_| Shape("circle"));
        registry
    }

    #[test]
    fn assignable_prefers_nearest_ancestor() {
        let registry = shapes();
        registry
            .add_converter::<String, Square, _>(|_| Ok(Square))
            .unwrap();
        registry
            .add_converter::<String, Polygon, _>(|_| Ok(Polygon("polygon")))
            .unwrap();

        let shape = registry
            .mandatory_convert_to::<Shape>(&Value::from("x"))
            .unwrap();
        assert_eq!(shape, Shape("polygon"));
    }

    #[test]
    fn assignable_tie_goes_to_earliest_registration() {
        let registry = shapes();
        registry
            .add_converter::<String, Circle, _>(|_| Ok(Circle))
            .unwrap();
        registry
            .add_converter::<String, Polygon, _>(|_| Ok(Polygon("polygon")))
            .unwrap();
        assert_eq!(
            registry.mandatory_convert_to::<Shape>(&Value::from("x")).unwrap(),
            Shape("circle")
        );

        // overriding re-registers, moving Circle behind Polygon
        registry
            .add_converter::<String, Circle, _>(|_| Ok(Circle))
            .unwrap();
        assert_eq!(
            registry.mandatory_convert_to::<Shape>(&Value::from("x")).unwrap(),
            Shape("polygon")
        );
    }

    #[test]
    fn value_assignable_to_target_is_upcast() {
        let registry = shapes();
        let shape = registry
            .mandatory_convert_to::<Shape>(&Value::new(Square))
            .unwrap();
        assert_eq!(shape, Shape("square"));
    }

    #[test]
    fn two_hop_through_string() {
        let registry = parse_registry();
        registry
            .add_converter::<Vec<u8>, String, _>(|b| Ok(String::from_utf8(b.clone())?))
            .unwrap();
        let n = registry
            .mandatory_convert_to::<i64>(&Value::from(b"17".to_vec()))
            .unwrap();
        assert_eq!(n, 17);

        registry.set_intermediates(Vec::new());
        assert!(registry
            .convert_to::<i64>(&Value::from(b"17".to_vec()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn statistics_track_outcomes() {
        let registry = parse_registry();
        let _ = registry.convert(TypeKey::of::<i64>(), &Value::from("1"));
        let _ = registry.convert(TypeKey::of::<i64>(), &Value::from("x"));
        let _ = registry.convert(TypeKey::of::<i64>(), &Value::from(1.5_f64));
        let stats = registry.statistics();
        assert_eq!(
            (stats.attempts, stats.hits, stats.failures, stats.misses),
            (3, 1, 1, 1)
        );
        registry.reset_statistics();
        assert_eq!(registry.statistics().attempts, 0);
    }

    #[test]
    fn convert_while_registering_concurrently() {
        let registry = Arc::new(parse_registry());
        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..200_i64 {
                    registry
                        .add_converter::<i64, String, _>(move |n| Ok(format!("{n}-{i}")))
                        .unwrap();
                }
            })
        };
        for _ in 0..200 {
            assert_eq!(registry.try_convert_to::<i64>(&Value::from("5")), Some(5));
        }
        writer.join().unwrap();
        assert_eq!(registry.size(), 2);
    }

    proptest! {
        #[test]
        fn conversion_is_deterministic(input in ".{0,12}") {
            let registry = parse_registry();
            let value = Value::from(input);
            let first = registry.convert_to::<i64>(&value).map_err(|e| e.to_string());
            for _ in 0..3 {
                let again = registry.convert_to::<i64>(&value).map_err(|e| e.to_string());
                prop_assert_eq!(&first, &again);
            }
        }
    }
}
