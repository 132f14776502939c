//! Converters every registry starts with: text, raw bytes, numbers, booleans
//! and JSON.

use std::str::FromStr;

use bytes::Bytes;

use super::{ConverterExists, TypeConverterLoader, TypeConverterRegistry};

/// Loader form of the built-in set, for registries created with
/// [`TypeConverterRegistry::new`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinConverters;

impl TypeConverterLoader for BuiltinConverters {
    fn load(&self, registry: &TypeConverterRegistry) -> anyhow::Result<()> {
        install(registry);
        Ok(())
    }
}

fn put<S, T>(registry: &TypeConverterRegistry, convert: fn(&S) -> anyhow::Result<T>)
where
    S: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    // Override never reports an existing converter.
    let _ = registry.register(convert, Some(ConverterExists::Override));
}

fn parse<T>(s: &String) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(s.trim().parse::<T>()?)
}

fn display<T: ToString>(v: &T) -> anyhow::Result<String> {
    Ok(v.to_string())
}

fn parse_bool(s: &String) -> anyhow::Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => anyhow::bail!("`{other}` is not a boolean"),
    }
}

pub(crate) fn install(registry: &TypeConverterRegistry) {
    // text <-> scalars
    put::<String, i64>(registry, parse);
    put::<String, i32>(registry, parse);
    put::<String, u32>(registry, parse);
    put::<String, u64>(registry, parse);
    put::<String, f64>(registry, parse);
    put::<String, bool>(registry, parse_bool);
    put::<i64, String>(registry, display);
    put::<i32, String>(registry, display);
    put::<u32, String>(registry, display);
    put::<u64, String>(registry, display);
    put::<f64, String>(registry, display);
    put::<bool, String>(registry, display);

    // numeric widening and narrowing
    put::<i32, i64>(registry, |n| Ok(i64::from(*n)));
    put::<u32, i64>(registry, |n| Ok(i64::from(*n)));
    put::<i64, i32>(registry, |n| Ok(i32::try_from(*n)?));
    put::<u64, i64>(registry, |n| Ok(i64::try_from(*n)?));
    put::<i64, u64>(registry, |n| Ok(u64::try_from(*n)?));
    put::<i32, f64>(registry, |n| Ok(f64::from(*n)));
    put::<u32, f64>(registry, |n| Ok(f64::from(*n)));

    // text <-> bytes
    put::<String, Vec<u8>>(registry, |s| Ok(s.clone().into_bytes()));
    put::<Vec<u8>, String>(registry, |b| Ok(String::from_utf8(b.clone())?));
    put::<String, Bytes>(registry, |s| Ok(Bytes::from(s.clone())));
    put::<Bytes, String>(registry, |b| Ok(std::str::from_utf8(b)?.to_string()));
    put::<Vec<u8>, Bytes>(registry, |b| Ok(Bytes::from(b.clone())));
    put::<Bytes, Vec<u8>>(registry, |b| Ok(b.to_vec()));

    // json
    put::<serde_json::Value, String>(registry, |j| match j {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    });
    put::<String, serde_json::Value>(registry, |s| Ok(serde_json::from_str(s)?));
    put::<Vec<u8>, serde_json::Value>(registry, |b| Ok(serde_json::from_slice(b)?));
    put::<serde_json::Value, Vec<u8>>(registry, |j| Ok(serde_json::to_vec(j)?));
    put::<serde_json::Value, i64>(registry, |j| {
        j.as_i64()
            .ok_or_else(|| anyhow::anyhow!("json value {j} is not an integer"))
    });
    put::<serde_json::Value, f64>(registry, |j| {
        j.as_f64()
            .ok_or_else(|| anyhow::anyhow!("json value {j} is not a number"))
    });
    put::<serde_json::Value, bool>(registry, |j| {
        j.as_bool()
            .ok_or_else(|| anyhow::anyhow!("json value {j} is not a boolean"))
    });
    put::<i64, serde_json::Value>(registry, |n| Ok(serde_json::Value::from(*n)));
    put::<f64, serde_json::Value>(registry, |n| Ok(serde_json::Value::from(*n)));
    put::<bool, serde_json::Value>(registry, |b| Ok(serde_json::Value::from(*b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn text_and_numbers() {
        let r = TypeConverterRegistry::with_builtins();
        assert_eq!(r.try_convert_to::<i64>(&Value::from(" 42 ")), Some(42));
        assert_eq!(r.try_convert_to::<f64>(&Value::from("2.5")), Some(2.5));
        assert_eq!(r.try_convert_to::<bool>(&Value::from("Yes")), Some(true));
        assert_eq!(
            r.try_convert_to::<String>(&Value::from(7_i64)).as_deref(),
            Some("7")
        );
    }

    #[test]
    fn narrowing_overflow_fails() {
        let r = TypeConverterRegistry::with_builtins();
        assert!(r.convert_to::<i32>(&Value::from(i64::MAX)).is_err());
        assert_eq!(r.try_convert_to::<i32>(&Value::from(12_i64)), Some(12));
    }

    #[test]
    fn bytes_through_string_two_hop() {
        let r = TypeConverterRegistry::with_builtins();
        let n = r
            .mandatory_convert_to::<i64>(&Value::from(Bytes::from_static(b"99")))
            .unwrap();
        assert_eq!(n, 99);
    }

    #[test]
    fn invalid_utf8_is_a_failure_not_a_miss() {
        let r = TypeConverterRegistry::with_builtins();
        let err = r.convert_to::<String>(&Value::from(vec![0xff_u8, 0xfe]));
        assert!(err.is_err());
    }

    #[test]
    fn json_round_trips_through_text() {
        let r = TypeConverterRegistry::with_builtins();
        let json = r
            .mandatory_convert_to::<serde_json::Value>(&Value::from(r#"{"a":1}"#))
            .unwrap();
        assert_eq!(json["a"], 1);
        let s = r
            .mandatory_convert_to::<String>(&Value::from(serde_json::json!("plain")))
            .unwrap();
        assert_eq!(s, "plain");
    }

    #[test]
    fn loader_installs_into_empty_registry() {
        let r = TypeConverterRegistry::new();
        assert_eq!(r.size(), 0);
        r.load(&BuiltinConverters).unwrap();
        assert!(r.size() > 20);
    }
}
