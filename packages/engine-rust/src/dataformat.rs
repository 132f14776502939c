//! Built-in data formats: `json`, `msgpack` and `text`.
//!
//! The dynamic formats read into `serde_json::Value`. [`TypedJson`] reads
//! into a concrete serde type instead.

use std::io::{Read, Write};
use std::marker::PhantomData;

use anyhow::bail;
use serde::de::DeserializeOwned;
use serde::Serialize;
use switchyard_core::{DataFormat, Exchange, Value};

/// Best-effort view of a body as a JSON tree.
///
/// Handles JSON values, text, scalars and `Vec<Value>` bodies such as the
/// output of a collecting splitter.
pub fn body_to_json(body: &Value) -> anyhow::Result<serde_json::Value> {
    use serde_json::Value as Json;

    if let Some(json) = body.downcast_ref::<Json>() {
        return Ok(json.clone());
    }
    if let Some(s) = body.as_str() {
        return Ok(Json::String(s.to_string()));
    }
    if let Some(b) = body.downcast_ref::<bool>() {
        return Ok(Json::Bool(*b));
    }
    if let Some(n) = body.downcast_ref::<i64>() {
        return Ok(Json::from(*n));
    }
    if let Some(n) = body.downcast_ref::<i32>() {
        return Ok(Json::from(*n));
    }
    if let Some(n) = body.downcast_ref::<u64>() {
        return Ok(Json::from(*n));
    }
    if let Some(n) = body.downcast_ref::<u32>() {
        return Ok(Json::from(*n));
    }
    if let Some(n) = body.downcast_ref::<f64>() {
        return Ok(Json::from(*n));
    }
    if let Some(items) = body.downcast_ref::<Vec<Value>>() {
        return items
            .iter()
            .map(body_to_json)
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Json::Array);
    }
    bail!("no JSON representation for body of type {}", body.type_name())
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDataFormat;

impl DataFormat for JsonDataFormat {
    fn name(&self) -> &str {
        "json"
    }

    fn marshal(
        &self,
        _exchange: &Exchange,
        body: &Value,
        output: &mut dyn Write,
    ) -> anyhow::Result<()> {
        serde_json::to_writer(output, &body_to_json(body)?)?;
        Ok(())
    }

    fn unmarshal(&self, _exchange: &Exchange, input: &mut dyn Read) -> anyhow::Result<Value> {
        let json: serde_json::Value = serde_json::from_reader(input)?;
        Ok(Value::new(json))
    }
}

/// JSON bound to one serde type. Bodies of type `T` are written directly;
/// other bodies go through the dynamic JSON view.
pub struct TypedJson<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedJson<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("json<{}>", std::any::type_name::<T>()),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedJson<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DataFormat for TypedJson<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn marshal(
        &self,
        _exchange: &Exchange,
        body: &Value,
        output: &mut dyn Write,
    ) -> anyhow::Result<()> {
        match body.downcast_ref::<T>() {
            Some(typed) => serde_json::to_writer(output, typed)?,
            None => serde_json::to_writer(output, &body_to_json(body)?)?,
        }
        Ok(())
    }

    fn unmarshal(&self, _exchange: &Exchange, input: &mut dyn Read) -> anyhow::Result<Value> {
        let typed: T = serde_json::from_reader(input)?;
        Ok(Value::new(typed))
    }
}

// ---------------------------------------------------------------------------
// MessagePack
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackDataFormat;

impl DataFormat for MsgpackDataFormat {
    fn name(&self) -> &str {
        "msgpack"
    }

    fn marshal(
        &self,
        _exchange: &Exchange,
        body: &Value,
        output: &mut dyn Write,
    ) -> anyhow::Result<()> {
        let encoded = rmp_serde::to_vec_named(&body_to_json(body)?)?;
        output.write_all(&encoded)?;
        Ok(())
    }

    fn unmarshal(&self, _exchange: &Exchange, input: &mut dyn Read) -> anyhow::Result<Value> {
        let mut raw = Vec::new();
        input.read_to_end(&mut raw)?;
        let json: serde_json::Value = rmp_serde::from_slice(&raw)?;
        Ok(Value::new(json))
    }
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// UTF-8 text. Byte bodies are written through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDataFormat;

impl DataFormat for TextDataFormat {
    fn name(&self) -> &str {
        "text"
    }

    fn marshal(
        &self,
        _exchange: &Exchange,
        body: &Value,
        output: &mut dyn Write,
    ) -> anyhow::Result<()> {
        if let Some(s) = body.as_str() {
            output.write_all(s.as_bytes())?;
        } else if let Some(raw) = body.downcast_ref::<Vec<u8>>() {
            output.write_all(raw)?;
        } else if let Some(raw) = body.downcast_ref::<bytes::Bytes>() {
            output.write_all(raw)?;
        } else {
            bail!("text format cannot write a body of type {}", body.type_name());
        }
        Ok(())
    }

    fn unmarshal(&self, _exchange: &Exchange, input: &mut dyn Read) -> anyhow::Result<Value> {
        let mut text = String::new();
        input.read_to_string(&mut text)?;
        Ok(Value::new(text))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    fn write(format: &dyn DataFormat, body: Value) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        format.marshal(&Exchange::new(), &body, &mut out)?;
        Ok(out)
    }

    fn read(format: &dyn DataFormat, raw: &[u8]) -> anyhow::Result<Value> {
        format.unmarshal(&Exchange::new(), &mut &raw[..])
    }

    #[test]
    fn json_writes_text_and_collected_bodies() {
        let out = write(&JsonDataFormat, Value::from("hi")).unwrap();
        assert_eq!(out, br#""hi""#);

        let bodies = Value::new(vec![Value::from(1_i64), Value::from("two")]);
        let out = write(&JsonDataFormat, bodies).unwrap();
        assert_eq!(out, br#"[1,"two"]"#);
    }

    #[test]
    fn json_rejects_opaque_bodies() {
        struct Opaque;
        let err = write(&JsonDataFormat, Value::new(Opaque)).unwrap_err();
        assert!(err.to_string().contains("no JSON representation"));
    }

    #[test]
    fn msgpack_reads_what_it_writes() {
        let doc = serde_json::json!({"name": "switch", "ports": [1, 2]});
        let raw = write(&MsgpackDataFormat, Value::new(doc.clone())).unwrap();
        let back = read(&MsgpackDataFormat, &raw).unwrap();
        assert_eq!(back.downcast_ref::<serde_json::Value>(), Some(&doc));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        item: String,
    }

    #[test]
    fn typed_json_produces_the_declared_type() {
        let format = TypedJson::<Order>::new();
        let value = read(&format, br#"{"id":3,"item":"bolt"}"#).unwrap();
        assert_eq!(
            value.downcast_ref::<Order>(),
            Some(&Order { id: 3, item: "bolt".into() })
        );
        assert!(read(&format, br#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn text_handles_strings_and_bytes() {
        assert_eq!(
            write(&TextDataFormat, Value::from("héllo")).unwrap(),
            "héllo".as_bytes()
        );
        assert_eq!(
            write(&TextDataFormat, Value::from(vec![1_u8, 2])).unwrap(),
            vec![1, 2]
        );
        assert!(write(&TextDataFormat, Value::from(5_i64)).is_err());
        assert!(read(&TextDataFormat, &[0xff, 0xfe]).is_err());
        assert_eq!(read(&TextDataFormat, b"ok").unwrap().as_str(), Some("ok"));
    }
}
