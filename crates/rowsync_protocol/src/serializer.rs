//! Batch part serializers and CBOR helpers.
//!
//! Part files are written by a [`BatchSerializer`] chosen by key. Manifests
//! are always JSON regardless of the part serializer.

use crate::error::{ProtocolError, ProtocolResult};
use crate::row::{BatchPartContent, SyncRow};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Key of the JSON serializer.
pub const JSON_SERIALIZER_KEY: &str = "json";

/// Key of the CBOR serializer.
pub const CBOR_SERIALIZER_KEY: &str = "cbor";

/// Encodes a value as CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

/// Serializes batch part content to and from bytes.
pub trait BatchSerializer: Send + Sync {
    /// Registry key, stored in the batch manifest.
    fn key(&self) -> &'static str;

    /// File extension of part files.
    fn extension(&self) -> &'static str;

    /// Serializes a part.
    fn serialize_part(&self, content: &BatchPartContent) -> ProtocolResult<Vec<u8>>;

    /// Deserializes a part.
    fn deserialize_part(&self, bytes: &[u8]) -> ProtocolResult<BatchPartContent>;

    /// Returns the serialized size of a single row, used to size parts.
    fn row_size(&self, row: &SyncRow) -> ProtocolResult<usize>;
}

/// JSON part serializer (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl BatchSerializer for JsonSerializer {
    fn key(&self) -> &'static str {
        JSON_SERIALIZER_KEY
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn serialize_part(&self, content: &BatchPartContent) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(content)?)
    }

    fn deserialize_part(&self, bytes: &[u8]) -> ProtocolResult<BatchPartContent> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn row_size(&self, row: &SyncRow) -> ProtocolResult<usize> {
        Ok(serde_json::to_vec(row)?.len())
    }
}

/// CBOR part serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl BatchSerializer for CborSerializer {
    fn key(&self) -> &'static str {
        CBOR_SERIALIZER_KEY
    }

    fn extension(&self) -> &'static str {
        "cbor"
    }

    fn serialize_part(&self, content: &BatchPartContent) -> ProtocolResult<Vec<u8>> {
        to_cbor(content)
    }

    fn deserialize_part(&self, bytes: &[u8]) -> ProtocolResult<BatchPartContent> {
        from_cbor(bytes)
    }

    fn row_size(&self, row: &SyncRow) -> ProtocolResult<usize> {
        Ok(to_cbor(row)?.len())
    }
}

/// Looks up a serializer by key.
pub fn serializer_for(key: &str) -> ProtocolResult<Box<dyn BatchSerializer>> {
    match key {
        JSON_SERIALIZER_KEY => Ok(Box::new(JsonSerializer)),
        CBOR_SERIALIZER_KEY => Ok(Box::new(CborSerializer)),
        other => Err(ProtocolError::UnknownSerializer(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::TableChanges;
    use crate::value::SyncValue;

    fn content() -> BatchPartContent {
        let mut table = TableChanges::new("customer", vec!["id".into(), "name".into(), "photo".into()]);
        table.rows.push(SyncRow::upsert(vec![
            1.into(),
            "Ada".into(),
            SyncValue::Bytes(vec![0, 255]),
        ]));
        table.rows.push(SyncRow::upsert(vec![2.into(), 2.5.into(), SyncValue::Null]));
        table.rows.push(SyncRow::deleted(vec![3.into(), SyncValue::Null, SyncValue::Null]));
        BatchPartContent::single(table)
    }

    #[test]
    fn both_serializers_preserve_content() {
        for key in [JSON_SERIALIZER_KEY, CBOR_SERIALIZER_KEY] {
            let serializer = serializer_for(key).unwrap();
            assert_eq!(serializer.key(), key);
            let bytes = serializer.serialize_part(&content()).unwrap();
            let decoded = serializer.deserialize_part(&bytes).unwrap();
            assert_eq!(decoded, content(), "serializer {key}");
        }
    }

    #[test]
    fn row_size_matches_encoding() {
        let row = SyncRow::upsert(vec![1.into(), "Ada".into()]);
        let size = JsonSerializer.row_size(&row).unwrap();
        assert_eq!(size, serde_json::to_vec(&row).unwrap().len());
    }

    #[test]
    fn unknown_serializer() {
        assert!(matches!(
            serializer_for("xml"),
            Err(ProtocolError::UnknownSerializer(_))
        ));
    }

    #[test]
    fn cbor_rejects_garbage() {
        let result: ProtocolResult<BatchPartContent> = from_cbor(&[0xff, 0x00]);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }
}
