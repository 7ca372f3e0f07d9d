//! Record Data Structure
//!
//! A [`Record`] is the unit flowing through every graph: an ordered,
//! fixed-arity tuple of typed values tagged with the schema it belongs to, an
//! identity key (service name, instance id, ...) and a coarse time bucket.
//!
//! ## Aggregation key
//! Two records aggregate together when they share `(id, time_bucket)`. The
//! storage id derived from that key is `"{time_bucket}_{id}"`.
//!
//! ## Wire format
//! ```text
//! schema_id (varint) | time_bucket (zigzag) | id (len + utf8)
//! field_count (varint) | field*
//! field = tag u8 (0=STRING 1=INT 2=LONG) | len + utf8 | zigzag
//! ```
//! The same bytes go into buffer log frames and remote dispatch frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::schema::{FieldKind, SchemaId};
use crate::varint::{
    decode_varint, decode_varint_u64, encode_varint, encode_varint_u64, varint_len_u64,
};
use crate::{Error, Result};

/// Upper bound on fields per record accepted by the decoder.
const MAX_FIELDS: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i32),
    Long(i64),
}

impl Value {
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Str(_) => FieldKind::String,
            Value::Int(_) => FieldKind::Int,
            Value::Long(_) => FieldKind::Long,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.as_long().is_some_and(|v| v < 0)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// `(identity key, time bucket)`: records sharing it merge into one accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub id: String,
    pub time_bucket: i64,
}

impl AggregationKey {
    pub fn storage_id(&self) -> String {
        format!("{}_{}", self.time_bucket, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub schema_id: SchemaId,
    pub id: String,
    pub time_bucket: i64,
    pub values: Vec<Value>,
}

impl Record {
    pub fn new(
        schema_id: SchemaId,
        id: impl Into<String>,
        time_bucket: i64,
        values: Vec<Value>,
    ) -> Self {
        Self {
            schema_id,
            id: id.into(),
            time_bucket,
            values,
        }
    }

    pub fn aggregation_key(&self) -> AggregationKey {
        AggregationKey {
            id: self.id.clone(),
            time_bucket: self.time_bucket,
        }
    }

    /// Row id used by the DAO layer.
    pub fn storage_id(&self) -> String {
        format!("{}_{}", self.time_bucket, self.id)
    }

    /// Exact size of [`Record::encode`] output.
    pub fn encoded_len(&self) -> usize {
        let mut len = varint_len_u64(u64::from(self.schema_id))
            + varint_len_u64(zigzag(self.time_bucket))
            + str_len(&self.id)
            + varint_len_u64(self.values.len() as u64);
        for value in &self.values {
            len += 1 + match value {
                Value::Str(s) => str_len(s),
                Value::Int(v) => varint_len_u64(zigzag(i64::from(*v))),
                Value::Long(v) => varint_len_u64(zigzag(*v)),
            };
        }
        len
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        encode_varint_u64(buf, u64::from(self.schema_id));
        encode_varint(buf, self.time_bucket);
        put_str(buf, &self.id);
        encode_varint_u64(buf, self.values.len() as u64);
        for value in &self.values {
            buf.put_u8(value.kind().tag());
            match value {
                Value::Str(s) => put_str(buf, s),
                Value::Int(v) => encode_varint(buf, i64::from(*v)),
                Value::Long(v) => encode_varint(buf, *v),
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one record, consuming exactly its bytes from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let schema_id = decode_varint_u64(buf)?;
        let schema_id = SchemaId::try_from(schema_id)
            .map_err(|_| Error::Decode(format!("schema id {schema_id} out of range")))?;
        let time_bucket = decode_varint(buf)?;
        let id = get_str(buf)?;

        let count = decode_varint_u64(buf)?;
        if count > MAX_FIELDS {
            return Err(Error::Decode(format!("field count {count} exceeds limit")));
        }

        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if !buf.has_remaining() {
                return Err(Error::Decode("truncated field tag".to_string()));
            }
            let value = match FieldKind::from_tag(buf.get_u8())? {
                FieldKind::String => Value::Str(get_str(buf)?),
                FieldKind::Int => {
                    let v = decode_varint(buf)?;
                    Value::Int(
                        i32::try_from(v)
                            .map_err(|_| Error::Decode(format!("INT value {v} out of range")))?,
                    )
                }
                FieldKind::Long => Value::Long(decode_varint(buf)?),
            };
            values.push(value);
        }

        Ok(Self {
            schema_id,
            id,
            time_bucket,
            values,
        })
    }

    /// Decode a buffer holding exactly one record.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let record = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after record",
                bytes.len()
            )));
        }
        Ok(record)
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn str_len(s: &str) -> usize {
    varint_len_u64(s.len() as u64) + s.len()
}

fn put_str(buf: &mut impl BufMut, s: &str) {
    encode_varint_u64(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut impl Buf) -> Result<String> {
    let len = decode_varint_u64(buf)?;
    if len > buf.remaining() as u64 {
        return Err(Error::Decode(format!(
            "string of {len} bytes exceeds remaining {}",
            buf.remaining()
        )));
    }
    let bytes = buf.copy_to_bytes(len as usize);
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode(e.to_string()))
}
