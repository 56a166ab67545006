//! Type transcoder registry.
//!
//! A [`Registry`] maps a type [`Oid`] to a [`Transcoder`] that converts
//! between wire bytes and [`PgValue`]s, in text or binary format.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES
//!
//! One registry is shared (behind an `Arc`) by every connection of a pool.
//! Lookups take a read lock; registration is meant to happen at setup time.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{PgError, PgResult};
use crate::protocol::Format;
use crate::types::{Oid, PgValue};

/// Bidirectional conversion for one PostgreSQL type.
///
/// Implementations must be pure: no connection or global state. NULL never
/// reaches a transcoder; the codec handles it.
pub trait Transcoder: Send + Sync {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue>;

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()>;

    /// Format used for parameters and requested for result columns.
    fn preferred_format(&self) -> Format {
        Format::Binary
    }
}

// ============================================================================
// Registry
// ============================================================================

type TranscoderMap = HashMap<Oid, Arc<dyn Transcoder>>;

/// Built-in transcoders, constructed once and copied into each new registry.
static BUILTIN: Lazy<TranscoderMap> = Lazy::new(|| {
    let mut map: TranscoderMap = HashMap::new();
    let text: Arc<dyn Transcoder> = Arc::new(TextTranscoder);

    map.insert(Oid::BOOL, Arc::new(BoolTranscoder));
    map.insert(Oid::INT2, Arc::new(IntTranscoder::INT2));
    map.insert(Oid::INT4, Arc::new(IntTranscoder::INT4));
    map.insert(Oid::INT8, Arc::new(IntTranscoder::INT8));
    map.insert(Oid::FLOAT4, Arc::new(FloatTranscoder::FLOAT4));
    map.insert(Oid::FLOAT8, Arc::new(FloatTranscoder::FLOAT8));
    for oid in [Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::NAME, Oid::CHAR] {
        map.insert(oid, Arc::clone(&text));
    }
    map.insert(Oid::BYTEA, Arc::new(ByteaTranscoder));
    map.insert(Oid::UUID, Arc::new(UuidTranscoder));
    map.insert(Oid::DATE, Arc::new(DateTranscoder));
    map.insert(Oid::TIME, Arc::new(TimeTranscoder));
    map.insert(Oid::TIMESTAMP, Arc::new(TimestampTranscoder));
    map.insert(Oid::TIMESTAMPTZ, Arc::new(TimestampTzTranscoder));
    map.insert(Oid::JSON, Arc::new(JsonTranscoder::JSON));
    map.insert(Oid::JSONB, Arc::new(JsonTranscoder::JSONB));
    map
});

/// Mapping from type OID to transcoder.
pub struct Registry {
    transcoders: RwLock<TranscoderMap>,
}

impl Registry {
    /// A registry holding the built-in transcoders.
    pub fn new() -> Self {
        Self {
            transcoders: RwLock::new(BUILTIN.clone()),
        }
    }

    /// A registry with no transcoders; every value decodes through the fallback.
    pub fn empty() -> Self {
        Self {
            transcoders: RwLock::new(HashMap::new()),
        }
    }

    /// Install or replace the transcoder for `oid`. Last write wins.
    pub fn register(&self, oid: Oid, transcoder: impl Transcoder + 'static) {
        self.register_arc(oid, Arc::new(transcoder));
    }

    pub fn register_arc(&self, oid: Oid, transcoder: Arc<dyn Transcoder>) {
        self.transcoders.write().insert(oid, transcoder);
    }

    pub fn lookup(&self, oid: Oid) -> Option<Arc<dyn Transcoder>> {
        self.transcoders.read().get(&oid).map(Arc::clone)
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.transcoders.read().contains_key(&oid)
    }

    /// Decode a non-NULL column value.
    ///
    /// Unregistered types fall back to text passthrough (text format) or raw
    /// bytes (binary format).
    pub fn decode(&self, oid: Oid, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match self.lookup(oid) {
            Some(t) => t.decode(format, data),
            None => Ok(match format {
                Format::Text => PgValue::Text(String::from_utf8_lossy(data).into_owned()),
                Format::Binary => PgValue::Raw {
                    oid,
                    data: data.to_vec(),
                },
            }),
        }
    }

    /// Encode a non-NULL parameter for a parameter declared as `oid`.
    ///
    /// Raw values pass through in binary. When the declared type has no
    /// transcoder, the value is sent in text format using its own type's
    /// transcoder and the server's input function does the conversion.
    pub fn encode(&self, oid: Oid, value: &PgValue) -> PgResult<(Bytes, Format)> {
        match value {
            PgValue::Null => {
                return Err(PgError::Type(
                    "NULL parameters are not encoded by transcoders".to_string(),
                ))
            }
            PgValue::Raw { data, .. } => return Ok((Bytes::copy_from_slice(data), Format::Binary)),
            _ => {}
        }

        let (transcoder, format) = match self.lookup(oid) {
            Some(t) => {
                let format = t.preferred_format();
                (t, format)
            }
            None => {
                let own = self.lookup(value.type_oid()).ok_or_else(|| {
                    PgError::Type(format!(
                        "No transcoder for parameter of type {} (value {:?})",
                        oid.0, value
                    ))
                })?;
                (own, Format::Text)
            }
        };

        let mut buf = BytesMut::new();
        transcoder.encode(value, format, &mut buf)?;
        Ok((buf.freeze(), format))
    }

    /// Format to request for a result column of type `oid`.
    pub fn result_format(&self, oid: Oid) -> Format {
        self.lookup(oid)
            .map(|t| t.preferred_format())
            .unwrap_or(Format::Text)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut oids: Vec<u32> = self.transcoders.read().keys().map(|o| o.0).collect();
        oids.sort_unstable();
        f.debug_struct("Registry").field("oids", &oids).finish()
    }
}

/// A fresh shared registry with the built-in transcoders.
pub fn default_registry() -> Arc<Registry> {
    Arc::new(Registry::new())
}

// ============================================================================
// Helpers
// ============================================================================

fn utf8<'a>(data: &'a [u8], what: &str) -> PgResult<&'a str> {
    std::str::from_utf8(data).map_err(|e| PgError::Type(format!("Invalid UTF-8 in {}: {}", what, e)))
}

fn fixed<const N: usize>(data: &[u8], what: &str) -> PgResult<[u8; N]> {
    data.try_into()
        .map_err(|_| PgError::Type(format!("Invalid {} length: {}", what, data.len())))
}

fn mismatch(what: &str, value: &PgValue) -> PgError {
    PgError::Type(format!("Cannot encode {:?} as {}", value, what))
}

/// 2000-01-01, the PostgreSQL epoch for binary date/time values.
fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_time(NaiveTime::MIN)
}

// ============================================================================
// Built-in transcoders
// ============================================================================

/// `bool`
#[derive(Debug, Clone, Copy)]
pub struct BoolTranscoder;

impl Transcoder for BoolTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary => {
                let [b] = fixed::<1>(data, "BOOL")?;
                Ok(PgValue::Bool(b != 0))
            }
            Format::Text => match utf8(data, "BOOL")? {
                "t" | "true" | "1" | "yes" | "on" => Ok(PgValue::Bool(true)),
                "f" | "false" | "0" | "no" | "off" => Ok(PgValue::Bool(false)),
                other => Err(PgError::Type(format!("Invalid BOOL: {}", other))),
            },
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let PgValue::Bool(v) = value else {
            return Err(mismatch("BOOL", value));
        };
        match format {
            Format::Binary => buf.put_u8(u8::from(*v)),
            Format::Text => buf.put_slice(if *v { b"t" } else { b"f" }),
        }
        Ok(())
    }
}

/// `int2`, `int4`, `int8`. Accepts any integer value that fits.
#[derive(Debug, Clone, Copy)]
pub struct IntTranscoder {
    width: usize,
}

impl IntTranscoder {
    pub const INT2: Self = Self { width: 2 };
    pub const INT4: Self = Self { width: 4 };
    pub const INT8: Self = Self { width: 8 };

    fn wrap(&self, v: i64) -> PgResult<PgValue> {
        let out_of_range = || PgError::Type(format!("Integer {} out of range for INT{}", v, self.width));
        Ok(match self.width {
            2 => PgValue::Int2(i16::try_from(v).map_err(|_| out_of_range())?),
            4 => PgValue::Int4(i32::try_from(v).map_err(|_| out_of_range())?),
            _ => PgValue::Int8(v),
        })
    }
}

impl Transcoder for IntTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match (format, self.width) {
            (Format::Binary, 2) => Ok(PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?))),
            (Format::Binary, 4) => Ok(PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?))),
            (Format::Binary, _) => Ok(PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?))),
            (Format::Text, _) => {
                let text = utf8(data, "integer")?;
                let v = text
                    .parse::<i64>()
                    .map_err(|e| PgError::Type(format!("Invalid INT{} {:?}: {}", self.width, text, e)))?;
                self.wrap(v)
            }
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let v = value.as_i64().ok_or_else(|| mismatch("integer", value))?;
        let narrowed = self.wrap(v)?;
        match format {
            Format::Text => buf.put_slice(v.to_string().as_bytes()),
            Format::Binary => match narrowed {
                PgValue::Int2(n) => buf.put_i16(n),
                PgValue::Int4(n) => buf.put_i32(n),
                _ => buf.put_i64(v),
            },
        }
        Ok(())
    }
}

/// `float4`, `float8`.
#[derive(Debug, Clone, Copy)]
pub struct FloatTranscoder {
    double: bool,
}

impl FloatTranscoder {
    pub const FLOAT4: Self = Self { double: false };
    pub const FLOAT8: Self = Self { double: true };
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

impl Transcoder for FloatTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary if self.double => Ok(PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?))),
            Format::Binary => Ok(PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?))),
            Format::Text => {
                let text = utf8(data, "float")?;
                let invalid = |e| PgError::Type(format!("Invalid float {:?}: {}", text, e));
                if self.double {
                    text.parse::<f64>().map(PgValue::Float8).map_err(invalid)
                } else {
                    text.parse::<f32>().map(PgValue::Float4).map_err(invalid)
                }
            }
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let v = match *value {
            PgValue::Float4(v) => f64::from(v),
            PgValue::Float8(v) => v,
            PgValue::Int2(v) => f64::from(v),
            PgValue::Int4(v) => f64::from(v),
            _ => return Err(mismatch("float", value)),
        };
        match (format, self.double) {
            (Format::Binary, true) => buf.put_f64(v),
            (Format::Binary, false) => buf.put_f32(v as f32),
            (Format::Text, true) => buf.put_slice(float_text(v).as_bytes()),
            (Format::Text, false) => {
                // Print the f32 itself so the shortest round-tripping digits are used
                let text = match *value {
                    PgValue::Float4(f) if f.is_finite() => f.to_string(),
                    _ => float_text(v),
                };
                buf.put_slice(text.as_bytes())
            }
        }
        Ok(())
    }
}

/// `text`, `varchar`, `bpchar`, `name`, `"char"`: UTF-8 in both formats.
#[derive(Debug, Clone, Copy)]
pub struct TextTranscoder;

impl Transcoder for TextTranscoder {
    fn decode(&self, _format: Format, data: &[u8]) -> PgResult<PgValue> {
        utf8(data, "TEXT").map(|s| PgValue::Text(s.to_owned()))
    }

    fn encode(&self, value: &PgValue, _format: Format, buf: &mut BytesMut) -> PgResult<()> {
        match value {
            PgValue::Text(s) => {
                buf.put_slice(s.as_bytes());
                Ok(())
            }
            _ => Err(mismatch("TEXT", value)),
        }
    }
}

/// `bytea`. Text format uses the `\x` hex encoding.
#[derive(Debug, Clone, Copy)]
pub struct ByteaTranscoder;

fn unescape_bytea(text: &str) -> PgResult<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
        } else if bytes.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let octal = text
                .get(i + 1..i + 4)
                .and_then(|s| u8::from_str_radix(s, 8).ok())
                .ok_or_else(|| PgError::Type("Invalid BYTEA escape sequence".to_string()))?;
            out.push(octal);
            i += 4;
        }
    }
    Ok(out)
}

impl Transcoder for ByteaTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary => Ok(PgValue::Bytea(data.to_vec())),
            Format::Text => {
                let text = utf8(data, "BYTEA")?;
                let bytes = match text.strip_prefix("\\x") {
                    Some(hex_digits) => hex::decode(hex_digits)
                        .map_err(|e| PgError::Type(format!("Invalid BYTEA hex: {}", e)))?,
                    None => unescape_bytea(text)?,
                };
                Ok(PgValue::Bytea(bytes))
            }
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let PgValue::Bytea(data) = value else {
            return Err(mismatch("BYTEA", value));
        };
        match format {
            Format::Binary => buf.put_slice(data),
            Format::Text => {
                buf.put_slice(b"\\x");
                buf.put_slice(hex::encode(data).as_bytes());
            }
        }
        Ok(())
    }
}

/// `uuid`
#[derive(Debug, Clone, Copy)]
pub struct UuidTranscoder;

impl Transcoder for UuidTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary => Ok(PgValue::Uuid(Uuid::from_bytes(fixed(data, "UUID")?))),
            Format::Text => Uuid::parse_str(utf8(data, "UUID")?)
                .map(PgValue::Uuid)
                .map_err(|e| PgError::Type(format!("Invalid UUID: {}", e))),
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let PgValue::Uuid(u) = value else {
            return Err(mismatch("UUID", value));
        };
        match format {
            Format::Binary => buf.put_slice(u.as_bytes()),
            Format::Text => buf.put_slice(u.hyphenated().to_string().as_bytes()),
        }
        Ok(())
    }
}

/// `date`: binary is days since 2000-01-01.
#[derive(Debug, Clone, Copy)]
pub struct DateTranscoder;

impl Transcoder for DateTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary => {
                let days = i32::from_be_bytes(fixed(data, "DATE")?);
                pg_epoch_date()
                    .checked_add_signed(TimeDelta::days(days.into()))
                    .map(PgValue::Date)
                    .ok_or_else(|| PgError::Type(format!("DATE out of range: {} days", days)))
            }
            Format::Text => NaiveDate::parse_from_str(utf8(data, "DATE")?, "%Y-%m-%d")
                .map(PgValue::Date)
                .map_err(|e| PgError::Type(format!("Invalid DATE: {}", e))),
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let PgValue::Date(d) = value else {
            return Err(mismatch("DATE", value));
        };
        match format {
            Format::Binary => {
                let days = d.signed_duration_since(pg_epoch_date()).num_days();
                let days = i32::try_from(days)
                    .map_err(|_| PgError::Type(format!("DATE out of range: {}", d)))?;
                buf.put_i32(days);
            }
            Format::Text => buf.put_slice(d.format("%Y-%m-%d").to_string().as_bytes()),
        }
        Ok(())
    }
}

/// `time`: binary is microseconds since midnight.
#[derive(Debug, Clone, Copy)]
pub struct TimeTranscoder;

impl Transcoder for TimeTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary => {
                let micros = i64::from_be_bytes(fixed(data, "TIME")?);
                let secs = u32::try_from(micros.div_euclid(1_000_000)).ok();
                let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
                secs.and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, nanos))
                    .map(PgValue::Time)
                    .ok_or_else(|| PgError::Type(format!("TIME out of range: {}us", micros)))
            }
            Format::Text => NaiveTime::parse_from_str(utf8(data, "TIME")?, "%H:%M:%S%.f")
                .map(PgValue::Time)
                .map_err(|e| PgError::Type(format!("Invalid TIME: {}", e))),
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let PgValue::Time(t) = value else {
            return Err(mismatch("TIME", value));
        };
        match format {
            Format::Binary => {
                let micros = i64::from(t.num_seconds_from_midnight()) * 1_000_000
                    + i64::from(t.nanosecond() / 1_000);
                buf.put_i64(micros);
            }
            Format::Text => buf.put_slice(t.format("%H:%M:%S%.6f").to_string().as_bytes()),
        }
        Ok(())
    }
}

fn micros_to_datetime(micros: i64) -> PgResult<NaiveDateTime> {
    pg_epoch()
        .checked_add_signed(TimeDelta::microseconds(micros))
        .ok_or_else(|| PgError::Type(format!("TIMESTAMP out of range: {}us", micros)))
}

fn datetime_to_micros(ts: &NaiveDateTime) -> PgResult<i64> {
    ts.signed_duration_since(pg_epoch())
        .num_microseconds()
        .ok_or_else(|| PgError::Type(format!("TIMESTAMP out of range: {}", ts)))
}

/// `timestamp`: binary is microseconds since 2000-01-01 00:00:00.
#[derive(Debug, Clone, Copy)]
pub struct TimestampTranscoder;

impl Transcoder for TimestampTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary => micros_to_datetime(i64::from_be_bytes(fixed(data, "TIMESTAMP")?))
                .map(PgValue::Timestamp),
            Format::Text => NaiveDateTime::parse_from_str(utf8(data, "TIMESTAMP")?, "%Y-%m-%d %H:%M:%S%.f")
                .map(PgValue::Timestamp)
                .map_err(|e| PgError::Type(format!("Invalid TIMESTAMP: {}", e))),
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let PgValue::Timestamp(ts) = value else {
            return Err(mismatch("TIMESTAMP", value));
        };
        match format {
            Format::Binary => buf.put_i64(datetime_to_micros(ts)?),
            Format::Text => buf.put_slice(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string().as_bytes()),
        }
        Ok(())
    }
}

/// `timestamptz`: binary is UTC microseconds since 2000-01-01.
#[derive(Debug, Clone, Copy)]
pub struct TimestampTzTranscoder;

impl Transcoder for TimestampTzTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        match format {
            Format::Binary => micros_to_datetime(i64::from_be_bytes(fixed(data, "TIMESTAMPTZ")?))
                .map(|naive| PgValue::TimestampTz(naive.and_utc())),
            Format::Text => {
                let text = utf8(data, "TIMESTAMPTZ")?;
                // The server prints offsets as +HH, +HH:MM or +HH:MM:SS depending on the zone
                ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"]
                    .iter()
                    .find_map(|fmt| DateTime::parse_from_str(text, fmt).ok())
                    .map(|dt| PgValue::TimestampTz(dt.with_timezone(&Utc)))
                    .ok_or_else(|| PgError::Type(format!("Invalid TIMESTAMPTZ: {:?}", text)))
            }
        }
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        let PgValue::TimestampTz(ts) = value else {
            return Err(mismatch("TIMESTAMPTZ", value));
        };
        match format {
            Format::Binary => buf.put_i64(datetime_to_micros(&ts.naive_utc())?),
            Format::Text => buf.put_slice(ts.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string().as_bytes()),
        }
        Ok(())
    }
}

/// `json`, `jsonb`. Binary jsonb carries a leading version byte.
///
/// A `PgValue::Text` parameter is taken as already-serialized JSON.
#[derive(Debug, Clone, Copy)]
pub struct JsonTranscoder {
    jsonb: bool,
}

impl JsonTranscoder {
    pub const JSON: Self = Self { jsonb: false };
    pub const JSONB: Self = Self { jsonb: true };
    const JSONB_VERSION: u8 = 1;
}

impl Transcoder for JsonTranscoder {
    fn decode(&self, format: Format, data: &[u8]) -> PgResult<PgValue> {
        let json = match (format, self.jsonb) {
            (Format::Binary, true) => match data.split_first() {
                Some((&Self::JSONB_VERSION, rest)) => rest,
                Some((v, _)) => return Err(PgError::Type(format!("Unsupported JSONB version: {}", v))),
                None => return Err(PgError::Type("Empty JSONB value".to_string())),
            },
            _ => data,
        };
        serde_json::from_slice(json)
            .map(PgValue::Json)
            .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))
    }

    fn encode(&self, value: &PgValue, format: Format, buf: &mut BytesMut) -> PgResult<()> {
        if format == Format::Binary && self.jsonb {
            buf.put_u8(Self::JSONB_VERSION);
        }
        match value {
            PgValue::Json(v) => {
                let text = serde_json::to_vec(v).map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))?;
                buf.put_slice(&text);
            }
            PgValue::Text(s) => buf.put_slice(s.as_bytes()),
            _ => return Err(mismatch("JSON", value)),
        }
        Ok(())
    }
}
