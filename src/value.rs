use std::collections::BTreeMap;
use std::fmt;

use crate::chainpack::{ChainPackReader, ChainPackWriter};
use crate::cpon::{CponReader, CponWriter};
use crate::error::Error;

/** Arbitrary-precision style decimal: mantissa * 10^exponent. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    pub mantissa: i64,
    pub exponent: i32,
}

impl Decimal {
    pub fn new(mantissa: i64, exponent: i32) -> Decimal {
        Decimal { mantissa, exponent }
    }
}

/** Point in time as epoch milliseconds plus a UTC offset in minutes.

The offset does not shift the instant, it only records the wall-clock zone
the stamp was produced in. ChainPack stores it at 15 minute granularity. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub epoch_msec: i64,
    pub utc_offset_min: i32,
}

impl DateTime {
    pub fn new(epoch_msec: i64, utc_offset_min: i32) -> DateTime {
        DateTime {
            epoch_msec,
            utc_offset_min,
        }
    }

    pub fn now() -> DateTime {
        let t = time::OffsetDateTime::now_utc();
        DateTime {
            epoch_msec: (t.unix_timestamp_nanos() / 1_000_000) as i64,
            utc_offset_min: 0,
        }
    }
}

/** Meta annotation attached to a value.

Keys may be integers or text. Both kinds are kept sorted so writers emit
integer keys ascending first, then text keys ascending. */
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaMap {
    pub int_keys: BTreeMap<i64, RpcValue>,
    pub str_keys: BTreeMap<String, RpcValue>,
}

impl MetaMap {
    pub fn new() -> MetaMap {
        MetaMap::default()
    }

    pub fn len(&self) -> usize {
        self.int_keys.len() + self.str_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.int_keys.is_empty() && self.str_keys.is_empty()
    }

    pub fn insert_int(&mut self, key: i64, val: RpcValue) {
        self.int_keys.insert(key, val);
    }

    pub fn insert_str(&mut self, key: impl Into<String>, val: RpcValue) {
        self.str_keys.insert(key.into(), val);
    }

    pub fn get_int(&self, key: i64) -> Option<&RpcValue> {
        self.int_keys.get(&key)
    }

    pub fn get_str(&self, key: &str) -> Option<&RpcValue> {
        self.str_keys.get(key)
    }

    pub fn remove_int(&mut self, key: i64) -> Option<RpcValue> {
        self.int_keys.remove(&key)
    }

    pub fn remove_str(&mut self, key: &str) -> Option<RpcValue> {
        self.str_keys.remove(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Decimal(Decimal),
    Blob(Vec<u8>),
    String(String),
    DateTime(DateTime),
    List(Vec<RpcValue>),
    Map(BTreeMap<String, RpcValue>),
    IMap(BTreeMap<i64, RpcValue>),
}

impl Default for Value {
    fn default() -> Value {
        Value::Null
    }
}

/** A value plus its optional meta annotation.

Absent meta and empty meta mean the same thing but serialize differently,
absent produces no meta prefix at all. */
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RpcValue {
    pub meta: Option<MetaMap>,
    pub value: Value,
}

impl RpcValue {
    pub fn new(value: Value) -> RpcValue {
        RpcValue { meta: None, value }
    }

    pub fn with_meta(mut self, meta: MetaMap) -> RpcValue {
        self.meta = Some(meta);
        self
    }

    pub fn null() -> RpcValue {
        RpcValue::new(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    /** Int and UInt both answer, other variants do not. */
    pub fn as_int(&self) -> Option<i64> {
        match &self.value {
            Value::Int(n) => Some(*n),
            Value::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match &self.value {
            Value::UInt(n) => Some(*n),
            Value::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match &self.value {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match &self.value {
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match &self.value {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match &self.value {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match &self.value {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_imap(&self) -> Option<&BTreeMap<i64, RpcValue>> {
        match &self.value {
            Value::IMap(m) => Some(m),
            _ => None,
        }
    }

    /** Null, false, zero and empty text count as false. */
    pub fn is_truthy(&self) -> bool {
        match &self.value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::UInt(n) => *n != 0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn to_chainpack(&self) -> Result<Vec<u8>, Error> {
        let mut wr = ChainPackWriter::new();
        wr.write(self)?;
        Ok(wr.into_bytes())
    }

    pub fn from_chainpack(data: &[u8]) -> Result<RpcValue, Error> {
        ChainPackReader::new(data).read()
    }

    pub fn to_cpon(&self) -> Result<Vec<u8>, Error> {
        let mut wr = CponWriter::new();
        wr.write(self)?;
        Ok(wr.into_bytes())
    }

    pub fn to_cpon_string(&self) -> String {
        match self.to_cpon() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::from("<unrepresentable>"),
        }
    }

    pub fn from_cpon(text: &str) -> Result<RpcValue, Error> {
        CponReader::new(text.as_bytes()).read()
    }
}

impl fmt::Display for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_cpon_string())
    }
}

impl From<Value> for RpcValue {
    fn from(value: Value) -> RpcValue {
        RpcValue::new(value)
    }
}

impl From<()> for RpcValue {
    fn from(_: ()) -> RpcValue {
        RpcValue::new(Value::Null)
    }
}

impl From<bool> for RpcValue {
    fn from(b: bool) -> RpcValue {
        RpcValue::new(Value::Bool(b))
    }
}

impl From<i64> for RpcValue {
    fn from(n: i64) -> RpcValue {
        RpcValue::new(Value::Int(n))
    }
}

impl From<i32> for RpcValue {
    fn from(n: i32) -> RpcValue {
        RpcValue::new(Value::Int(n as i64))
    }
}

impl From<u64> for RpcValue {
    fn from(n: u64) -> RpcValue {
        RpcValue::new(Value::UInt(n))
    }
}

impl From<u32> for RpcValue {
    fn from(n: u32) -> RpcValue {
        RpcValue::new(Value::UInt(n as u64))
    }
}

impl From<f64> for RpcValue {
    fn from(d: f64) -> RpcValue {
        RpcValue::new(Value::Double(d))
    }
}

impl From<Decimal> for RpcValue {
    fn from(d: Decimal) -> RpcValue {
        RpcValue::new(Value::Decimal(d))
    }
}

impl From<DateTime> for RpcValue {
    fn from(dt: DateTime) -> RpcValue {
        RpcValue::new(Value::DateTime(dt))
    }
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> RpcValue {
        RpcValue::new(Value::String(s.to_owned()))
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> RpcValue {
        RpcValue::new(Value::String(s))
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(b: Vec<u8>) -> RpcValue {
        RpcValue::new(Value::Blob(b))
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(l: Vec<RpcValue>) -> RpcValue {
        RpcValue::new(Value::List(l))
    }
}

impl From<BTreeMap<String, RpcValue>> for RpcValue {
    fn from(m: BTreeMap<String, RpcValue>) -> RpcValue {
        RpcValue::new(Value::Map(m))
    }
}

impl From<BTreeMap<i64, RpcValue>> for RpcValue {
    fn from(m: BTreeMap<i64, RpcValue>) -> RpcValue {
        RpcValue::new(Value::IMap(m))
    }
}
