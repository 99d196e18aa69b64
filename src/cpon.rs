use std::collections::BTreeMap;

use crate::context::{PackContext, UnpackContext};
use crate::error::Error;
use crate::value::{DateTime, Decimal, MetaMap, RpcValue, Value};

fn hexdigit(b: u8) -> Result<u8, Error> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::MalformedInput(format!(
            "invalid hex digit: {}",
            b as char
        ))),
    }
}

pub struct CponReader<'a> {
    pub ctx: UnpackContext<'a>,
}

impl<'a> CponReader<'a> {
    pub fn new(data: &'a [u8]) -> CponReader<'a> {
        CponReader {
            ctx: UnpackContext::new(data),
        }
    }

    /** Skips whitespace, comments and the stray ':' and ',' tokens that may
    sit between significant tokens. */
    fn skip_insignificant(&mut self) -> Result<(), Error> {
        loop {
            let b = match self.ctx.peek_byte() {
                None => return Ok(()),
                Some(b) => b,
            };
            if b <= b' ' {
                self.ctx.get_byte()?;
                continue;
            }
            match b {
                b'/' => {
                    self.ctx.get_byte()?;
                    match self.ctx.get_byte()? {
                        b'*' => loop {
                            if self.ctx.get_byte()? == b'*' && self.ctx.peek_byte() == Some(b'/') {
                                self.ctx.get_byte()?;
                                break;
                            }
                        },
                        b'/' => loop {
                            if self.ctx.get_byte()? == b'\n' {
                                break;
                            }
                        },
                        _ => return Err(Error::MalformedInput("malformed comment".into())),
                    }
                }
                b':' | b',' => {
                    self.ctx.get_byte()?;
                }
                _ => return Ok(()),
            }
        }
    }

    pub fn read(&mut self) -> Result<RpcValue, Error> {
        self.skip_insignificant()?;
        let mut meta = None;
        if self.ctx.peek_byte() == Some(b'<') {
            meta = Some(self.read_meta()?);
            self.skip_insignificant()?;
        }

        let b = self.ctx.peek_byte().ok_or(Error::BufferUnderflow)?;
        let value = match b {
            b'0'..=b'9' | b'+' | b'-' => self.read_number()?,
            b'"' => Value::String(self.read_string()?),
            b'[' => Value::List(self.read_list()?),
            b'{' => Value::Map(self.read_map()?),
            b'i' => {
                self.ctx.get_byte()?;
                if self.ctx.peek_byte() == Some(b'{') {
                    Value::IMap(self.read_imap()?)
                } else {
                    return Err(Error::MalformedInput("invalid IMap prefix".into()));
                }
            }
            b'd' => {
                self.ctx.get_byte()?;
                if self.ctx.peek_byte() == Some(b'"') {
                    Value::DateTime(self.read_datetime()?)
                } else {
                    return Err(Error::MalformedInput("invalid DateTime prefix".into()));
                }
            }
            b'b' => {
                self.ctx.get_byte()?;
                if self.ctx.peek_byte() == Some(b'"') {
                    Value::Blob(self.read_blob()?)
                } else {
                    return Err(Error::MalformedInput("invalid Blob prefix".into()));
                }
            }
            b'x' => {
                self.ctx.get_byte()?;
                if self.ctx.peek_byte() == Some(b'"') {
                    Value::Blob(self.read_hexblob()?)
                } else {
                    return Err(Error::MalformedInput("invalid HexBlob prefix".into()));
                }
            }
            b't' => {
                self.ctx.expect_literal(b"true")?;
                Value::Bool(true)
            }
            b'f' => {
                self.ctx.expect_literal(b"false")?;
                Value::Bool(false)
            }
            b'n' => {
                self.ctx.expect_literal(b"null")?;
                Value::Null
            }
            _ => return Err(Error::MalformedInput("malformed cpon input".into())),
        };
        Ok(RpcValue { meta, value })
    }

    /** Reads an optionally signed, optionally 0x-prefixed integer literal.
    Returns the value and the number of bytes consumed. */
    fn read_int(&mut self) -> Result<(i64, usize), Error> {
        let start = self.ctx.pos;
        let mut base: i64 = 10;
        let mut val: i64 = 0;
        let mut neg = false;
        let mut n = 0usize;
        loop {
            let b = match self.ctx.peek_byte() {
                None => break,
                Some(b) => b,
            };
            let digit = match b {
                b'+' | b'-' => {
                    if n > 0 {
                        break;
                    }
                    self.ctx.get_byte()?;
                    if b == b'-' {
                        neg = true;
                    }
                    n += 1;
                    continue;
                }
                b'x' => {
                    if n != 1 || val != 0 {
                        break;
                    }
                    self.ctx.get_byte()?;
                    base = 16;
                    n += 1;
                    continue;
                }
                b'0'..=b'9' => (b - b'0') as i64,
                b'A'..=b'F' if base == 16 => (b - b'A' + 10) as i64,
                b'a'..=b'f' if base == 16 => (b - b'a' + 10) as i64,
                _ => break,
            };
            self.ctx.get_byte()?;
            val = val
                .checked_mul(base)
                .and_then(|v| v.checked_add(digit))
                .ok_or_else(|| Error::MalformedInput("number literal out of range".into()))?;
            n += 1;
        }
        if neg {
            val = -val;
        }
        Ok((val, self.ctx.pos - start))
    }

    fn read_number(&mut self) -> Result<Value, Error> {
        let mut is_neg = false;
        if self.ctx.peek_byte() == Some(b'-') {
            is_neg = true;
            self.ctx.get_byte()?;
        }

        let (mantissa, _) = self.read_int()?;
        let mut exponent: i64 = 0;
        let mut decimals: i64 = 0;
        let mut dec_cnt: usize = 0;
        let mut is_decimal = false;
        let mut is_uint = false;

        match self.ctx.peek_byte() {
            Some(b'u') => {
                is_uint = true;
                self.ctx.get_byte()?;
            }
            Some(b'.') => {
                is_decimal = true;
                self.ctx.get_byte()?;
                let (d, cnt) = self.read_int()?;
                decimals = d;
                dec_cnt = cnt;
                if let Some(b'e' | b'E') = self.ctx.peek_byte() {
                    self.ctx.get_byte()?;
                    let (e, cnt) = self.read_int()?;
                    if cnt == 0 {
                        return Err(Error::MalformedInput(
                            "malformed number exponential part".into(),
                        ));
                    }
                    exponent = e;
                }
            }
            Some(b'e' | b'E') => {
                is_decimal = true;
                self.ctx.get_byte()?;
                let (e, cnt) = self.read_int()?;
                if cnt == 0 {
                    return Err(Error::MalformedInput(
                        "malformed number exponential part".into(),
                    ));
                }
                exponent = e;
            }
            _ => {}
        }

        let value = if is_decimal {
            let mut m = mantissa;
            for _ in 0..dec_cnt {
                m = m
                    .checked_mul(10)
                    .ok_or_else(|| Error::MalformedInput("decimal out of range".into()))?;
            }
            m = m
                .checked_add(decimals)
                .ok_or_else(|| Error::MalformedInput("decimal out of range".into()))?;
            if is_neg {
                m = -m;
            }
            let exp = i32::try_from(exponent - dec_cnt as i64)
                .map_err(|_| Error::MalformedInput("decimal exponent out of range".into()))?;
            Value::Decimal(Decimal::new(m, exp))
        } else if is_uint {
            let u = u64::try_from(mantissa)
                .map_err(|_| Error::MalformedInput("uint literal out of range".into()))?;
            Value::UInt(u)
        } else {
            Value::Int(if is_neg { -mantissa } else { mantissa })
        };
        Ok(value)
    }

    fn read_string(&mut self) -> Result<String, Error> {
        let mut pctx = PackContext::new();
        self.ctx.get_byte()?; // eat '"'
        loop {
            let b = self.ctx.get_byte()?;
            if b == b'\\' {
                let b = self.ctx.get_byte()?;
                match b {
                    b'\\' => pctx.put_byte(b'\\'),
                    b'"' => pctx.put_byte(b'"'),
                    b'b' => pctx.put_byte(0x08),
                    b'f' => pctx.put_byte(0x0c),
                    b'n' => pctx.put_byte(b'\n'),
                    b'r' => pctx.put_byte(b'\r'),
                    b't' => pctx.put_byte(b'\t'),
                    b'0' => pctx.put_byte(0),
                    _ => pctx.put_byte(b),
                }
            } else if b == b'"' {
                break; // end of string
            } else {
                pctx.put_byte(b);
            }
        }
        String::from_utf8(pctx.into_bytes())
            .map_err(|_| Error::MalformedInput("string is not valid utf-8".into()))
    }

    fn read_blob(&mut self) -> Result<Vec<u8>, Error> {
        let mut pctx = PackContext::new();
        self.ctx.get_byte()?; // eat '"'
        loop {
            let b = self.ctx.get_byte()?;
            if b == b'\\' {
                let b = self.ctx.get_byte()?;
                match b {
                    b'\\' => pctx.put_byte(b'\\'),
                    b'"' => pctx.put_byte(b'"'),
                    b'n' => pctx.put_byte(b'\n'),
                    b'r' => pctx.put_byte(b'\r'),
                    b't' => pctx.put_byte(b'\t'),
                    _ => {
                        let lo = self.ctx.get_byte()?;
                        pctx.put_byte(16 * hexdigit(b)? + hexdigit(lo)?);
                    }
                }
            } else if b == b'"' {
                break;
            } else {
                pctx.put_byte(b);
            }
        }
        Ok(pctx.into_bytes())
    }

    fn read_hexblob(&mut self) -> Result<Vec<u8>, Error> {
        self.ctx.get_byte()?; // eat '"'
        let mut digits = Vec::new();
        loop {
            let b = self.ctx.get_byte()?;
            if b == b'"' {
                break;
            }
            digits.push(b);
        }
        hex::decode(&digits).map_err(|_| Error::MalformedInput("invalid hex blob".into()))
    }

    fn read_datetime(&mut self) -> Result<DateTime, Error> {
        self.ctx.get_byte()?; // eat '"'
        if self.ctx.peek_byte() == Some(b'"') {
            return Err(Error::MalformedInput("empty date-time".into()));
        }

        let (year, _) = self.read_int()?;
        self.expect_byte(b'-', "malformed year-month separator in date-time")?;
        let (month, _) = self.read_int()?;
        self.expect_byte(b'-', "malformed month-day separator in date-time")?;
        let (day, _) = self.read_int()?;
        let b = self.ctx.get_byte()?;
        if b != b' ' && b != b'T' {
            return Err(Error::MalformedInput(
                "malformed date-time separator in date-time".into(),
            ));
        }
        let (hour, _) = self.read_int()?;
        self.expect_byte(b':', "malformed hour-minute separator in date-time")?;
        let (minute, _) = self.read_int()?;
        self.expect_byte(b':', "malformed minute-second separator in date-time")?;
        let (second, _) = self.read_int()?;

        let mut msec: i64 = 0;
        if self.ctx.peek_byte() == Some(b'.') {
            self.ctx.get_byte()?;
            let (v, _) = self.read_int()?;
            msec = v;
        }

        let mut offset_min: i64 = 0;
        match self.ctx.peek_byte() {
            Some(b'Z') => {
                self.ctx.get_byte()?; // zulu time
            }
            Some(sign @ (b'+' | b'-')) => {
                self.ctx.get_byte()?;
                let (val, n) = self.read_int()?;
                offset_min = match n {
                    2 => 60 * val,
                    4 => 60 * (val / 100) + val % 100,
                    _ => {
                        return Err(Error::MalformedInput(
                            "malformed UTC offset in date-time".into(),
                        ))
                    }
                };
                if sign == b'-' {
                    offset_min = -offset_min;
                }
            }
            _ => {}
        }
        self.expect_byte(b'"', "date-time literal must be terminated by '\"'")?;

        let epoch_sec = civil_to_epoch_sec(year, month, day, hour, minute, second, offset_min)?;
        Ok(DateTime::new(epoch_sec * 1000 + msec, offset_min as i32))
    }

    fn expect_byte(&mut self, expected: u8, what: &str) -> Result<(), Error> {
        if self.ctx.get_byte()? != expected {
            return Err(Error::MalformedInput(what.into()));
        }
        Ok(())
    }

    fn read_list(&mut self) -> Result<Vec<RpcValue>, Error> {
        let mut lst = Vec::new();
        self.ctx.get_byte()?; // eat '['
        loop {
            self.skip_insignificant()?;
            match self.ctx.peek_byte() {
                Some(b']') => {
                    self.ctx.get_byte()?;
                    return Ok(lst);
                }
                Some(_) => lst.push(self.read()?),
                None => return Err(Error::BufferUnderflow),
            }
        }
    }

    /** Reads key/value pairs up to the terminator. Keys of both kinds are
    collected; the typed map readers below reject the kind they disallow. */
    fn read_map_body(&mut self, terminator: u8) -> Result<MetaMap, Error> {
        let mut map = MetaMap::new();
        self.ctx.get_byte()?; // eat the opener
        loop {
            self.skip_insignificant()?;
            match self.ctx.peek_byte() {
                Some(b) if b == terminator => {
                    self.ctx.get_byte()?;
                    return Ok(map);
                }
                Some(_) => {
                    let key = self.read()?;
                    self.skip_insignificant()?;
                    let val = self.read()?;
                    if let Some(k) = key.as_int() {
                        map.insert_int(k, val);
                    } else if let Value::String(s) = key.value {
                        map.insert_str(s, val);
                    } else {
                        return Err(Error::MalformedInput("malformed map key".into()));
                    }
                }
                None => return Err(Error::BufferUnderflow),
            }
        }
    }

    fn read_map(&mut self) -> Result<BTreeMap<String, RpcValue>, Error> {
        let body = self.read_map_body(b'}')?;
        if !body.int_keys.is_empty() {
            return Err(Error::MalformedInput("map key must be a string".into()));
        }
        Ok(body.str_keys)
    }

    fn read_imap(&mut self) -> Result<BTreeMap<i64, RpcValue>, Error> {
        let body = self.read_map_body(b'}')?;
        if !body.str_keys.is_empty() {
            return Err(Error::MalformedInput("imap key must be an integer".into()));
        }
        Ok(body.int_keys)
    }

    fn read_meta(&mut self) -> Result<MetaMap, Error> {
        self.read_map_body(b'>')
    }
}

fn civil_to_epoch_sec(
    year: i64,
    month: i64,
    day: i64,
    hour: i64,
    minute: i64,
    second: i64,
    offset_min: i64,
) -> Result<i64, Error> {
    fn bad<E>(_: E) -> Error {
        Error::MalformedInput("date-time field out of range".into())
    }
    let month = time::Month::try_from(u8::try_from(month).map_err(bad)?).map_err(bad)?;
    let date = time::Date::from_calendar_date(
        i32::try_from(year).map_err(bad)?,
        month,
        u8::try_from(day).map_err(bad)?,
    )
    .map_err(bad)?;
    let tod = time::Time::from_hms(
        u8::try_from(hour).map_err(bad)?,
        u8::try_from(minute).map_err(bad)?,
        u8::try_from(second).map_err(bad)?,
    )
    .map_err(bad)?;
    let offset =
        time::UtcOffset::from_whole_seconds(i32::try_from(offset_min * 60).map_err(bad)?)
            .map_err(bad)?;
    Ok(time::PrimitiveDateTime::new(date, tod)
        .assume_offset(offset)
        .unix_timestamp())
}

#[derive(Default)]
pub struct CponWriterOptions {
    /// When set, containers in block form put every item on its own line
    /// prefixed by this string repeated per nesting level.
    pub indent: Option<Vec<u8>>,
}

pub struct CponWriter {
    ctx: PackContext,
    options: CponWriterOptions,
    nest_level: usize,
}

impl Default for CponWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CponWriter {
    pub fn new() -> CponWriter {
        CponWriter::with_options(CponWriterOptions::default())
    }

    pub fn with_options(options: CponWriterOptions) -> CponWriter {
        CponWriter {
            ctx: PackContext::new(),
            options,
            nest_level: 0,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.ctx.into_bytes()
    }

    pub fn write(&mut self, val: &RpcValue) -> Result<(), Error> {
        if let Some(meta) = &val.meta {
            self.write_meta(meta)?;
        }
        match &val.value {
            Value::Null => self.ctx.write_str("null"),
            Value::Bool(b) => self.ctx.write_str(if *b { "true" } else { "false" }),
            Value::Int(n) => self.write_int(*n),
            Value::UInt(n) => {
                self.ctx.write_str(&n.to_string());
                self.ctx.put_byte(b'u');
            }
            Value::Double(d) => self.ctx.write_str(&d.to_string()),
            Value::Decimal(d) => self.write_decimal(d),
            Value::DateTime(dt) => self.write_datetime(dt)?,
            Value::Blob(b) => self.write_blob(b),
            Value::String(s) => self.write_string(s),
            Value::List(l) => self.write_list(l)?,
            Value::Map(m) => {
                self.ctx.put_byte(b'{');
                self.write_map_content(&BTreeMap::new(), m)?;
                self.ctx.put_byte(b'}');
            }
            Value::IMap(m) => {
                self.ctx.write_str("i{");
                self.write_map_content(m, &BTreeMap::new())?;
                self.ctx.put_byte(b'}');
            }
        }
        Ok(())
    }

    fn write_meta(&mut self, meta: &MetaMap) -> Result<(), Error> {
        self.ctx.put_byte(b'<');
        self.write_map_content(&meta.int_keys, &meta.str_keys)?;
        self.ctx.put_byte(b'>');
        Ok(())
    }

    fn indent_item(&mut self, is_oneliner: bool, item_index: usize) {
        let indent = match &self.options.indent {
            None => return,
            Some(indent) => indent.clone(),
        };
        if is_oneliner {
            if item_index > 0 {
                self.ctx.put_byte(b' ');
            }
        } else {
            self.ctx.put_byte(b'\n');
            for _ in 0..self.nest_level {
                self.ctx.write_bytes(&indent);
            }
        }
    }

    fn is_container(val: &RpcValue) -> bool {
        matches!(
            val.value,
            Value::List(_) | Value::Map(_) | Value::IMap(_)
        )
    }

    fn write_list(&mut self, lst: &[RpcValue]) -> Result<(), Error> {
        self.nest_level += 1;
        let is_oneliner = lst.len() <= 10 && !lst.iter().any(Self::is_container);
        self.ctx.put_byte(b'[');
        for (i, item) in lst.iter().enumerate() {
            if i > 0 {
                self.ctx.put_byte(b',');
            }
            self.indent_item(is_oneliner, i);
            self.write(item)?;
        }
        self.nest_level -= 1;
        self.indent_item(is_oneliner, 0);
        self.ctx.put_byte(b']');
        Ok(())
    }

    /** Integer keys ascending first, then text keys ascending. */
    fn write_map_content(
        &mut self,
        int_entries: &BTreeMap<i64, RpcValue>,
        str_entries: &BTreeMap<String, RpcValue>,
    ) -> Result<(), Error> {
        self.nest_level += 1;
        let entry_cnt = int_entries.len() + str_entries.len();
        let is_oneliner = entry_cnt <= 10
            && !int_entries
                .values()
                .chain(str_entries.values())
                .any(Self::is_container);
        let mut i = 0;
        for (k, v) in int_entries {
            if i > 0 {
                self.ctx.put_byte(b',');
            }
            self.indent_item(is_oneliner, i);
            self.write_int(*k);
            self.ctx.put_byte(b':');
            self.write(v)?;
            i += 1;
        }
        for (k, v) in str_entries {
            if i > 0 {
                self.ctx.put_byte(b',');
            }
            self.indent_item(is_oneliner, i);
            self.write_string(k);
            self.ctx.put_byte(b':');
            self.write(v)?;
            i += 1;
        }
        self.nest_level -= 1;
        self.indent_item(is_oneliner, 0);
        Ok(())
    }

    fn write_int(&mut self, num: i64) {
        self.ctx.write_str(&num.to_string());
    }

    fn write_string(&mut self, sstr: &str) {
        self.ctx.put_byte(b'"');
        for b in sstr.bytes() {
            match b {
                0 => self.ctx.write_str("\\0"),
                b'\\' => self.ctx.write_str("\\\\"),
                b'\t' => self.ctx.write_str("\\t"),
                0x08 => self.ctx.write_str("\\b"),
                b'\r' => self.ctx.write_str("\\r"),
                b'\n' => self.ctx.write_str("\\n"),
                b'"' => self.ctx.write_str("\\\""),
                _ => self.ctx.put_byte(b),
            }
        }
        self.ctx.put_byte(b'"');
    }

    fn write_blob(&mut self, data: &[u8]) {
        self.ctx.write_str("b\"");
        for &b in data {
            match b {
                b'\\' => self.ctx.write_str("\\\\"),
                b'\t' => self.ctx.write_str("\\t"),
                b'\r' => self.ctx.write_str("\\r"),
                b'\n' => self.ctx.write_str("\\n"),
                b'"' => self.ctx.write_str("\\\""),
                _ if b >= 0x7f => {
                    self.ctx.put_byte(b'\\');
                    self.ctx.write_str(&format!("{:02x}", b));
                }
                _ => self.ctx.put_byte(b),
            }
        }
        self.ctx.put_byte(b'"');
    }

    /** The exponent implies the decimal point, small exponents render in
    dotted form, everything else falls back to the e notation. */
    fn write_decimal(&mut self, val: &Decimal) {
        let mut m = val.mantissa as i128;
        if m < 0 {
            self.ctx.put_byte(b'-');
            m = -m;
        }
        let mstr = m.to_string();
        let n = mstr.len() as i32;
        let exponent = val.exponent;
        let dec_places = -exponent;
        if dec_places > 0 && dec_places < n {
            let dot_ix = (n - dec_places) as usize;
            self.ctx.write_str(&mstr[..dot_ix]);
            self.ctx.put_byte(b'.');
            self.ctx.write_str(&mstr[dot_ix..]);
        } else if dec_places > 0 && dec_places <= 3 {
            self.ctx.write_str("0.");
            for _ in 0..(dec_places - n) {
                self.ctx.put_byte(b'0');
            }
            self.ctx.write_str(&mstr);
        } else if dec_places < 0 && n + exponent <= 9 {
            self.ctx.write_str(&mstr);
            for _ in 0..exponent {
                self.ctx.put_byte(b'0');
            }
            self.ctx.put_byte(b'.');
        } else if dec_places == 0 {
            self.ctx.write_str(&mstr);
            self.ctx.put_byte(b'.');
        } else {
            self.ctx.write_str(&mstr);
            self.ctx.write_str(&format!("e{}", exponent));
        }
    }

    fn write_datetime(&mut self, dt: &DateTime) -> Result<(), Error> {
        let ms = dt.epoch_msec.rem_euclid(1000);
        let epoch_sec = (dt.epoch_msec - ms) / 1000;
        let offset = time::UtcOffset::from_whole_seconds(dt.utc_offset_min * 60)
            .map_err(|_| {
                Error::InvalidValue(format!(
                    "UTC offset out of range: {} min",
                    dt.utc_offset_min
                ))
            })?;
        let t = time::OffsetDateTime::from_unix_timestamp(epoch_sec)
            .map_err(|_| Error::InvalidValue("date-time out of range".into()))?
            .to_offset(offset);

        self.ctx.write_str("d\"");
        self.ctx.write_str(&format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            t.year(),
            u8::from(t.month()),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        ));
        if ms != 0 {
            self.ctx.write_str(&format!(".{:03}", ms));
        }
        if dt.utc_offset_min == 0 {
            self.ctx.put_byte(b'Z');
        } else {
            let abs = dt.utc_offset_min.abs();
            let sign = if dt.utc_offset_min < 0 { '-' } else { '+' };
            self.ctx.write_str(&format!("{}{:02}", sign, abs / 60));
            if abs % 60 != 0 {
                self.ctx.write_str(&format!("{:02}", abs % 60));
            }
        }
        self.ctx.put_byte(b'"');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::value::RpcValue;

    /// cpon -> value -> chainpack -> value -> cpon must reproduce the
    /// canonical text.
    fn check(input: &str, canonical: &str) {
        let rv1 = RpcValue::from_cpon(input).unwrap();
        let cpk = rv1.to_chainpack().unwrap();
        let rv2 = RpcValue::from_chainpack(&cpk).unwrap();
        assert_eq!(rv1, rv2, "chainpack round trip of {}", input);
        let out = String::from_utf8(rv2.to_cpon().unwrap()).unwrap();
        assert_eq!(out, canonical, "input {}", input);
    }

    fn check_same(input: &str) {
        check(input, input);
    }

    #[test]
    fn conversions_one_to_one() {
        check_same("2147483647u");
        check_same("4294967295u");
        check_same("2147483647");
        check_same("-1073741823");
        check_same("9007199254740991");
        check_same("-9007199254740991");
        check_same("4294967295");
        check_same("true");
        check_same("false");
        check_same("null");
        check_same("1u");
        check_same("134");
        check_same("7");
        check_same("-2");
        check_same("223.");
        check_same("2.30");
        check_same("\"foo\"");
        check_same("\"\"");
        check_same("[]");
        check_same("[1]");
        check_same("[1,2,3]");
        check_same("[[]]");
        check_same("{\"foo\":\"bar\"}");
        check_same("i{1:2}");
        check_same("[1u,{\"a\":1},2.30]");
        check_same("<1:2>3");
        check_same("[1,<7:8>9]");
        check_same("<>1");
        check_same("<8:3u>i{2:[[\".broker\",<1:2>true]]}");
        check_same("<1:2,\"foo\":<5:6>\"bar\">[1u,{\"a\":1},2.30]");
        check_same("<1:2>[3,<4:5>6]");
        check_same("<4:\"svete\">i{2:<4:\"svete\">[0,1]}");
        check_same("b\"ab\\cd\\t\\r\\n\"");
        check_same("d\"2018-02-02T00:00:00Z\"");
        check_same("d\"2027-05-03T11:30:12.345+01\"");
    }

    #[test]
    fn conversions_canonicalize() {
        check("0xab", "171");
        check("-0xCD", "-205");
        check("0x1a2b3c4d", "439041101");
        check("12.3e-10", "123e-11");
        check("-0.00012", "-12e-5");
        check("-1234567890.", "-1234567890.");
        check("[1,]", "[1]");
        check(
            "i{\n\t1: \"bar\",\n\t345u : \"foo\",\n}",
            "i{1:\"bar\",345:\"foo\"}",
        );
        check(
            "<\"foo\":\"bar\",1:2>i{1:<7:8>9}",
            "<1:2,\"foo\":\"bar\">i{1:<7:8>9}",
        );
        check("i{1:2 // comment to end of line\n}", "i{1:2}");
        check(
            "d\"2019-05-03T11:30:00-0700\"",
            "d\"2019-05-03T11:30:00-07\"",
        );
        check("x\"abcd\"", "b\"\\ab\\cd\"");
        check(
            "/*comment 1*/{ /*comment 2*/\n\
             \t\"foo\"/*comment \"3\"*/: \"bar\", //comment to end of line\n\
             \t\"baz\" : 1,\n\
             /*\n\
             \tmultiline comment\n\
             \t\"baz\" : 1,\n\
             \t\"baz\" : 1, // single inside multi\n\
             */\n\
             }",
            "{\"baz\":1,\"foo\":\"bar\"}",
        );
    }

    #[test]
    fn equal_instants_decode_to_same_epoch() {
        for date in [
            "d\"2017-05-03T18:30:00Z\"",
            "d\"2017-05-03T22:30:00+04\"",
            "d\"2017-05-03T11:30:00-0700\"",
            "d\"2017-05-03T15:00:00-0330\"",
        ] {
            let val = RpcValue::from_cpon(date).unwrap();
            assert_eq!(
                val.as_datetime().unwrap().epoch_msec,
                1_493_836_200_000,
                "{}",
                date
            );
        }
    }

    #[test]
    fn number_literal_kinds() {
        let v = RpcValue::from_cpon("134").unwrap();
        assert_eq!(v.as_int(), Some(134));

        let v = RpcValue::from_cpon("12.3e-10").unwrap();
        let d = v.as_decimal().unwrap();
        assert_eq!((d.mantissa, d.exponent), (123, -11));

        let v = RpcValue::from_cpon("1u").unwrap();
        assert_eq!(v.as_uint(), Some(1));
    }

    #[test]
    fn trailing_commas_and_stray_separators() {
        check("{ \"foo\":\"bar\", \"baz\":1, }", "{\"baz\":1,\"foo\":\"bar\"}");
        check("[1, 2,, 3,]", "[1,2,3]");
    }

    #[test]
    fn string_escapes_round_trip() {
        check_same("\"a\\tb\\nc\\\\d\\\"e\\0f\"");
        // unknown escape passes the byte through
        let v = RpcValue::from_cpon("\"a\\qb\"").unwrap();
        assert_eq!(v.as_str(), Some("aqb"));
    }

    #[test]
    fn blob_escapes() {
        let v = RpcValue::from_cpon("b\"ab\\cd\\t\"").unwrap();
        assert_eq!(v.as_blob(), Some(&[b'a', b'b', 0xcd, b'\t'][..]));
        let v = RpcValue::from_cpon("x\"ABCD\"").unwrap();
        assert_eq!(v.as_blob(), Some(&[0xab, 0xcd][..]));
    }

    #[test]
    fn indent_option_formats_block_containers() {
        use super::{CponWriter, CponWriterOptions};

        let v = RpcValue::from_cpon("{\"a\":[1,2]}").unwrap();
        let mut wr = CponWriter::with_options(CponWriterOptions {
            indent: Some(b"\t".to_vec()),
        });
        wr.write(&v).unwrap();
        let out = String::from_utf8(wr.into_bytes()).unwrap();
        assert_eq!(out, "{\n\t\"a\":[1, 2]\n}");
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        for bad in ["i[1]", "d'x'", "{1:2}", "i{\"a\":1}", "[1", "12.3e", "@"] {
            assert!(RpcValue::from_cpon(bad).is_err(), "{}", bad);
        }
    }
}
