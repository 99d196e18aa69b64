use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

use crate::constants::*;
use crate::context::{PackContext, UnpackContext};
use crate::error::Error;
use crate::value::{DateTime, Decimal, MetaMap, RpcValue, Value};

/** Number of significant bits of the magnitude, at least 1. */
fn significant_bits(num: u64) -> u32 {
    (64 - num.leading_zeros()).max(1)
}

/** Number of octets needed to carry bit_len payload bits. */
fn bytes_needed(bit_len: u32) -> u32 {
    if bit_len <= 28 {
        (bit_len - 1) / 7 + 1
    } else {
        (bit_len - 1) / 8 + 2
    }
}

/** Index of the top payload bit of the encoding that carries bit_len bits.
The sign bit of int data goes there. */
fn expand_bit_len(bit_len: u32) -> u32 {
    let byte_cnt = bytes_needed(bit_len);
    if bit_len <= 28 {
        byte_cnt * 7 - 1
    } else {
        (byte_cnt - 1) * 8 - 1
    }
}

pub struct ChainPackWriter {
    ctx: PackContext,
}

impl Default for ChainPackWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainPackWriter {
    pub fn new() -> ChainPackWriter {
        ChainPackWriter {
            ctx: PackContext::new(),
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
            Value::Null => self.ctx.put_byte(CP_NULL),
            Value::Bool(b) => self.ctx.put_byte(if *b { CP_TRUE } else { CP_FALSE }),
            Value::Int(n) => self.write_int(*n),
            Value::UInt(n) => self.write_uint(*n),
            Value::Double(d) => self.write_double(*d),
            Value::Decimal(d) => self.write_decimal(d),
            Value::DateTime(dt) => self.write_datetime(dt)?,
            Value::Blob(b) => self.write_blob(b),
            Value::String(s) => self.write_string(s),
            Value::List(l) => self.write_list(l)?,
            Value::Map(m) => self.write_map(m)?,
            Value::IMap(m) => self.write_imap(m)?,
        }
        Ok(())
    }

    /** Packs num big-endian into the shortest form covering bit_len bits. */
    fn write_uint_data_helper(&mut self, num: u128, bit_len: u32) {
        let byte_cnt = bytes_needed(bit_len) as usize;
        let mut data = [0u8; 17];
        let mut n = num;
        for i in (0..byte_cnt).rev() {
            data[i] = (n & 0xff) as u8;
            n >>= 8;
        }
        if bit_len <= 28 {
            let mask = 0xf0u32 << (4 - byte_cnt as u32);
            data[0] &= (!mask) as u8;
            data[0] |= ((mask << 1) & 0xff) as u8;
        } else {
            data[0] = 0xf0 | (byte_cnt as u8 - 5);
        }
        self.ctx.write_bytes(&data[..byte_cnt]);
    }

    pub fn write_uint_data(&mut self, num: u64) {
        let bit_len = significant_bits(num);
        self.write_uint_data_helper(num as u128, bit_len);
    }

    pub fn write_int_data(&mut self, snum: i64) {
        let magnitude = snum.unsigned_abs();
        let bit_len = significant_bits(magnitude) + 1; // add sign bit
        let mut num = magnitude as u128;
        if snum < 0 {
            num |= 1u128 << expand_bit_len(bit_len);
        }
        self.write_uint_data_helper(num, bit_len);
    }

    pub fn write_uint(&mut self, n: u64) {
        if n < 64 {
            self.ctx.put_byte(n as u8); // tiny UInt
        } else {
            self.ctx.put_byte(CP_UINT);
            self.write_uint_data(n);
        }
    }

    pub fn write_int(&mut self, n: i64) {
        if (0..64).contains(&n) {
            self.ctx.put_byte(n as u8 + 64); // tiny Int
        } else {
            self.ctx.put_byte(CP_INT);
            self.write_int_data(n);
        }
    }

    fn write_double(&mut self, val: f64) {
        self.ctx.put_byte(CP_DOUBLE);
        let mut data = [0u8; 8];
        LittleEndian::write_f64(&mut data, val);
        self.ctx.write_bytes(&data);
    }

    fn write_decimal(&mut self, val: &Decimal) {
        self.ctx.put_byte(CP_DECIMAL);
        self.write_int_data(val.mantissa);
        self.write_int_data(val.exponent as i64);
    }

    fn write_datetime(&mut self, dt: &DateTime) -> Result<(), Error> {
        self.ctx.put_byte(CP_DATETIME);

        let mut msecs = dt.epoch_msec - SHV_EPOCH_MSEC;
        let offset = dt.utc_offset_min.div_euclid(15);
        if !(-63..=63).contains(&offset) {
            return Err(Error::InvalidValue(format!(
                "UTC offset out of range: {} min",
                dt.utc_offset_min
            )));
        }
        let ms = msecs.rem_euclid(1000);
        if ms == 0 {
            msecs /= 1000;
        }
        // zero offset is encoded as "no offset", the 7-bit field is absent
        if offset != 0 {
            msecs <<= 7;
            msecs |= (offset & 0x7f) as i64;
        }
        msecs <<= 2;
        if offset != 0 {
            msecs |= 1;
        }
        if ms == 0 {
            msecs |= 2;
        }
        self.write_int_data(msecs);
        Ok(())
    }

    fn write_blob(&mut self, data: &[u8]) {
        self.ctx.put_byte(CP_BLOB);
        self.write_uint_data(data.len() as u64);
        self.ctx.write_bytes(data);
    }

    fn write_string(&mut self, sstr: &str) {
        self.ctx.put_byte(CP_STRING);
        self.write_uint_data(sstr.len() as u64);
        self.ctx.write_bytes(sstr.as_bytes());
    }

    fn write_list(&mut self, lst: &[RpcValue]) -> Result<(), Error> {
        self.ctx.put_byte(CP_LIST);
        for item in lst {
            self.write(item)?;
        }
        self.ctx.put_byte(CP_TERM);
        Ok(())
    }

    fn write_map(&mut self, map: &BTreeMap<String, RpcValue>) -> Result<(), Error> {
        self.ctx.put_byte(CP_MAP);
        for (k, v) in map {
            self.write_string(k);
            self.write(v)?;
        }
        self.ctx.put_byte(CP_TERM);
        Ok(())
    }

    fn write_imap(&mut self, map: &BTreeMap<i64, RpcValue>) -> Result<(), Error> {
        self.ctx.put_byte(CP_IMAP);
        for (k, v) in map {
            self.write_int(*k);
            self.write(v)?;
        }
        self.ctx.put_byte(CP_TERM);
        Ok(())
    }

    fn write_meta(&mut self, meta: &MetaMap) -> Result<(), Error> {
        self.ctx.put_byte(CP_META_MAP);
        for (k, v) in &meta.int_keys {
            self.write_int(*k);
            self.write(v)?;
        }
        for (k, v) in &meta.str_keys {
            self.write_string(k);
            self.write(v)?;
        }
        self.ctx.put_byte(CP_TERM);
        Ok(())
    }
}

pub struct ChainPackReader<'a> {
    pub ctx: UnpackContext<'a>,
}

impl<'a> ChainPackReader<'a> {
    pub fn new(data: &'a [u8]) -> ChainPackReader<'a> {
        ChainPackReader {
            ctx: UnpackContext::new(data),
        }
    }

    pub fn read(&mut self) -> Result<RpcValue, Error> {
        let mut meta = None;
        let mut schema = self.ctx.get_byte()?;
        if schema == CP_META_MAP {
            meta = Some(self.read_meta_body()?);
            schema = self.ctx.get_byte()?;
        }

        let value = if schema < 128 {
            if schema & 64 != 0 {
                Value::Int((schema & 63) as i64)
            } else {
                Value::UInt((schema & 63) as u64)
            }
        } else {
            match schema {
                CP_NULL => Value::Null,
                CP_TRUE => Value::Bool(true),
                CP_FALSE => Value::Bool(false),
                CP_INT => Value::Int(self.read_int_data()?),
                CP_UINT => Value::UInt(self.read_uint_data()?),
                CP_DOUBLE => {
                    let data = self.ctx.get_bytes(8)?;
                    Value::Double(LittleEndian::read_f64(data))
                }
                CP_DECIMAL => {
                    let mantissa = self.read_int_data()?;
                    let exponent = i32::try_from(self.read_int_data()?).map_err(|_| {
                        Error::MalformedInput("decimal exponent out of range".into())
                    })?;
                    Value::Decimal(Decimal::new(mantissa, exponent))
                }
                CP_DATETIME => Value::DateTime(self.read_datetime()?),
                CP_LIST => Value::List(self.read_list_body()?),
                CP_MAP => Value::Map(self.read_map_body()?),
                CP_IMAP => Value::IMap(self.read_imap_body()?),
                CP_BLOB => {
                    let len = self.read_len()?;
                    Value::Blob(self.ctx.get_bytes(len)?.to_vec())
                }
                CP_STRING => {
                    let len = self.read_len()?;
                    let data = self.ctx.get_bytes(len)?;
                    Value::String(String::from_utf8(data.to_vec()).map_err(|_| {
                        Error::MalformedInput("string is not valid utf-8".into())
                    })?)
                }
                CP_CSTRING => Value::String(self.read_cstring()?),
                _ => {
                    return Err(Error::MalformedInput(format!(
                        "invalid packing schema: {}",
                        schema
                    )))
                }
            }
        };
        Ok(RpcValue { meta, value })
    }

    fn read_uint_data_helper(&mut self) -> Result<(u128, u32), Error> {
        let head = self.ctx.get_byte()?;
        let (mut num, bytes_to_read, bit_len) = if head & 128 == 0 {
            (u128::from(head & 127), 0, 7)
        } else if head & 64 == 0 {
            (u128::from(head & 63), 1, 6 + 8)
        } else if head & 32 == 0 {
            (u128::from(head & 31), 2, 5 + 2 * 8)
        } else if head & 16 == 0 {
            (u128::from(head & 15), 3, 4 + 3 * 8)
        } else {
            let cnt = u32::from(head & 0x0f) + 4;
            if cnt > 16 {
                return Err(Error::MalformedInput(format!(
                    "uint data too long: {} octets",
                    cnt
                )));
            }
            (0, cnt, cnt * 8)
        };
        for _ in 0..bytes_to_read {
            num = (num << 8) + u128::from(self.ctx.get_byte()?);
        }
        Ok((num, bit_len))
    }

    pub fn read_uint_data(&mut self) -> Result<u64, Error> {
        let (num, _) = self.read_uint_data_helper()?;
        u64::try_from(num).map_err(|_| Error::MalformedInput("uint data out of range".into()))
    }

    pub fn read_int_data(&mut self) -> Result<i64, Error> {
        let (num, bit_len) = self.read_uint_data_helper()?;
        let sign_mask = 1u128 << (bit_len - 1);
        if num & sign_mask != 0 {
            let magnitude = num & !sign_mask;
            if magnitude > 1u128 << 63 {
                return Err(Error::MalformedInput("int data out of range".into()));
            }
            Ok((-(magnitude as i128)) as i64)
        } else {
            i64::try_from(num).map_err(|_| Error::MalformedInput("int data out of range".into()))
        }
    }

    fn read_len(&mut self) -> Result<usize, Error> {
        let len = self.read_uint_data()?;
        usize::try_from(len).map_err(|_| Error::MalformedInput("length out of range".into()))
    }

    fn read_datetime(&mut self) -> Result<DateTime, Error> {
        let mut d = self.read_int_data()?;
        let has_offset = d & 1 != 0;
        let sec_precision = d & 2 != 0;
        d >>= 2;
        let mut offset = 0i32;
        if has_offset {
            offset = (d & 0x7f) as i32;
            if offset & 0x40 != 0 {
                offset -= 128; // sign extension
            }
            d >>= 7;
        }
        if sec_precision {
            d = d
                .checked_mul(1000)
                .ok_or_else(|| Error::MalformedInput("date-time out of range".into()))?;
        }
        let epoch_msec = d
            .checked_add(SHV_EPOCH_MSEC)
            .ok_or_else(|| Error::MalformedInput("date-time out of range".into()))?;
        Ok(DateTime::new(epoch_msec, offset * 15))
    }

    fn read_cstring(&mut self) -> Result<String, Error> {
        let mut pctx = PackContext::new();
        loop {
            let b = self.ctx.get_byte()?;
            if b == b'\\' {
                let b = self.ctx.get_byte()?;
                match b {
                    b'\\' => pctx.put_byte(b'\\'),
                    b'0' => pctx.put_byte(0),
                    _ => pctx.put_byte(b),
                }
            } else if b == 0 {
                break; // end of string
            } else {
                pctx.put_byte(b);
            }
        }
        String::from_utf8(pctx.into_bytes())
            .map_err(|_| Error::MalformedInput("cstring is not valid utf-8".into()))
    }

    fn read_list_body(&mut self) -> Result<Vec<RpcValue>, Error> {
        let mut lst = Vec::new();
        loop {
            match self.ctx.peek_byte() {
                Some(CP_TERM) => {
                    self.ctx.get_byte()?;
                    return Ok(lst);
                }
                Some(_) => lst.push(self.read()?),
                None => return Err(Error::BufferUnderflow),
            }
        }
    }

    fn read_map_body(&mut self) -> Result<BTreeMap<String, RpcValue>, Error> {
        let mut map = BTreeMap::new();
        loop {
            match self.ctx.peek_byte() {
                Some(CP_TERM) => {
                    self.ctx.get_byte()?;
                    return Ok(map);
                }
                Some(_) => {
                    let key = self.read()?;
                    let val = self.read()?;
                    match key.value {
                        Value::String(s) => {
                            map.insert(s, val);
                        }
                        _ => {
                            return Err(Error::MalformedInput(
                                "map key must be a string".into(),
                            ))
                        }
                    }
                }
                None => return Err(Error::BufferUnderflow),
            }
        }
    }

    fn read_imap_body(&mut self) -> Result<BTreeMap<i64, RpcValue>, Error> {
        let mut map = BTreeMap::new();
        loop {
            match self.ctx.peek_byte() {
                Some(CP_TERM) => {
                    self.ctx.get_byte()?;
                    return Ok(map);
                }
                Some(_) => {
                    let key = self.read()?;
                    let val = self.read()?;
                    match key.as_int() {
                        Some(k) => {
                            map.insert(k, val);
                        }
                        None => {
                            return Err(Error::MalformedInput(
                                "imap key must be an integer".into(),
                            ))
                        }
                    }
                }
                None => return Err(Error::BufferUnderflow),
            }
        }
    }

    fn read_meta_body(&mut self) -> Result<MetaMap, Error> {
        let mut meta = MetaMap::new();
        loop {
            match self.ctx.peek_byte() {
                Some(CP_TERM) => {
                    self.ctx.get_byte()?;
                    return Ok(meta);
                }
                Some(_) => {
                    let key = self.read()?;
                    let val = self.read()?;
                    if let Some(k) = key.as_int() {
                        meta.insert_int(k, val);
                    } else if let Value::String(s) = key.value {
                        meta.insert_str(s, val);
                    } else {
                        return Err(Error::MalformedInput(
                            "meta key must be an integer or a string".into(),
                        ));
                    }
                }
                None => return Err(Error::BufferUnderflow),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(val: &RpcValue) -> Vec<u8> {
        let mut wr = ChainPackWriter::new();
        wr.write(val).unwrap();
        wr.into_bytes()
    }

    fn unpack(data: &[u8]) -> RpcValue {
        ChainPackReader::new(data).read().unwrap()
    }

    #[test]
    fn significant_bits_all_widths() {
        assert_eq!(significant_bits(0), 1);
        for width in 1..=64u32 {
            let low = 1u64 << (width - 1);
            let high = if width == 64 {
                u64::MAX
            } else {
                (1u64 << width) - 1
            };
            assert_eq!(significant_bits(low), width);
            assert_eq!(significant_bits(high), width);
        }
    }

    #[test]
    fn uint_data_round_trip_all_widths() {
        for width in 1..=64u32 {
            let low = 1u64 << (width - 1);
            let high = if width == 64 {
                u64::MAX
            } else {
                (1u64 << width) - 1
            };
            for num in [low, high] {
                let mut wr = ChainPackWriter::new();
                wr.write_uint_data(num);
                let bytes = wr.into_bytes();
                let mut rd = ChainPackReader::new(&bytes);
                assert_eq!(rd.read_uint_data().unwrap(), num, "width {}", width);
            }
        }
    }

    #[test]
    fn int_data_round_trip_all_widths() {
        let mut nums = vec![0i64, 1, -1, 63, 64, -64, 134, i64::MAX, i64::MIN + 1, i64::MIN];
        for width in 1..=62u32 {
            nums.push(1i64 << width);
            nums.push(-(1i64 << width));
        }
        for num in nums {
            let mut wr = ChainPackWriter::new();
            wr.write_int_data(num);
            let bytes = wr.into_bytes();
            let mut rd = ChainPackReader::new(&bytes);
            assert_eq!(rd.read_int_data().unwrap(), num);
        }
    }

    #[test]
    fn tiny_ints() {
        assert_eq!(pack(&RpcValue::from(1i64)), vec![0x41]);
        assert_eq!(pack(&RpcValue::from(0i64)), vec![0x40]);
        assert_eq!(pack(&RpcValue::from(63i64)), vec![0x7f]);
        assert_eq!(pack(&RpcValue::from(2u64)), vec![0x02]);
        assert_eq!(pack(&RpcValue::from(63u64)), vec![0x3f]);
        assert_eq!(unpack(&[0x41]).as_int(), Some(1));
        assert_eq!(unpack(&[0x02]).as_uint(), Some(2));
    }

    #[test]
    fn int_134_spills_to_two_byte_int_data() {
        // 134 needs 8 magnitude bits + sign, two payload octets
        assert_eq!(pack(&RpcValue::from(134i64)), vec![0x82, 0x80, 0x86]);
        assert_eq!(unpack(&[0x82, 0x80, 0x86]).as_int(), Some(134));
    }

    #[test]
    fn scalar_round_trips() {
        let vals = [
            RpcValue::null(),
            RpcValue::from(true),
            RpcValue::from(false),
            RpcValue::from(-2i64),
            RpcValue::from(u64::from(u32::MAX)),
            RpcValue::from(12.24f64),
            RpcValue::from(Decimal::new(-1234567890, 0)),
            RpcValue::from("ahoj svete"),
            RpcValue::from(b"\x00\x01\xff".to_vec()),
        ];
        for v in vals {
            assert_eq!(unpack(&pack(&v)), v);
        }
    }

    #[test]
    fn datetime_packing() {
        // SHV epoch itself: zero biased msec, seconds precision flag only
        let dt = RpcValue::from(DateTime::new(SHV_EPOCH_MSEC, 0));
        assert_eq!(pack(&dt), vec![CP_DATETIME, 0x02]);
        assert_eq!(unpack(&[CP_DATETIME, 0x02]), dt);

        for (msec, offset) in [
            (SHV_EPOCH_MSEC, 0),
            (SHV_EPOCH_MSEC + 1, 0),
            (1_493_836_200_000, 4 * 60),
            (1_493_836_200_001, -7 * 60),
            (1_493_836_200_000, -(3 * 60 + 30)),
            (SHV_EPOCH_MSEC - 123_456_789, 15),
        ] {
            let v = RpcValue::from(DateTime::new(msec, offset));
            assert_eq!(unpack(&pack(&v)), v, "msec {} offset {}", msec, offset);
        }
    }

    #[test]
    fn datetime_offset_out_of_range() {
        let mut wr = ChainPackWriter::new();
        let res = wr.write(&RpcValue::from(DateTime::new(0, 16 * 60)));
        assert!(matches!(res, Err(Error::InvalidValue(_))));
    }

    #[test]
    fn containers_round_trip() {
        let v = RpcValue::from_cpon("[1,[2,3],{\"a\":null},i{1:2u}]").unwrap();
        assert_eq!(unpack(&pack(&v)), v);
    }

    #[test]
    fn known_byte_vectors() {
        // <1:2>3
        let v = RpcValue::from_cpon("<1:2>3").unwrap();
        assert_eq!(pack(&v), hex::decode("8b4142ff43").unwrap());
        // {"foo":"bar"}
        let v = RpcValue::from_cpon("{\"foo\":\"bar\"}").unwrap();
        assert_eq!(pack(&v), hex::decode("898603666f6f8603626172ff").unwrap());
    }

    #[test]
    fn cstring_is_read_not_written() {
        // "a\0b" escaped on the wire, plain String on output
        let data = [CP_CSTRING, b'a', b'\\', b'0', b'b', 0];
        let v = unpack(&data);
        assert_eq!(v.as_str(), Some("a\0b"));
        assert_eq!(pack(&v)[0], CP_STRING);
    }

    #[test]
    fn writer_output_is_stable() {
        // write -> read -> write must reproduce the bytes
        let v = RpcValue::from_cpon("<8:3u>i{2:[[\".broker\",<1:2>true]]}").unwrap();
        let bytes = pack(&v);
        assert_eq!(pack(&unpack(&bytes)), bytes);
    }

    #[test]
    fn truncated_input_underflows() {
        let v = RpcValue::from_cpon("[1,2,3]").unwrap();
        let bytes = pack(&v);
        for cut in 0..bytes.len() {
            assert!(matches!(
                ChainPackReader::new(&bytes[..cut]).read(),
                Err(Error::BufferUnderflow)
            ));
        }
    }
}
