/*

The ChainPack packing schema

Every value starts with one packing-schema octet. Octets below 128 carry a
tiny integer inline: bit 6 set means a tiny Int, bit 6 clear a tiny UInt,
the low 6 bits are the value. Octets 128..=142 are explicit type prefixes,
253..=255 are the Bool literals and the container terminator.

**** uint data

Multi-octet unsigned integers use a prefix-length scheme on the first octet:

     0 ...  7 bits  1  byte  |0|x|x|x|x|x|x|x|
     8 ... 14 bits  2  bytes |1|0|x|x|x|x|x|x| |x|x|x|x|x|x|x|x|
    15 ... 21 bits  3  bytes |1|1|0|x|x|x|x|x| ...
    22 ... 28 bits  4  bytes |1|1|1|0|x|x|x|x| ...
    29+       bits  5+ bytes |1|1|1|1|n|n|n|n| followed by n+4 payload octets

The value is stored big-endian across the payload bits. The shortest form
whose payload width covers the value's significant bits is used.

**** int data

Same framing; one sign bit is added on top of the magnitude's significant
bits and placed at the top of the expanded payload width.

**** DateTime

Packed int data: epoch msec biased by the SHV epoch (2018-02-02 00:00:00
UTC), optionally divided by 1000 (seconds precision) and carrying a 7-bit
signed UTC offset in quarter hours. Two low flag bits: bit 0 = has offset,
bit 1 = seconds precision.

**** Containers

List, Map, IMap and MetaMap have no length field; they are a sequence of
encoded items (key/value pairs for the map kinds) ended by CP_TERM.

*/

// Packing schema octets
pub const CP_NULL: u8 = 128;
pub const CP_UINT: u8 = 129;
pub const CP_INT: u8 = 130;
pub const CP_DOUBLE: u8 = 131;
pub const CP_BOOL: u8 = 132;
pub const CP_BLOB: u8 = 133;
pub const CP_STRING: u8 = 134; // utf8 encoded string
pub const CP_LIST: u8 = 136;
pub const CP_MAP: u8 = 137;
pub const CP_IMAP: u8 = 138;
pub const CP_META_MAP: u8 = 139;
pub const CP_DECIMAL: u8 = 140;
pub const CP_DATETIME: u8 = 141;
pub const CP_CSTRING: u8 = 142;
pub const CP_FALSE: u8 = 253;
pub const CP_TRUE: u8 = 254;
pub const CP_TERM: u8 = 255;

// UTC msec since 2.2. 2018
// Fri Feb 02 2018 00:00:00 == 1517529600 EPOCH
pub const SHV_EPOCH_MSEC: i64 = 1_517_529_600_000;

// Protocol octet of a wire frame, selects the body encoding
pub const PROTOCOL_CHAINPACK: u8 = 1;
pub const PROTOCOL_CPON: u8 = 2;

pub const DEFAULT_PORT: u16 = 3755;

// Reserved RpcMessage meta keys
pub const TAG_REQUEST_ID: i64 = 8;
pub const TAG_SHV_PATH: i64 = 9;
pub const TAG_METHOD: i64 = 10;
pub const TAG_CALLER_IDS: i64 = 11;

// Reserved RpcMessage payload keys
pub const KEY_PARAMS: i64 = 1;
pub const KEY_RESULT: i64 = 2;
pub const KEY_ERROR: i64 = 3;
