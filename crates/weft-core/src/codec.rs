//! Binary wire format.
//!
//! Self-describing: the first byte of every operation is a structure tag and
//! alone determines the remaining layout, so a single decode entry point
//! dispatches on it. Multi-byte integers are LEB128 varints. The insertion
//! form packs a feature-flag byte ahead of the variable fields so absent
//! optional fields cost nothing, and pure single-character text runs are
//! stored as one joined string instead of a JSON array.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::op::{
    Delete, Insert, InsertContent, ListContainer, MapContainer, OpId, Operation,
    XmlContainer,
};

const TAG_DELETE: u8 = 0;
const TAG_INSERT: u8 = 1;
const TAG_LIST: u8 = 2;
const TAG_MAP: u8 = 3;
const TAG_XML: u8 = 4;

const F_PARENT_SUB: u8 = 1;
const F_OP_CONTENT: u8 = 2;
const F_TEXT: u8 = 4;
const F_ORIGIN_IS_LEFT: u8 = 8;
const F_LEFT: u8 = 16;
const F_RIGHT: u8 = 32;
const F_ORIGIN: u8 = 64;

pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder { buf: BytesMut::new() }
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    fn write_u8(&mut self, b: u8) {
        self.buf.put_u8(b);
    }

    fn write_var_uint(&mut self, mut n: u64) {
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    fn write_var_string(&mut self, s: &str) {
        self.write_var_uint(s.len() as u64);
        self.buf.put_slice(s.as_bytes());
    }

    fn write_op_id(&mut self, id: OpId) {
        self.write_var_uint(id.client);
        self.write_var_uint(id.clock);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder::new()
    }
}

pub struct Decoder {
    buf: Bytes,
    pos: usize,
}

impl Decoder {
    pub fn new(buf: Bytes) -> Self {
        Decoder { buf, pos: 0 }
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| WeftError::Decode("unexpected end of message".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_var_uint(&mut self) -> Result<u64> {
        let mut n: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(WeftError::Decode("varint overflows u64".into()));
            }
            n |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(n);
            }
            shift += 7;
        }
    }

    fn read_var_string(&mut self) -> Result<String> {
        let len = self.read_var_uint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| WeftError::Decode("string exceeds message".into()))?;
        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|e| WeftError::Decode(format!("invalid utf-8: {e}")))?
            .to_owned();
        self.pos = end;
        Ok(s)
    }

    fn read_op_id(&mut self) -> Result<OpId> {
        let client = self.read_var_uint()?;
        let clock = self.read_var_uint()?;
        Ok(OpId::new(client, clock))
    }
}

/// Single-character strings only, so the run can travel as one joined string.
fn is_pure_text(values: &[Value]) -> bool {
    !values.is_empty()
        && values.iter().all(|v| match v {
            Value::String(s) => s.chars().count() == 1,
            _ => false,
        })
}

pub fn encode_operation(enc: &mut Encoder, op: &Operation) -> Result<()> {
    match op {
        Operation::Delete(d) => {
            enc.write_u8(TAG_DELETE);
            enc.write_op_id(d.target);
            enc.write_var_uint(d.length);
        }
        Operation::Insert(ins) => encode_insert(enc, ins)?,
        Operation::List(l) => {
            enc.write_u8(TAG_LIST);
            enc.write_op_id(l.id);
            enc.write_var_string(&l.type_name);
        }
        Operation::Map(m) => {
            enc.write_u8(TAG_MAP);
            enc.write_op_id(m.id);
            enc.write_var_string(&m.type_name);
        }
        Operation::Xml(x) => {
            enc.write_u8(TAG_XML);
            enc.write_op_id(x.id);
            enc.write_var_string(&x.type_name);
            enc.write_var_string(&x.node_name);
        }
    }
    Ok(())
}

fn encode_insert(enc: &mut Encoder, op: &Insert) -> Result<()> {
    enc.write_u8(TAG_INSERT);
    let (op_content, text, values): (Option<OpId>, bool, Option<&[Value]>) =
        match &op.content {
            InsertContent::Type(id) => (Some(*id), false, None),
            InsertContent::Values(v) => (None, is_pure_text(v), Some(v)),
            InsertContent::Reclaimed(_) => {
                return Err(WeftError::Corrupt(format!(
                    "reclaimed stub {:?} is not encodable",
                    op.id
                )))
            }
        };
    let origin_is_left = op.origin.is_some() && op.origin == op.left;
    let mut info = 0u8;
    if op.parent_sub.is_some() {
        info |= F_PARENT_SUB;
    }
    if op_content.is_some() {
        info |= F_OP_CONTENT;
    }
    if text {
        info |= F_TEXT;
    }
    if origin_is_left {
        info |= F_ORIGIN_IS_LEFT;
    }
    if op.left.is_some() {
        info |= F_LEFT;
    }
    if op.right.is_some() {
        info |= F_RIGHT;
    }
    if op.origin.is_some() {
        info |= F_ORIGIN;
    }
    enc.write_u8(info);
    enc.write_op_id(op.id);
    enc.write_op_id(op.parent);
    if let Some(left) = op.left {
        enc.write_op_id(left);
    }
    if let Some(right) = op.right {
        enc.write_op_id(right);
    }
    if !origin_is_left {
        if let Some(origin) = op.origin {
            enc.write_op_id(origin);
        }
    }
    if let Some(sub) = &op.parent_sub {
        enc.write_var_string(sub);
    }
    if let Some(nested) = op_content {
        enc.write_op_id(nested);
    } else if let Some(values) = values {
        if text {
            let joined: String = values
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .concat();
            enc.write_var_string(&joined);
        } else {
            enc.write_var_string(&serde_json::to_string(values)?);
        }
    }
    Ok(())
}

pub fn decode_operation(dec: &mut Decoder) -> Result<Operation> {
    let tag = dec.read_u8()?;
    match tag {
        TAG_DELETE => {
            let target = dec.read_op_id()?;
            let length = dec.read_var_uint()?;
            Ok(Operation::Delete(Delete { target, length }))
        }
        TAG_INSERT => decode_insert(dec),
        TAG_LIST => {
            let id = dec.read_op_id()?;
            let type_name = dec.read_var_string()?;
            Ok(Operation::List(ListContainer {
                id,
                type_name,
                start: None,
                end: None,
                deleted: false,
            }))
        }
        TAG_MAP => {
            let id = dec.read_op_id()?;
            let type_name = dec.read_var_string()?;
            Ok(Operation::Map(MapContainer {
                id,
                type_name,
                map: Default::default(),
                deleted: false,
            }))
        }
        TAG_XML => {
            let id = dec.read_op_id()?;
            let type_name = dec.read_var_string()?;
            let node_name = dec.read_var_string()?;
            Ok(Operation::Xml(XmlContainer {
                id,
                type_name,
                node_name,
                start: None,
                end: None,
                map: Default::default(),
                deleted: false,
            }))
        }
        other => Err(WeftError::UnknownTag(other)),
    }
}

fn decode_insert(dec: &mut Decoder) -> Result<Operation> {
    let info = dec.read_u8()?;
    let id = dec.read_op_id()?;
    let parent = dec.read_op_id()?;
    let left = if info & F_LEFT != 0 {
        Some(dec.read_op_id()?)
    } else {
        None
    };
    let right = if info & F_RIGHT != 0 {
        Some(dec.read_op_id()?)
    } else {
        None
    };
    let origin = if info & F_ORIGIN_IS_LEFT != 0 {
        left
    } else if info & F_ORIGIN != 0 {
        Some(dec.read_op_id()?)
    } else {
        None
    };
    let parent_sub = if info & F_PARENT_SUB != 0 {
        Some(dec.read_var_string()?)
    } else {
        None
    };
    let content = if info & F_OP_CONTENT != 0 {
        InsertContent::Type(dec.read_op_id()?)
    } else if info & F_TEXT != 0 {
        let text = dec.read_var_string()?;
        InsertContent::Values(
            text.chars().map(|c| Value::String(c.to_string())).collect(),
        )
    } else {
        let raw = dec.read_var_string()?;
        let values: Vec<Value> = serde_json::from_str(&raw)?;
        InsertContent::Values(values)
    };
    Ok(Operation::Insert(Insert {
        id,
        left,
        right,
        origin,
        parent,
        parent_sub,
        content,
        deleted: false,
        gc: false,
    }))
}

/// Encode a batch, length-prefixed.
pub fn encode_operations(ops: &[Operation]) -> Result<Bytes> {
    let mut enc = Encoder::new();
    enc.write_var_uint(ops.len() as u64);
    for op in ops {
        encode_operation(&mut enc, op)?;
    }
    Ok(enc.into_bytes())
}

pub fn decode_operations(buf: Bytes) -> Result<Vec<Operation>> {
    let mut dec = Decoder::new(buf);
    let count = dec.read_var_uint()? as usize;
    let mut ops = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        ops.push(decode_operation(&mut dec)?);
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(op: &Operation) -> Operation {
        let mut enc = Encoder::new();
        encode_operation(&mut enc, op).unwrap();
        let mut dec = Decoder::new(enc.into_bytes());
        let out = decode_operation(&mut dec).unwrap();
        assert!(!dec.has_remaining());
        out
    }

    #[test]
    fn delete_is_byte_exact() {
        let op = Operation::Delete(Delete { target: OpId::new(3, 200), length: 2 });
        let mut enc = Encoder::new();
        encode_operation(&mut enc, &op).unwrap();
        // tag, client=3, clock=200 as two-byte varint, length=2
        assert_eq!(enc.into_bytes().as_ref(), &[0, 3, 0xc8, 0x01, 2]);
    }

    #[test]
    fn varint_boundaries() {
        let mut enc = Encoder::new();
        enc.write_var_uint(0);
        enc.write_var_uint(127);
        enc.write_var_uint(128);
        enc.write_var_uint(u64::MAX);
        let mut dec = Decoder::new(enc.into_bytes());
        assert_eq!(dec.read_var_uint().unwrap(), 0);
        assert_eq!(dec.read_var_uint().unwrap(), 127);
        assert_eq!(dec.read_var_uint().unwrap(), 128);
        assert_eq!(dec.read_var_uint().unwrap(), u64::MAX);
    }

    #[test]
    fn pure_text_travels_as_joined_string() {
        let op = Operation::Insert(Insert {
            id: OpId::new(1, 0),
            left: None,
            right: None,
            origin: None,
            parent: OpId::root(0),
            parent_sub: None,
            content: InsertContent::Values(vec![json!("a"), json!("b")]),
            deleted: false,
            gc: false,
        });
        let mut enc = Encoder::new();
        encode_operation(&mut enc, &op).unwrap();
        let bytes = enc.into_bytes();
        // tag, flags(text only), id, parent, len=2, "ab"
        assert_eq!(bytes.as_ref(), &[1, 4, 1, 0, 0, 0, 2, b'a', b'b']);
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn origin_equal_to_left_is_not_reencoded() {
        let anchor = OpId::new(2, 7);
        let op = Operation::Insert(Insert {
            id: OpId::new(1, 3),
            left: Some(anchor),
            right: Some(OpId::new(2, 8)),
            origin: Some(anchor),
            parent: OpId::root(1),
            parent_sub: None,
            content: InsertContent::Values(vec![json!(42)]),
            deleted: false,
            gc: false,
        });
        let mut enc = Encoder::new();
        encode_operation(&mut enc, &op).unwrap();
        let bytes = enc.into_bytes();
        // flags: originIsLeft | left | right | origin
        assert_eq!(bytes[1], 8 | 16 | 32 | 64);
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn distinct_origin_roundtrips() {
        let op = Operation::Insert(Insert {
            id: OpId::new(5, 0),
            left: Some(OpId::new(1, 9)),
            right: None,
            origin: Some(OpId::new(1, 4)),
            parent: OpId::root(0),
            parent_sub: Some("title".into()),
            content: InsertContent::Values(vec![json!({"x": 1}), json!(null)]),
            deleted: false,
            gc: false,
        });
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn nested_container_roundtrips() {
        let op = Operation::Insert(Insert {
            id: OpId::new(5, 1),
            left: None,
            right: None,
            origin: None,
            parent: OpId::root(0),
            parent_sub: None,
            content: InsertContent::Type(OpId::new(5, 0)),
            deleted: false,
            gc: false,
        });
        assert_eq!(roundtrip(&op), op);
    }

    #[test]
    fn containers_roundtrip() {
        let list = Operation::List(ListContainer {
            id: OpId::root(0),
            type_name: "Array".into(),
            start: None,
            end: None,
            deleted: false,
        });
        assert_eq!(roundtrip(&list), list);
        let xml = Operation::Xml(XmlContainer {
            id: OpId::new(4, 0),
            type_name: "XmlElement".into(),
            node_name: "p".into(),
            start: None,
            end: None,
            map: Default::default(),
            deleted: false,
        });
        assert_eq!(roundtrip(&xml), xml);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut dec = Decoder::new(Bytes::from_static(&[9, 0, 0]));
        match decode_operation(&mut dec) {
            Err(WeftError::UnknownTag(9)) => {}
            other => panic!("expected UnknownTag, got {other:?}"),
        }
    }

    #[test]
    fn batch_roundtrips() {
        let ops = vec![
            Operation::Delete(Delete { target: OpId::new(1, 0), length: 1 }),
            Operation::List(ListContainer {
                id: OpId::root(2),
                type_name: "Array".into(),
                start: None,
                end: None,
                deleted: false,
            }),
        ];
        let bytes = encode_operations(&ops).unwrap();
        assert_eq!(decode_operations(bytes).unwrap(), ops);
    }

    #[test]
    fn truncated_message_is_a_decode_error() {
        let mut dec = Decoder::new(Bytes::from_static(&[1, 4, 1]));
        assert!(matches!(decode_operation(&mut dec), Err(WeftError::Decode(_))));
    }
}
