//! Binary node encoding.
//!
//! Nodes are stored as a small length-prefixed record structure followed by a
//! checksum. A record is either a byte string or a list of records:
//!
//! ```text
//! Bytes: 0x80 | len (u32 LE) | data
//! List:  0xC0 | len (u32 LE) | items...      (len = payload bytes)
//! ```
//!
//! The node variant is implied by the shape of the top-level list:
//!
//! ```text
//! Leaf:     [ [entry*], next-id ]      entry = [ identifier*, value ]
//! Internal: [ [child*] ]               child = [ separator, child-id ]
//! ```
//!
//! Node IDs are 8-byte big-endian, `0` standing for "no node". The node's own
//! ID is not part of the payload; it is the key the payload is stored under.
//! A CRC32 of the record (u32 LE) trails every payload.

// Record lengths are bounded by node size, which fits in u32
#![allow(clippy::cast_possible_truncation)]

use crate::index::node::{ChildEntry, InternalNode, LeafEntry, LeafNode, NO_NODE, Node, NodeId};
use crate::index::value::Value;

const TAG_BYTES: u8 = 0x80;
const TAG_LIST: u8 = 0xC0;

/// Tag (1) + length (4).
const ITEM_HEADER_SIZE: usize = 5;

/// CRC32 checksum size at end of payload.
const CHECKSUM_SIZE: usize = 4;

/// Deepest list nesting a node uses: node, entry list, entry.
const MAX_LIST_DEPTH: usize = 2;

/// Errors that can occur when encoding or decoding nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The bytes don't describe a valid node.
    MalformedEncoding(String),
    /// Only resolved nodes can be encoded.
    UnresolvedNode(NodeId),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedEncoding(reason) => write!(f, "malformed node encoding: {reason}"),
            Self::UnresolvedNode(id) => write!(f, "cannot encode unresolved node {id}"),
        }
    }
}

impl std::error::Error for NodeError {}

fn malformed(reason: impl Into<String>) -> NodeError {
    NodeError::MalformedEncoding(reason.into())
}

/// Builds nested records into a flat buffer.
struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn bytes(&mut self, data: &[u8]) {
        self.buf.push(TAG_BYTES);
        self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(data);
    }

    fn node_id(&mut self, id: Option<NodeId>) {
        self.bytes(&id.unwrap_or(NO_NODE).to_be_bytes());
    }

    /// Write a list whose items are produced by `items`.
    fn list(&mut self, items: impl FnOnce(&mut Self)) {
        self.buf.push(TAG_LIST);
        let len_at = self.buf.len();
        self.buf.extend_from_slice(&[0u8; 4]);
        items(self);
        let payload_len = (self.buf.len() - len_at - 4) as u32;
        self.buf[len_at..len_at + 4].copy_from_slice(&payload_len.to_le_bytes());
    }

    /// Append the checksum and return the finished buffer.
    fn finish(mut self) -> Vec<u8> {
        let checksum = crc32fast::hash(&self.buf);
        self.buf.extend_from_slice(&checksum.to_le_bytes());
        self.buf
    }
}

/// A decoded record borrowing from the input.
#[derive(Debug)]
enum Record<'a> {
    Bytes(&'a [u8]),
    List(Vec<Record<'a>>),
}

impl<'a> Record<'a> {
    fn into_bytes(self, what: &str) -> Result<&'a [u8], NodeError> {
        match self {
            Self::Bytes(data) => Ok(data),
            Self::List(_) => Err(malformed(format!("{what}: expected bytes, found list"))),
        }
    }

    fn into_list(self, what: &str) -> Result<Vec<Self>, NodeError> {
        match self {
            Self::List(items) => Ok(items),
            Self::Bytes(_) => Err(malformed(format!("{what}: expected list, found bytes"))),
        }
    }
}

/// Parse one record starting at `pos`, returning it and the position after it.
///
/// `depth` counts the lists enclosing this record.
fn parse_record(buf: &[u8], pos: usize, depth: usize) -> Result<(Record<'_>, usize), NodeError> {
    if buf.len() < pos + ITEM_HEADER_SIZE {
        return Err(malformed("truncated record header"));
    }
    let tag = buf[pos];
    let len = u32::from_le_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], buf[pos + 4]]) as usize;
    let start = pos + ITEM_HEADER_SIZE;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| malformed("record length exceeds input"))?;

    match tag {
        TAG_BYTES => Ok((Record::Bytes(&buf[start..end]), end)),
        TAG_LIST if depth > MAX_LIST_DEPTH => Err(malformed("records nested too deeply")),
        TAG_LIST => {
            let mut items = Vec::new();
            let mut cursor = start;
            while cursor < end {
                let (item, next) = parse_record(&buf[..end], cursor, depth + 1)?;
                items.push(item);
                cursor = next;
            }
            Ok((Record::List(items), end))
        }
        other => Err(malformed(format!("unknown record tag {other:#04x}"))),
    }
}

/// Verify the checksum and parse the single top-level record.
fn parse_payload(bytes: &[u8]) -> Result<Record<'_>, NodeError> {
    if bytes.len() < CHECKSUM_SIZE {
        return Err(malformed("payload shorter than checksum"));
    }
    let body_end = bytes.len() - CHECKSUM_SIZE;
    let stored = u32::from_le_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    let computed = crc32fast::hash(&bytes[..body_end]);
    if stored != computed {
        return Err(malformed(format!(
            "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
        )));
    }

    let body = &bytes[..body_end];
    let (record, end) = parse_record(body, 0, 0)?;
    if end != body.len() {
        return Err(malformed("trailing bytes after record"));
    }
    Ok(record)
}

fn decode_node_id(data: &[u8]) -> Result<Option<NodeId>, NodeError> {
    let raw: [u8; 8] = data
        .try_into()
        .map_err(|_| malformed(format!("node id must be 8 bytes, found {}", data.len())))?;
    let id = NodeId::from_be_bytes(raw);
    Ok((id != NO_NODE).then_some(id))
}

fn write_entry(w: &mut RecordWriter, entry: &LeafEntry) {
    w.list(|w| {
        for identifier in &entry.identifiers {
            w.bytes(identifier);
        }
        w.bytes(entry.value.as_bytes());
    });
}

fn decode_entry(record: Record<'_>) -> Result<LeafEntry, NodeError> {
    let mut fields = record.into_list("leaf entry")?;
    let value = fields
        .pop()
        .ok_or_else(|| malformed("leaf entry has no value"))?
        .into_bytes("entry value")?;
    let identifiers = fields
        .into_iter()
        .map(|f| f.into_bytes("identifier").map(<[u8]>::to_vec))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LeafEntry {
        value: Value::from(value),
        identifiers,
    })
}

fn decode_child(record: Record<'_>) -> Result<ChildEntry, NodeError> {
    let fields = record.into_list("child entry")?;
    if fields.len() != 2 {
        return Err(malformed(format!(
            "child entry has {} fields, expected 2",
            fields.len()
        )));
    }
    let mut fields = fields.into_iter();
    let separator = fields
        .next()
        .ok_or_else(|| malformed("missing separator"))?
        .into_bytes("separator")?;
    let child = fields
        .next()
        .ok_or_else(|| malformed("missing child id"))?
        .into_bytes("child id")?;
    let child = decode_node_id(child)?.ok_or_else(|| malformed("child id is the null node"))?;
    Ok(ChildEntry {
        separator: Value::from(separator),
        child,
    })
}

/// Serialize a resolved node.
///
/// Child and next references are written as bare IDs.
pub fn encode(node: &Node) -> Result<Vec<u8>, NodeError> {
    let mut w = RecordWriter::new();
    match node {
        Node::Leaf(leaf) => w.list(|w| {
            w.list(|w| {
                for entry in &leaf.entries {
                    write_entry(w, entry);
                }
            });
            w.node_id(leaf.next);
        }),
        Node::Internal(internal) => w.list(|w| {
            w.list(|w| {
                for child in &internal.children {
                    w.list(|w| {
                        w.bytes(child.separator.as_bytes());
                        w.node_id(Some(child.child));
                    });
                }
            });
        }),
        Node::Unresolved(id) => return Err(NodeError::UnresolvedNode(*id)),
    }
    Ok(w.finish())
}

/// Exact length of `encode(node)` without building the buffer.
///
/// Unresolved nodes have no encoding and report zero.
#[must_use]
pub fn encoded_len(node: &Node) -> usize {
    let entry_len = |entry: &LeafEntry| {
        ITEM_HEADER_SIZE
            + entry
                .identifiers
                .iter()
                .map(|id| ITEM_HEADER_SIZE + id.len())
                .sum::<usize>()
            + ITEM_HEADER_SIZE
            + entry.value.as_bytes().len()
    };
    let node_id_len = ITEM_HEADER_SIZE + 8;

    let body = match node {
        Node::Leaf(leaf) => {
            ITEM_HEADER_SIZE + leaf.entries.iter().map(entry_len).sum::<usize>() + node_id_len
        }
        Node::Internal(internal) => {
            ITEM_HEADER_SIZE
                + internal
                    .children
                    .iter()
                    .map(|c| {
                        ITEM_HEADER_SIZE
                            + ITEM_HEADER_SIZE
                            + c.separator.as_bytes().len()
                            + node_id_len
                    })
                    .sum::<usize>()
        }
        Node::Unresolved(_) => return 0,
    };
    ITEM_HEADER_SIZE + body + CHECKSUM_SIZE
}

/// Deserialize the node stored under `id`.
pub fn decode(id: NodeId, bytes: &[u8]) -> Result<Node, NodeError> {
    let fields = parse_payload(bytes)?.into_list("node")?;
    match fields.len() {
        2 => {
            let mut fields = fields.into_iter();
            let entries = fields
                .next()
                .ok_or_else(|| malformed("missing leaf entries"))?
                .into_list("leaf entries")?
                .into_iter()
                .map(decode_entry)
                .collect::<Result<Vec<_>, _>>()?;
            let next = fields
                .next()
                .ok_or_else(|| malformed("missing next id"))?
                .into_bytes("next id")?;
            Ok(Node::Leaf(LeafNode {
                id,
                entries,
                next: decode_node_id(next)?,
            }))
        }
        1 => {
            let children = fields
                .into_iter()
                .next()
                .ok_or_else(|| malformed("missing children"))?
                .into_list("children")?
                .into_iter()
                .map(decode_child)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Node::Internal(InternalNode { id, children }))
        }
        n => Err(malformed(format!(
            "node has {n} top-level fields, expected 1 or 2"
        ))),
    }
}

/// Serialize a bare list of entries (used for the special-value table).
#[must_use]
pub fn encode_entries(entries: &[LeafEntry]) -> Vec<u8> {
    let mut w = RecordWriter::new();
    w.list(|w| {
        for entry in entries {
            write_entry(w, entry);
        }
    });
    w.finish()
}

/// Deserialize a list written by [`encode_entries`].
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<LeafEntry>, NodeError> {
    parse_payload(bytes)?
        .into_list("entries")?
        .into_iter()
        .map(decode_entry)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_leaf() -> Node {
        let mut leaf = LeafNode::new(7);
        leaf.insert(Value::from_u64(10), b"tx-a".to_vec());
        leaf.insert(Value::from_u64(10), b"tx-b".to_vec());
        leaf.insert(Value::new(vec![0x01, 0x00]), b"tx-c".to_vec());
        leaf.next = Some(12);
        Node::Leaf(leaf)
    }

    fn sample_internal() -> Node {
        Node::Internal(InternalNode::new(
            3,
            vec![
                ChildEntry {
                    separator: Value::from_u64(99),
                    child: 4,
                },
                ChildEntry {
                    separator: Value::from_u64(30_000),
                    child: 5,
                },
            ],
        ))
    }

    #[test]
    fn test_leaf_roundtrip() {
        let node = sample_leaf();
        let bytes = encode(&node).expect("encode");
        assert_eq!(decode(7, &bytes).expect("decode"), node);
    }

    #[test]
    fn test_tail_leaf_roundtrip() {
        let mut leaf = LeafNode::new(1);
        leaf.insert(Value::from_u64(1), Vec::new());
        let node = Node::Leaf(leaf);

        let bytes = encode(&node).expect("encode");
        let Node::Leaf(decoded) = decode(1, &bytes).expect("decode") else {
            panic!("expected a leaf");
        };
        assert_eq!(decoded.next, None);
        assert_eq!(decoded.entries[0].identifiers, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_internal_roundtrip() {
        let node = sample_internal();
        let bytes = encode(&node).expect("encode");
        assert_eq!(decode(3, &bytes).expect("decode"), node);
    }

    #[test]
    fn test_encoded_len_matches_encode() {
        for node in [sample_leaf(), sample_internal(), Node::Leaf(LeafNode::new(2))] {
            let bytes = encode(&node).expect("encode");
            assert_eq!(encoded_len(&node), bytes.len());
        }
        assert_eq!(encoded_len(&Node::Unresolved(1)), 0);
    }

    #[test]
    fn test_decode_uses_supplied_id() {
        let bytes = encode(&sample_internal()).expect("encode");
        assert_eq!(decode(42, &bytes).expect("decode").id(), 42);
    }

    #[test]
    fn test_encode_unresolved_fails() {
        assert_eq!(
            encode(&Node::Unresolved(9)),
            Err(NodeError::UnresolvedNode(9))
        );
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let bytes = encode(&sample_leaf()).expect("encode");
        for cut in [0, 1, 4, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(
                    decode(7, &bytes[..cut]),
                    Err(NodeError::MalformedEncoding(_))
                ),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn test_corrupted_byte_is_malformed() {
        let mut bytes = encode(&sample_internal()).expect("encode");
        bytes[8] ^= 0x40;
        assert!(matches!(
            decode(3, &bytes),
            Err(NodeError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_wrong_field_count_is_malformed() {
        let mut w = RecordWriter::new();
        w.list(|w| {
            w.list(|_| {});
            w.bytes(&[0; 8]);
            w.bytes(b"extra");
        });
        let err = decode(1, &w.finish()).expect_err("three fields");
        assert!(err.to_string().contains("3 top-level fields"));
    }

    #[test]
    fn test_deep_nesting_is_malformed() {
        // 200k nested empty lists with a valid checksum
        let depth = 200_000usize;
        let mut body = Vec::with_capacity(depth * ITEM_HEADER_SIZE + CHECKSUM_SIZE);
        for level in 0..depth {
            let inner = (depth - 1 - level) * ITEM_HEADER_SIZE;
            body.push(TAG_LIST);
            body.extend_from_slice(&(inner as u32).to_le_bytes());
        }
        let checksum = crc32fast::hash(&body);
        body.extend_from_slice(&checksum.to_le_bytes());

        assert_eq!(
            decode(1, &body),
            Err(NodeError::MalformedEncoding(
                "records nested too deeply".to_string()
            ))
        );
    }

    #[test]
    fn test_nesting_one_past_entries_is_malformed() {
        let mut w = RecordWriter::new();
        w.list(|w| {
            w.list(|w| {
                w.list(|w| {
                    w.list(|_| {});
                    w.bytes(&[5]);
                });
            });
            w.node_id(None);
        });
        assert!(matches!(
            decode(1, &w.finish()),
            Err(NodeError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_child_with_null_id_is_malformed() {
        let mut w = RecordWriter::new();
        w.list(|w| {
            w.list(|w| {
                w.list(|w| {
                    w.bytes(&[5]);
                    w.node_id(None);
                });
            });
        });
        assert!(decode(1, &w.finish()).is_err());
    }

    #[test]
    fn test_entries_roundtrip() {
        let entries = vec![
            LeafEntry::new(Value::from_u64(0), b"zero".to_vec()),
            LeafEntry {
                value: Value::from_u64(1),
                identifiers: vec![b"x".to_vec(), b"y".to_vec()],
            },
        ];
        let bytes = encode_entries(&entries);
        assert_eq!(decode_entries(&bytes).expect("decode"), entries);
        assert!(decode_entries(&encode_entries(&[])).expect("decode").is_empty());
    }
}
