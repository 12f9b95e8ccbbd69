//! Two-frame request/response binary codec (§6.1).
//!
//! Each request is `[header_tag, body]`; each response is `[success_flag,
//! body]`. `header_tag` is a variable-length unsigned integer (LEB128);
//! `success_flag` is a single byte, `0x01` on success, `0x00` on failure.
//! Every body is itself a length-prefixed frame (`u32` little-endian length,
//! then that many bytes) whose contents are field-ordered little-endian
//! integers, length-prefixed UTF-8 strings, and count-prefixed lists.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use reconciler_core::diff::{Diff, Operation};
use reconciler_core::document::{Document, Path};
use reconciler_core::key::{DiffId, EntityName, InternalKey, OperationId, SourceName};

use crate::error::{ReconcileError, WireErrorKind};

const TAG_NOTIFY: u64 = 0;
const TAG_LIST_CONFLICTS: u64 = 1;
const TAG_RESOLVE: u64 = 2;
const TAG_FLUSH_WORK_QUEUE: u64 = 3;

/// `(entity, source, foreign_id)`, as carried by a `Notify` request (§6.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeNotification {
    pub entity: EntityName,
    pub source: SourceName,
    pub foreign_id: String,
}

/// A decoded client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Notify(ChangeNotification),
    ListConflicts,
    Resolve {
        diff_id: DiffId,
        operation_ids: Vec<OperationId>,
    },
    FlushWorkQueue,
}

/// One entry of a `ListConflicts` response: a `DiffRecord` that still has at
/// least one unresolved rejected operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictEntry {
    pub key: InternalKey,
    pub baseline: Document,
    pub applied: Diff,
    pub diff_id: DiffId,
    pub rejected: Vec<(OperationId, Operation)>,
}

/// A response body, paired with the success flag at encode time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    NotifyOk,
    ListConflicts(Vec<ConflictEntry>),
    ResolveOk,
    FlushWorkQueue(u64),
    Error(WireErrorKind, String),
}

fn invalid(detail: impl Into<String>) -> ReconcileError {
    ReconcileError::InvalidMessage { detail: detail.into() }
}

// --- primitive readers/writers -------------------------------------------

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, ReconcileError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(invalid("varint too long"));
        }
        // Transport failure, including a clean disconnect before the next
        // request's first byte: propagated as `Io`, not `InvalidMessage`, so
        // callers can tell "peer is gone" from "peer sent garbage".
        let byte = reader.read_u8().await?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u32_le(bytes: &[u8], pos: &mut usize) -> Result<u32, ReconcileError> {
    let slice = bytes
        .get(*pos..*pos + 4)
        .ok_or_else(|| invalid("truncated u32"))?;
    *pos += 4;
    Ok(u32::from_le_bytes(slice.try_into().expect("slice is 4 bytes")))
}

fn write_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u64_le(bytes: &[u8], pos: &mut usize) -> Result<u64, ReconcileError> {
    let slice = bytes
        .get(*pos..*pos + 8)
        .ok_or_else(|| invalid("truncated u64"))?;
    *pos += 8;
    Ok(u64::from_le_bytes(slice.try_into().expect("slice is 8 bytes")))
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_u32_le(buf, u32::try_from(s.len()).unwrap_or(u32::MAX));
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(bytes: &[u8], pos: &mut usize) -> Result<String, ReconcileError> {
    let len = read_u32_le(bytes, pos)? as usize;
    let slice = bytes.get(*pos..*pos + len).ok_or_else(|| invalid("truncated string"))?;
    *pos += len;
    String::from_utf8(slice.to_vec()).map_err(|e| invalid(format!("invalid utf-8: {e}")))
}

fn write_path(buf: &mut Vec<u8>, path: &Path) {
    write_string(buf, &path.as_dotted());
}

fn read_path(bytes: &[u8], pos: &mut usize) -> Result<Path, ReconcileError> {
    let s = read_string(bytes, pos)?;
    Path::parse(&s).map_err(|e| invalid(format!("{e}")))
}

fn write_operation(buf: &mut Vec<u8>, op: &Operation) {
    match op {
        Operation::Insert { path, value } => {
            buf.push(0);
            write_path(buf, path);
            write_string(buf, value);
        }
        Operation::Delete { path, old_value } => {
            buf.push(1);
            write_path(buf, path);
            write_string(buf, old_value);
        }
        Operation::Replace { path, old_value, new_value } => {
            buf.push(2);
            write_path(buf, path);
            write_string(buf, old_value);
            write_string(buf, new_value);
        }
    }
}

fn read_operation(bytes: &[u8], pos: &mut usize) -> Result<Operation, ReconcileError> {
    let tag = *bytes.get(*pos).ok_or_else(|| invalid("truncated operation tag"))?;
    *pos += 1;
    match tag {
        0 => {
            let path = read_path(bytes, pos)?;
            let value = read_string(bytes, pos)?;
            Ok(Operation::Insert { path, value })
        }
        1 => {
            let path = read_path(bytes, pos)?;
            let old_value = read_string(bytes, pos)?;
            Ok(Operation::Delete { path, old_value })
        }
        2 => {
            let path = read_path(bytes, pos)?;
            let old_value = read_string(bytes, pos)?;
            let new_value = read_string(bytes, pos)?;
            Ok(Operation::Replace { path, old_value, new_value })
        }
        other => Err(invalid(format!("unknown operation tag {other}"))),
    }
}

fn write_diff(buf: &mut Vec<u8>, diff: &Diff) {
    match &diff.label {
        Some(label) => {
            buf.push(1);
            write_string(buf, label);
        }
        None => buf.push(0),
    }
    write_u32_le(buf, u32::try_from(diff.len()).unwrap_or(u32::MAX));
    for op in diff.operations() {
        write_operation(buf, op);
    }
}

fn read_diff(bytes: &[u8], pos: &mut usize) -> Result<Diff, ReconcileError> {
    let has_label = *bytes.get(*pos).ok_or_else(|| invalid("truncated diff label flag"))?;
    *pos += 1;
    let label = if has_label == 1 {
        Some(read_string(bytes, pos)?)
    } else {
        None
    };
    let count = read_u32_le(bytes, pos)? as usize;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        ops.push(read_operation(bytes, pos)?);
    }
    let diff = Diff::from_sorted_operations(ops);
    Ok(match label {
        Some(l) => diff.with_label(l),
        None => diff,
    })
}

/// Encode a Document as a count-prefixed list of `(dotted path, value)`
/// pairs, in the Document's own lexicographic path order.
fn write_document(buf: &mut Vec<u8>, doc: &Document) {
    let paths = doc.paths();
    write_u32_le(buf, u32::try_from(paths.len()).unwrap_or(u32::MAX));
    for path in paths {
        let value = doc.get(&path).unwrap_or_default();
        write_path(buf, &path);
        write_string(buf, value);
    }
}

fn read_document(bytes: &[u8], pos: &mut usize) -> Result<Document, ReconcileError> {
    let count = read_u32_le(bytes, pos)? as usize;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let path = read_path(bytes, pos)?;
        let value = read_string(bytes, pos)?;
        pairs.push((path, value));
    }
    Ok(document_from_pairs(&pairs))
}

fn document_from_pairs(pairs: &[(Path, String)]) -> Document {
    let mut root = serde_json::Map::new();
    for (path, value) in pairs {
        insert_segment(&mut root, path.segments(), value.clone());
    }
    Document::from_json(&serde_json::Value::Object(root)).unwrap_or_else(|_| Document::empty())
}

fn insert_segment(map: &mut serde_json::Map<String, serde_json::Value>, segments: &[String], value: String) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(head.clone(), serde_json::Value::String(value));
        return;
    }
    let entry = map
        .entry(head.clone())
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(inner) = entry {
        insert_segment(inner, rest, value);
    }
}

fn write_internal_key(buf: &mut Vec<u8>, key: &InternalKey) {
    write_string(buf, key.entity());
    write_string(buf, key.id());
}

// --- frame-level read/write ------------------------------------------------

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ReconcileError> {
    let len = reader.read_u32_le().await?;
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), ReconcileError> {
    writer
        .write_u32_le(u32::try_from(body.len()).unwrap_or(u32::MAX))
        .await?;
    writer.write_all(body).await?;
    Ok(())
}

// --- request/response encode/decode ---------------------------------------

/// Read one request from the stream. The header tag is read first, then the
/// length-prefixed body frame.
///
/// # Errors
/// Returns [`ReconcileError::InvalidMessage`] on any framing, tag, or body
/// decoding failure, or [`ReconcileError::Io`] if the connection drops.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Request, ReconcileError> {
    let tag = read_varint(reader).await?;
    let body = read_frame(reader).await?;
    let mut pos = 0;
    match tag {
        TAG_NOTIFY => {
            let entity = read_string(&body, &mut pos)?;
            let source = read_string(&body, &mut pos)?;
            let foreign_id = read_string(&body, &mut pos)?;
            if entity.is_empty() || source.is_empty() || foreign_id.is_empty() {
                return Err(invalid("Notify fields must be non-empty"));
            }
            Ok(Request::Notify(ChangeNotification { entity, source, foreign_id }))
        }
        TAG_LIST_CONFLICTS => Ok(Request::ListConflicts),
        TAG_RESOLVE => {
            let diff_id = DiffId(read_u64_le(&body, &mut pos)?);
            let count = read_u32_le(&body, &mut pos)? as usize;
            let mut operation_ids = Vec::with_capacity(count);
            for _ in 0..count {
                operation_ids.push(OperationId(read_u32_le(&body, &mut pos)?));
            }
            Ok(Request::Resolve { diff_id, operation_ids })
        }
        TAG_FLUSH_WORK_QUEUE => Ok(Request::FlushWorkQueue),
        other => Err(invalid(format!("unknown request tag {other}"))),
    }
}

/// Write one response to the stream: success flag byte, then the
/// length-prefixed encoded body.
///
/// # Errors
/// Returns [`ReconcileError::Io`] if the write fails.
pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<(), ReconcileError> {
    let mut body = Vec::new();
    let success = match response {
        Response::NotifyOk | Response::ResolveOk => true,
        Response::ListConflicts(entries) => {
            write_u32_le(&mut body, u32::try_from(entries.len()).unwrap_or(u32::MAX));
            for entry in entries {
                write_internal_key(&mut body, &entry.key);
                write_document(&mut body, &entry.baseline);
                write_diff(&mut body, &entry.applied);
                write_u64_le(&mut body, entry.diff_id.0);
                write_u32_le(&mut body, u32::try_from(entry.rejected.len()).unwrap_or(u32::MAX));
                for (op_id, op) in &entry.rejected {
                    write_u32_le(&mut body, op_id.0);
                    write_operation(&mut body, op);
                }
            }
            true
        }
        Response::FlushWorkQueue(count) => {
            write_u64_le(&mut body, *count);
            true
        }
        Response::Error(kind, message) => {
            body.push(wire_error_kind_tag(*kind));
            write_string(&mut body, message);
            false
        }
    };

    writer.write_u8(u8::from(success)).await?;
    write_frame(writer, &body).await
}

fn wire_error_kind_tag(kind: WireErrorKind) -> u8 {
    match kind {
        WireErrorKind::InvalidMessage => 0,
        WireErrorKind::UnknownEntity => 1,
        WireErrorKind::UnknownSource => 2,
        WireErrorKind::NotFound => 3,
        WireErrorKind::Unavailable => 4,
        WireErrorKind::Conflict => 5,
        WireErrorKind::Internal => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn key(entity: &str, id: &str) -> InternalKey {
        InternalKey::new(entity, id).unwrap()
    }

    #[tokio::test]
    async fn notify_request_round_trips() {
        let mut buf = Vec::new();
        write_varint(&mut buf, TAG_NOTIFY);
        let mut body = Vec::new();
        write_string(&mut body, "customer");
        write_string(&mut body, "crm");
        write_string(&mut body, "A1");
        write_u32_le(&mut buf, u32::try_from(body.len()).unwrap());
        buf.extend_from_slice(&body);

        let mut cursor = Cursor::new(buf);
        let req = read_request(&mut cursor).await.unwrap();
        assert_eq!(
            req,
            Request::Notify(ChangeNotification {
                entity: "customer".to_owned(),
                source: "crm".to_owned(),
                foreign_id: "A1".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn notify_rejects_empty_fields() {
        let mut buf = Vec::new();
        write_varint(&mut buf, TAG_NOTIFY);
        let mut body = Vec::new();
        write_string(&mut body, "");
        write_string(&mut body, "crm");
        write_string(&mut body, "A1");
        write_u32_le(&mut buf, u32::try_from(body.len()).unwrap());
        buf.extend_from_slice(&body);

        let mut cursor = Cursor::new(buf);
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidMessage { .. }));
    }

    #[tokio::test]
    async fn resolve_request_round_trips() {
        let mut buf = Vec::new();
        write_varint(&mut buf, TAG_RESOLVE);
        let mut body = Vec::new();
        write_u64_le(&mut body, 7);
        write_u32_le(&mut body, 2);
        write_u32_le(&mut body, 0);
        write_u32_le(&mut body, 3);
        write_u32_le(&mut buf, u32::try_from(body.len()).unwrap());
        buf.extend_from_slice(&body);

        let mut cursor = Cursor::new(buf);
        let req = read_request(&mut cursor).await.unwrap();
        assert_eq!(
            req,
            Request::Resolve {
                diff_id: DiffId(7),
                operation_ids: vec![OperationId(0), OperationId(3)],
            }
        );
    }

    #[tokio::test]
    async fn unknown_tag_is_invalid_message() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 99);
        write_u32_le(&mut buf, 0);

        let mut cursor = Cursor::new(buf);
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidMessage { .. }));
    }

    #[tokio::test]
    async fn flush_work_queue_response_round_trips() {
        let mut out = Vec::new();
        write_response(&mut out, &Response::FlushWorkQueue(25)).await.unwrap();

        let mut cursor = Cursor::new(out);
        let flag = cursor.read_u8().await.unwrap();
        assert_eq!(flag, 1);
        let body = read_frame(&mut cursor).await.unwrap();
        let mut pos = 0;
        assert_eq!(read_u64_le(&body, &mut pos).unwrap(), 25);
    }

    #[tokio::test]
    async fn error_response_round_trips() {
        let mut out = Vec::new();
        write_response(&mut out, &Response::Error(WireErrorKind::NotFound, "gone".to_owned()))
            .await
            .unwrap();

        let mut cursor = Cursor::new(out);
        let flag = cursor.read_u8().await.unwrap();
        assert_eq!(flag, 0);
        let body = read_frame(&mut cursor).await.unwrap();
        assert_eq!(body[0], wire_error_kind_tag(WireErrorKind::NotFound));
        let mut pos = 1;
        assert_eq!(read_string(&body, &mut pos).unwrap(), "gone");
    }

    #[tokio::test]
    async fn list_conflicts_response_round_trips_document_and_diff() {
        let doc = Document::from_json(&serde_json::json!({"name": "Alice", "address": {"city": "NYC"}})).unwrap();
        let op = Operation::Insert { path: Path::parse("tier").unwrap(), value: "gold".to_owned() };
        let diff = Diff::from_sorted_operations(vec![op.clone()]).with_label("crm");
        let entry = ConflictEntry {
            key: key("customer", "42"),
            baseline: doc.clone(),
            applied: diff.clone(),
            diff_id: DiffId(3),
            rejected: vec![(OperationId(0), op)],
        };

        let mut out = Vec::new();
        write_response(&mut out, &Response::ListConflicts(vec![entry])).await.unwrap();

        let mut cursor = Cursor::new(out);
        let flag = cursor.read_u8().await.unwrap();
        assert_eq!(flag, 1);
        let body = read_frame(&mut cursor).await.unwrap();
        let mut pos = 0;
        let count = read_u32_le(&body, &mut pos).unwrap();
        assert_eq!(count, 1);
        let entity = read_string(&body, &mut pos).unwrap();
        let id = read_string(&body, &mut pos).unwrap();
        assert_eq!((entity.as_str(), id.as_str()), ("customer", "42"));
        let decoded_doc = read_document(&body, &mut pos).unwrap();
        assert_eq!(decoded_doc, doc);
        let decoded_diff = read_diff(&body, &mut pos).unwrap();
        assert_eq!(decoded_diff, diff);
        let diff_id = read_u64_le(&body, &mut pos).unwrap();
        assert_eq!(diff_id, 3);
        let rejected_count = read_u32_le(&body, &mut pos).unwrap();
        assert_eq!(rejected_count, 1);
    }

    #[test]
    fn varint_handles_multi_byte_values() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0b1010_1100, 0b0000_0010]);
    }
}
