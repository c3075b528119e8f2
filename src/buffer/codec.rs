//! Spill file record format.
//!
//! A spill file starts with a 6-byte header (`BCSP` + big-endian `u16`
//! version) followed by records. Each record is a big-endian `u32` body
//! length and the body. Body fields are written in a fixed order; strings
//! and JSON maps are `u32`-length-prefixed UTF-8, optional fields carry a
//! one-byte presence flag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};
use std::io;

use crate::position::{BinlogPosition, Position};
use crate::row::{RowEvent, RowKind};
use crate::{Error, Result};

pub const SPILL_MAGIC: &[u8; 4] = b"BCSP";
pub const SPILL_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 6;

/// Records larger than this are treated as corruption.
const MAX_RECORD_LEN: u32 = 256 * 1024 * 1024;

pub fn header() -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(SPILL_MAGIC);
    h[4..].copy_from_slice(&SPILL_VERSION.to_be_bytes());
    h
}

pub fn check_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != SPILL_MAGIC {
        return Err(corrupt("invalid spill file magic"));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != SPILL_VERSION {
        return Err(corrupt(&format!("unsupported spill file version {}", version)));
    }
    Ok(())
}

/// Validates a record length read from a spill file.
pub fn check_record_len(len: u32) -> Result<usize> {
    if len > MAX_RECORD_LEN {
        return Err(corrupt(&format!("record length {} exceeds limit", len)));
    }
    Ok(len as usize)
}

/// Encodes `row` as one length-prefixed record.
pub fn encode(row: &RowEvent) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(256);

    body.put_u8(kind_tag(row.kind));
    put_str(&mut body, &row.database);
    put_opt_str(&mut body, row.table.as_deref());
    body.put_i64(row.timestamp_millis);

    body.put_u32(row.primary_key_columns.len() as u32);
    for pk in &row.primary_key_columns {
        put_str(&mut body, pk);
    }

    put_map(&mut body, &row.data)?;
    put_map(&mut body, &row.old_data)?;
    put_position(&mut body, &row.position);
    put_position(&mut body, &row.next_position);

    put_opt_u64(&mut body, row.transaction_id);
    body.put_u32(row.transaction_offset);
    body.put_u8(row.tx_commit as u8);
    put_opt_u64(&mut body, row.server_id);
    body.put_u64(row.schema_version);
    put_opt_str(&mut body, row.sql.as_deref());

    let mut record = BytesMut::with_capacity(4 + body.len());
    record.put_u32(body.len() as u32);
    record.extend_from_slice(&body);
    Ok(record.freeze())
}

/// Decodes one record body (without its length prefix).
pub fn decode(mut body: Bytes) -> Result<RowEvent> {
    let buf = &mut body;

    let kind = tag_kind(get_u8(buf)?)?;
    let database = get_str(buf)?;
    let table = get_opt_str(buf)?;
    let timestamp_millis = get_i64(buf)?;

    let pk_count = get_u32(buf)? as usize;
    let mut primary_key_columns = Vec::with_capacity(pk_count.min(64));
    for _ in 0..pk_count {
        primary_key_columns.push(get_str(buf)?);
    }

    let data = get_map(buf)?;
    let old_data = get_map(buf)?;
    let position = get_position(buf)?;
    let next_position = get_position(buf)?;

    let transaction_id = get_opt_u64(buf)?;
    let transaction_offset = get_u32(buf)?;
    let tx_commit = get_u8(buf)? != 0;
    let server_id = get_opt_u64(buf)?;
    let schema_version = get_u64(buf)?;
    let sql = get_opt_str(buf)?;

    if buf.has_remaining() {
        return Err(corrupt("trailing bytes after record"));
    }

    Ok(RowEvent {
        kind,
        database,
        table,
        timestamp_millis,
        primary_key_columns,
        data,
        old_data,
        position,
        next_position,
        transaction_id,
        transaction_offset,
        tx_commit,
        server_id,
        schema_version,
        sql,
    })
}

fn kind_tag(kind: RowKind) -> u8 {
    match kind {
        RowKind::Insert => 0,
        RowKind::Update => 1,
        RowKind::Delete => 2,
        RowKind::Ddl => 3,
        RowKind::Heartbeat => 4,
        RowKind::Commit => 5,
        RowKind::BootstrapStart => 6,
        RowKind::BootstrapInsert => 7,
        RowKind::BootstrapComplete => 8,
    }
}

fn tag_kind(tag: u8) -> Result<RowKind> {
    Ok(match tag {
        0 => RowKind::Insert,
        1 => RowKind::Update,
        2 => RowKind::Delete,
        3 => RowKind::Ddl,
        4 => RowKind::Heartbeat,
        5 => RowKind::Commit,
        6 => RowKind::BootstrapStart,
        7 => RowKind::BootstrapInsert,
        8 => RowKind::BootstrapComplete,
        other => return Err(corrupt(&format!("unknown row kind tag {}", other))),
    })
}

fn corrupt(message: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("corrupt spill file: {}", message),
    ))
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_opt_u64(buf: &mut BytesMut, v: Option<u64>) {
    match v {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_map(buf: &mut BytesMut, map: &Map<String, Value>) -> Result<()> {
    let json = serde_json::to_vec(map)?;
    buf.put_u32(json.len() as u32);
    buf.extend_from_slice(&json);
    Ok(())
}

fn put_position(buf: &mut BytesMut, p: &Position) {
    put_str(buf, p.binlog().file());
    buf.put_u64(p.binlog().offset());
    buf.put_i64(p.last_heartbeat_read());
}

fn ensure(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(corrupt("truncated record"));
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| corrupt("invalid utf-8 in string field"))
}

fn get_opt_str(buf: &mut Bytes) -> Result<Option<String>> {
    match get_u8(buf)? {
        0 => Ok(None),
        _ => get_str(buf).map(Some),
    }
}

fn get_opt_u64(buf: &mut Bytes) -> Result<Option<u64>> {
    match get_u8(buf)? {
        0 => Ok(None),
        _ => get_u64(buf).map(Some),
    }
}

fn get_map(buf: &mut Bytes) -> Result<Map<String, Value>> {
    let raw = get_bytes(buf)?;
    Ok(serde_json::from_slice(&raw)?)
}

fn get_position(buf: &mut Bytes) -> Result<Position> {
    let file = get_str(buf)?;
    let offset = get_u64(buf)?;
    let heartbeat = get_i64(buf)?;
    Ok(Position::new(BinlogPosition::new(file, offset)?, heartbeat))
}
