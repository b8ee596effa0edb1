//! Shared test utilities for pgllsr-lib integration tests.
//!
//! Streams are driven by a fake reader: `/bin/sh -c <script>` which ignores
//! the generated connection arguments and replays pre-built frames from a
//! scratch file, so no database is needed.
#![allow(dead_code)]

use bytes::BufMut;
use pgllsr_lib::proto::{datum_message::Datum, DatumMessage, Op, RowMessage};
use pgllsr_lib::{ConnectionConfig, LogPos, ReaderCommand, Stream, StreamOptions};
use prost::Message;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

pub const TEST_TABLE: &str = "public.llsr_test_table";
pub const TEST_SLOT: &str = "llsr_test_slot";

/// Upper bound for any wait on the completion signal
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Encode one frame: length prefix, position, RowMessage
pub fn frame(position: u64, row: &RowMessage) -> Vec<u8> {
    let body = row.encode_to_vec();
    let mut out = Vec::with_capacity(12 + body.len());
    out.put_u32((8 + body.len()) as u32);
    out.put_u64(position);
    out.extend_from_slice(&body);
    out
}

/// A frame whose payload is not a valid record
pub fn garbage_frame(position: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_u32(11);
    out.put_u64(position);
    out.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
    out
}

fn datum(name: &str, type_oid: i64, value: Datum) -> DatumMessage {
    DatumMessage {
        column_name: Some(name.to_string()),
        column_type: Some(type_oid),
        datum: Some(value),
    }
}

pub fn boundary_row(op: Op, xid: u32) -> RowMessage {
    RowMessage {
        transaction_id: Some(xid),
        commit_time: Some(1_760_000_000_000_000),
        table: None,
        op: Some(op as i32),
        new_tuple: vec![],
        old_tuple: vec![],
    }
}

pub fn insert_row(id: i32, txt: &str) -> RowMessage {
    RowMessage {
        transaction_id: Some(1),
        commit_time: None,
        table: Some(TEST_TABLE.to_string()),
        op: Some(Op::Insert as i32),
        new_tuple: vec![
            datum("id", 23, Datum::DatumInt32(id)),
            datum("txt", 25, Datum::DatumString(txt.to_string())),
        ],
        old_tuple: vec![],
    }
}

pub fn update_row(id: i32, old_txt: &str, new_txt: &str) -> RowMessage {
    RowMessage {
        transaction_id: Some(2),
        commit_time: None,
        table: Some(TEST_TABLE.to_string()),
        op: Some(Op::Update as i32),
        new_tuple: vec![
            datum("id", 23, Datum::DatumInt32(id)),
            datum("txt", 25, Datum::DatumString(new_txt.to_string())),
        ],
        old_tuple: vec![datum("txt", 25, Datum::DatumString(old_txt.to_string()))],
    }
}

/// Write frames to a scratch file that the fake reader replays
pub fn write_frames(frames: &[Vec<u8>]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create frame file");
    for frame in frames {
        file.write_all(frame).expect("write frame");
    }
    file.flush().expect("flush frame file");
    file
}

/// Reader that runs `script` under `/bin/sh`
pub fn shell_reader(script: &str) -> ReaderCommand {
    ReaderCommand::new("/bin/sh").with_prefix_args(["-c", script, "pg_logical_stream"])
}

/// Reader that replays `file` and then idles until it is signalled
pub fn replaying_reader(file: &NamedTempFile) -> ReaderCommand {
    shell_reader(&format!(
        "cat '{}'; exec sleep 30",
        file.path().display()
    ))
}

pub fn test_stream(reader: ReaderCommand) -> Stream {
    test_stream_with(StreamOptions::default().reader(reader))
}

pub fn test_stream_with(options: StreamOptions) -> Stream {
    let mut config = ConnectionConfig::new("postgres");
    config.user = "postgres".to_string();
    Stream::with_options(config, TEST_SLOT, LogPos::ZERO, options)
}
