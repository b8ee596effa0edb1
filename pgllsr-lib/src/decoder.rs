//! Framed change-record decoder
//!
//! The reader process writes a sequence of frames to its standard output:
//!
//! ```text
//! +----------------+---------------------------------------------+
//! | u32 BE length  | payload (length bytes)                      |
//! +----------------+---------------------------------------------+
//!                  | u64 BE log position | decoderbufs RowMessage |
//!                  +---------------------+------------------------+
//! ```
//!
//! Bytes are accumulated across reads; an event is only produced once its
//! whole frame is buffered. The first malformed frame halts the decoder for
//! good, there is no attempt to resynchronize.

use crate::error::{CdcError, Result};
use crate::lsn::LogPos;
use crate::proto::{datum_message::Datum, DatumMessage, Op, RowMessage};
use crate::types::{ChangeEvent, Column, ColumnValue, Operation};
use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use prost::Message;
use tracing::trace;

/// Size of the big-endian length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Size of the log position at the start of every payload
pub const POSITION_LEN: usize = 8;

/// Upper bound on a single frame's payload
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Incremental decoder turning reader output into [`ChangeEvent`]s
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
    frames_decoded: u64,
    failed: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_len,
            frames_decoded: 0,
            failed: false,
        }
    }

    /// Append raw bytes read from the reader's output
    pub fn feed(&mut self, data: &[u8]) {
        if !self.failed {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Number of buffered bytes not yet consumed as a whole frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// True when some bytes of an incomplete frame are held back
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Decode the next complete frame, if one is fully buffered
    ///
    /// Returns `Ok(None)` when more input is needed. After an error every
    /// further call fails as well.
    pub fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        if self.failed {
            return Err(CdcError::decode("decoder halted after a previous error"));
        }

        match self.try_decode() {
            Ok(event) => Ok(event),
            Err(e) => {
                self.failed = true;
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Iterate over every event that is fully buffered right now
    pub fn drain(&mut self) -> Drain<'_> {
        Drain {
            decoder: self,
            done: false,
        }
    }

    /// Check that the input ended on a frame boundary
    pub fn finish(&self) -> Result<()> {
        if self.failed {
            return Err(CdcError::decode("decoder halted after a previous error"));
        }
        if self.has_partial_frame() {
            return Err(CdcError::decode(format!(
                "input ended inside a frame ({} trailing bytes)",
                self.buffer.len()
            )));
        }
        Ok(())
    }

    fn try_decode(&mut self) -> Result<Option<ChangeEvent>> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buffer[..FRAME_HEADER_LEN];
        let frame_len = header.get_u32() as usize;

        if frame_len == 0 {
            return Err(CdcError::decode("zero-length frame"));
        }
        if frame_len > self.max_frame_len {
            return Err(CdcError::decode(format!(
                "frame length {} exceeds limit of {} bytes",
                frame_len, self.max_frame_len
            )));
        }
        if frame_len < POSITION_LEN {
            return Err(CdcError::decode(format!(
                "frame length {} is too short to hold a log position",
                frame_len
            )));
        }

        if self.buffer.len() < FRAME_HEADER_LEN + frame_len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        let mut payload = self.buffer.split_to(frame_len).freeze();
        let position = LogPos(payload.get_u64());

        let row = RowMessage::decode(payload).map_err(|e| {
            CdcError::decode(format!(
                "invalid change record at {}: {}",
                position, e
            ))
        })?;

        let event = row_to_event(row, position)?;
        self.frames_decoded += 1;
        trace!(
            "Decoded frame #{} ({} at {})",
            self.frames_decoded,
            event.operation,
            event.position
        );
        Ok(Some(event))
    }
}

/// Iterator over the complete frames currently buffered in a [`FrameDecoder`]
///
/// Yields at most one error, then stops.
pub struct Drain<'a> {
    decoder: &'a mut FrameDecoder,
    done: bool,
}

impl Iterator for Drain<'_> {
    type Item = Result<ChangeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn row_to_event(row: RowMessage, position: LogPos) -> Result<ChangeEvent> {
    let raw_op = row
        .op
        .ok_or_else(|| CdcError::decode(format!("record at {} has no operation", position)))?;

    let operation = match Op::try_from(raw_op) {
        Ok(Op::Insert) => Operation::Insert,
        Ok(Op::Update) => Operation::Update,
        Ok(Op::Delete) => Operation::Delete,
        Ok(Op::Begin) => Operation::Begin,
        Ok(Op::Commit) => Operation::Commit,
        Ok(Op::Unknown) | Err(_) => {
            return Err(CdcError::decode(format!(
                "record at {} has unknown operation {}",
                position, raw_op
            )))
        }
    };

    let commit_time = row
        .commit_time
        .and_then(|micros| i64::try_from(micros).ok())
        .and_then(DateTime::<Utc>::from_timestamp_micros);

    if operation.is_transaction_boundary() {
        return Ok(ChangeEvent {
            operation,
            table: None,
            columns: Vec::new(),
            position,
            transaction_id: row.transaction_id,
            commit_time,
        });
    }

    let table = match row.table {
        Some(table) if !table.is_empty() => table,
        _ => {
            return Err(CdcError::decode(format!(
                "{} record at {} has no table",
                operation, position
            )))
        }
    };

    let columns = if row.new_tuple.is_empty() {
        // DELETE: only the old key/identity tuple is present
        row.old_tuple
            .into_iter()
            .map(|datum| {
                let (name, type_oid, value) = split_datum(datum);
                Column {
                    name,
                    type_oid,
                    old_value: Some(value.clone()),
                    value,
                }
            })
            .collect()
    } else {
        let mut old_values: Vec<(String, ColumnValue)> = row
            .old_tuple
            .into_iter()
            .map(|datum| {
                let (name, _, value) = split_datum(datum);
                (name, value)
            })
            .collect();

        row.new_tuple
            .into_iter()
            .map(|datum| {
                let (name, type_oid, value) = split_datum(datum);
                let old_value = old_values
                    .iter()
                    .position(|(old_name, _)| *old_name == name)
                    .map(|idx| old_values.swap_remove(idx).1);
                Column {
                    name,
                    type_oid,
                    value,
                    old_value,
                }
            })
            .collect()
    };

    Ok(ChangeEvent {
        operation,
        table: Some(table),
        columns,
        position,
        transaction_id: row.transaction_id,
        commit_time,
    })
}

fn split_datum(datum: DatumMessage) -> (String, i64, ColumnValue) {
    let value = match datum.datum {
        None => ColumnValue::Null,
        Some(Datum::DatumMissing(_)) => ColumnValue::Unchanged,
        Some(Datum::DatumInt32(v)) => ColumnValue::Int32(v),
        Some(Datum::DatumInt64(v)) => ColumnValue::Int64(v),
        Some(Datum::DatumFloat(v)) => ColumnValue::Float(v),
        Some(Datum::DatumDouble(v)) => ColumnValue::Double(v),
        Some(Datum::DatumBool(v)) => ColumnValue::Bool(v),
        Some(Datum::DatumString(v)) => ColumnValue::Text(v),
        Some(Datum::DatumBytes(v)) => ColumnValue::Bytes(v),
        Some(Datum::DatumPoint(p)) => ColumnValue::Point { x: p.x, y: p.y },
    };
    (
        datum.column_name.unwrap_or_default(),
        datum.column_type.unwrap_or_default(),
        value,
    )
}
