//! Protobuf records emitted by the `decoderbufs` logical decoding plugin
//!
//! Tag numbers must match `pg_logicaldec.proto` exactly for wire
//! compatibility.

/// Row operation as reported by the plugin
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Op {
    Unknown = -1,
    Insert = 0,
    Update = 1,
    Delete = 2,
    Begin = 3,
    Commit = 4,
}

/// Geometric point value
#[derive(Clone, PartialEq, prost::Message)]
pub struct Point {
    #[prost(double, tag = "1")]
    pub x: f64,
    #[prost(double, tag = "2")]
    pub y: f64,
}

/// One column of a tuple
#[derive(Clone, PartialEq, prost::Message)]
pub struct DatumMessage {
    #[prost(string, optional, tag = "1")]
    pub column_name: Option<String>,
    /// Type OID of the column
    #[prost(int64, optional, tag = "2")]
    pub column_type: Option<i64>,
    #[prost(oneof = "datum_message::Datum", tags = "3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub datum: Option<datum_message::Datum>,
}

pub mod datum_message {
    /// Typed column payload; absent for SQL NULL
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Datum {
        #[prost(int32, tag = "3")]
        DatumInt32(i32),
        #[prost(int64, tag = "4")]
        DatumInt64(i64),
        #[prost(float, tag = "5")]
        DatumFloat(f32),
        #[prost(double, tag = "6")]
        DatumDouble(f64),
        #[prost(bool, tag = "7")]
        DatumBool(bool),
        #[prost(string, tag = "8")]
        DatumString(String),
        #[prost(bytes = "vec", tag = "9")]
        DatumBytes(Vec<u8>),
        #[prost(message, tag = "10")]
        DatumPoint(super::Point),
        /// Set for unchanged TOAST values
        #[prost(bool, tag = "11")]
        DatumMissing(bool),
    }
}

/// One change record
#[derive(Clone, PartialEq, prost::Message)]
pub struct RowMessage {
    #[prost(uint32, optional, tag = "1")]
    pub transaction_id: Option<u32>,
    /// Microseconds since the Unix epoch
    #[prost(uint64, optional, tag = "2")]
    pub commit_time: Option<u64>,
    #[prost(string, optional, tag = "3")]
    pub table: Option<String>,
    #[prost(enumeration = "Op", optional, tag = "4")]
    pub op: Option<i32>,
    #[prost(message, repeated, tag = "5")]
    pub new_tuple: Vec<DatumMessage>,
    #[prost(message, repeated, tag = "6")]
    pub old_tuple: Vec<DatumMessage>,
}
