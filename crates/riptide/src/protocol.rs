//! Host ↔ script-engine wire protocol.
//!
//! Every outbound message is a header table and a payload table, each
//! encoded as a length-prefixed tagged table and framed as
//! `u32 BE header_len | header | u32 BE payload_len | payload`. Inbound
//! responses are a single framed table. Numeric values inside a table are
//! little-endian; there is no trailing padding.
//!
//! Table fields carry `(tag, wire_type)` so readers can skip tags they do
//! not understand; reserved descriptor fields ride on the same property.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Vbucket;

/// Upper bound on a single table blob. Oversized frames indicate a corrupt
/// peer, not a legitimate workload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const WIRE_FIXED1: u8 = 0;
const WIRE_FIXED2: u8 = 1;
const WIRE_FIXED4: u8 = 2;
const WIRE_FIXED8: u8 = 3;
const WIRE_BYTES: u8 = 4;

/// Errors raised while encoding, decoding, or framing protocol messages.
///
/// Any of these on the control channel is a protocol violation: the caller
/// closes the connection and restarts the engine.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid event tag: {0}")]
    InvalidEvent(i8),

    #[error("invalid response message type: {0}")]
    InvalidMessageKind(i8),

    #[error("invalid response opcode: {0}")]
    InvalidResponseOpcode(i8),

    #[error("truncated table field (tag {0})")]
    Truncated(u8),

    #[error("unknown wire type {wire} (tag {tag})")]
    UnknownWireType { tag: u8, wire: u8 },

    #[error("field is not valid utf-8 (tag {0})")]
    InvalidUtf8(u8),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tagged table encoding
// ---------------------------------------------------------------------------

pub(crate) struct TableWriter {
    buf: BytesMut,
}

impl TableWriter {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub(crate) fn put_i8(&mut self, tag: u8, v: i8) {
        self.buf.put_u8(tag);
        self.buf.put_u8(WIRE_FIXED1);
        self.buf.put_i8(v);
    }

    pub(crate) fn put_bool(&mut self, tag: u8, v: bool) {
        self.buf.put_u8(tag);
        self.buf.put_u8(WIRE_FIXED1);
        self.buf.put_u8(u8::from(v));
    }

    pub(crate) fn put_i16(&mut self, tag: u8, v: i16) {
        self.buf.put_u8(tag);
        self.buf.put_u8(WIRE_FIXED2);
        self.buf.put_i16_le(v);
    }

    pub(crate) fn put_i32(&mut self, tag: u8, v: i32) {
        self.buf.put_u8(tag);
        self.buf.put_u8(WIRE_FIXED4);
        self.buf.put_i32_le(v);
    }

    pub(crate) fn put_u32(&mut self, tag: u8, v: u32) {
        self.buf.put_u8(tag);
        self.buf.put_u8(WIRE_FIXED4);
        self.buf.put_u32_le(v);
    }

    pub(crate) fn put_i64(&mut self, tag: u8, v: i64) {
        self.buf.put_u8(tag);
        self.buf.put_u8(WIRE_FIXED8);
        self.buf.put_i64_le(v);
    }

    pub(crate) fn put_bytes(&mut self, tag: u8, v: &[u8]) {
        self.buf.put_u8(tag);
        self.buf.put_u8(WIRE_BYTES);
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub(crate) fn put_str(&mut self, tag: u8, v: &str) {
        self.put_bytes(tag, v.as_bytes());
    }

    pub(crate) fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// One decoded table field.
pub(crate) enum FieldValue<'a> {
    Fixed1(u8),
    Fixed2([u8; 2]),
    Fixed4([u8; 4]),
    Fixed8([u8; 8]),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub(crate) fn as_i8(&self, tag: u8) -> Result<i8, FrameError> {
        match self {
            FieldValue::Fixed1(v) => Ok(*v as i8),
            _ => Err(FrameError::Truncated(tag)),
        }
    }

    pub(crate) fn as_bool(&self, tag: u8) -> Result<bool, FrameError> {
        Ok(self.as_i8(tag)? != 0)
    }

    pub(crate) fn as_i16(&self, tag: u8) -> Result<i16, FrameError> {
        match self {
            FieldValue::Fixed2(v) => Ok(i16::from_le_bytes(*v)),
            _ => Err(FrameError::Truncated(tag)),
        }
    }

    pub(crate) fn as_i32(&self, tag: u8) -> Result<i32, FrameError> {
        match self {
            FieldValue::Fixed4(v) => Ok(i32::from_le_bytes(*v)),
            _ => Err(FrameError::Truncated(tag)),
        }
    }

    pub(crate) fn as_u32(&self, tag: u8) -> Result<u32, FrameError> {
        match self {
            FieldValue::Fixed4(v) => Ok(u32::from_le_bytes(*v)),
            _ => Err(FrameError::Truncated(tag)),
        }
    }

    pub(crate) fn as_i64(&self, tag: u8) -> Result<i64, FrameError> {
        match self {
            FieldValue::Fixed8(v) => Ok(i64::from_le_bytes(*v)),
            _ => Err(FrameError::Truncated(tag)),
        }
    }

    pub(crate) fn as_bytes(&self, tag: u8) -> Result<&'a [u8], FrameError> {
        match self {
            FieldValue::Bytes(v) => Ok(v),
            _ => Err(FrameError::Truncated(tag)),
        }
    }

    pub(crate) fn as_str(&self, tag: u8) -> Result<&'a str, FrameError> {
        std::str::from_utf8(self.as_bytes(tag)?).map_err(|_| FrameError::InvalidUtf8(tag))
    }
}

pub(crate) struct TableReader<'a> {
    buf: &'a [u8],
}

impl<'a> TableReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Next `(tag, value)` pair, or `None` at end of table. Unknown wire
    /// types are errors; unknown tags are the caller's to skip.
    pub(crate) fn next(&mut self) -> Result<Option<(u8, FieldValue<'a>)>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() < 2 {
            return Err(FrameError::Truncated(self.buf[0]));
        }
        let tag = self.buf[0];
        let wire = self.buf[1];
        self.buf = &self.buf[2..];

        let fixed = |buf: &mut &'a [u8], n: usize| -> Result<&'a [u8], FrameError> {
            if buf.len() < n {
                return Err(FrameError::Truncated(tag));
            }
            let (head, rest) = buf.split_at(n);
            *buf = rest;
            Ok(head)
        };

        let value = match wire {
            WIRE_FIXED1 => FieldValue::Fixed1(fixed(&mut self.buf, 1)?[0]),
            WIRE_FIXED2 => {
                let b = fixed(&mut self.buf, 2)?;
                FieldValue::Fixed2([b[0], b[1]])
            }
            WIRE_FIXED4 => {
                let b = fixed(&mut self.buf, 4)?;
                FieldValue::Fixed4([b[0], b[1], b[2], b[3]])
            }
            WIRE_FIXED8 => {
                let b = fixed(&mut self.buf, 8)?;
                FieldValue::Fixed8([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
            WIRE_BYTES => {
                let len = u32::from_le_bytes(
                    fixed(&mut self.buf, 4)?.try_into().expect("4 byte slice"),
                ) as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(FrameError::FrameTooLarge(len));
                }
                FieldValue::Bytes(fixed(&mut self.buf, len)?)
            }
            other => return Err(FrameError::UnknownWireType { tag, wire: other }),
        };
        Ok(Some((tag, value)))
    }
}

// ---------------------------------------------------------------------------
// Events and opcodes
// ---------------------------------------------------------------------------

/// Outbound event class carried in the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Event {
    Dcp = 1,
    Http = 2,
    V8Worker = 3,
    AppWorkerSetting = 4,
    Timer = 5,
    Debugger = 6,
}

impl TryFrom<i8> for Event {
    type Error = FrameError;

    fn try_from(value: i8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Event::Dcp),
            2 => Ok(Event::Http),
            3 => Ok(Event::V8Worker),
            4 => Ok(Event::AppWorkerSetting),
            5 => Ok(Event::Timer),
            6 => Ok(Event::Debugger),
            other => Err(FrameError::InvalidEvent(other)),
        }
    }
}

/// Opcodes for [`Event::Dcp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum DcpOpcode {
    Deletion = 1,
    Mutation = 2,
}

/// Opcodes for [`Event::V8Worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum V8WorkerOpcode {
    Dispose = 1,
    Init = 2,
    Load = 3,
    Terminate = 4,
    SourceMap = 5,
    HandlerCode = 6,
    LatencyStats = 7,
    FailureStats = 8,
    ExecutionStats = 9,
    Compile = 10,
    LcbExceptions = 11,
}

/// Opcodes for [`Event::AppWorkerSetting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum SettingOpcode {
    LogLevel = 1,
    WorkerThreadCount = 2,
    WorkerThreadPartitionMap = 3,
}

/// Opcodes for [`Event::Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum TimerOpcode {
    DocTimer = 1,
    NonDocTimer = 2,
}

/// Opcodes for [`Event::Debugger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum DebuggerOpcode {
    StartDebug = 1,
    StopDebug = 2,
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

const HDR_EVENT: u8 = 1;
const HDR_OPCODE: u8 = 2;
const HDR_PARTITION: u8 = 3;
const HDR_METADATA: u8 = 4;

/// Message header: event class, per-event opcode, target partition, and an
/// opaque metadata string (CDC sequence info for dcp events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub event: Event,
    pub opcode: i8,
    pub partition: i16,
    pub metadata: String,
}

impl Header {
    pub fn new(event: Event, opcode: i8, partition: i16, metadata: impl Into<String>) -> Self {
        Self {
            event,
            opcode,
            partition,
            metadata: metadata.into(),
        }
    }

    pub fn dcp(opcode: DcpOpcode, vb: Vbucket, metadata: impl Into<String>) -> Self {
        Self::new(Event::Dcp, opcode as i8, vb as i16, metadata)
    }

    pub fn v8_worker(opcode: V8WorkerOpcode, metadata: impl Into<String>) -> Self {
        Self::new(Event::V8Worker, opcode as i8, 0, metadata)
    }

    pub fn setting(opcode: SettingOpcode, metadata: impl Into<String>) -> Self {
        Self::new(Event::AppWorkerSetting, opcode as i8, 0, metadata)
    }

    pub fn timer(opcode: TimerOpcode, vb: Vbucket) -> Self {
        Self::new(Event::Timer, opcode as i8, vb as i16, "")
    }

    pub fn debugger(opcode: DebuggerOpcode) -> Self {
        Self::new(Event::Debugger, opcode as i8, 0, "")
    }

    pub fn encode(&self) -> Bytes {
        let mut w = TableWriter::new();
        w.put_i8(HDR_EVENT, self.event as i8);
        w.put_i8(HDR_OPCODE, self.opcode);
        w.put_i16(HDR_PARTITION, self.partition);
        w.put_str(HDR_METADATA, &self.metadata);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let mut event = None;
        let mut opcode = 0i8;
        let mut partition = 0i16;
        let mut metadata = String::new();

        let mut reader = TableReader::new(buf);
        while let Some((tag, value)) = reader.next()? {
            match tag {
                HDR_EVENT => event = Some(Event::try_from(value.as_i8(tag)?)?),
                HDR_OPCODE => opcode = value.as_i8(tag)?,
                HDR_PARTITION => partition = value.as_i16(tag)?,
                HDR_METADATA => metadata = value.as_str(tag)?.to_string(),
                _ => {}
            }
        }
        let event = event.ok_or(FrameError::InvalidEvent(0))?;
        Ok(Self {
            event,
            opcode,
            partition,
            metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

const PAY_KEY: u8 = 1;
const PAY_VALUE: u8 = 2;
const PAY_DOC_ID: u8 = 3;
const PAY_CALLBACK_FN: u8 = 4;
const PAY_DOC_IDS_CALLBACK_FNS: u8 = 5;
const PAY_THR_MAP: u8 = 6;
const PAY_PARTITION_COUNT: u8 = 7;
const PAY_APP_NAME: u8 = 8;
const PAY_CURR_HOST: u8 = 9;
const PAY_EVENTING_DIR: u8 = 10;
const PAY_CURR_EVENTING_PORT: u8 = 11;
const PAY_DEPCFG: u8 = 12;
const PAY_KV_HOST_PORT: u8 = 13;
const PAY_RBAC_USER: u8 = 14;
const PAY_RBAC_PASS: u8 = 15;
const PAY_LCB_INST_CAPACITY: u8 = 16;
const PAY_EXECUTION_TIMEOUT: u8 = 17;
const PAY_FUZZ_OFFSET: u8 = 18;
const PAY_CHECKPOINT_INTERVAL: u8 = 19;
const PAY_CURL_TIMEOUT: u8 = 20;
const PAY_ENABLE_RECURSIVE_MUTATION: u8 = 21;
const PAY_SKIP_LCB_BOOTSTRAP: u8 = 22;

/// One engine thread and the partitions pinned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPartitions {
    pub thread_id: i16,
    pub partitions: Vec<Vbucket>,
}

/// Superset payload table; each opcode populates its own subset of fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    // dcp events
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    // doc timer
    pub doc_id: Option<String>,
    pub callback_fn: Option<String>,
    // non-doc timer: opaque concatenation of id/callback pairs
    pub doc_ids_callback_fns: Option<String>,
    // worker thread partition map
    pub thr_map: Option<Vec<ThreadPartitions>>,
    pub partition_count: Option<i16>,
    // v8 worker init
    pub app_name: Option<String>,
    pub curr_host: Option<String>,
    pub eventing_dir: Option<String>,
    pub curr_eventing_port: Option<String>,
    pub depcfg: Option<String>,
    pub kv_host_port: Option<String>,
    pub rbac_user: Option<String>,
    pub rbac_pass: Option<String>,
    pub lcb_inst_capacity: Option<i32>,
    pub execution_timeout: Option<i32>,
    pub fuzz_offset: Option<i32>,
    pub checkpoint_interval: Option<i32>,
    pub curl_timeout: Option<i64>,
    pub enable_recursive_mutation: Option<bool>,
    pub skip_lcb_bootstrap: Option<bool>,
}

impl Payload {
    pub fn dcp(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key: Some(key),
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn doc_timer(doc_id: impl Into<String>, callback_fn: impl Into<String>) -> Self {
        Self {
            doc_id: Some(doc_id.into()),
            callback_fn: Some(callback_fn.into()),
            ..Default::default()
        }
    }

    pub fn non_doc_timer(doc_ids_callback_fns: impl Into<String>) -> Self {
        Self {
            doc_ids_callback_fns: Some(doc_ids_callback_fns.into()),
            ..Default::default()
        }
    }

    pub fn thread_partition_map(thr_map: Vec<ThreadPartitions>, partition_count: i16) -> Self {
        Self {
            thr_map: Some(thr_map),
            partition_count: Some(partition_count),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = TableWriter::new();
        if let Some(v) = &self.key {
            w.put_bytes(PAY_KEY, v);
        }
        if let Some(v) = &self.value {
            w.put_bytes(PAY_VALUE, v);
        }
        if let Some(v) = &self.doc_id {
            w.put_str(PAY_DOC_ID, v);
        }
        if let Some(v) = &self.callback_fn {
            w.put_str(PAY_CALLBACK_FN, v);
        }
        if let Some(v) = &self.doc_ids_callback_fns {
            w.put_str(PAY_DOC_IDS_CALLBACK_FNS, v);
        }
        if let Some(v) = &self.thr_map {
            w.put_bytes(PAY_THR_MAP, &encode_thr_map(v));
        }
        if let Some(v) = self.partition_count {
            w.put_i16(PAY_PARTITION_COUNT, v);
        }
        if let Some(v) = &self.app_name {
            w.put_str(PAY_APP_NAME, v);
        }
        if let Some(v) = &self.curr_host {
            w.put_str(PAY_CURR_HOST, v);
        }
        if let Some(v) = &self.eventing_dir {
            w.put_str(PAY_EVENTING_DIR, v);
        }
        if let Some(v) = &self.curr_eventing_port {
            w.put_str(PAY_CURR_EVENTING_PORT, v);
        }
        if let Some(v) = &self.depcfg {
            w.put_str(PAY_DEPCFG, v);
        }
        if let Some(v) = &self.kv_host_port {
            w.put_str(PAY_KV_HOST_PORT, v);
        }
        if let Some(v) = &self.rbac_user {
            w.put_str(PAY_RBAC_USER, v);
        }
        if let Some(v) = &self.rbac_pass {
            w.put_str(PAY_RBAC_PASS, v);
        }
        if let Some(v) = self.lcb_inst_capacity {
            w.put_i32(PAY_LCB_INST_CAPACITY, v);
        }
        if let Some(v) = self.execution_timeout {
            w.put_i32(PAY_EXECUTION_TIMEOUT, v);
        }
        if let Some(v) = self.fuzz_offset {
            w.put_i32(PAY_FUZZ_OFFSET, v);
        }
        if let Some(v) = self.checkpoint_interval {
            w.put_i32(PAY_CHECKPOINT_INTERVAL, v);
        }
        if let Some(v) = self.curl_timeout {
            w.put_i64(PAY_CURL_TIMEOUT, v);
        }
        if let Some(v) = self.enable_recursive_mutation {
            w.put_bool(PAY_ENABLE_RECURSIVE_MUTATION, v);
        }
        if let Some(v) = self.skip_lcb_bootstrap {
            w.put_bool(PAY_SKIP_LCB_BOOTSTRAP, v);
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let mut out = Payload::default();
        let mut reader = TableReader::new(buf);
        while let Some((tag, value)) = reader.next()? {
            match tag {
                PAY_KEY => out.key = Some(value.as_bytes(tag)?.to_vec()),
                PAY_VALUE => out.value = Some(value.as_bytes(tag)?.to_vec()),
                PAY_DOC_ID => out.doc_id = Some(value.as_str(tag)?.to_string()),
                PAY_CALLBACK_FN => out.callback_fn = Some(value.as_str(tag)?.to_string()),
                PAY_DOC_IDS_CALLBACK_FNS => {
                    out.doc_ids_callback_fns = Some(value.as_str(tag)?.to_string())
                }
                PAY_THR_MAP => out.thr_map = Some(decode_thr_map(value.as_bytes(tag)?)?),
                PAY_PARTITION_COUNT => out.partition_count = Some(value.as_i16(tag)?),
                PAY_APP_NAME => out.app_name = Some(value.as_str(tag)?.to_string()),
                PAY_CURR_HOST => out.curr_host = Some(value.as_str(tag)?.to_string()),
                PAY_EVENTING_DIR => out.eventing_dir = Some(value.as_str(tag)?.to_string()),
                PAY_CURR_EVENTING_PORT => {
                    out.curr_eventing_port = Some(value.as_str(tag)?.to_string())
                }
                PAY_DEPCFG => out.depcfg = Some(value.as_str(tag)?.to_string()),
                PAY_KV_HOST_PORT => out.kv_host_port = Some(value.as_str(tag)?.to_string()),
                PAY_RBAC_USER => out.rbac_user = Some(value.as_str(tag)?.to_string()),
                PAY_RBAC_PASS => out.rbac_pass = Some(value.as_str(tag)?.to_string()),
                PAY_LCB_INST_CAPACITY => out.lcb_inst_capacity = Some(value.as_i32(tag)?),
                PAY_EXECUTION_TIMEOUT => out.execution_timeout = Some(value.as_i32(tag)?),
                PAY_FUZZ_OFFSET => out.fuzz_offset = Some(value.as_i32(tag)?),
                PAY_CHECKPOINT_INTERVAL => out.checkpoint_interval = Some(value.as_i32(tag)?),
                PAY_CURL_TIMEOUT => out.curl_timeout = Some(value.as_i64(tag)?),
                PAY_ENABLE_RECURSIVE_MUTATION => {
                    out.enable_recursive_mutation = Some(value.as_bool(tag)?)
                }
                PAY_SKIP_LCB_BOOTSTRAP => out.skip_lcb_bootstrap = Some(value.as_bool(tag)?),
                _ => {}
            }
        }
        Ok(out)
    }
}

fn encode_thr_map(entries: &[ThreadPartitions]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16_le(entries.len() as u16);
    for entry in entries {
        buf.put_i16_le(entry.thread_id);
        buf.put_u16_le(entry.partitions.len() as u16);
        for vb in &entry.partitions {
            buf.put_u16_le(*vb);
        }
    }
    buf.freeze()
}

fn decode_thr_map(mut buf: &[u8]) -> Result<Vec<ThreadPartitions>, FrameError> {
    let take = |buf: &mut &[u8], n: usize| -> Result<Vec<u8>, FrameError> {
        if buf.len() < n {
            return Err(FrameError::Truncated(PAY_THR_MAP));
        }
        let (head, rest) = buf.split_at(n);
        *buf = rest;
        Ok(head.to_vec())
    };

    let count = u16::from_le_bytes(take(&mut buf, 2)?.try_into().expect("2 bytes"));
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let thread_id = i16::from_le_bytes(take(&mut buf, 2)?.try_into().expect("2 bytes"));
        let nvbs = u16::from_le_bytes(take(&mut buf, 2)?.try_into().expect("2 bytes"));
        let mut partitions = Vec::with_capacity(nvbs as usize);
        for _ in 0..nvbs {
            partitions.push(u16::from_le_bytes(
                take(&mut buf, 2)?.try_into().expect("2 bytes"),
            ));
        }
        entries.push(ThreadPartitions {
            thread_id,
            partitions,
        });
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Responses (engine → host)
// ---------------------------------------------------------------------------

/// Inbound response class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum MessageKind {
    V8WorkerConfig = 1,
}

impl TryFrom<i8> for MessageKind {
    type Error = FrameError;

    fn try_from(value: i8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(MessageKind::V8WorkerConfig),
            other => Err(FrameError::InvalidMessageKind(other)),
        }
    }
}

/// Opcodes of [`MessageKind::V8WorkerConfig`] responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ResponseOpcode {
    SourceMap = 1,
    HandlerCode = 2,
    AppLogMessage = 3,
    SysLogMessage = 4,
    LatencyStats = 5,
    FailureStats = 6,
    ExecutionStats = 7,
    CompileInfo = 8,
    QueueSize = 9,
    LcbExceptions = 10,
}

impl TryFrom<i8> for ResponseOpcode {
    type Error = FrameError;

    fn try_from(value: i8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(ResponseOpcode::SourceMap),
            2 => Ok(ResponseOpcode::HandlerCode),
            3 => Ok(ResponseOpcode::AppLogMessage),
            4 => Ok(ResponseOpcode::SysLogMessage),
            5 => Ok(ResponseOpcode::LatencyStats),
            6 => Ok(ResponseOpcode::FailureStats),
            7 => Ok(ResponseOpcode::ExecutionStats),
            8 => Ok(ResponseOpcode::CompileInfo),
            9 => Ok(ResponseOpcode::QueueSize),
            10 => Ok(ResponseOpcode::LcbExceptions),
            other => Err(FrameError::InvalidResponseOpcode(other)),
        }
    }
}

const RESP_MSG_TYPE: u8 = 1;
const RESP_OPCODE: u8 = 2;
const RESP_MSG: u8 = 3;

/// One engine response. Stats opcodes carry a JSON document in `msg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub msg_type: MessageKind,
    pub opcode: ResponseOpcode,
    pub msg: String,
}

impl Response {
    pub fn new(opcode: ResponseOpcode, msg: impl Into<String>) -> Self {
        Self {
            msg_type: MessageKind::V8WorkerConfig,
            opcode,
            msg: msg.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = TableWriter::new();
        w.put_i8(RESP_MSG_TYPE, self.msg_type as i8);
        w.put_i8(RESP_OPCODE, self.opcode as i8);
        w.put_str(RESP_MSG, &self.msg);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let mut msg_type = None;
        let mut opcode = None;
        let mut msg = String::new();

        let mut reader = TableReader::new(buf);
        while let Some((tag, value)) = reader.next()? {
            match tag {
                RESP_MSG_TYPE => msg_type = Some(MessageKind::try_from(value.as_i8(tag)?)?),
                RESP_OPCODE => opcode = Some(ResponseOpcode::try_from(value.as_i8(tag)?)?),
                RESP_MSG => msg = value.as_str(tag)?.to_string(),
                _ => {}
            }
        }
        Ok(Self {
            msg_type: msg_type.ok_or(FrameError::InvalidMessageKind(0))?,
            opcode: opcode.ok_or(FrameError::InvalidResponseOpcode(0))?,
            msg,
        })
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// One outbound message: header table plus payload table.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// Encode as `u32 BE header_len | header | u32 BE payload_len | payload`.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let header = self.header.encode();
        let payload = self.payload.encode();
        if header.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(header.len()));
        }
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        let mut buf = BytesMut::with_capacity(8 + header.len() + payload.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }
}

async fn read_blob<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(len));
    }
    let mut blob = vec![0u8; len];
    reader.read_exact(&mut blob).await?;
    Ok(blob)
}

/// Write one host→engine message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), FrameError> {
    let encoded = message.encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read one host→engine message (engine side; used by test engines).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
    let header = Header::decode(&read_blob(reader).await?)?;
    let payload = Payload::decode(&read_blob(reader).await?)?;
    Ok(Message { header, payload })
}

/// Write one engine→host response (engine side; used by test engines).
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), FrameError> {
    let encoded = response.encode();
    let mut buf = BytesMut::with_capacity(4 + encoded.len());
    buf.put_u32(encoded.len() as u32);
    buf.put_slice(&encoded);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one engine→host response.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response, FrameError> {
    Response::decode(&read_blob(reader).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let encoded = message.encode().unwrap();
        // Re-split the framing by hand to keep the test honest about layout.
        let header_len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        let header = Header::decode(&encoded[4..4 + header_len]).unwrap();
        let payload_off = 4 + header_len + 4;
        let payload = Payload::decode(&encoded[payload_off..]).unwrap();
        assert_eq!(Message { header, payload }, message);
    }

    #[test]
    fn dcp_mutation_round_trips() {
        round_trip(Message::new(
            Header::dcp(DcpOpcode::Mutation, 57, r#"{"vb":57,"seq":12}"#),
            Payload::dcp(b"doc-1".to_vec(), b"{\"n\":1}".to_vec()),
        ));
    }

    #[test]
    fn dcp_deletion_round_trips() {
        round_trip(Message::new(
            Header::dcp(DcpOpcode::Deletion, 3, r#"{"vb":3,"seq":8}"#),
            Payload::dcp(b"doc-2".to_vec(), Vec::new()),
        ));
    }

    #[test]
    fn timer_payloads_round_trip() {
        round_trip(Message::new(
            Header::timer(TimerOpcode::DocTimer, 9),
            Payload::doc_timer("doc-9", "onTimer"),
        ));
        round_trip(Message::new(
            Header::timer(TimerOpcode::NonDocTimer, 9),
            Payload::non_doc_timer("cb1::id1;cb2::id2"),
        ));
    }

    #[test]
    fn debugger_and_settings_round_trip() {
        round_trip(Message::new(
            Header::debugger(DebuggerOpcode::StartDebug),
            Payload::default(),
        ));
        round_trip(Message::new(
            Header::setting(SettingOpcode::LogLevel, "INFO"),
            Payload::default(),
        ));
    }

    #[test]
    fn thread_partition_map_round_trips() {
        let map = vec![
            ThreadPartitions {
                thread_id: 0,
                partitions: vec![0, 2, 4],
            },
            ThreadPartitions {
                thread_id: 1,
                partitions: vec![1, 3],
            },
        ];
        round_trip(Message::new(
            Header::setting(SettingOpcode::WorkerThreadPartitionMap, ""),
            Payload::thread_partition_map(map, 5),
        ));
    }

    #[test]
    fn v8_init_payload_fields_are_exact() {
        let payload = Payload {
            app_name: Some("app1".into()),
            curr_host: Some("127.0.0.1".into()),
            eventing_dir: Some("/data/eventing".into()),
            curr_eventing_port: Some("8096".into()),
            depcfg: Some("{}".into()),
            kv_host_port: Some("127.0.0.1:11210".into()),
            rbac_user: Some("admin".into()),
            rbac_pass: Some("secret".into()),
            lcb_inst_capacity: Some(5),
            execution_timeout: Some(1),
            fuzz_offset: Some(30),
            checkpoint_interval: Some(10_000),
            curl_timeout: Some(500),
            enable_recursive_mutation: Some(true),
            skip_lcb_bootstrap: Some(false),
            ..Default::default()
        };
        let message = Message::new(Header::v8_worker(V8WorkerOpcode::Init, ""), payload);
        let encoded = message.encode().unwrap();
        let header_len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        let decoded = Payload::decode(&encoded[4 + header_len + 4..]).unwrap();

        assert_eq!(decoded.app_name.as_deref(), Some("app1"));
        assert_eq!(decoded.lcb_inst_capacity, Some(5));
        assert_eq!(decoded.execution_timeout, Some(1));
        assert_eq!(decoded.curl_timeout, Some(500));
        assert_eq!(decoded.enable_recursive_mutation, Some(true));
        assert_eq!(decoded.skip_lcb_bootstrap, Some(false));
        assert_eq!(decoded, message.payload);
    }

    #[test]
    fn responses_round_trip_for_every_opcode() {
        let opcodes = [
            ResponseOpcode::SourceMap,
            ResponseOpcode::HandlerCode,
            ResponseOpcode::AppLogMessage,
            ResponseOpcode::SysLogMessage,
            ResponseOpcode::LatencyStats,
            ResponseOpcode::FailureStats,
            ResponseOpcode::ExecutionStats,
            ResponseOpcode::CompileInfo,
            ResponseOpcode::QueueSize,
            ResponseOpcode::LcbExceptions,
        ];
        for opcode in opcodes {
            let response = Response::new(opcode, r#"{"count":1}"#);
            assert_eq!(Response::decode(&response.encode()).unwrap(), response);
        }
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let mut w = TableWriter::new();
        w.put_i8(RESP_MSG_TYPE, MessageKind::V8WorkerConfig as i8);
        w.put_i8(RESP_OPCODE, ResponseOpcode::QueueSize as i8);
        w.put_str(RESP_MSG, "17");
        w.put_str(200, "from-the-future");
        w.put_i64(201, 99);
        let decoded = Response::decode(&w.finish()).unwrap();
        assert_eq!(decoded.opcode, ResponseOpcode::QueueSize);
        assert_eq!(decoded.msg, "17");
    }

    #[test]
    fn malformed_tables_are_rejected() {
        assert!(matches!(
            Response::decode(&[1, 0]),
            Err(FrameError::Truncated(1))
        ));
        assert!(matches!(
            Response::decode(&[1, 9, 0]),
            Err(FrameError::UnknownWireType { tag: 1, wire: 9 })
        ));
        // A bytes field whose declared length runs past the buffer.
        let mut w = TableWriter::new();
        w.put_str(RESP_MSG, "hello");
        let mut bytes = w.finish().to_vec();
        bytes.truncate(bytes.len() - 2);
        assert!(Response::decode(&bytes).is_err());
    }

    #[tokio::test]
    async fn framing_round_trips_over_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let message = Message::new(
            Header::dcp(DcpOpcode::Mutation, 7, "meta"),
            Payload::dcp(b"k".to_vec(), b"v".to_vec()),
        );
        write_message(&mut client, &message).await.unwrap();
        let read = read_message(&mut server).await.unwrap();
        assert_eq!(read, message);

        let response = Response::new(ResponseOpcode::LatencyStats, "{}");
        write_response(&mut server, &response).await.unwrap();
        let read = read_response(&mut client).await.unwrap();
        assert_eq!(read, response);

        drop(server);
        assert!(matches!(
            read_response(&mut client).await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
