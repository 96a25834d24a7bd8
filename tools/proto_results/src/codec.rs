//! Wire framing for `TestRecord` messages.
//!
//! Delimited streams prefix every JSON body with its length as an unsigned
//! LEB128 varint. A non-delimited payload is a single JSON document and only
//! ever carries a final snapshot.

use crate::errors::ResultsError;
use crate::record::TestRecord;
use std::io::{ErrorKind, Read, Write};

pub const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Delimited,
    Single,
}

pub fn encode_single(record: &TestRecord) -> Result<Vec<u8>, ResultsError> {
    serde_json::to_vec(record).map_err(|e| ResultsError::Decode(e.to_string()))
}

pub fn encode_delimited(record: &TestRecord) -> Result<Vec<u8>, ResultsError> {
    let body = encode_single(record)?;
    let mut out = Vec::with_capacity(body.len() + 5);
    write_varint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn encode(record: &TestRecord, framing: Framing) -> Result<Vec<u8>, ResultsError> {
    match framing {
        Framing::Delimited => encode_delimited(record),
        Framing::Single => encode_single(record),
    }
}

pub fn write_delimited<W: Write>(writer: &mut W, record: &TestRecord) -> Result<(), ResultsError> {
    let frame = encode_delimited(record)?;
    writer
        .write_all(&frame)
        .and_then(|_| writer.flush())
        .map_err(|e| ResultsError::Transport(e.to_string()))
}

pub fn decode_single(bytes: &[u8]) -> Result<TestRecord, ResultsError> {
    serde_json::from_slice(bytes).map_err(|err| {
        ResultsError::Decode(format!(
            "invalid record: {err}; input={}",
            String::from_utf8_lossy(&bytes[..bytes.len().min(256)]),
        ))
    })
}

/// Splits a buffer of delimited frames, keeping every good record and every
/// per-frame error in stream order.
pub fn decode_frames(bytes: &[u8]) -> (Vec<TestRecord>, Vec<ResultsError>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for frame in FrameReader::new(bytes) {
        match frame {
            Ok(record) => records.push(record),
            Err(err) => errors.push(err),
        }
    }
    (records, errors)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

enum VarintRead {
    Value(u64),
    CleanEof,
}

/// Iterates delimited frames from any reader. A body that fails to parse
/// yields an error but the reader stays aligned on the next frame; a torn
/// length prefix or body ends iteration after reporting it.
pub struct FrameReader<R> {
    reader: R,
    finished: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }

    fn read_varint(&mut self) -> Result<VarintRead, ResultsError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) if shift == 0 => return Ok(VarintRead::CleanEof),
                Ok(0) => {
                    return Err(ResultsError::Decode(
                        "stream ended inside a frame length".to_string(),
                    ))
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ResultsError::Transport(err.to_string())),
            }
            if shift >= 64 {
                return Err(ResultsError::Decode("frame length overflows u64".to_string()));
            }
            value |= u64::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                return Ok(VarintRead::Value(value));
            }
            shift += 7;
        }
    }

    /// Outer error: the stream is unusable. Inner error: this frame's body
    /// was bad but the next frame is still reachable.
    fn next_frame(&mut self) -> Result<Option<Result<TestRecord, ResultsError>>, ResultsError> {
        let len = match self.read_varint()? {
            VarintRead::CleanEof => return Ok(None),
            VarintRead::Value(len) => len,
        };
        if len > MAX_FRAME_BYTES {
            return Err(ResultsError::Decode(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}"
            )));
        }
        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                ResultsError::Decode(format!("stream ended inside a {len} byte frame"))
            } else {
                ResultsError::Transport(err.to_string())
            }
        })?;
        Ok(Some(decode_single(&body)))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<TestRecord, ResultsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
