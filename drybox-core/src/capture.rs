//! Binary TLV capture writer (`.dbxcap`): a simple, replayable record of
//! every tx/rx/drop event crossing the bytelink and bearer layers.
//!
//! Format: magic `b"DBXC"`, version byte (`1`), then records of
//! `t_ms: u64le, side: u8, layer: u8, event: u8, len: u32le, data: [u8; len]`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::errors::CaptureError;

pub const MAGIC: &[u8; 4] = b"DBXC";
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    LeftToRight,
    RightToLeft,
}

impl Side {
    fn code(self) -> u8 {
        match self {
            Side::LeftToRight => 0,
            Side::RightToLeft => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    ByteLink,
    Bearer,
}

impl Layer {
    fn code(self) -> u8 {
        match self {
            Layer::ByteLink => 0,
            Layer::Bearer => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    Tx,
    Rx,
    Drop,
}

impl CaptureEvent {
    fn code(self) -> u8 {
        match self {
            CaptureEvent::Tx => 0,
            CaptureEvent::Rx => 1,
            CaptureEvent::Drop => 2,
        }
    }
}

pub struct CaptureWriter {
    writer: BufWriter<File>,
}

impl CaptureWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&[VERSION])?;
        Ok(Self { writer })
    }

    pub fn write_record(
        &mut self,
        t_ms: u64,
        side: Side,
        layer: Layer,
        event: CaptureEvent,
        data: &[u8],
    ) -> Result<(), CaptureError> {
        self.writer.write_all(&t_ms.to_le_bytes())?;
        self.writer.write_all(&[side.code(), layer.code(), event.code()])?;
        self.writer
            .write_all(&(data.len() as u32).to_le_bytes())?;
        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), CaptureError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Parse a `.dbxcap` file back into its records, for tooling and tests.
pub fn read_records(bytes: &[u8]) -> Option<Vec<(u64, Side, Layer, CaptureEvent, Vec<u8>)>> {
    if bytes.len() < 5 || &bytes[0..4] != MAGIC || bytes[4] != VERSION {
        return None;
    }
    let mut out = Vec::new();
    let mut cursor = 5usize;
    while cursor + 15 <= bytes.len() {
        let t_ms = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().ok()?);
        let side_b = bytes[cursor + 8];
        let layer_b = bytes[cursor + 9];
        let event_b = bytes[cursor + 10];
        let len = u32::from_le_bytes(bytes[cursor + 11..cursor + 15].try_into().ok()?) as usize;
        cursor += 15;
        if cursor + len > bytes.len() {
            return None;
        }
        let data = bytes[cursor..cursor + len].to_vec();
        cursor += len;

        let side = match side_b {
            0 => Side::LeftToRight,
            1 => Side::RightToLeft,
            _ => return None,
        };
        let layer = match layer_b {
            0 => Layer::ByteLink,
            1 => Layer::Bearer,
            _ => return None,
        };
        let event = match event_b {
            0 => CaptureEvent::Tx,
            1 => CaptureEvent::Rx,
            2 => CaptureEvent::Drop,
            _ => return None,
        };
        out.push((t_ms, side, layer, event, data));
    }
    Some(out)
}
