//! 本地日志文件帧格式
//!
//! Frame layout:
//! - marker (1 byte, [`FRAME_MARKER`])
//! - payload length (4 bytes, little endian)
//! - payload (serde_json encoded [`LogEvent`])

use std::io::{self, Read};
use thiserror::Error;

use crate::log_event::LogEvent;

pub const FRAME_MARKER: u8 = 0xA5;

/// Header size: marker + length
pub const FRAME_HEADER_LEN: usize = 5;

/// Upper bound on a single payload; anything larger is treated as corruption
pub const MAX_FRAME_PAYLOAD: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bad frame marker: {0:#04x}")]
    BadMarker(u8),

    #[error("Frame payload too large: {0} bytes")]
    TooLarge(u32),

    #[error("Truncated frame")]
    Truncated,

    #[error("Invalid frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Serialize one event into a complete frame
pub fn encode_frame(event: &LogEvent) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(event)?;
    if payload.len() > MAX_FRAME_PAYLOAD as usize {
        return Err(FrameError::TooLarge(payload.len() as u32));
    }
    let mut data = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    data.push(FRAME_MARKER);
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&payload);
    Ok(data)
}

/// Sequential reader over a stream of frames
pub struct FrameReader<R> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next event, `Ok(None)` on a clean end of stream
    pub fn next_event(&mut self) -> Result<Option<LogEvent>, FrameError> {
        let mut marker = [0u8; 1];
        match self.inner.read(&mut marker)? {
            0 => return Ok(None),
            _ if marker[0] != FRAME_MARKER => return Err(FrameError::BadMarker(marker[0])),
            _ => {}
        }

        let mut len_buf = [0u8; 4];
        read_exact_or_truncated(&mut self.inner, &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(len));
        }

        let mut payload = vec![0u8; len as usize];
        read_exact_or_truncated(&mut self.inner, &mut payload)?;
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<LogEvent, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => FrameError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_event::Severity;

    #[test]
    fn test_read_sequence_in_order() {
        let mut data = Vec::new();
        for i in 0..3 {
            let ev = LogEvent::new(Severity::Info, format!("event {i}"));
            data.extend(encode_frame(&ev).unwrap());
        }

        let messages: Vec<String> = FrameReader::new(data.as_slice())
            .map(|r| r.unwrap().message)
            .collect();
        assert_eq!(messages, vec!["event 0", "event 1", "event 2"]);
    }

    #[test]
    fn test_header_layout() {
        let ev = LogEvent::new(Severity::Warn, "x");
        let frame = encode_frame(&ev).unwrap();
        assert_eq!(frame[0], FRAME_MARKER);
        let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn test_bad_marker() {
        let data = [0x00u8, 1, 0, 0, 0, b'x'];
        let mut reader = FrameReader::new(&data[..]);
        assert!(matches!(reader.next_event(), Err(FrameError::BadMarker(0))));
    }

    #[test]
    fn test_truncated_frame() {
        let ev = LogEvent::new(Severity::Info, "cut short");
        let frame = encode_frame(&ev).unwrap();
        let mut reader = FrameReader::new(&frame[..frame.len() - 3]);
        assert!(matches!(reader.next_event(), Err(FrameError::Truncated)));
    }
}
