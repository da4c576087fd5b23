//! Server-Sent Events framing.
//!
//! [`SseDecoder`] turns the raw body of a `text/event-stream` response into
//! frames. Only `\n` and `\r\n` line endings are recognised.

use std::time::Duration;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::error::EventStreamError;

/// Upper bound for one frame (all its lines together).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One dispatched event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, `None` for the default "message" type.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<Duration>,
    frame_bytes: usize,
}

impl SseDecoder {
    fn reset(&mut self) {
        self.event = None;
        self.data.clear();
        self.id = None;
        self.retry = None;
        self.frame_bytes = 0;
    }

    // Un événement sans ligne data n'est pas dispatché.
    fn take_frame(&mut self) -> Option<SseFrame> {
        let frame = if self.data.is_empty() {
            None
        } else {
            Some(SseFrame {
                event: self.event.take(),
                data: self.data.join("\n"),
                id: self.id.take(),
                retry: self.retry.take(),
            })
        };
        self.reset();
        frame
    }

    fn field(&mut self, line: &str) {
        let (name, value) = match line.find(':') {
            Some(0) => return, // commentaire / keep-alive
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match name {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
    }
}

impl Decoder for SseDecoder {
    type Item = SseFrame;
    type Error = EventStreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseFrame>, EventStreamError> {
        loop {
            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                if self.frame_bytes + src.len() > MAX_FRAME_BYTES {
                    self.reset();
                    src.clear();
                    return Err(EventStreamError::FrameTooLarge(MAX_FRAME_BYTES));
                }
                return Ok(None);
            };

            let mut line = src.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(newline - 1);
            }

            if line.is_empty() {
                match self.take_frame() {
                    Some(frame) => return Ok(Some(frame)),
                    None => continue,
                }
            }

            self.frame_bytes += line.len();
            if self.frame_bytes > MAX_FRAME_BYTES {
                self.reset();
                return Err(EventStreamError::FrameTooLarge(MAX_FRAME_BYTES));
            }

            let line = String::from_utf8_lossy(&line);
            self.field(&line);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SseFrame>, EventStreamError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // Trame incomplète en fin de flux : abandonnée.
                src.clear();
                self.reset();
                Ok(None)
            }
        }
    }
}
