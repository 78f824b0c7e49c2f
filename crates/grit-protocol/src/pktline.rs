//! Pkt-line framing.
//!
//! Every wire unit is four ASCII hex length digits followed by payload;
//! the length counts its own four bytes. Three lengths are reserved as
//! control packets: `0000` flush, `0001` delimiter (v2), `0002`
//! response-end (v2).

use std::io::{Read, Write};

use crate::ProtocolError;

/// Largest payload a single pkt-line can carry (65520 minus the header).
pub const MAX_PKT_PAYLOAD: usize = 65516;

/// Default writer buffer size.
pub const DEFAULT_BUFSIZE: usize = 65515;

/// One wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pkt {
    Data(Vec<u8>),
    Flush,
    Delim,
    ResponseEnd,
}

impl Pkt {
    /// Payload with a single trailing newline removed, for text commands.
    pub fn text(&self) -> Option<&[u8]> {
        match self {
            Pkt::Data(data) => Some(strip_newline(data)),
            _ => None,
        }
    }
}

pub(crate) fn strip_newline(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(b'\n') => &data[..data.len() - 1],
        _ => data,
    }
}

/// Reads pkt-lines off a byte stream.
pub struct PktReader<R> {
    inner: R,
}

impl<R: Read> PktReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one packet. EOF at a packet boundary is a hangup: the peer
    /// went away between frames.
    pub fn read_pkt(&mut self) -> Result<Pkt, ProtocolError> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::Hangup
            } else {
                ProtocolError::Io(e)
            }
        })?;

        let len_str = std::str::from_utf8(&len_buf)
            .map_err(|_| ProtocolError::InvalidPktLine(format!("length bytes {len_buf:?}")))?;
        let len = usize::from_str_radix(len_str, 16)
            .map_err(|_| ProtocolError::InvalidPktLine(format!("length {len_str:?}")))?;

        match len {
            0 => Ok(Pkt::Flush),
            1 => Ok(Pkt::Delim),
            2 => Ok(Pkt::ResponseEnd),
            3 => Err(ProtocolError::InvalidPktLine("length 3 is reserved".into())),
            _ => {
                let payload_len = len - 4;
                if payload_len > MAX_PKT_PAYLOAD {
                    return Err(ProtocolError::InvalidPktLine(format!(
                        "payload of {payload_len} bytes exceeds the maximum"
                    )));
                }
                let mut data = vec![0u8; payload_len];
                self.inner.read_exact(&mut data).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        ProtocolError::Hangup
                    } else {
                        ProtocolError::Io(e)
                    }
                })?;
                Ok(Pkt::Data(data))
            }
        }
    }

    /// Read a data packet; `None` for flush.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.read_pkt()? {
            Pkt::Data(data) => Ok(Some(data)),
            Pkt::Flush => Ok(None),
            other => Err(ProtocolError::Violation(format!(
                "unexpected control packet {other:?}"
            ))),
        }
    }

    /// Collect data packets until the next flush.
    pub fn read_until_flush(&mut self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line()? {
            lines.push(line);
        }
        Ok(lines)
    }
}

/// Writes pkt-lines, buffering whole frames.
///
/// Frames accumulate until the buffer would exceed `bufsize`; a single
/// logical line is never split across flushes to the underlying stream.
pub struct PktWriter<W> {
    inner: W,
    buffer: Vec<u8>,
    bufsize: usize,
}

impl<W: Write> PktWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_bufsize(inner, DEFAULT_BUFSIZE)
    }

    pub fn with_bufsize(inner: W, bufsize: usize) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(bufsize.min(DEFAULT_BUFSIZE)),
            bufsize,
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Write one data packet.
    pub fn data_pkt(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > MAX_PKT_PAYLOAD {
            return Err(ProtocolError::InvalidPktLine(format!(
                "payload of {} bytes exceeds the maximum",
                payload.len()
            )));
        }
        if self.buffer.len() + 4 + payload.len() > self.bufsize {
            self.flush_buffer()?;
        }
        let header = format!("{:04x}", payload.len() + 4);
        self.buffer.extend_from_slice(header.as_bytes());
        self.buffer.extend_from_slice(payload);
        Ok(())
    }

    /// Write a text command, newline-terminated like the reference tools.
    pub fn text_pkt(&mut self, text: &str) -> Result<(), ProtocolError> {
        if text.ends_with('\n') {
            self.data_pkt(text.as_bytes())
        } else {
            let mut line = Vec::with_capacity(text.len() + 1);
            line.extend_from_slice(text.as_bytes());
            line.push(b'\n');
            self.data_pkt(&line)
        }
    }

    /// `0000`: end of section. Also drains the buffer to the stream.
    pub fn flush_pkt(&mut self) -> Result<(), ProtocolError> {
        self.buffer.extend_from_slice(b"0000");
        self.flush_buffer()?;
        self.inner.flush()?;
        Ok(())
    }

    /// `0001` (v2 section separator).
    pub fn delim_pkt(&mut self) -> Result<(), ProtocolError> {
        self.buffer.extend_from_slice(b"0001");
        Ok(())
    }

    /// `0002` (v2 response terminator).
    pub fn response_end_pkt(&mut self) -> Result<(), ProtocolError> {
        self.buffer.extend_from_slice(b"0002");
        self.flush_buffer()?;
        self.inner.flush()?;
        Ok(())
    }

    /// Push buffered frames down and flush the stream.
    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        self.flush_buffer()?;
        self.inner.flush()?;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), ProtocolError> {
        if !self.buffer.is_empty() {
            self.inner.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }
}
