//! Sideband multiplexing.
//!
//! When negotiated, the server interleaves three channels inside data
//! pkt-lines, selected by the first payload byte: 1 carries pack data,
//! 2 carries progress text, 3 carries a fatal message that ends the
//! exchange.

use std::io::{Read, Write};

use crate::pktline::{Pkt, PktReader, PktWriter};
use crate::ProtocolError;

pub const BAND_DATA: u8 = 1;
pub const BAND_PROGRESS: u8 = 2;
pub const BAND_FATAL: u8 = 3;

/// Demultiplexes a sideband stream, routing progress to a callback and
/// turning a channel-3 message into a terminal error.
pub struct SidebandReader<'a, R> {
    reader: &'a mut PktReader<R>,
    progress: Option<&'a mut dyn FnMut(&[u8])>,
}

impl<'a, R: Read> SidebandReader<'a, R> {
    pub fn new(reader: &'a mut PktReader<R>) -> Self {
        Self {
            reader,
            progress: None,
        }
    }

    pub fn with_progress(
        reader: &'a mut PktReader<R>,
        progress: &'a mut dyn FnMut(&[u8]),
    ) -> Self {
        Self {
            reader,
            progress: Some(progress),
        }
    }

    /// Next chunk of channel-1 data; `None` at the end of the stream.
    pub fn read_data(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            match self.reader.read_pkt()? {
                Pkt::Flush | Pkt::ResponseEnd => return Ok(None),
                Pkt::Delim => continue,
                Pkt::Data(payload) => {
                    let Some((&band, rest)) = payload.split_first() else {
                        return Ok(None);
                    };
                    match band {
                        BAND_DATA => return Ok(Some(rest.to_vec())),
                        BAND_PROGRESS => {
                            if let Some(cb) = self.progress.as_mut() {
                                cb(rest);
                            }
                        }
                        BAND_FATAL => {
                            return Err(ProtocolError::Remote(
                                String::from_utf8_lossy(rest).trim_end().to_string(),
                            ));
                        }
                        other => {
                            return Err(ProtocolError::Violation(format!(
                                "unknown sideband channel {other}"
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Drain channel 1 completely.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_data()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Send a payload on one channel, chunked to the negotiated packet size.
pub fn write_band<W: Write>(
    writer: &mut PktWriter<W>,
    band: u8,
    max_payload: usize,
    data: &[u8],
) -> Result<(), ProtocolError> {
    for chunk in data.chunks(max_payload.max(1)) {
        let mut pkt = Vec::with_capacity(1 + chunk.len());
        pkt.push(band);
        pkt.extend_from_slice(chunk);
        writer.data_pkt(&pkt)?;
    }
    Ok(())
}

/// A `Write` adapter that frames everything as channel-1 sideband packets;
/// lets the pack writer stream straight onto the wire.
pub struct SidebandSink<'a, W: Write> {
    writer: &'a mut PktWriter<W>,
    max_payload: usize,
}

impl<'a, W: Write> SidebandSink<'a, W> {
    pub fn new(writer: &'a mut PktWriter<W>, max_payload: usize) -> Self {
        Self {
            writer,
            max_payload,
        }
    }
}

impl<W: Write> Write for SidebandSink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        write_band(self.writer, BAND_DATA, self.max_payload, buf)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer
            .flush()
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
