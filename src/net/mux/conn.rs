use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::net::mux::{self, MuxFrame};
use crate::net::{Deserialize, Serialize};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads whole mux frames off the byte stream underneath a session.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader {
            reader,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Read a frame from the connection, waiting until enough data has arrived
    /// to fill the frame.
    ///
    /// Returns `Error::Eof` if the stream ends on a frame boundary.
    pub async fn read_frame(&mut self) -> Result<MuxFrame, mux::Error> {
        loop {
            // Get a cursor to seek over the buffered bytes.
            let mut read_cursor = Cursor::new(&self.buffer);

            // Try to parse the frame from the buffer.
            if let Some(frame) = MuxFrame::deserialize(&mut read_cursor)? {
                let num_parsed = read_cursor.position() as usize;

                // Mark the bytes as consumed.
                self.buffer.advance(num_parsed);

                return Ok(frame);
            }

            // Pull more bytes in from the source if possible.
            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                return match self.buffer.is_empty() {
                    true => Err(mux::Error::Eof),
                    false => Err(mux::Error::TruncatedFrame(self.buffer.len())),
                };
            }
        }
    }
}

/// Writes mux frames. Frames are buffered until `flush`.
pub struct FrameWriter<W: AsyncWrite> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> FrameWriter<W> {
        FrameWriter {
            writer: BufWriter::new(writer),
        }
    }

    pub async fn write_frame(&mut self, frame: &MuxFrame) -> Result<(), mux::Error> {
        let buf = frame.serialize();
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), mux::Error> {
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), mux::Error> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
