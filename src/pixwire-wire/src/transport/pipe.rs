use super::Transport;
use crate::error::TransportError;
use std::io::{ErrorKind, Read, Write};

/// Default size of the outgoing staging buffer.
pub const DEFAULT_STAGING_SIZE: usize = 1024;

/// A channel over two unidirectional pipes.
///
/// Outgoing bytes collect in a fixed-size staging buffer and hit the pipe
/// only on flush or when the buffer fills up.
pub struct PipeTransport<R: Read, W: Write> {
    reader: Option<R>,
    writer: Option<W>,
    staging: Vec<u8>,
    capacity: usize,
}

impl<R, W> PipeTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_capacity(reader, writer, DEFAULT_STAGING_SIZE)
    }

    pub fn with_capacity(reader: R, writer: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reader: Some(reader),
            writer: Some(writer),
            staging: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes written but not yet flushed.
    pub fn staged(&self) -> usize {
        self.staging.len()
    }

    pub fn writer(&self) -> Option<&W> {
        self.writer.as_ref()
    }

    fn flush_staging(&mut self) -> Result<(), TransportError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(&self.staging)?;
        writer.flush()?;
        self.staging.clear();
        Ok(())
    }
}

impl<R, W> Transport for PipeTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(err)
                    if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) =>
                {
                    continue
                }
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.writer.is_none() {
            return Err(TransportError::Closed);
        }
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.capacity - self.staging.len();
            let take = room.min(rest.len());
            self.staging.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.staging.len() == self.capacity {
                self.flush_staging()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.flush_staging()
    }

    fn close(&mut self) {
        if let Err(err) = self.flush_staging() {
            tracing::debug!(error = %err, "dropping unflushed bytes on close");
        }
        self.staging.clear();
        self.writer = None;
        self.reader = None;
    }
}

impl<R: Read, W: Write> Drop for PipeTransport<R, W> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if !self.staging.is_empty() {
                let _ = writer.write_all(&self.staging);
                let _ = writer.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingWriter {
        chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.chunks.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct InterruptingReader {
        data: Vec<u8>,
        interrupted: bool,
    }

    impl Read for InterruptingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(ErrorKind::Interrupted.into());
            }
            // Hand out one byte at a time to exercise short reads.
            if self.data.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data.remove(0);
            Ok(1)
        }
    }

    #[test]
    fn writes_are_held_until_flush() {
        let writer = RecordingWriter::default();
        let chunks = writer.chunks.clone();
        let mut pipe = PipeTransport::with_capacity(Cursor::new(Vec::new()), writer, 8);

        pipe.write(&[1, 2, 3]).unwrap();
        assert!(chunks.lock().unwrap().is_empty());
        assert_eq!(pipe.staged(), 3);

        pipe.flush().unwrap();
        assert_eq!(*chunks.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(pipe.staged(), 0);
    }

    #[test]
    fn overflow_fills_flushes_and_restages() {
        let writer = RecordingWriter::default();
        let chunks = writer.chunks.clone();
        let mut pipe = PipeTransport::with_capacity(Cursor::new(Vec::new()), writer, 4);

        pipe.write(&[1, 2]).unwrap();
        pipe.write(&[3, 4, 5, 6, 7, 8, 9, 10, 11]).unwrap();
        assert_eq!(
            *chunks.lock().unwrap(),
            vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]
        );
        assert_eq!(pipe.staged(), 3);
    }

    #[test]
    fn short_and_interrupted_reads_are_completed() {
        let reader = InterruptingReader {
            data: vec![9, 8, 7, 6],
            interrupted: false,
        };
        let mut pipe = PipeTransport::new(reader, RecordingWriter::default());
        assert_eq!(pipe.read(4).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn eof_mid_read_is_unexpected() {
        let mut pipe = PipeTransport::new(Cursor::new(vec![1, 2]), RecordingWriter::default());
        assert!(matches!(
            pipe.read(4),
            Err(TransportError::UnexpectedEof)
        ));
    }

    #[test]
    fn closed_pipe_rejects_io() {
        let mut pipe = PipeTransport::new(Cursor::new(vec![1]), RecordingWriter::default());
        pipe.close();
        assert!(matches!(pipe.write(&[1]), Err(TransportError::Closed)));
        assert!(matches!(pipe.read(1), Err(TransportError::Closed)));
    }
}
