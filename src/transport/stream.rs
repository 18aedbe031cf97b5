//! Buffered row streams over any byte stream.

use crate::error::Result;
use crate::pipeline::runtime::StopSignal;
use crate::row::{Row, Schema};
use crate::transport::wire::{self, io_error};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

/// Sends a schema frame, row frames and a terminal frame
pub struct RowStreamWriter<W: Write> {
    inner: BufWriter<W>,
    scratch: Vec<u8>,
    rows: u64,
}

impl<W: Write> RowStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
            scratch: Vec::with_capacity(256),
            rows: 0,
        }
    }

    /// Send the schema frame. Flushed immediately so the peer can finish
    /// its handshake before any row exists.
    pub fn write_schema(&mut self, schema: &Schema) -> Result<()> {
        wire::write_schema(&mut self.inner, schema)?;
        self.flush()
    }

    pub fn write(&mut self, row: &Row) -> Result<()> {
        wire::write_row(&mut self.inner, row, &mut self.scratch)?;
        self.rows += 1;
        Ok(())
    }

    /// Send the terminal frame and flush.
    pub fn finish(&mut self) -> Result<()> {
        wire::write_terminal(&mut self.inner)?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush().map_err(io_error)
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

/// Receives what a [`RowStreamWriter`] sent
pub struct RowStreamReader<R: Read> {
    inner: BufReader<R>,
    schema: Option<Arc<Schema>>,
    scratch: Vec<u8>,
    rows: u64,
}

impl<R: Read> RowStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            schema: None,
            scratch: Vec::with_capacity(256),
            rows: 0,
        }
    }

    /// Read the schema frame. Must be called once, before any row.
    pub fn read_schema(&mut self) -> Result<Arc<Schema>> {
        let schema = Arc::new(wire::read_schema(&mut self.inner)?);
        self.schema = Some(schema.clone());
        Ok(schema)
    }

    pub fn schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    /// Next row, or `None` after the terminal frame.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| wire::protocol("row frame before schema frame"))?;
        let row = wire::read_row(&mut self.inner, &schema, &mut self.scratch)?;
        if row.is_some() {
            self.rows += 1;
        }
        Ok(row)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }
}

/// Byte stream whose blocking calls give up once the run stops.
///
/// The wrapped socket gets a short read/write timeout; every timeout checks
/// the stop signal and otherwise retries, so callers see either data or a
/// real error.
pub struct Interruptible<S> {
    inner: S,
    stop: StopSignal,
}

impl Interruptible<TcpStream> {
    pub fn tcp(stream: TcpStream, stop: StopSignal, poll: Duration) -> Result<Self> {
        stream.set_read_timeout(Some(poll)).map_err(io_error)?;
        stream.set_write_timeout(Some(poll)).map_err(io_error)?;
        stream.set_nodelay(true).map_err(io_error)?;
        Ok(Self {
            inner: stream,
            stop,
        })
    }
}

impl<S> Interruptible<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn stopped(&self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, "run stopped")
    }
}

fn timed_out(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl<S: Read> Read for Interruptible<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if timed_out(&e) => {
                    if self.stop.is_stopped() {
                        return Err(self.stopped());
                    }
                }
                other => return other,
            }
        }
    }
}

impl<S: Write> Write for Interruptible<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Err(e) if timed_out(&e) => {
                    if self.stop.is_stopped() {
                        return Err(self.stopped());
                    }
                }
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        loop {
            match self.inner.flush() {
                Err(e) if timed_out(&e) => {
                    if self.stop.is_stopped() {
                        return Err(self.stopped());
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportKind;
    use crate::row::{FieldMeta, Value, ValueType};

    fn schema() -> Arc<Schema> {
        Schema::shared(vec![
            FieldMeta::new("id", ValueType::Integer),
            FieldMeta::new("name", ValueType::String),
        ])
    }

    #[test]
    fn test_stream_over_buffer() {
        let schema = schema();
        let mut writer = RowStreamWriter::new(Vec::new());
        writer.write_schema(&schema).unwrap();
        for i in 0..3 {
            let row = Row::new(schema.clone(), vec![Value::Integer(i), Value::Null]).unwrap();
            writer.write(&row).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(writer.rows(), 3);
        let bytes = writer.get_ref().clone();

        let mut reader = RowStreamReader::new(bytes.as_slice());
        let received = reader.read_schema().unwrap();
        assert!(received.diff(&schema).is_none());
        let mut ids = Vec::new();
        while let Some(row) = reader.next_row().unwrap() {
            ids.push(row.get(0).and_then(Value::as_i64).unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(reader.rows(), 3);
    }

    #[test]
    fn test_row_before_schema_is_protocol_error() {
        let mut reader = RowStreamReader::new(&[0u8, 0, 0, 0][..]);
        let err = reader.next_row().unwrap_err();
        assert_eq!(err.transport_kind(), Some(TransportKind::Protocol));
    }
}
