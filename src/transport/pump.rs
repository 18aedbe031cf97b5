//! Queue-to-socket pumps.
//!
//! A socket edge is two queues joined by a TCP stream:
//!
//! ```text
//! producer copy -> [producer queue] -> send_queue ==tcp==> receive_queue -> [consumer queue] -> consumer copy
//! ```
//!
//! Neither copy can tell the difference from a local edge: the schema is
//! forwarded before the first row, end-of-stream becomes a terminal frame and
//! an aborted producer queue becomes a dropped connection.

use crate::error::{Result, ResultExt};
use crate::pipeline::queue::RowQueue;
use crate::pipeline::runtime::StopSignal;
use crate::transport::stream::{Interruptible, RowStreamReader, RowStreamWriter};
use crate::transport::wire::io_error;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Socket timeout used to notice stop requests while blocked on I/O
pub const POLL: Duration = Duration::from_millis(100);

/// Connected loopback pair `(sending end, receiving end)`.
pub fn loopback_pair() -> Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(io_error)?;
    let addr = listener.local_addr().map_err(io_error)?;
    let sender = TcpStream::connect(addr).map_err(io_error)?;
    let (receiver, _) = listener.accept().map_err(io_error)?;
    Ok((sender, receiver))
}

/// Drain `queue` onto `stream` until end-of-stream.
///
/// Returns the number of rows sent. An aborted queue shuts the connection
/// down without a terminal frame, which the peer reports as a broken stream.
pub fn send_queue(queue: Arc<RowQueue>, stream: TcpStream, stop: StopSignal) -> Result<u64> {
    let name = queue.name().to_string();
    let socket = stream.try_clone().map_err(io_error)?;
    let mut writer = RowStreamWriter::new(Interruptible::tcp(stream, stop, POLL)?);

    let schema = match queue.wait_schema() {
        Some(schema) => schema,
        None => {
            let _ = socket.shutdown(Shutdown::Both);
            return Ok(0);
        }
    };
    writer
        .write_schema(&schema)
        .with_context(|| format!("sending schema of {}", name))?;

    while let Some(row) = queue.get() {
        writer
            .write(&row)
            .with_context(|| format!("sending rows of {}", name))?;
    }

    if queue.is_aborted() {
        tracing::debug!(queue = %name, "producer aborted, dropping connection");
        let _ = writer.flush();
        let _ = socket.shutdown(Shutdown::Both);
    } else {
        writer
            .finish()
            .with_context(|| format!("ending stream of {}", name))?;
        tracing::debug!(queue = %name, rows = writer.rows(), "stream sent");
    }
    Ok(writer.rows())
}

/// Fill `queue` from `stream` until the terminal frame, then close it.
///
/// Returns the number of rows received. If the consumer side goes away
/// (the queue is aborted) the remaining input is dropped quietly.
pub fn receive_queue(stream: TcpStream, queue: Arc<RowQueue>, stop: StopSignal) -> Result<u64> {
    let name = queue.name().to_string();
    let mut reader = RowStreamReader::new(Interruptible::tcp(stream, stop, POLL)?);

    let schema = reader
        .read_schema()
        .with_context(|| format!("receiving schema of {}", name))?;
    queue.set_schema(schema)?;

    loop {
        match reader.next_row() {
            Ok(Some(row)) => {
                if queue.put(row).is_err() {
                    tracing::debug!(queue = %name, "consumer gone, dropping input");
                    return Ok(reader.rows());
                }
            }
            Ok(None) => {
                queue.close();
                tracing::debug!(queue = %name, rows = reader.rows(), "stream received");
                return Ok(reader.rows());
            }
            Err(e) => return Err(e.with_context(format!("receiving rows of {}", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::runtime::RunControl;
    use crate::row::{FieldMeta, Row, Schema, Value, ValueType};
    use std::thread;

    fn stop() -> (Arc<RunControl>, StopSignal) {
        let control = Arc::new(RunControl::new(0, Vec::new()));
        (control.clone(), StopSignal::new(control))
    }

    #[test]
    fn test_pumps_move_rows_and_end_of_stream() {
        let (_control, signal) = stop();
        let schema = Schema::shared(vec![FieldMeta::new("id", ValueType::Integer)]);
        let producer = Arc::new(RowQueue::new("a.0 - b.0 (send)", 4));
        let consumer = Arc::new(RowQueue::new("a.0 - b.0", 4));
        let (tx, rx) = loopback_pair().unwrap();

        let sender = {
            let (queue, signal) = (producer.clone(), signal.clone());
            thread::spawn(move || send_queue(queue, tx, signal))
        };
        let receiver = {
            let queue = consumer.clone();
            thread::spawn(move || receive_queue(rx, queue, signal))
        };

        producer.set_schema(schema.clone()).unwrap();
        for i in 0..100 {
            producer
                .put(Row::new(schema.clone(), vec![Value::Integer(i)]).unwrap())
                .unwrap();
        }
        producer.close();

        let mut ids = Vec::new();
        while let Some(row) = consumer.get() {
            ids.push(row.get(0).and_then(Value::as_i64).unwrap());
        }
        assert_eq!(ids, (0..100).collect::<Vec<_>>());
        assert_eq!(sender.join().unwrap().unwrap(), 100);
        assert_eq!(receiver.join().unwrap().unwrap(), 100);
        assert!(consumer.is_done());
    }

    #[test]
    fn test_aborted_producer_breaks_stream() {
        let (_control, signal) = stop();
        let schema = Schema::shared(vec![FieldMeta::new("id", ValueType::Integer)]);
        let producer = Arc::new(RowQueue::new("send", 4));
        let consumer = Arc::new(RowQueue::new("recv", 4));
        let (tx, rx) = loopback_pair().unwrap();

        producer.set_schema(schema).unwrap();
        producer.abort();

        let sender = {
            let (queue, signal) = (producer.clone(), signal.clone());
            thread::spawn(move || send_queue(queue, tx, signal))
        };
        let result = receive_queue(rx, consumer.clone(), signal);
        assert!(result.unwrap_err().transport_kind().is_some());
        assert!(sender.join().unwrap().is_ok());
        assert!(!consumer.is_done());
    }

    #[test]
    fn test_stop_interrupts_blocked_receiver() {
        let (control, signal) = stop();
        let consumer = Arc::new(RowQueue::new("recv", 4));
        let (_tx, rx) = loopback_pair().unwrap();

        let receiver = thread::spawn(move || receive_queue(rx, consumer, signal));
        thread::sleep(Duration::from_millis(50));
        control.stop();
        assert!(receiver.join().unwrap().is_err());
    }
}
