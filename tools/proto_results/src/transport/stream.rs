//! Live delivery of snapshots over a TCP connection.
//!
//! The receiver owns two threads. The reader accepts a single connection and
//! decodes delimited frames onto a bounded channel; the dispatcher drains the
//! channel into a `ResultParser`. A full channel blocks the reader, which in
//! turn back-pressures the sender through TCP flow control.

use crate::codec::{write_delimited, FrameReader};
use crate::errors::ResultsError;
use crate::listener::TestListener;
use crate::logging::append_run_log;
use crate::parser::ResultParser;
use crate::record::TestRecord;
use crate::reporter::{SnapshotKind, SnapshotSink};
use serde_json::json;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub frame_buffer: usize,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            frame_buffer: 32,
        }
    }
}

enum Frame {
    Record(TestRecord),
    Error(ResultsError),
}

type SharedStream = Arc<Mutex<Option<TcpStream>>>;

pub struct StreamReceiver<L> {
    port: u16,
    stop: Arc<AtomicBool>,
    connection: SharedStream,
    reader: Option<thread::JoinHandle<()>>,
    dispatcher: Option<thread::JoinHandle<ResultParser<L>>>,
    parser: Option<ResultParser<L>>,
    errors: Vec<ResultsError>,
}

impl<L: TestListener + 'static> StreamReceiver<L> {
    /// Binds before returning so the port can be handed to the sender.
    pub fn start(parser: ResultParser<L>, options: &ReceiverOptions) -> Result<Self, ResultsError> {
        let listener = TcpListener::bind((options.host.as_str(), options.port))
            .map_err(|e| ResultsError::Transport(format!("bind {}:{}: {e}", options.host, options.port)))?;
        let port = listener
            .local_addr()
            .map_err(|e| ResultsError::Transport(e.to_string()))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| ResultsError::Transport(e.to_string()))?;
        append_run_log(
            "info",
            "receiver.bound",
            json!({ "host": options.host, "port": port }),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let connection: SharedStream = Arc::new(Mutex::new(None));
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(options.frame_buffer.max(1));

        let reader = {
            let stop = Arc::clone(&stop);
            let connection = Arc::clone(&connection);
            thread::spawn(move || read_connection(listener, frame_tx, stop, connection))
        };
        let dispatcher = thread::spawn(move || {
            let mut parser = parser;
            let mut dispatched = 0usize;
            while let Some(frame) = frame_rx.blocking_recv() {
                match frame {
                    Frame::Record(record) => {
                        parser.process_record(&record);
                        dispatched += 1;
                    }
                    Frame::Error(err) => parser.record_error(err),
                }
            }
            append_run_log(
                "info",
                "receiver.dispatcher_finished",
                json!({ "frames": dispatched, "errors": parser.errors().len() }),
            );
            parser
        });

        Ok(Self {
            port,
            stop,
            connection,
            reader: Some(reader),
            dispatcher: Some(dispatcher),
            parser: None,
            errors: Vec::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits until the sender has disconnected and every frame has been
    /// dispatched. Returns false if `timeout` elapses first.
    pub fn join_receiver(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let finished = self
                .dispatcher
                .as_ref()
                .map_or(true, thread::JoinHandle::is_finished);
            if finished {
                self.join_threads();
                return true;
            }
            if Instant::now() >= deadline {
                append_run_log(
                    "warn",
                    "receiver.join_timed_out",
                    json!({ "port": self.port, "timeout_ms": timeout.as_millis() as u64 }),
                );
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
    }

    /// Stops accepting and reading, then dispatches whatever was already
    /// buffered. Safe to call more than once.
    pub fn close(&mut self) {
        if self.reader.is_none() && self.dispatcher.is_none() {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(stream) = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.join_threads();
        append_run_log("info", "receiver.closed", json!({ "port": self.port }));
    }

    /// Closes the receiver, then closes whatever the stream left open.
    pub fn complete_module_events(&mut self) -> Result<(), ResultsError> {
        self.close();
        match self.parser.as_mut() {
            Some(parser) => parser.complete_module_events(),
            None => Err(ResultsError::Transport(
                "receiver lost its parser".to_string(),
            )),
        }
    }

    pub fn invocation_ended_reported(&self) -> bool {
        self.parser
            .as_ref()
            .is_some_and(ResultParser::invocation_ended_reported)
    }

    /// Decode and transport errors seen so far. Frame errors become visible
    /// once the receiver has been joined or closed.
    pub fn errors(&self) -> Vec<ResultsError> {
        let mut errors = self.errors.clone();
        if let Some(parser) = &self.parser {
            errors.extend(parser.errors().iter().cloned());
        }
        errors
    }

    pub fn into_parser(mut self) -> Result<ResultParser<L>, ResultsError> {
        self.close();
        self.parser
            .take()
            .ok_or_else(|| ResultsError::Transport("receiver lost its parser".to_string()))
    }

    pub fn into_listener(self) -> Result<L, ResultsError> {
        self.into_parser().map(ResultParser::into_listener)
    }

    fn join_threads(&mut self) {
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                self.errors
                    .push(ResultsError::Transport("reader thread panicked".to_string()));
            }
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            match dispatcher.join() {
                Ok(parser) => self.parser = Some(parser),
                Err(_) => self
                    .errors
                    .push(ResultsError::Transport("dispatcher thread panicked".to_string())),
            }
        }
    }
}

impl<L> Drop for StreamReceiver<L> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(stream) = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

fn read_connection(
    listener: TcpListener,
    frame_tx: mpsc::Sender<Frame>,
    stop: Arc<AtomicBool>,
    connection: SharedStream,
) {
    let stream = loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                append_run_log(
                    "info",
                    "receiver.accepted",
                    json!({ "peer": peer.to_string() }),
                );
                break stream;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                let _ = frame_tx.blocking_send(Frame::Error(ResultsError::Transport(format!(
                    "accept failed: {err}"
                ))));
                return;
            }
        }
    };

    if let Err(err) = stream.set_nonblocking(false) {
        let _ = frame_tx.blocking_send(Frame::Error(ResultsError::Transport(err.to_string())));
        return;
    }
    match stream.try_clone() {
        Ok(handle) => {
            *connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        Err(err) => {
            let _ = frame_tx.blocking_send(Frame::Error(ResultsError::Transport(err.to_string())));
            return;
        }
    }
    // close() may have run between accept and publishing the handle.
    if stop.load(Ordering::SeqCst) {
        return;
    }

    let mut frames = 0usize;
    for frame in FrameReader::new(BufReader::new(stream)) {
        let frame = match frame {
            Ok(record) => {
                frames += 1;
                Frame::Record(record)
            }
            Err(_) if stop.load(Ordering::SeqCst) => break,
            Err(err) => Frame::Error(err),
        };
        if frame_tx.blocking_send(frame).is_err() {
            break;
        }
    }
    append_run_log(
        "info",
        "receiver.connection_closed",
        json!({ "frames": frames, "stopped": stop.load(Ordering::SeqCst) }),
    );
}

/// Sends each snapshot as a delimited frame. Connection problems are logged
/// and recorded; once the connection is gone further snapshots are dropped.
pub struct StreamSnapshotSink {
    address: String,
    stream: Option<BufWriter<TcpStream>>,
    sent: usize,
    dropped: usize,
    errors: Vec<ResultsError>,
}

impl StreamSnapshotSink {
    pub fn connect(host: &str, port: u16) -> Self {
        let address = format!("{host}:{port}");
        let mut sink = Self {
            address,
            stream: None,
            sent: 0,
            dropped: 0,
            errors: Vec::new(),
        };
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                append_run_log(
                    "info",
                    "sender.connected",
                    json!({ "address": sink.address }),
                );
                sink.stream = Some(BufWriter::new(stream));
            }
            Err(err) => sink.fail(ResultsError::Transport(format!(
                "connect {}: {err}",
                sink.address
            ))),
        }
        sink
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn errors(&self) -> &[ResultsError] {
        &self.errors
    }

    /// Flushes and closes the write half so the receiver sees end of stream.
    pub fn finish(&mut self) {
        if let Some(mut writer) = self.stream.take() {
            let _ = writer.flush();
            if let Ok(stream) = writer.into_inner() {
                let _ = stream.shutdown(Shutdown::Write);
            }
            append_run_log(
                "info",
                "sender.finished",
                json!({ "address": self.address, "sent": self.sent, "dropped": self.dropped }),
            );
        }
    }

    fn fail(&mut self, err: ResultsError) {
        append_run_log(
            "warn",
            "sender.failed",
            json!({ "address": self.address, "error": err.to_string() }),
        );
        self.stream = None;
        self.errors.push(err);
    }
}

impl SnapshotSink for StreamSnapshotSink {
    fn on_snapshot(&mut self, root: &TestRecord, _kind: SnapshotKind) -> Result<(), ResultsError> {
        let Some(writer) = self.stream.as_mut() else {
            self.dropped += 1;
            return Ok(());
        };
        match write_delimited(writer, root) {
            Ok(()) => self.sent += 1,
            Err(err) => {
                self.dropped += 1;
                self.fail(err);
            }
        }
        Ok(())
    }

    fn on_final(&mut self, root: &TestRecord) -> Result<(), ResultsError> {
        self.on_snapshot(root, SnapshotKind::InvocationEnded)?;
        self.finish();
        Ok(())
    }
}

impl Drop for StreamSnapshotSink {
    fn drop(&mut self) {
        self.finish();
    }
}
