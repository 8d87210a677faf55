//! Stream layer
//!
//! Virtual TCP streams multiplexed onto a circuit. The circuit owns the
//! cell-level state; each stream holds a non-owning handle and receives its
//! inbound cells through a per-stream mailbox. A single reader task per
//! circuit pulls relay cells, handles circuit-level SENDMEs and DATA
//! accounting, and routes everything else by stream id.
//!
//! Writers respect both send windows; an exhausted window suspends the
//! writer until the reader task credits it from an incoming SENDME.

use crate::circuit::{
    Circuit, MAX_RELAY_DATA_LEN, RELAY_BEGIN, RELAY_BEGIN_DIR, RELAY_CONNECTED, RELAY_DATA,
    RELAY_END, RELAY_SENDME,
};
use crate::error::{Error, Resource, Result};
use crate::flow::{
    sendme_v1_payload, RecvAccounting, SendWindow, CIRC_SENDME_INCREMENT, STREAM_SENDME_INCREMENT,
    STREAM_WINDOW_INITIAL,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// RELAY_END reason sent on normal close.
const END_REASON_DONE: u8 = 6;

/// Events delivered to a stream's mailbox by the circuit reader task.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Connected(Vec<u8>),
    Data(Vec<u8>),
    End(u8),
    /// Unexpected relay command addressed to this stream.
    Violation(u8),
    Terminated(Terminated),
}

/// Why the circuit stopped delivering.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Terminated {
    Destroyed(u8),
    LinkClosed,
}

impl Terminated {
    fn into_error(self) -> Error {
        match self {
            Terminated::Destroyed(reason) => Error::CircuitDestroyed(reason),
            Terminated::LinkClosed => Error::LinkClosed,
        }
    }
}

struct StreamEntry {
    sender: mpsc::UnboundedSender<StreamEvent>,
    window: Arc<SendWindow>,
}

/// Per-circuit stream registry and id allocator. Ids are monotonic from 1,
/// skip 0 (circuit control), and wrap reusing only freed slots.
pub(crate) struct StreamTable {
    entries: HashMap<u16, StreamEntry>,
    next_id: u16,
}

impl Default for StreamTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }
}

impl StreamTable {
    fn allocate(
        &mut self,
    ) -> Result<(u16, mpsc::UnboundedReceiver<StreamEvent>, Arc<SendWindow>)> {
        for _ in 0..u16::MAX {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !self.entries.contains_key(&id) {
                let (sender, receiver) = mpsc::unbounded_channel();
                let window = Arc::new(SendWindow::new(STREAM_WINDOW_INITIAL));
                self.entries.insert(
                    id,
                    StreamEntry {
                        sender,
                        window: Arc::clone(&window),
                    },
                );
                return Ok((id, receiver, window));
            }
        }
        Err(Error::ResourceExhausted(Resource::StreamIds))
    }

    fn release(&mut self, id: u16) {
        self.entries.remove(&id);
    }

    fn window(&self, id: u16) -> Option<Arc<SendWindow>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.window))
    }

    fn route(&self, id: u16, event: StreamEvent) -> bool {
        match self.entries.get(&id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, terminated: Terminated) {
        for entry in self.entries.values() {
            let _ = entry.sender.send(StreamEvent::Terminated(terminated));
        }
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.entries.len()
    }
}

/// A virtual TCP stream over a circuit.
pub struct Stream {
    id: u16,
    circuit: Arc<Circuit>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    window: Arc<SendWindow>,
    buf: Vec<u8>,
    eof: bool,
    closed: bool,
    /// When set, closing the stream also tears down the circuit and link
    /// (used for onion-service streams, which own their rendezvous circuit).
    owns_circuit: bool,
}

impl Stream {
    /// Opens a stream to `target` ("host:port") with RELAY_BEGIN and waits
    /// for RELAY_CONNECTED.
    pub async fn begin(circuit: &Arc<Circuit>, target: &str) -> Result<Stream> {
        // RELAY_BEGIN payload: "host:port\0" + 4 flag bytes, all zero.
        let mut payload = Vec::with_capacity(target.len() + 5);
        payload.extend_from_slice(target.as_bytes());
        payload.extend_from_slice(&[0; 5]);
        Self::begin_with(circuit, RELAY_BEGIN, &payload, target).await
    }

    /// Opens a directory stream to the relay itself (RELAY_BEGIN_DIR).
    pub async fn begin_dir(circuit: &Arc<Circuit>) -> Result<Stream> {
        Self::begin_with(circuit, RELAY_BEGIN_DIR, &[], "<dir>").await
    }

    async fn begin_with(
        circuit: &Arc<Circuit>,
        begin_cmd: u8,
        payload: &[u8],
        target: &str,
    ) -> Result<Stream> {
        ensure_reader(circuit);

        let (id, events, window) = circuit
            .streams
            .lock()
            .expect("stream table lock")
            .allocate()?;
        log::info!("stream {id}: BEGIN to {target}");

        let mut stream = Stream {
            id,
            circuit: Arc::clone(circuit),
            events,
            window,
            buf: Vec::new(),
            eof: false,
            closed: false,
            owns_circuit: false,
        };

        if let Err(e) = circuit.send_relay(begin_cmd, id, payload).await {
            stream.deregister();
            stream.closed = true;
            return Err(e);
        }

        match stream.events.recv().await {
            Some(StreamEvent::Connected(_)) => {
                log::info!("stream {id}: connected");
                Ok(stream)
            }
            Some(StreamEvent::End(reason)) => {
                stream.deregister();
                stream.closed = true;
                Err(Error::StreamRejected(reason))
            }
            Some(StreamEvent::Terminated(t)) => {
                stream.deregister();
                stream.closed = true;
                Err(t.into_error())
            }
            Some(other) => {
                stream.deregister();
                stream.closed = true;
                Err(Error::ProtocolViolation(format!(
                    "unexpected {other:?} while waiting for CONNECTED"
                )))
            }
            None => {
                stream.closed = true;
                Err(Error::LinkClosed)
            }
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Reads stream data. Returns 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            return Ok(n);
        }
        if self.eof {
            return Ok(0);
        }

        loop {
            match self.events.recv().await {
                Some(StreamEvent::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.buf.extend_from_slice(&data[n..]);
                    }
                    return Ok(n);
                }
                Some(StreamEvent::End(reason)) => {
                    log::debug!("stream {}: END (reason {reason})", self.id);
                    self.eof = true;
                    return Ok(0);
                }
                Some(StreamEvent::Terminated(t)) => return Err(t.into_error()),
                Some(StreamEvent::Violation(cmd)) => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected relay command {cmd} on stream {}",
                        self.id
                    )))
                }
                Some(StreamEvent::Connected(_)) => {
                    return Err(Error::ProtocolViolation(
                        "CONNECTED on established stream".into(),
                    ))
                }
                None => return Err(Error::LinkClosed),
            }
        }
    }

    /// Reads until end of stream or `limit` bytes.
    pub async fn read_to_end(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; MAX_RELAY_DATA_LEN];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
            if out.len() > limit {
                return Err(Error::ProtocolViolation(format!(
                    "stream response exceeds {limit} bytes"
                )));
            }
        }
    }

    /// Writes all of `data` as RELAY_DATA cells, suspending on exhausted
    /// send windows until SENDMEs lift them.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream closed").into());
        }
        let mut total = 0;
        for chunk in data.chunks(MAX_RELAY_DATA_LEN) {
            self.window.reserve().await;
            self.circuit.circ_window.reserve().await;
            self.circuit.send_relay(RELAY_DATA, self.id, chunk).await?;
            total += chunk.len();
        }
        Ok(total)
    }

    /// Non-blocking write of at most one cell. Fails with
    /// [`Error::FlowControl`] instead of suspending when a window is
    /// exhausted.
    pub async fn try_write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream closed").into());
        }
        let chunk = &data[..data.len().min(MAX_RELAY_DATA_LEN)];
        if !self.window.try_reserve() {
            return Err(Error::FlowControl);
        }
        if !self.circuit.circ_window.try_reserve() {
            self.window.add(1); // give back the stream slot
            return Err(Error::FlowControl);
        }
        self.circuit.send_relay(RELAY_DATA, self.id, chunk).await?;
        Ok(chunk.len())
    }

    /// Sends RELAY_END (reason DONE) and releases the stream id. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.deregister();
        let result = self
            .circuit
            .send_relay(RELAY_END, self.id, &[END_REASON_DONE])
            .await;
        if self.owns_circuit {
            if let Err(e) = self.circuit.destroy().await {
                log::debug!("stream {}: circuit teardown: {e}", self.id);
            }
            self.circuit.link().close().await;
        }
        match result {
            Ok(()) => Ok(()),
            // The stream is gone either way; teardown races are not errors.
            Err(Error::CircuitDestroyed(_)) | Err(Error::LinkClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Marks this stream as the sole user of its circuit: closing it also
    /// destroys the circuit and closes the link.
    pub(crate) fn set_owns_circuit(&mut self) {
        self.owns_circuit = true;
    }

    fn deregister(&self) {
        self.circuit
            .streams
            .lock()
            .expect("stream table lock")
            .release(self.id);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.closed {
            self.deregister();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

/// Spawns the circuit's reader task on first use.
fn ensure_reader(circuit: &Arc<Circuit>) {
    if !circuit.reader_started.swap(true, Ordering::SeqCst) {
        tokio::spawn(reader_loop(Arc::clone(circuit)));
    }
}

/// The per-circuit receive loop: pulls relay cells, applies flow-control
/// accounting, emits SENDMEs, and dispatches by stream id. Cells for
/// unknown streams are dropped.
async fn reader_loop(circuit: Arc<Circuit>) {
    let mut circ_acct = RecvAccounting::default();
    let mut stream_accts: HashMap<u16, RecvAccounting> = HashMap::new();

    loop {
        let msg = match circuit.recv_relay().await {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("circuit 0x{:08x}: reader stopping: {e}", circuit.id());
                let terminated = match e {
                    Error::CircuitDestroyed(reason) => Terminated::Destroyed(reason),
                    _ => Terminated::LinkClosed,
                };
                circuit
                    .streams
                    .lock()
                    .expect("stream table lock")
                    .broadcast(terminated);
                return;
            }
        };

        match msg.cmd {
            RELAY_SENDME if msg.stream_id == 0 => {
                circuit.circ_window.add(CIRC_SENDME_INCREMENT);
            }
            RELAY_SENDME => {
                let window = circuit
                    .streams
                    .lock()
                    .expect("stream table lock")
                    .window(msg.stream_id);
                match window {
                    Some(w) => w.add(STREAM_SENDME_INCREMENT),
                    None => log::debug!("SENDME for unknown stream {}", msg.stream_id),
                }
            }
            RELAY_DATA => {
                let circ_sendme = circ_acct.note_data(CIRC_SENDME_INCREMENT);
                let stream_sendme = stream_accts
                    .entry(msg.stream_id)
                    .or_default()
                    .note_data(STREAM_SENDME_INCREMENT);

                if circ_sendme || stream_sendme {
                    // SENDME v1 binds the ack to the traffic it covers via
                    // the backward digest at this instant.
                    let digest = circuit.backward_digest().await;
                    let payload = sendme_v1_payload(&digest);
                    if circ_sendme {
                        if let Err(e) = circuit.send_relay(RELAY_SENDME, 0, &payload).await {
                            log::warn!("circuit SENDME send failed: {e}");
                        }
                    }
                    if stream_sendme {
                        if let Err(e) =
                            circuit.send_relay(RELAY_SENDME, msg.stream_id, &payload).await
                        {
                            log::warn!("stream SENDME send failed: {e}");
                        }
                    }
                }

                route(&circuit, msg.stream_id, StreamEvent::Data(msg.data));
            }
            RELAY_END => {
                let reason = msg.data.first().copied().unwrap_or(0);
                stream_accts.remove(&msg.stream_id);
                route(&circuit, msg.stream_id, StreamEvent::End(reason));
            }
            RELAY_CONNECTED => {
                route(&circuit, msg.stream_id, StreamEvent::Connected(msg.data));
            }
            other => {
                route(&circuit, msg.stream_id, StreamEvent::Violation(other));
            }
        }
    }
}

fn route(circuit: &Arc<Circuit>, stream_id: u16, event: StreamEvent) {
    let routed = circuit
        .streams
        .lock()
        .expect("stream table lock")
        .route(stream_id, event);
    if !routed {
        log::debug!("dropping cell for unroutable stream {stream_id}");
    }
}
