//! One TCP connection carrying newline-delimited JSON both ways.
//!
//! Sending happens on the caller's thread under the connection lock. A
//! background reader accumulates bytes, splits them on `\n` and hands every
//! decoded frame to the [`EventHandlers`] table. Handlers run on the reader
//! thread.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{io_err, ChannelError};
use crate::wire::Event;

const READ_CHUNK: usize = 1024;

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

type Handler = Box<dyn Fn(&Value) + Send + Sync>;

/// Event name → handler.
#[derive(Default)]
pub struct EventHandlers {
    handlers: HashMap<String, Handler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler receiving the raw frame. Replaces any previous
    /// handler for `name`.
    pub fn insert<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    /// Register a handler for `E`. Frames whose payload does not decode into
    /// `E` are logged and dropped.
    pub fn on<E, F>(&mut self, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(E) + Send + Sync + 'static,
    {
        self.insert(E::NAME, move |frame: &Value| {
            match serde_json::from_value::<E>(frame.clone()) {
                Ok(event) => handler(event),
                Err(err) => {
                    tracing::warn!(event = E::NAME, error = %err, "dropping undecodable event")
                }
            }
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route `frame` by its `event` field. Returns whether a handler ran.
    pub fn dispatch(&self, frame: &Value) -> bool {
        let Some(name) = frame.get("event").and_then(Value::as_str) else {
            tracing::warn!(%frame, "frame without event name");
            return false;
        };
        match self.handlers.get(name) {
            Some(handler) => {
                handler(frame);
                true
            }
            None => {
                tracing::debug!(event = name, "no handler for event");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct Connection {
    address: String,
    stream: TcpStream,
    reader: JoinHandle<()>,
}

pub struct EventChannel {
    handlers: Arc<EventHandlers>,
    connection: Mutex<Option<Connection>>,
}

impl EventChannel {
    pub fn new(handlers: EventHandlers) -> Self {
        Self {
            handlers: Arc::new(handlers),
            connection: Mutex::new(None),
        }
    }

    /// Open the socket and start the reader.
    ///
    /// A refused connection is reported as [`ChannelError::Refused`] so
    /// callers can treat "server not up yet" as an ordinary failure.
    pub fn connect(&self, ip: &str, port: u16) -> Result<(), ChannelError> {
        let mut connection = self.connection.lock();
        if let Some(existing) = connection.as_ref() {
            if !existing.reader.is_finished() {
                return Err(ChannelError::AlreadyConnected(existing.address.clone()));
            }
        }
        if let Some(stale) = connection.take() {
            close(stale);
        }

        let address = format!("{ip}:{port}");
        let stream = TcpStream::connect(&address).map_err(|err| {
            if err.kind() == ErrorKind::ConnectionRefused {
                ChannelError::Refused {
                    address: address.clone(),
                }
            } else {
                io_err(&address, err)
            }
        })?;
        let read_half = stream.try_clone().map_err(|e| io_err(&address, e))?;

        let handlers = self.handlers.clone();
        let reader_address = address.clone();
        let reader = thread::Builder::new()
            .name("shiba-event-reader".to_string())
            .spawn(move || read_loop(read_half, &handlers, &reader_address))
            .map_err(|e| io_err(&address, e))?;

        tracing::info!(%address, "connected");
        *connection = Some(Connection {
            address,
            stream,
            reader,
        });
        Ok(())
    }

    /// True while the socket is open and the peer has not closed it.
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| !c.reader.is_finished())
    }

    pub fn address(&self) -> Option<String> {
        self.connection.lock().as_ref().map(|c| c.address.clone())
    }

    /// Write `message` as one frame. There is no acknowledgement.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), ChannelError> {
        let payload = serde_json::to_string(message)?;
        let mut connection = self.connection.lock();
        let Some(connection) = connection.as_mut() else {
            return Err(ChannelError::NotConnected);
        };

        let address = &connection.address;
        connection
            .stream
            .write_all(payload.as_bytes())
            .map_err(|e| io_err(address, e))?;
        connection
            .stream
            .write_all(b"\n")
            .map_err(|e| io_err(address, e))?;
        connection.stream.flush().map_err(|e| io_err(address, e))?;
        tracing::debug!(%address, %payload, "sent");
        Ok(())
    }

    /// Close the socket and join the reader. No-op when not connected.
    pub fn disconnect(&self) {
        let taken = self.connection.lock().take();
        if let Some(connection) = taken {
            close(connection);
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn close(connection: Connection) {
    let Connection {
        address,
        stream,
        reader,
    } = connection;
    if let Err(err) = stream.shutdown(Shutdown::Both) {
        if err.kind() != ErrorKind::NotConnected {
            tracing::debug!(%address, error = %err, "socket shutdown failed");
        }
    }
    // A handler asking for a disconnect runs on the reader itself.
    if reader.thread().id() != thread::current().id() && reader.join().is_err() {
        tracing::warn!(%address, "event reader panicked");
    }
    tracing::info!(%address, "disconnected");
}

fn read_loop(mut stream: TcpStream, handlers: &EventHandlers, address: &str) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                tracing::debug!(%address, "peer closed the connection");
                break;
            }
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::NotConnected
                ) =>
            {
                tracing::debug!(%address, error = %err, "connection dropped");
                break;
            }
            Err(err) => {
                tracing::warn!(%address, error = %err, "read failed");
                break;
            }
        };

        pending.extend_from_slice(&chunk[..read]);
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            handle_line(&line[..end], handlers, address);
        }
    }
}

fn handle_line(line: &[u8], handlers: &EventHandlers, address: &str) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(frame) => {
            handlers.dispatch(&frame);
        }
        Err(err) => tracing::warn!(%address, error = %err, line = %text, "skipping malformed frame"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
