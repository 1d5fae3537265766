// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type Reader = BufReader<Box<dyn Read + Send>>;
type Writer = Box<dyn Write + Send>;
type Interrupt = Box<dyn Fn() + Send + Sync>;

/// A network stream shared by the send and receive halves of a host
/// connection.
///
/// The stream is created empty by the runtime and filled in by the
/// transport's `connect` function with [`attach`](#method.attach). The read
/// and write halves are locked separately so a connection's receive thread
/// can block in a read while its send thread writes the next request. Reads
/// are buffered by the stream itself.
pub struct NetStream {
    id: u64,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    interrupt: Mutex<Option<Interrupt>>,
    connected: AtomicBool,
}

impl NetStream {
    pub fn new() -> Self {
        NetStream {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            interrupt: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let reader: Box<dyn Read + Send> = Box::new(reader);
        *self.reader.lock().unwrap() = Some(BufReader::new(reader));
        *self.writer.lock().unwrap() = Some(Box::new(writer));
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Register `f` to run at the start of [`close`](#method.close), before
    /// either half is locked. It must unblock any read or write in progress,
    /// for example by shutting down the underlying socket.
    pub fn on_close<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.interrupt.lock().unwrap() = Some(Box::new(f));
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop both halves of the stream. Any further I/O fails with
    /// `NotConnected`.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let interrupt = self.interrupt.lock().unwrap().take();
        if let Some(interrupt) = interrupt {
            interrupt();
        }
        let writer = self.writer.lock().unwrap().take();
        if let Some(mut w) = writer {
            let _ = w.flush();
        }
        self.reader.lock().unwrap().take();
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.lock().unwrap().as_mut() {
            Some(r) => r.read(buf),
            None => Err(not_connected()),
        }
    }

    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        match self.reader.lock().unwrap().as_mut() {
            Some(r) => r.read_exact(buf),
            None => Err(not_connected()),
        }
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match self.writer.lock().unwrap().as_mut() {
            Some(w) => {
                w.write_all(buf)?;
                w.flush()
            }
            None => Err(not_connected()),
        }
    }

    /// Read a single `\n` terminated line, without the terminator.
    pub fn read_line(&self) -> io::Result<String> {
        let mut guard = self.reader.lock().unwrap();
        let r = guard.as_mut().ok_or_else(not_connected)?;
        let mut line = Vec::new();
        r.read_until(b'\n', &mut line)?;
        if line.pop() != Some(b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed before end of line",
            ));
        }
        String::from_utf8(line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Default for NetStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NetStream")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is not connected")
}
