// Copyright 2020 Joyent, Inc.

// Fakes shared by the portal integration tests: an in-memory transport whose
// connections echo back whatever is written to them, and a few commands.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use slog::{o, Drain, Logger};

use gop::command::{Command, ConnectContext, TaskQueue};
use gop::gop::Gop;
use gop::netstream::NetStream;
use gop::portal::Transport;
use gop::status::OpStatus;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

struct LoopWriter(Sender<Vec<u8>>);

impl Write for LoopWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct LoopReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
}

impl Read for LoopReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.buf.is_empty() {
            match self.rx.recv_timeout(READ_TIMEOUT) {
                Ok(chunk) => self.buf = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::from(io::ErrorKind::TimedOut))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
        Ok(n)
    }
}

/// A transport whose connections are in-memory loopbacks
#[derive(Default)]
pub struct LoopbackTransport {
    pub live: AtomicI64,
    pub max_live: AtomicI64,
    pub connects: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub connect_delay: Duration,
    pub unresolvable: Vec<String>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport::default()
    }

    pub fn with_connect_delay(delay: Duration) -> Self {
        LoopbackTransport {
            connect_delay: delay,
            ..LoopbackTransport::default()
        }
    }

    pub fn with_unresolvable(hosts: &[&str]) -> Self {
        LoopbackTransport {
            unresolvable: hosts.iter().map(|h| h.to_string()).collect(),
            ..LoopbackTransport::default()
        }
    }

    pub fn max_live(&self) -> i64 {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn connect(
        &self,
        stream: &NetStream,
        _ctx: &ConnectContext,
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> OpStatus {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_delay > Duration::from_secs(0) {
            thread::sleep(self.connect_delay);
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return OpStatus::CANT_CONNECT;
        }

        let (tx, rx) = channel();
        stream.attach(
            LoopReader {
                rx,
                buf: Vec::new(),
            },
            LoopWriter(tx),
        );
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        OpStatus::SUCCESS
    }

    fn close_connection(&self, stream: &NetStream) {
        if stream.is_connected() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        stream.close();
    }

    fn resolve(&self, host: &str, _port: u16) -> bool {
        !self.unresolvable.iter().any(|h| h == host)
    }
}

/// Writes its number on a line and expects to read the same number back.
/// Every number read is recorded in `seen`.
pub struct Echo {
    pub n: usize,
    pub seen: Arc<Mutex<Vec<usize>>>,
    pub delay: Duration,
}

impl Echo {
    pub fn new(n: usize, seen: &Arc<Mutex<Vec<usize>>>) -> Self {
        Echo {
            n,
            seen: seen.clone(),
            delay: Duration::from_millis(0),
        }
    }

    pub fn slow(n: usize, seen: &Arc<Mutex<Vec<usize>>>, delay: Duration) -> Self {
        Echo {
            n,
            seen: seen.clone(),
            delay,
        }
    }
}

impl Command for Echo {
    fn send_phase(&self, _op: &Gop, ns: &NetStream) -> OpStatus {
        match ns.write_all(format!("{}\n", self.n).as_bytes()) {
            Ok(()) => OpStatus::SUCCESS,
            Err(_) => OpStatus::DEAD,
        }
    }

    fn recv_phase(&self, _op: &Gop, ns: &NetStream) -> OpStatus {
        thread::sleep(self.delay);
        let line = match ns.read_line() {
            Ok(line) => line,
            Err(_) => return OpStatus::DEAD,
        };
        match line.trim().parse::<usize>() {
            Ok(got) => {
                self.seen.lock().unwrap().push(got);
                if got == self.n {
                    OpStatus::SUCCESS
                } else {
                    OpStatus::FAILURE
                }
            }
            Err(_) => OpStatus::FAILURE,
        }
    }
}

/// Reports a dead connection for the first `deaths` receives across all
/// instances sharing the counter, then succeeds.
pub struct DiesOnce {
    pub deaths: Arc<AtomicUsize>,
}

impl Command for DiesOnce {
    fn recv_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
        let left = self.deaths.load(Ordering::SeqCst);
        if left > 0 {
            self.deaths.fetch_sub(1, Ordering::SeqCst);
            OpStatus::DEAD
        } else {
            OpStatus::SUCCESS
        }
    }
}

/// Absorbs every other queued task before it executes and reports `status`
/// for the whole batch.
pub struct Batched {
    pub status: OpStatus,
    pub round_trips: Arc<AtomicUsize>,
}

impl Command for Batched {
    fn recv_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.status
    }

    fn before_exec(&self, op: &Gop, queue: &mut TaskQueue) {
        let cmd = match op.command() {
            Some(cmd) => cmd,
            None => return,
        };
        let mut idx = 0;
        while let Some(next) = queue.get(idx) {
            if Gop::ptr_eq(next, op) {
                idx += 1;
                continue;
            }
            if let Some(sibling) = queue.remove(idx) {
                cmd.coalesce(sibling);
            }
        }
    }
}

/// Signals `started` when its receive phase begins, then waits `hold`.
pub struct Held {
    pub started: Mutex<Option<Sender<()>>>,
    pub hold: Duration,
}

impl Command for Held {
    fn recv_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
        if let Some(tx) = self.started.lock().unwrap().take() {
            let _ = tx.send(());
        }
        thread::sleep(self.hold);
        OpStatus::SUCCESS
    }
}
