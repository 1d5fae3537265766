// Copyright 2020 Joyent, Inc.

//! A TCP [`Transport`](../gop/portal/trait.Transport.html) for gop portal
//! contexts, plus a simple line-oriented command.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::{ExponentialBackoff, Operation};
use slog::{debug, error, o, warn, Drain, Logger};

use gop::command::{Command, ConnectContext};
use gop::gop::Gop;
use gop::netstream::NetStream;
use gop::portal::Transport;
use gop::status::OpStatus;

/// Connects to `host:port` over TCP, retrying with exponential backoff until
/// the portal's connect timeout runs out.
#[derive(Debug)]
pub struct TcpTransport {
    read_timeout: Option<Duration>,
    log: Logger,
}

impl TcpTransport {
    pub fn new(log: Option<Logger>) -> Self {
        TcpTransport {
            read_timeout: None,
            log: log.unwrap_or_else(|| {
                Logger::root(slog_stdlog::StdLog.fuse(), o!())
            }),
        }
    }

    /// Fail reads that wait longer than `timeout`. A command sees the
    /// failure as a `timeout` status.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    fn open(
        &self,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> io::Result<TcpStream> {
        let mut last = io::Error::from(io::ErrorKind::AddrNotAvailable);
        for addr in addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new(None)
    }
}

impl Transport for TcpTransport {
    fn connect(
        &self,
        stream: &NetStream,
        _ctx: &ConnectContext,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> OpStatus {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                warn!(self.log, "unable to resolve {}:{}: {}", host, port, e);
                return OpStatus::INVALID_HOST;
            }
        };

        let mut backoff = ExponentialBackoff {
            max_elapsed_time: Some(timeout),
            ..ExponentialBackoff::default()
        };
        let mut op = || {
            debug!(self.log, "attempting to connect with retry...";
                "host" => host, "port" => port);
            self.open(&addrs, timeout).map_err(|e| {
                error!(self.log, "Retrying connection : {}", e);
                backoff::Error::Transient(e)
            })
        };

        let tcp = match op.retry(&mut backoff) {
            Ok(tcp) => tcp,
            Err(_) => return OpStatus::CANT_CONNECT,
        };

        let halves = tcp
            .set_read_timeout(self.read_timeout)
            .and_then(|_| tcp.set_nodelay(true))
            .and_then(|_| Ok((tcp.try_clone()?, tcp.try_clone()?)));
        match halves {
            Ok((reader, control)) => {
                stream.attach(reader, tcp);
                // Wakes a send thread stuck writing to a peer that stopped
                // reading, so close never waits on it
                stream.on_close(move || {
                    let _ = control.shutdown(Shutdown::Both);
                });
                OpStatus::SUCCESS
            }
            Err(e) => {
                error!(self.log, "unable to set up connection: {}", e);
                OpStatus::CANT_CONNECT
            }
        }
    }
}

/// The shared slot a [`LineCommand`](struct.LineCommand.html) stores its
/// reply in
pub type Reply = Arc<Mutex<Option<String>>>;

/// Writes one line and reads one line back
#[derive(Debug)]
pub struct LineCommand {
    request: String,
    reply: Reply,
}

impl LineCommand {
    pub fn new<S: Into<String>>(request: S) -> Self {
        LineCommand {
            request: request.into(),
            reply: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reply(&self) -> Reply {
        self.reply.clone()
    }
}

impl Command for LineCommand {
    fn send_phase(&self, _op: &Gop, ns: &NetStream) -> OpStatus {
        let mut line = self.request.clone();
        line.push('\n');
        match ns.write_all(line.as_bytes()) {
            Ok(()) => OpStatus::SUCCESS,
            Err(_) => OpStatus::DEAD,
        }
    }

    fn recv_phase(&self, _op: &Gop, ns: &NetStream) -> OpStatus {
        match ns.read_line() {
            Ok(line) => {
                *self.reply.lock().unwrap() = Some(line);
                OpStatus::SUCCESS
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                OpStatus::TIMEOUT
            }
            Err(_) => OpStatus::DEAD,
        }
    }
}
