// Copyright 2020 Joyent, Inc.

//! Command descriptors.
//!
//! A [`CommandOp`](struct.CommandOp.html) is attached to every operation that
//! is executed by a portal. It names the destination, carries the scheduling
//! metadata (workload, timeout, retry policy) and holds the protocol hooks
//! implementing the [`Command`](trait.Command.html) trait.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::gop::Gop;
use crate::netstream::NetStream;
use crate::status::OpStatus;

/// Opaque, transport-specific data needed to open a connection (credentials,
/// socket options, etc.).
pub type ConnectContext = Option<Arc<dyn Any + Send + Sync>>;

// Default timeout for a single command
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
// Default pause after a dead connection before the command is retried
const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(1);

/// The protocol hooks of a command. Every hook has a default implementation
/// so a command only implements the phases it needs.
///
/// The send hooks run on a connection's send thread and the receive hook on
/// its receive thread. `on_submit` and `before_exec` run with the host
/// portal's lock held and receive the portal's pending queue so they can
/// coalesce neighbouring tasks into `op` with
/// [`CommandOp::coalesce`](struct.CommandOp.html#method.coalesce).
pub trait Command: Send + Sync + 'static {
    fn send_command(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
        OpStatus::SUCCESS
    }

    fn send_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
        OpStatus::SUCCESS
    }

    fn recv_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
        OpStatus::SUCCESS
    }

    fn on_submit(&self, _op: &Gop, _queue: &mut TaskQueue) {}

    fn before_exec(&self, _op: &Gop, _queue: &mut TaskQueue) {}

    /// Release any command-specific resources when the operation is
    /// destroyed.
    fn destroy(&self, _op: &Gop) {}
}

#[derive(Debug, Default)]
struct ExecTimes {
    start: Option<Instant>,
    deadline: Option<Instant>,
    end: Option<Instant>,
}

/// A command descriptor.
pub struct CommandOp {
    hostport: String,
    connect_context: ConnectContext,
    workload: i64,
    sort_size: Option<i64>,
    timeout: Duration,
    retry_wait: Duration,
    retry_count: AtomicI32,
    retry_count_set: bool,
    on_top: AtomicBool,
    times: Mutex<ExecTimes>,
    coalesced: Mutex<Vec<Gop>>,
    handler: Box<dyn Command>,
}

impl CommandOp {
    /// Create a descriptor for `hostport`, a `host:port` destination key
    /// optionally followed by further transport-specific qualifiers.
    pub fn new<C>(hostport: &str, handler: C) -> Self
    where
        C: Command,
    {
        CommandOp {
            hostport: hostport.to_string(),
            connect_context: None,
            workload: 1,
            sort_size: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            retry_wait: DEFAULT_RETRY_WAIT,
            retry_count: AtomicI32::new(0),
            retry_count_set: false,
            on_top: AtomicBool::new(false),
            times: Mutex::new(ExecTimes::default()),
            coalesced: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    pub fn workload(mut self, workload: i64) -> Self {
        self.workload = workload;
        self
    }

    /// The size used to order tasks bound for the same host when a queue is
    /// sorted. Defaults to the workload.
    pub fn sort_size(mut self, size: i64) -> Self {
        self.sort_size = Some(size);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    /// The number of times the command may be redelivered after a dead
    /// connection or a timeout. If not set the portal context's `max_retry`
    /// is used.
    pub fn retry_count(mut self, count: i32) -> Self {
        self.retry_count = AtomicI32::new(count);
        self.retry_count_set = true;
        self
    }

    pub fn connect_context(mut self, ctx: ConnectContext) -> Self {
        self.connect_context = ctx;
        self
    }

    pub(crate) fn default_retry_count(&mut self, count: i32) {
        if !self.retry_count_set {
            self.retry_count = AtomicI32::new(count);
            self.retry_count_set = true;
        }
    }

    pub fn hostport(&self) -> &str {
        &self.hostport
    }

    pub fn get_connect_context(&self) -> &ConnectContext {
        &self.connect_context
    }

    pub fn get_workload(&self) -> i64 {
        self.workload
    }

    pub fn get_sort_size(&self) -> i64 {
        self.sort_size.unwrap_or(self.workload)
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get_retry_wait(&self) -> Duration {
        self.retry_wait
    }

    pub fn get_retry_count(&self) -> i32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub(crate) fn decrement_retry_count(&self) -> i32 {
        self.retry_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn handler(&self) -> &dyn Command {
        self.handler.as_ref()
    }

    /// Attach `sibling` to this command's round trip. The sibling is
    /// completed with this command's status and is never submitted to the
    /// transport on its own.
    pub fn coalesce(&self, sibling: Gop) {
        self.coalesced.lock().unwrap().push(sibling);
    }

    pub fn coalesced_count(&self) -> usize {
        self.coalesced.lock().unwrap().len()
    }

    pub(crate) fn take_coalesced(&self) -> Vec<Gop> {
        let mut coalesced = self.coalesced.lock().unwrap();
        coalesced.drain(..).collect()
    }

    /// Whether this command is the oldest outstanding task on its
    /// connection, i.e. whether its timeout clock is armed.
    pub fn is_on_top(&self) -> bool {
        self.on_top.load(Ordering::SeqCst)
    }

    pub(crate) fn set_on_top(&self) {
        self.on_top.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_on_top(&self) {
        self.on_top.store(false, Ordering::SeqCst);
    }

    /// Arm the timeout clock unless another thread already did. Returns true
    /// if this call armed it.
    pub(crate) fn arm_clock(&self) -> bool {
        if !self.on_top.swap(true, Ordering::SeqCst) {
            self.start_clock();
            true
        } else {
            false
        }
    }

    pub(crate) fn start_clock(&self) {
        let now = Instant::now();
        let mut times = self.times.lock().unwrap();
        times.start = Some(now);
        times.deadline = Some(now + self.timeout);
        times.end = None;
    }

    pub(crate) fn stop_clock(&self) {
        self.times.lock().unwrap().end = Some(Instant::now());
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.times.lock().unwrap().start
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.times.lock().unwrap().end
    }

    /// The instant after which the receive phase should report a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.times.lock().unwrap().deadline
    }

    pub fn exec_time(&self) -> Option<Duration> {
        let times = self.times.lock().unwrap();
        match (times.start, times.end) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}

impl fmt::Debug for CommandOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandOp")
            .field("hostport", &self.hostport)
            .field("workload", &self.workload)
            .field("timeout", &self.timeout)
            .field("retry_wait", &self.retry_wait)
            .field("retry_count", &self.get_retry_count())
            .field("on_top", &self.is_on_top())
            .field("coalesced", &self.coalesced_count())
            .finish()
    }
}

/// Split a destination key into its host and port. Anything after the port
/// digits is a transport-specific qualifier and is ignored here.
pub fn split_hostport(hostport: &str) -> (String, u16) {
    match hostport.find(':') {
        Some(idx) => {
            let host = hostport[..idx].to_string();
            let digits: String = hostport[idx + 1..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            (host, digits.parse().unwrap_or(0))
        }
        None => (hostport.to_string(), 0),
    }
}

fn op_workload(op: &Gop) -> i64 {
    op.command().map_or(0, CommandOp::get_workload)
}

/// A host portal's pending tasks together with their total workload.
///
/// The front of the queue is the next task to execute. Every mutation keeps
/// the workload total in step with the tasks held.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Gop>,
    workload: i64,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn workload(&self) -> i64 {
        self.workload
    }

    pub fn get(&self, index: usize) -> Option<&Gop> {
        self.tasks.get(index)
    }

    pub fn front(&self) -> Option<&Gop> {
        self.tasks.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gop> {
        self.tasks.iter()
    }

    pub fn position(&self, op: &Gop) -> Option<usize> {
        self.tasks.iter().position(|t| Gop::ptr_eq(t, op))
    }

    pub fn push_front(&mut self, op: Gop) {
        self.workload += op_workload(&op);
        self.tasks.push_front(op);
    }

    pub fn push_back(&mut self, op: Gop) {
        self.workload += op_workload(&op);
        self.tasks.push_back(op);
    }

    pub fn pop_front(&mut self) -> Option<Gop> {
        let op = self.tasks.pop_front()?;
        self.workload -= op_workload(&op);
        Some(op)
    }

    pub fn remove(&mut self, index: usize) -> Option<Gop> {
        let op = self.tasks.remove(index)?;
        self.workload -= op_workload(&op);
        Some(op)
    }

    /// Remove `op` wherever it is in the queue.
    pub fn remove_op(&mut self, op: &Gop) -> bool {
        match self.position(op) {
            Some(idx) => self.remove(idx).is_some(),
            None => false,
        }
    }

    pub fn drain(&mut self) -> Vec<Gop> {
        self.workload = 0;
        self.tasks.drain(..).collect()
    }
}
