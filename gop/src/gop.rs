// Copyright 2020 Joyent, Inc.

//! Operations and queues.
//!
//! A [`Gop`](struct.Gop.html) is either a single operation, executed by an
//! [`Executor`](trait.Executor.html), or a queue aggregating child operations
//! and queues. Both expose the same wait, status and callback API.
//!
//! Every operation borrows its mutex and condition variable from the
//! system's control block pool. A child is linked to its queue through a weak
//! back-reference stored in the child's callback chain, so the queue owns its
//! children while a child never keeps its queue alive.
//!
//! Locks are always taken child first, then parent. Children discovered while
//! a queue lock is held (a queue being started, a retry requested by the
//! failure callback) are submitted only after every lock is released.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, MutexGuard, Weak};
use std::time::{Duration, Instant};

use derive_more::{Display, From, Into};
use slog::{debug, trace, Logger};

use crate::command::CommandOp;
use crate::control::{ControlBlock, ControlHandle};
use crate::error::Error;
use crate::status::OpStatus;

/// The number of times a queue's failure callback may request a retry unless
/// changed with [`Gop::set_retry_limit`](struct.Gop.html#method.set_retry_limit).
pub const DEFAULT_RETRY_LIMIT: u32 = 1;

/// A globally unique operation identifier
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct GopId(u64);

/// How an operation reaches a connection: through its destination's shared
/// queue or through a dedicated connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecMode {
    Queued,
    Direct,
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Queued
    }
}

/// Whether freeing an operation also runs its command's destroy hook.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreeMode {
    Destroy,
    Finalize,
}

/// Something that runs single operations: a portal context or the local
/// executor.
pub trait Executor: Send + Sync {
    /// Start executing `op`. The executor must eventually complete it with
    /// [`Gop::mark_completed`](struct.Gop.html#method.mark_completed).
    fn submit(&self, op: Gop);

    /// Whether `sync_exec` runs the operation on the calling thread.
    fn supports_sync_exec(&self) -> bool {
        false
    }

    fn sync_exec(&self, op: &Gop) {
        self.submit(op.clone())
    }
}

type UserCallback = Box<dyn FnMut(&OpStatus) + Send>;

/// A queue's failure callback
pub type FailureCallback = Box<dyn FnMut(&mut FailureContext) + Send>;

enum Callback {
    User(UserCallback),
    Parent(Weak<GopInner>),
}

/// The view a failure callback gets of its queue when the last child
/// reported and at least one child failed.
pub struct FailureContext<'a> {
    failed: &'a [Gop],
    retry: Vec<Gop>,
}

impl<'a> FailureContext<'a> {
    /// The failed children, most recent last
    pub fn failed(&self) -> &'a [Gop] {
        self.failed
    }

    /// Request a retry pass and add `op` to the queue for it. The queue
    /// continues instead of completing if at least one operation was added.
    pub fn resubmit(&mut self, op: Gop) {
        self.retry.push(op);
    }
}

/// Task counts for a queue
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueueCounts {
    pub submitted: usize,
    pub left: usize,
    /// Children that have reported, over the whole life of the queue
    pub completed: usize,
    /// Finished children not yet handed out by `wait_any`/`next_finished`
    pub finished: usize,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    list: Vec<Gop>,
    finished: VecDeque<Gop>,
    failed: Vec<Gop>,
    left: usize,
    submitted: usize,
    completed: usize,
    finished_submission: bool,
    failure_cb: Option<FailureCallback>,
    retries: u32,
    retry_limit: u32,
    last_failure: Option<OpStatus>,
}

#[doc(hidden)]
#[derive(Default)]
pub struct GopState {
    user_id: i64,
    status: OpStatus,
    completed: bool,
    started: bool,
    auto_destroy: bool,
    handed_out: bool,
    freed: bool,
    mode: ExecMode,
    callbacks: Vec<Callback>,
    queue: Option<QueueState>,
}

impl GopState {
    fn is_done(&self) -> bool {
        match &self.queue {
            Some(q) => q.left == 0,
            None => self.completed,
        }
    }

    fn aggregate_status(&self) -> OpStatus {
        if self.completed {
            return self.status;
        }
        match &self.queue {
            Some(q) if !q.failed.is_empty() => {
                q.last_failure.unwrap_or(OpStatus::FAILURE)
            }
            Some(q) if q.left == 0 => OpStatus::SUCCESS,
            _ => self.status,
        }
    }
}

// Work found while locks were held, run once every lock is released
enum Deferred {
    Attach { queue: Gop, child: Gop },
    Destroy(Gop),
}

pub(crate) struct GopInner {
    id: GopId,
    is_queue: bool,
    control: ControlHandle<GopState>,
    executor: Option<Arc<dyn Executor>>,
    cmd: Option<CommandOp>,
    log: Logger,
}

/// A handle to an operation or a queue. Clones refer to the same operation.
#[derive(Clone)]
pub struct Gop(Arc<GopInner>);

impl Gop {
    pub(crate) fn new_op(
        id: GopId,
        control: ControlHandle<GopState>,
        executor: Arc<dyn Executor>,
        cmd: Option<CommandOp>,
        log: Logger,
    ) -> Self {
        Gop(Arc::new(GopInner {
            id,
            is_queue: false,
            control,
            executor: Some(executor),
            cmd,
            log,
        }))
    }

    pub(crate) fn new_queue(
        id: GopId,
        control: ControlHandle<GopState>,
        log: Logger,
    ) -> Self {
        control.block().lock().queue = Some(QueueState {
            retry_limit: DEFAULT_RETRY_LIMIT,
            ..QueueState::default()
        });
        Gop(Arc::new(GopInner {
            id,
            is_queue: true,
            control,
            executor: None,
            cmd: None,
            log,
        }))
    }

    pub fn ptr_eq(a: &Gop, b: &Gop) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn id(&self) -> GopId {
        self.0.id
    }

    pub fn is_queue(&self) -> bool {
        self.0.is_queue
    }

    /// The command descriptor of a single operation
    pub fn command(&self) -> Option<&CommandOp> {
        self.0.cmd.as_ref()
    }

    fn block(&self) -> &ControlBlock<GopState> {
        self.0.control.block()
    }

    fn lock(&self) -> MutexGuard<GopState> {
        self.block().lock()
    }

    pub fn user_id(&self) -> i64 {
        self.lock().user_id
    }

    pub fn set_user_id(&self, user_id: i64) {
        self.lock().user_id = user_id;
    }

    pub fn exec_mode(&self) -> ExecMode {
        self.lock().mode
    }

    pub fn set_exec_mode(&self, mode: ExecMode) {
        self.lock().mode = mode;
    }

    pub fn is_direct(&self) -> bool {
        self.exec_mode() == ExecMode::Direct
    }

    //
    // Execution
    //

    /// Start executing the operation. A single operation is handed to its
    /// executor and a queue starts each of its unstarted children. Calling
    /// this on an operation that has already started does nothing.
    pub fn start_execution(&self) {
        if self.is_queue() {
            let children = {
                let mut state = self.lock();
                if state.started {
                    return;
                }
                state.started = true;
                match state.queue.as_mut() {
                    Some(q) => mem::take(&mut q.list),
                    None => Vec::new(),
                }
            };
            trace!(self.0.log, "starting queue";
                "id" => %self.id(), "children" => children.len());
            for child in children {
                child.start_execution();
            }
        } else {
            {
                let mut state = self.lock();
                if state.started {
                    return;
                }
                state.started = true;
            }
            match &self.0.executor {
                Some(executor) => executor.submit(self.clone()),
                None => self.mark_completed(OpStatus::ERROR),
            }
        }
    }

    /// Same as [`start_execution`](#method.start_execution)
    pub fn submit(&self) {
        self.start_execution()
    }

    /// Complete the operation with `status`. Coalesced siblings are completed
    /// first with the same status. The status is stored, the callbacks run
    /// and waiters are woken under a single acquisition of the operation's
    /// lock. Completing an operation a second time has no effect.
    pub fn mark_completed(&self, status: OpStatus) {
        let mut deferred = Vec::new();
        if let Some(cmd) = self.command() {
            for sibling in cmd.take_coalesced() {
                sibling.complete_locked(status, &mut deferred);
            }
        }
        self.complete_locked(status, &mut deferred);
        run_deferred(deferred);
    }

    fn complete_locked(&self, status: OpStatus, deferred: &mut Vec<Deferred>) {
        let block = self.block();
        let mut state = block.lock();
        if state.completed {
            debug!(self.0.log, "ignoring second completion";
                "id" => %self.id(), "status" => %status);
            return;
        }
        trace!(self.0.log, "operation completed";
            "id" => %self.id(), "status" => %status);
        state.status = status;
        self.run_callbacks(&mut state, status, deferred);
        state.completed = true;
        block.broadcast();
        if state.auto_destroy {
            deferred.push(Deferred::Destroy(self.clone()));
        }
    }

    fn run_callbacks(
        &self,
        state: &mut GopState,
        status: OpStatus,
        deferred: &mut Vec<Deferred>,
    ) {
        for cb in state.callbacks.iter_mut() {
            match cb {
                Callback::User(f) => f(&status),
                Callback::Parent(parent) => {
                    if let Some(parent) = parent.upgrade() {
                        Gop(parent).child_finished(self, status, deferred);
                    }
                }
            }
        }
    }

    // Called with the child's lock held
    fn child_finished(
        &self,
        child: &Gop,
        status: OpStatus,
        deferred: &mut Vec<Deferred>,
    ) {
        let block = self.block();
        let mut guard = block.lock();
        let state = &mut *guard;
        let q = match state.queue.as_mut() {
            Some(q) => q,
            None => return,
        };

        q.finished.push_back(child.clone());
        if !status.is_success() {
            q.failed.push(child.clone());
            q.last_failure = Some(status);
        }
        q.left = q.left.saturating_sub(1);
        q.completed += 1;

        if q.left > 0 {
            block.broadcast();
            return;
        }

        if q.failed.is_empty() {
            self.finish_queue(state, OpStatus::SUCCESS, deferred);
            return;
        }

        if q.retries < q.retry_limit {
            if let Some(mut failure_cb) = q.failure_cb.take() {
                q.retries += 1;
                let mut ctx = FailureContext {
                    failed: &q.failed,
                    retry: Vec::new(),
                };
                failure_cb(&mut ctx);
                let retry = ctx.retry;
                q.failure_cb = Some(failure_cb);

                if !retry.is_empty() {
                    debug!(self.0.log, "queue retrying failed tasks";
                        "id" => %self.id(),
                        "failed" => q.failed.len(),
                        "retry" => retry.len(),
                        "pass" => q.retries);
                    q.failed.clear();
                    q.last_failure = None;
                    q.submitted += retry.len();
                    q.left += retry.len();
                    for op in retry {
                        deferred.push(Deferred::Attach {
                            queue: self.clone(),
                            child: op,
                        });
                    }
                    return;
                }
            }
        }

        let failure = q.last_failure.unwrap_or(OpStatus::FAILURE);
        self.finish_queue(state, failure, deferred);
    }

    fn finish_queue(
        &self,
        state: &mut GopState,
        status: OpStatus,
        deferred: &mut Vec<Deferred>,
    ) {
        if state.completed {
            return;
        }
        trace!(self.0.log, "queue completed";
            "id" => %self.id(), "status" => %status);
        state.status = status;
        self.run_callbacks(state, status, deferred);
        state.completed = true;
        self.block().broadcast();
        if state.auto_destroy {
            deferred.push(Deferred::Destroy(self.clone()));
        }
    }

    // Called with the queue's lock held. Parents that already counted this
    // queue as finished wait for it again.
    fn reopen_locked(&self, state: &mut GopState) {
        trace!(self.0.log, "queue reopened"; "id" => %self.id());
        state.completed = false;
        state.status = OpStatus::default();
        for cb in state.callbacks.iter() {
            if let Callback::Parent(parent) = cb {
                if let Some(parent) = parent.upgrade() {
                    Gop(parent).child_reopened();
                }
            }
        }
    }

    fn child_reopened(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(q) = state.queue.as_mut() {
            q.left += 1;
            q.completed = q.completed.saturating_sub(1);
        }
        if state.completed {
            self.reopen_locked(state);
        }
    }

    //
    // Callbacks
    //

    /// Add a callback run with the final status when the operation
    /// completes. If it already has, the callback runs immediately.
    ///
    /// Callbacks run with the operation's lock held and must not call back
    /// into the same operation.
    pub fn append_callback<F>(&self, f: F)
    where
        F: FnMut(&OpStatus) + Send + 'static,
    {
        let mut f = f;
        let mut state = self.lock();
        if state.completed {
            let status = state.status;
            f(&status);
        } else {
            state.callbacks.push(Callback::User(Box::new(f)));
        }
    }

    /// Replace every callback added with `append_callback` with `f`.
    pub fn set_callback<F>(&self, f: F)
    where
        F: FnMut(&OpStatus) + Send + 'static,
    {
        let old = {
            let mut state = self.lock();
            let (parents, users): (Vec<_>, Vec<_>) = mem::take(&mut state.callbacks)
                .into_iter()
                .partition(|cb| matches!(cb, Callback::Parent(_)));
            state.callbacks = parents;
            users
        };
        drop(old);
        self.append_callback(f);
    }

    //
    // Queues
    //

    /// Add `child` to this queue. If the queue has already started the child
    /// is started as well. May be called from inside another operation's
    /// callback.
    ///
    /// Adding to a queue that completed because nothing was left reopens it:
    /// the queue completes again, and runs its callbacks again, once the new
    /// children have finished. A queue freed with [`free`](#method.free)
    /// rejects new children.
    pub fn add(&self, child: &Gop) -> Result<(), Error> {
        let started = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.freed {
                return Err(Error::QueueFreed);
            }
            let q = state.queue.as_mut().ok_or(Error::NotAQueue)?;
            q.submitted += 1;
            q.left += 1;
            if !state.started {
                q.list.push(child.clone());
            }
            if state.completed {
                self.reopen_locked(state);
            }
            state.started
        };

        let mut deferred = Vec::new();
        attach_parent(child, self, &mut deferred);
        if started {
            child.start_execution();
        }
        run_deferred(deferred);
        Ok(())
    }

    pub fn set_failure_callback<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnMut(&mut FailureContext) + Send + 'static,
    {
        let mut state = self.lock();
        let q = state.queue.as_mut().ok_or(Error::NotAQueue)?;
        q.failure_cb = Some(Box::new(f));
        Ok(())
    }

    pub fn set_retry_limit(&self, limit: u32) -> Result<(), Error> {
        let mut state = self.lock();
        let q = state.queue.as_mut().ok_or(Error::NotAQueue)?;
        q.retry_limit = limit;
        Ok(())
    }

    /// Note that no more children will be added. Waiters are woken if nothing
    /// is left to run.
    pub fn finished_submission(&self) -> Result<(), Error> {
        let mut state = self.lock();
        let q = state.queue.as_mut().ok_or(Error::NotAQueue)?;
        q.finished_submission = true;
        if q.left == 0 {
            self.block().broadcast();
        }
        Ok(())
    }

    pub fn is_submission_finished(&self) -> bool {
        match &self.lock().queue {
            Some(q) => q.finished_submission,
            None => true,
        }
    }

    /// Reorder the queue's unstarted children.
    pub fn sort_tasks_by<F>(&self, mut compare: F) -> Result<(), Error>
    where
        F: FnMut(&Gop, &Gop) -> Ordering,
    {
        let mut state = self.lock();
        let q = state.queue.as_mut().ok_or(Error::NotAQueue)?;
        q.list.sort_by(|a, b| compare(a, b));
        Ok(())
    }

    //
    // Waiting
    //

    /// Start the operation and block until it completes, or for a queue until
    /// no children are left. Returns success, or the last failure status
    /// seen.
    pub fn wait_all(&self) -> OpStatus {
        self.start_execution();
        self.wait_done(None).unwrap_or(OpStatus::RETRY)
    }

    /// As `wait_all` but gives up after `secs` seconds, returning `retry`
    /// and leaving the operation outstanding.
    pub fn wait_all_timeout(&self, secs: u64) -> OpStatus {
        self.start_execution();
        self.wait_done(Some(Duration::from_secs(secs)))
            .unwrap_or(OpStatus::RETRY)
    }

    /// Block until the operation completes without starting it.
    pub fn wait(&self) -> OpStatus {
        self.wait_done(None).unwrap_or(OpStatus::RETRY)
    }

    fn wait_done(&self, timeout: Option<Duration>) -> Option<OpStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let block = self.block();
        let mut state = block.lock();
        loop {
            if state.is_done() {
                return Some(state.aggregate_status());
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return None;
                    }
                    Some(d - now)
                }
                None => None,
            };
            state = block.condvar_wait(state, remaining).0;
        }
    }

    /// Start the operation and block until a child finishes, returning it.
    /// Each finished child is returned once. Returns `None` once nothing is
    /// left. A single operation returns itself once it completes, the first
    /// time only.
    pub fn wait_any(&self) -> Option<Gop> {
        self.start_execution();
        self.wait_next(None)
    }

    pub fn wait_any_timeout(&self, secs: u64) -> Option<Gop> {
        self.start_execution();
        self.wait_next(Some(Duration::from_secs(secs)))
    }

    fn wait_next(&self, timeout: Option<Duration>) -> Option<Gop> {
        if !self.is_queue() {
            self.wait_done(timeout)?;
            return self.hand_out_self(|_| true);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let block = self.block();
        let mut state = block.lock();
        loop {
            match state.queue.as_mut() {
                Some(q) => {
                    if let Some(child) = q.finished.pop_front() {
                        return Some(child);
                    }
                    if q.left == 0 {
                        return None;
                    }
                }
                None => return None,
            }
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return None;
                    }
                    Some(d - now)
                }
                None => None,
            };
            state = block.condvar_wait(state, remaining).0;
        }
    }

    fn hand_out_self<F>(&self, accept: F) -> Option<Gop>
    where
        F: FnOnce(&GopState) -> bool,
    {
        let mut state = self.lock();
        if state.handed_out || !state.completed || !accept(&state) {
            return None;
        }
        state.handed_out = true;
        Some(self.clone())
    }

    /// Pop the oldest finished child without blocking.
    pub fn next_finished(&self) -> Option<Gop> {
        if !self.is_queue() {
            return self.hand_out_self(|_| true);
        }
        self.lock()
            .queue
            .as_mut()
            .and_then(|q| q.finished.pop_front())
    }

    /// Pop the most recently failed child without blocking.
    pub fn next_failed(&self) -> Option<Gop> {
        if !self.is_queue() {
            return self.hand_out_self(|s| !s.status.is_success());
        }
        self.lock().queue.as_mut().and_then(|q| q.failed.pop())
    }

    /// Whether `wait_any` would block
    pub fn will_block(&self) -> bool {
        let state = self.lock();
        match &state.queue {
            Some(q) => q.finished.is_empty() && q.left > 0,
            None => !state.completed,
        }
    }

    //
    // Status and counts
    //

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn status(&self) -> OpStatus {
        self.lock().aggregate_status()
    }

    pub fn completed_successfully(&self) -> bool {
        self.status().is_success()
    }

    pub fn counts(&self) -> QueueCounts {
        let state = self.lock();
        match &state.queue {
            Some(q) => QueueCounts {
                submitted: q.submitted,
                left: q.left,
                completed: q.completed,
                finished: q.finished.len(),
                failed: q.failed.len(),
            },
            None => {
                let done = state.completed as usize;
                QueueCounts {
                    submitted: 1,
                    left: 1 - done,
                    completed: done,
                    finished: done,
                    failed: (state.completed && !state.status.is_success())
                        as usize,
                }
            }
        }
    }

    pub fn tasks_submitted(&self) -> usize {
        self.counts().submitted
    }

    pub fn tasks_left(&self) -> usize {
        self.counts().left
    }

    pub fn tasks_finished(&self) -> usize {
        self.counts().finished
    }

    pub fn tasks_failed(&self) -> usize {
        self.counts().failed
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.command().and_then(CommandOp::start_time)
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.command().and_then(CommandOp::end_time)
    }

    pub fn exec_time(&self) -> Option<Duration> {
        self.command().and_then(CommandOp::exec_time)
    }

    //
    // Resource release
    //

    /// Destroy the operation as soon as it completes, or now if it already
    /// has.
    pub fn set_auto_destroy(&self, auto_destroy: bool) {
        let completed = {
            let mut state = self.lock();
            state.auto_destroy = auto_destroy;
            state.completed
        };
        if auto_destroy && completed {
            self.release(FreeMode::Destroy);
        }
    }

    /// Release the operation's resources. A queue frees its unstarted and
    /// finished children with the same mode.
    pub fn free(self, mode: FreeMode) {
        self.release(mode);
    }

    fn release(&self, mode: FreeMode) {
        let (children, callbacks, failure_cb) = {
            let mut state = self.lock();
            if state.freed {
                return;
            }
            state.freed = true;
            let callbacks = mem::take(&mut state.callbacks);
            let mut children = Vec::new();
            let mut failure_cb = None;
            if let Some(q) = state.queue.as_mut() {
                children.extend(q.list.drain(..));
                children.extend(q.finished.drain(..));
                q.failed.clear();
                failure_cb = q.failure_cb.take();
            }
            (children, callbacks, failure_cb)
        };
        drop(callbacks);
        drop(failure_cb);

        for child in children {
            child.release(mode);
        }

        if mode == FreeMode::Destroy {
            if let Some(cmd) = self.command() {
                cmd.handler().destroy(self);
            }
        }
        trace!(self.0.log, "operation freed"; "id" => %self.id());
    }

    /// Submit the operation, wait for it and free it. Operations whose
    /// executor can run them inline are executed on the calling thread.
    pub fn sync_exec_status(self) -> OpStatus {
        let inline = match &self.0.executor {
            Some(e) if e.supports_sync_exec() => {
                let mut state = self.lock();
                let first = !state.started;
                state.started = true;
                first
            }
            _ => false,
        };

        let status = match (&self.0.executor, inline) {
            (Some(executor), true) => {
                executor.sync_exec(&self);
                self.wait()
            }
            _ => self.wait_all(),
        };
        self.free(FreeMode::Destroy);
        status
    }

    pub fn sync_exec(self) -> bool {
        self.sync_exec_status().is_success()
    }
}

impl fmt::Debug for Gop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Gop")
            .field("id", &self.0.id)
            .field("queue", &self.0.is_queue)
            .field("command", &self.0.cmd)
            .finish()
    }
}

fn attach_parent(child: &Gop, queue: &Gop, deferred: &mut Vec<Deferred>) {
    let mut state = child.lock();
    if state.completed {
        let status = state.status;
        queue.child_finished(child, status, deferred);
    } else {
        state
            .callbacks
            .push(Callback::Parent(Arc::downgrade(&queue.0)));
    }
}

fn run_deferred(mut deferred: Vec<Deferred>) {
    while let Some(work) = deferred.pop() {
        match work {
            Deferred::Attach { queue, child } => {
                let mut more = Vec::new();
                attach_parent(&child, &queue, &mut more);
                child.start_execution();
                deferred.extend(more);
            }
            Deferred::Destroy(op) => op.release(FreeMode::Destroy),
        }
    }
}

fn default_order(a: &Gop, b: &Gop) -> Ordering {
    match (a.command(), b.command()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(ca), Some(cb)) => ca
            .hostport()
            .cmp(cb.hostport())
            .then_with(|| cb.get_sort_size().cmp(&ca.get_sort_size())),
    }
}

/// Reorder a queue's unstarted children: sub-queues first, then operations
/// grouped by destination with the largest first.
pub fn default_sort_tasks(queue: &Gop) -> Result<(), Error> {
    queue.sort_tasks_by(default_order)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;
    use std::thread;

    use quickcheck::quickcheck;

    use crate::local::Immediate;
    use crate::status::StatusKind;
    use crate::system::{GopSystem, SystemOptions};

    // An executor that parks submitted operations until the test completes
    // them by hand.
    struct Parked(mpsc::Sender<Gop>);

    impl Executor for Parked {
        fn submit(&self, op: Gop) {
            let _ = self.0.send(op);
        }
    }

    fn parked() -> (Arc<dyn Executor>, mpsc::Receiver<Gop>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Parked(tx)), rx)
    }

    #[test]
    fn second_completion_is_ignored() {
        let sys = GopSystem::new(SystemOptions::default());
        let (exec, _rx) = parked();
        let op = sys.new_op(exec, None);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        op.append_callback(move |_| {
            calls_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });

        op.mark_completed(OpStatus::SUCCESS);
        op.mark_completed(OpStatus::FAILURE);

        assert!(op.is_completed());
        assert_eq!(op.status(), OpStatus::SUCCESS);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn submit_is_idempotent() {
        let sys = GopSystem::new(SystemOptions::default());
        let (exec, rx) = parked();
        let op = sys.new_op(exec, None);
        op.start_execution();
        op.submit();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn coalesced_siblings_share_status() {
        let sys = GopSystem::new(SystemOptions::default());
        let (exec, rx) = parked();
        let primary = sys.new_op(
            exec.clone(),
            Some(crate::command::CommandOp::new(
                "h:1",
                Immediate(OpStatus::SUCCESS),
            )),
        );
        let a = sys.new_op(exec.clone(), None);
        let b = sys.new_op(exec, None);
        if let Some(cmd) = primary.command() {
            cmd.coalesce(a.clone());
            cmd.coalesce(b.clone());
        }

        primary.mark_completed(OpStatus::SUCCESS);
        for op in &[&primary, &a, &b] {
            assert!(op.is_completed());
            assert_eq!(op.status(), OpStatus::SUCCESS);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn queue_reports_last_failure() {
        let sys = GopSystem::new(SystemOptions::default());
        let q = sys.new_queue();
        q.add(&sys.dummy(OpStatus::SUCCESS)).unwrap();
        q.add(&sys.dummy(OpStatus::new(StatusKind::Timeout))).unwrap();
        let status = q.wait_all();
        assert_eq!(status.kind, StatusKind::Timeout);
        assert_eq!(q.tasks_failed(), 1);
        assert_eq!(q.tasks_left(), 0);
    }

    #[test]
    fn add_reopens_a_drained_queue() {
        let sys = GopSystem::new(SystemOptions::default());
        let q = sys.new_queue();
        let first = sys.dummy(OpStatus::SUCCESS);
        q.add(&first).unwrap();
        let done = q.wait_any().unwrap();
        assert!(Gop::ptr_eq(&done, &first));
        assert_eq!(q.tasks_left(), 0);

        // Sliding window: keep feeding the queue as children finish
        for _ in 0..3 {
            let next = sys.dummy(OpStatus::SUCCESS);
            q.add(&next).unwrap();
            let done = q.wait_any().unwrap();
            assert!(Gop::ptr_eq(&done, &next));
        }
        assert!(q.wait_any().is_none());
        assert_eq!(q.wait_all(), OpStatus::SUCCESS);
        assert_eq!(q.tasks_submitted(), 4);

        q.add(&sys.dummy(OpStatus::FAILURE)).unwrap();
        assert_eq!(q.wait_all(), OpStatus::FAILURE);
        assert!(q.is_completed());
    }

    #[test]
    fn completed_child_does_not_close_the_queue() {
        let sys = GopSystem::new(SystemOptions::default());
        let done = sys.dummy(OpStatus::SUCCESS);
        assert_eq!(done.wait_all(), OpStatus::SUCCESS);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let q = sys.new_queue();
        q.append_callback(move |_| {
            calls_clone.fetch_add(1, AtomicOrdering::SeqCst);
        });
        q.add(&done).unwrap();
        assert!(q.is_completed());
        q.add(&sys.dummy(OpStatus::SUCCESS)).unwrap();
        assert!(!q.is_completed());

        assert_eq!(q.wait_all(), OpStatus::SUCCESS);
        assert_eq!(q.tasks_finished(), 2);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn reopened_child_queue_holds_its_parent() {
        let sys = GopSystem::new(SystemOptions::default());
        let outer = sys.new_queue();
        let inner = sys.new_queue();
        inner.add(&sys.dummy(OpStatus::SUCCESS)).unwrap();
        outer.add(&inner).unwrap();
        assert_eq!(outer.wait_all(), OpStatus::SUCCESS);

        let (exec, rx) = parked();
        let late = sys.new_op(exec, None);
        inner.add(&late).unwrap();
        assert!(!outer.is_completed());
        assert_eq!(outer.tasks_left(), 1);

        rx.recv().unwrap().mark_completed(OpStatus::SUCCESS);
        assert_eq!(outer.wait_all(), OpStatus::SUCCESS);
        let c = outer.counts();
        assert_eq!(c.submitted, c.left + c.completed);
    }

    #[test]
    fn failure_callback_retries_once() {
        let sys = GopSystem::new(SystemOptions::default());
        let q = sys.new_queue();
        let retry_sys = sys.clone();
        let passes = Arc::new(AtomicUsize::new(0));
        let passes_clone = passes.clone();
        q.set_failure_callback(move |ctx| {
            passes_clone.fetch_add(1, AtomicOrdering::SeqCst);
            for _ in ctx.failed() {
                ctx.resubmit(retry_sys.dummy(OpStatus::SUCCESS));
            }
        })
        .unwrap();
        q.add(&sys.dummy(OpStatus::FAILURE)).unwrap();
        q.add(&sys.dummy(OpStatus::SUCCESS)).unwrap();

        assert_eq!(q.wait_all(), OpStatus::SUCCESS);
        assert_eq!(passes.load(AtomicOrdering::SeqCst), 1);
        let counts = q.counts();
        assert_eq!(counts.submitted, 3);
        assert_eq!(counts.submitted, counts.left + counts.completed);
    }

    #[test]
    fn failure_callback_is_bounded() {
        let sys = GopSystem::new(SystemOptions::default());
        let q = sys.new_queue();
        let retry_sys = sys.clone();
        q.set_failure_callback(move |ctx| {
            ctx.resubmit(retry_sys.dummy(OpStatus::FAILURE));
        })
        .unwrap();
        q.set_retry_limit(2).unwrap();
        q.add(&sys.dummy(OpStatus::FAILURE)).unwrap();

        assert_eq!(q.wait_all(), OpStatus::FAILURE);
        assert_eq!(q.tasks_submitted(), 3);
        assert!(q.is_completed());
    }

    #[test]
    fn nested_queue_reports_to_parent() {
        let sys = GopSystem::new(SystemOptions::default());
        let outer = sys.new_queue();
        let inner = sys.new_queue();
        inner.add(&sys.dummy(OpStatus::CANT_CONNECT)).unwrap();
        outer.add(&inner).unwrap();
        outer.add(&sys.dummy(OpStatus::SUCCESS)).unwrap();

        assert_eq!(outer.wait_all(), OpStatus::CANT_CONNECT);
        assert_eq!(inner.status(), OpStatus::CANT_CONNECT);
        assert_eq!(outer.tasks_failed(), 1);
    }

    #[test]
    fn timed_wait_leaves_op_outstanding() {
        let sys = GopSystem::new(SystemOptions::default());
        let (exec, rx) = parked();
        let op = sys.new_op(exec, None);
        assert_eq!(op.wait_all_timeout(0), OpStatus::RETRY);
        assert!(op.wait_any_timeout(0).is_none());
        assert!(!op.is_completed());

        let parked_op = rx.recv().unwrap();
        let t = thread::spawn(move || parked_op.mark_completed(OpStatus::SUCCESS));
        assert_eq!(op.wait_all(), OpStatus::SUCCESS);
        t.join().unwrap();

        assert!(op.wait_any().is_some());
        assert!(op.wait_any().is_none());
    }

    #[test]
    fn auto_destroy_after_completion_runs_destroy_hook() {
        struct Counted(Arc<AtomicUsize>);
        impl crate::command::Command for Counted {
            fn destroy(&self, _op: &Gop) {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let sys = GopSystem::new(SystemOptions::default());
        let destroyed = Arc::new(AtomicUsize::new(0));
        let op = sys.new_local_op(crate::command::CommandOp::new(
            "local:0",
            Counted(destroyed.clone()),
        ));
        assert_eq!(op.wait_all(), OpStatus::SUCCESS);
        assert_eq!(destroyed.load(AtomicOrdering::SeqCst), 0);
        op.set_auto_destroy(true);
        assert_eq!(destroyed.load(AtomicOrdering::SeqCst), 1);
        op.free(FreeMode::Destroy);
        assert_eq!(destroyed.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn default_sort_puts_queues_first() {
        let sys = GopSystem::new(SystemOptions::default());
        let q = sys.new_queue();
        let mk = |host: &str, size: i64| {
            sys.new_local_op(
                crate::command::CommandOp::new(host, Immediate(OpStatus::SUCCESS))
                    .sort_size(size),
            )
        };
        let b_small = mk("b:1", 1);
        let a = mk("a:1", 5);
        let sub = sys.new_queue();
        let b_big = mk("b:1", 9);
        for op in &[&b_small, &a, &sub, &b_big] {
            q.add(op).unwrap();
        }
        default_sort_tasks(&q).unwrap();

        let order: Vec<GopId> = {
            let state = q.lock();
            state
                .queue
                .as_ref()
                .map(|qs| qs.list.iter().map(Gop::id).collect())
                .unwrap_or_default()
        };
        assert_eq!(order, vec![sub.id(), a.id(), b_big.id(), b_small.id()]);
        assert!(default_sort_tasks(&a).is_err());
    }

    quickcheck! {
        fn prop_wait_any_returns_each_child_once(statuses: Vec<bool>) -> bool {
            let sys = GopSystem::new(SystemOptions::default());
            let q = sys.new_queue();
            let mut ids = Vec::new();
            for ok in statuses.iter() {
                let status = if *ok { OpStatus::SUCCESS } else { OpStatus::FAILURE };
                let op = sys.dummy(status);
                ids.push(op.id());
                if q.add(&op).is_err() {
                    return false;
                }
            }

            let mut seen = Vec::new();
            while let Some(child) = q.wait_any() {
                let c = q.counts();
                if c.submitted != c.left + c.completed {
                    return false;
                }
                seen.push(child.id());
            }
            seen.sort();
            ids.sort();
            let failures = statuses.iter().filter(|ok| !**ok).count();
            seen == ids
                && q.tasks_left() == 0
                && q.completed_successfully() == (failures == 0)
        }
    }
}
