// Copyright 2020 Joyent, Inc.

//! A host connection: one network stream served by a send thread and a
//! receive thread.
//!
//! The send thread connects, then keeps taking tasks off its portal's queue
//! and writing them while the connection's outstanding workload is below
//! the ceiling. Each written task is appended to the pending list. The
//! receive thread reads results for pending tasks in the order they were
//! sent. When the connection stops, the receive thread re-queues whatever
//! is left at the front of the portal's queue and updates the portal's
//! connection counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, error, info, o, trace, warn, Logger};

use crate::error::Error;
use crate::gop::Gop;
use crate::netstream::NetStream;
use crate::portal::host_portal::HostPortal;
use crate::portal::types::{CloseState, ShutdownRequest, Startup};
use crate::portal::{ContextShared, Transport};
use crate::status::{OpStatus, StatusKind};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// Longest a send thread waits on an empty queue before re-checking its state
const QUEUE_POLL: Duration = Duration::from_secs(1);
const REAP_POLL: Duration = Duration::from_millis(10);

struct ConnectionData {
    pending: VecDeque<Gop>,
    curr_workload: i64,
    current: Option<Gop>,
    shutdown: ShutdownRequest,
    startup: Startup,
    close_state: CloseState,
    send_down: bool,
    connect_ok: bool,
    start_stable: i64,
    cmd_count: u64,
    last_used: Instant,
    send_thread: Option<thread::JoinHandle<()>>,
    recv_thread: Option<thread::JoinHandle<()>>,
}

pub(crate) struct HostConnection<T: Transport> {
    id: u64,
    portal: Arc<HostPortal<T>>,
    stream: NetStream,
    data: Mutex<ConnectionData>,
    send_cond: Condvar,
    recv_cond: Condvar,
    log: Logger,
}

impl<T> HostConnection<T>
where
    T: Transport,
{
    /// Start a connection's two threads. The intended connection count was
    /// already bumped by the caller and is rolled back on failure.
    pub fn create(
        portal: &Arc<HostPortal<T>>,
        ctx: &ContextShared<T>,
    ) -> Result<(), Error> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let hc = Arc::new(HostConnection {
            id,
            portal: portal.clone(),
            stream: NetStream::new(),
            data: Mutex::new(ConnectionData {
                pending: VecDeque::new(),
                curr_workload: 0,
                current: None,
                shutdown: ShutdownRequest::None,
                startup: Startup::Pending,
                close_state: CloseState::Open,
                send_down: false,
                connect_ok: false,
                start_stable: 0,
                cmd_count: 0,
                last_used: Instant::now(),
                send_thread: None,
                recv_thread: None,
            }),
            send_cond: Condvar::new(),
            recv_cond: Condvar::new(),
            log: portal.log.new(o!("conn" => id)),
        });

        ctx.running_threads_add(1);

        let send_hc = hc.clone();
        let send = thread::Builder::new()
            .name(format!("gop-send-{}", id))
            .spawn(move || send_loop(send_hc));
        match send {
            Ok(handle) => hc.lock().send_thread = Some(handle),
            Err(e) => {
                hc.rollback(ctx);
                return Err(Error::SpawnFailure(e));
            }
        }

        let barrier = Arc::new(Barrier::new(2));
        let recv_barrier = barrier.clone();
        let recv_hc = hc.clone();
        let recv = thread::Builder::new()
            .name(format!("gop-recv-{}", id))
            .spawn(move || recv_loop(recv_hc, recv_barrier));
        match recv {
            Ok(handle) => {
                hc.lock().recv_thread = Some(handle);
                barrier.wait();
                trace!(hc.log, "connection started");
                Ok(())
            }
            Err(e) => {
                let send = {
                    let mut data = hc.lock();
                    data.startup = Startup::Failed;
                    hc.send_cond.notify_all();
                    data.send_thread.take()
                };
                if let Some(send) = send {
                    let _ = send.join();
                }
                hc.rollback(ctx);
                Err(Error::SpawnFailure(e))
            }
        }
    }

    fn rollback(&self, ctx: &ContextShared<T>) {
        {
            let mut pdata = self.portal.lock();
            if pdata.budget.n_conn > 0 {
                pdata.budget.n_conn -= 1;
            }
        }
        ctx.running_threads_add(-1);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<ConnectionData> {
        self.data.lock().unwrap()
    }

    /// Open, with nothing outstanding. Never blocks.
    pub fn is_idle(&self) -> bool {
        match self.data.try_lock() {
            Ok(data) => data.pending.is_empty() && data.curr_workload == 0,
            Err(_) => false,
        }
    }

    /// The outstanding workload if the connection can be picked for closing
    pub fn open_workload(&self) -> Option<i64> {
        let data = self.lock();
        if data.close_state == CloseState::Open {
            Some(data.curr_workload)
        } else {
            None
        }
    }

    /// Claim the connection for closing. Fails if someone else got there
    /// first.
    pub fn mark_closing(&self) -> bool {
        let mut data = self.lock();
        if data.close_state == CloseState::Open {
            data.close_state = CloseState::Closing;
            true
        } else {
            false
        }
    }

    pub fn request_stop(&self) {
        let mut data = self.lock();
        if data.shutdown == ShutdownRequest::None {
            data.shutdown = ShutdownRequest::Requested;
        }
        self.recv_cond.notify_all();
        self.send_cond.notify_all();
    }

    /// Ask the connection to stop. A quick close only waits for the send
    /// thread to exit; otherwise the receive thread is joined and the portal
    /// reaped.
    pub fn close(&self, quick: bool) {
        self.request_stop();
        self.portal.signal();
        self.send_cond.notify_all();
        self.portal.signal();

        if quick {
            let mut data = self.lock();
            while !data.send_down {
                data = self.send_cond.wait(data).unwrap();
            }
            data.close_state = CloseState::Released;
            debug!(self.log, "connection closed early");
        } else {
            self.join_recv();
            self.portal.reap(false);
        }
    }

    pub fn ready_to_reap(&self, quick: bool) -> bool {
        let mut attempt = 0;
        loop {
            if self.lock().close_state != CloseState::Closing {
                return true;
            }
            attempt += 1;
            if quick && attempt > 2 {
                return false;
            }
            thread::sleep(REAP_POLL);
        }
    }

    pub fn join_recv(&self) {
        let handle = self.lock().recv_thread.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(self.log, "receive thread panicked");
            }
        }
    }

    // Block while the outstanding workload is at the ceiling. Returns false
    // if the connection was asked to stop.
    fn wait_for_capacity(&self, max_workload: i64) -> bool {
        let mut data = self.lock();
        while data.curr_workload >= max_workload
            && data.shutdown == ShutdownRequest::None
        {
            data = self.send_cond.wait(data).unwrap();
        }
        data.shutdown == ShutdownRequest::None
    }
}

fn send_loop<T: Transport>(hc: Arc<HostConnection<T>>) {
    {
        let mut data = hc.lock();
        while data.startup == Startup::Pending {
            data = hc.send_cond.wait(data).unwrap();
        }
        if data.startup == Startup::Failed {
            return;
        }
    }

    let ctx = match hc.portal.context.upgrade() {
        Some(ctx) => ctx,
        None => {
            hc.lock().shutdown = ShutdownRequest::Requested;
            hc.recv_cond.notify_all();
            finish_send(&hc);
            return;
        }
    };
    let portal = &hc.portal;

    let connect_ok = if portal.invalid_host() {
        portal.fail_tasks(OpStatus::INVALID_HOST);
        false
    } else {
        let timeout = portal.lock().dt_connect;
        let status = ctx.transport.connect(
            &hc.stream,
            &portal.connect_context,
            &portal.host,
            portal.port,
            timeout,
        );
        if !status.is_success() {
            info!(hc.log, "connect failed"; "status" => %status);
        }
        status.is_success()
    };

    let start_stable = {
        let mut pdata = portal.lock();
        if connect_ok {
            pdata.successful_conn_attempts += 1;
            pdata.failed_conn_attempts = 0;
        } else {
            pdata.failed_conn_attempts += 1;
        }
        pdata.connections.push(hc.clone());
        pdata.budget.stable_conn
    };
    {
        let mut data = hc.lock();
        data.connect_ok = connect_ok;
        data.start_stable = start_stable;
        data.last_used = Instant::now();
    }

    let mut running = connect_ok;
    while running {
        if !hc.wait_for_capacity(ctx.config.max_workload) {
            break;
        }

        let next = {
            let mut pdata = portal.lock();
            match portal.dequeue_locked(&mut pdata) {
                Some(op) => {
                    pdata.executing_workload += workload_of(&op);
                    Some(op)
                }
                None => {
                    drop(portal.wait(pdata, QUEUE_POLL));
                    None
                }
            }
        };

        if let Some(op) = next {
            if !send_one(&hc, op) {
                running = false;
            }
        }

        let mut data = hc.lock();
        if data.pending.is_empty() {
            if data.last_used.elapsed() >= ctx.config.min_idle {
                debug!(hc.log, "connection idle");
                data.shutdown = ShutdownRequest::Requested;
            }
        } else if data.start_stable == 0 {
            data.shutdown = ShutdownRequest::Requested;
        }
        if ctx.is_shutting_down() && data.shutdown == ShutdownRequest::None {
            data.shutdown = ShutdownRequest::Requested;
        }
        if data.shutdown != ShutdownRequest::None {
            running = false;
        }
    }

    {
        let mut data = hc.lock();
        data.shutdown = if data.pending.is_empty() {
            ShutdownRequest::Requested
        } else {
            ShutdownRequest::DrainPending
        };
        trace!(hc.log, "send side stopped"; "shutdown" => %data.shutdown);
        hc.recv_cond.notify_all();
    }
    ctx.running_threads_add(-1);
    finish_send(&hc);
}

fn finish_send<T: Transport>(hc: &HostConnection<T>) {
    let mut data = hc.lock();
    data.send_down = true;
    hc.send_cond.notify_all();
    trace!(hc.log, "send thread exiting");
}

// Write one task. Returns false if the connection failed.
fn send_one<T: Transport>(hc: &HostConnection<T>, op: Gop) -> bool {
    let cmd = match op.command() {
        Some(cmd) => cmd,
        None => {
            op.mark_completed(OpStatus::ERROR);
            return true;
        }
    };
    let handler = cmd.handler();

    cmd.start_clock();
    {
        let mut data = hc.lock();
        data.current = Some(op.clone());
        if data.pending.is_empty() {
            cmd.set_on_top();
        }
    }

    let mut status = handler.send_command(&op, &hc.stream);
    if status.is_success() {
        {
            let mut data = hc.lock();
            data.last_used = Instant::now();
            data.curr_workload += cmd.get_workload();
            if !cmd.is_on_top() && data.pending.is_empty() {
                cmd.arm_clock();
            }
        }

        status = handler.send_phase(&op, &hc.stream);

        let mut data = hc.lock();
        data.last_used = Instant::now();
        data.pending.push_back(op.clone());
        data.current = None;
        hc.recv_cond.notify_all();
    }

    if status.is_success() {
        true
    } else {
        debug!(hc.log, "send failed"; "id" => %op.id(), "status" => %status);
        false
    }
}

fn recv_loop<T: Transport>(hc: Arc<HostConnection<T>>, barrier: Arc<Barrier>) {
    barrier.wait();
    {
        let mut data = hc.lock();
        data.startup = Startup::Ready;
        hc.send_cond.notify_all();
    }

    let ctx = match hc.portal.context.upgrade() {
        Some(ctx) => ctx,
        None => {
            join_send(&hc);
            return;
        }
    };
    let portal = &hc.portal;
    let check_interval = ctx.config.check_connection_interval;
    let start_processed = portal.lock().cmds_processed;
    let mut check_time = Instant::now() + check_interval;
    let mut in_flight: Option<Gop> = None;
    let mut pause = Duration::from_secs(0);

    loop {
        let next = hc.lock().pending.front().cloned();
        match next {
            Some(op) => {
                let (status, retries_left, retry_wait) = match op.command() {
                    Some(cmd) => {
                        cmd.arm_clock();
                        let status = cmd.handler().recv_phase(&op, &hc.stream);
                        cmd.stop_clock();
                        (status, cmd.get_retry_count() > 0, cmd.get_retry_wait())
                    }
                    None => (OpStatus::ERROR, false, pause),
                };

                let workload = workload_of(&op);
                portal.lock().executing_workload -= workload;
                {
                    let mut data = hc.lock();
                    data.last_used = Instant::now();
                    data.curr_workload -= workload;
                    data.pending.pop_front();
                    hc.send_cond.notify_all();
                }

                if status.is_dead() && retries_left {
                    debug!(hc.log, "connection dead, redelivering";
                        "id" => %op.id(), "status" => %status);
                    pause = retry_wait;
                    in_flight = Some(op);
                    break;
                } else if status.kind == StatusKind::Timeout && retries_left {
                    debug!(hc.log, "command timed out, redelivering";
                        "id" => %op.id());
                    in_flight = Some(op);
                    break;
                }

                hc.lock().cmd_count += 1;
                portal.lock().cmds_processed += 1;
                op.mark_completed(status);
            }
            None => {
                let mut data = hc.lock();
                if let Some(current) = data.current.as_ref() {
                    if let Some(cmd) = current.command() {
                        cmd.arm_clock();
                    }
                }
                let shutdown = data.shutdown;
                match shutdown {
                    ShutdownRequest::Requested => break,
                    ShutdownRequest::DrainPending => {
                        data.shutdown = ShutdownRequest::Requested;
                    }
                    ShutdownRequest::None => {
                        while data.shutdown == ShutdownRequest::None
                            && data.pending.is_empty()
                        {
                            hc.send_cond.notify_all();
                            let now = Instant::now();
                            if now >= check_time {
                                break;
                            }
                            let (guard, res) = hc
                                .recv_cond
                                .wait_timeout(data, check_time - now)
                                .unwrap();
                            data = guard;
                            if res.timed_out() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if Instant::now() > check_time {
            portal.check_connections();
            check_time = Instant::now() + check_interval;
        }
    }

    teardown(&hc, &ctx, in_flight, pause, start_processed);
}

fn join_send<T: Transport>(hc: &HostConnection<T>) {
    {
        let mut data = hc.lock();
        data.curr_workload = 0;
        data.shutdown = ShutdownRequest::Requested;
    }
    hc.portal.signal();
    hc.send_cond.notify_all();

    let send = hc.lock().send_thread.take();
    if let Some(send) = send {
        if send.join().is_err() {
            error!(hc.log, "send thread panicked");
        }
    }
}

fn teardown<T: Transport>(
    hc: &Arc<HostConnection<T>>,
    ctx: &ContextShared<T>,
    in_flight: Option<Gop>,
    mut pause: Duration,
    start_processed: u64,
) {
    let portal = &hc.portal;

    ctx.transport.close_connection(&hc.stream);
    join_send(hc);

    let (connect_ok, cmd_count, start_stable, current, pending) = {
        let mut data = hc.lock();
        let current = data.current.take();
        let pending: Vec<Gop> = data.pending.drain(..).collect();
        (
            data.connect_ok,
            data.cmd_count,
            data.start_stable,
            current,
            pending,
        )
    };

    let mut requeued = Vec::new();
    let mut released_workload = 0;
    if let Some(op) = in_flight {
        if let Some(cmd) = op.command() {
            cmd.decrement_retry_count();
        }
        requeued.push(op);
    }
    for op in pending.into_iter().chain(current) {
        released_workload += workload_of(&op);
        requeued.push(op);
    }
    for op in requeued.iter() {
        if let Some(cmd) = op.command() {
            cmd.clear_on_top();
        }
    }

    let shutting_down = ctx.is_shutting_down();
    let mut failed = Vec::new();
    let mut status = OpStatus::ERROR;
    let any_requeued = !requeued.is_empty();

    let (n_conn, sleeping) = {
        let mut pdata = portal.lock();
        pdata.executing_workload -= released_workload;

        if !connect_ok {
            let abort = pdata.budget.n_conn == 1
                || pdata.failed_conn_attempts > pdata.abort_conn_attempts;
            if pdata.cmds_processed == start_processed && abort {
                status = OpStatus::CANT_CONNECT;
                while let Some(op) = portal.dequeue_locked(&mut pdata) {
                    failed.push(op);
                }
            }
        }

        if shutting_down {
            failed.append(&mut requeued);
        } else {
            for op in requeued.into_iter().rev() {
                portal.enqueue_locked(&mut pdata, op, true);
            }
        }

        if pdata.budget.n_conn > 0 {
            pdata.budget.n_conn -= 1;
        }
        pdata.connections.retain(|c| !Arc::ptr_eq(c, hc));

        if any_requeued {
            let weak = if cmd_count < 2 { 1 } else { 0 };
            pdata.budget.stable_conn = (pdata.budget.n_conn - weak).max(0);
            if pdata.budget.sleeping_conn > 0 {
                pause = Duration::from_secs(0);
            }
            if pause > Duration::from_secs(0) {
                pause = pause.min(ctx.config.max_wait);
                let until = Instant::now() + pause;
                if pdata.budget.pause_until.map_or(true, |p| p < until) {
                    pdata.budget.pause_until = Some(until);
                }
            }
            if start_stable == 0 && cmd_count > 0 {
                pause = Duration::from_secs(0);
            }
        } else {
            pause = Duration::from_secs(0);
        }
        if shutting_down {
            pause = Duration::from_secs(0);
        }

        pdata.closing_conn += 1;
        let sleeping = pause > Duration::from_secs(0);
        if sleeping {
            pdata.budget.sleeping_conn += 1;
        }
        (pdata.budget.n_conn, sleeping)
    };

    if !failed.is_empty() {
        warn!(hc.log, "failing tasks";
            "count" => failed.len(), "status" => %status);
    }
    for op in failed {
        op.mark_completed(status);
    }

    if sleeping {
        if n_conn <= 0 {
            debug!(hc.log, "cooling down"; "pause_ms" => pause.as_millis() as u64);
            thread::sleep(pause);
        }
        portal.lock().budget.sleeping_conn -= 1;
    }

    portal.check_connections();

    {
        let mut pdata = portal.lock();
        pdata.closing_conn -= 1;
        pdata.closed.push(hc.clone());
    }
    debug!(hc.log, "connection closed"; "commands" => cmd_count);
}

fn workload_of(op: &Gop) -> i64 {
    op.command().map_or(0, |cmd| cmd.get_workload())
}
