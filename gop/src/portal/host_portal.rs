// Copyright 2020 Joyent, Inc.

//! The per-destination admission controller.
//!
//! A host portal owns the queue of tasks bound for one destination and
//! decides how many host connections should be draining it. The decision is
//! made by [`ConnectionBudget::connections_needed`], a pure function of the
//! portal's counters, and is applied by bumping the intended connection
//! count under the portal lock before any thread is spawned.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, error, info, o, trace, Logger};

use crate::command::{split_hostport, ConnectContext, TaskQueue};
use crate::gop::Gop;
use crate::portal::connection::HostConnection;
use crate::portal::types::{ConnectionCount, PortalStats};
use crate::portal::{ContextShared, Transport};
use crate::status::OpStatus;

// Interval between checks while waiting for connections to settle
const SETTLE_POLL: Duration = Duration::from_millis(10);

/// The connection counters that drive the admission control loop.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionBudget {
    /// Intended connections, bumped before a connection thread exists
    pub n_conn: i64,
    /// The floor that only rises by one per stability interval
    pub stable_conn: i64,
    pub min_conn: i64,
    pub max_conn: i64,
    /// Connections in their teardown cooldown sleep
    pub sleeping_conn: i64,
    /// No new connections beyond the current ones until this instant
    pub pause_until: Option<Instant>,
    pub invalid_host: bool,
}

impl ConnectionBudget {
    pub fn new(min_conn: i64, max_conn: i64, invalid_host: bool) -> Self {
        ConnectionBudget {
            n_conn: 0,
            stable_conn: max_conn,
            min_conn,
            max_conn,
            sleeping_conn: 0,
            pause_until: None,
            invalid_host,
        }
    }

    /// Work out how many connections to open for `queued` tasks with a
    /// combined queued and executing `workload`, and count them as intended
    /// connections. Returns the number of connections the caller must spawn.
    pub fn connections_needed(
        &mut self,
        queued: usize,
        workload: i64,
        ceiling: i64,
        wait_stable: Duration,
        now: Instant,
    ) -> i64 {
        if queued == 0 {
            return 0;
        }

        let mut n = if self.n_conn < self.min_conn {
            self.min_conn - self.n_conn
        } else {
            let ceiling = ceiling.max(1);
            let wanted = (workload.max(0) + ceiling - 1) / ceiling;
            let mut n = (wanted - self.n_conn).max(0);
            if self.n_conn + n > self.max_conn {
                n = (self.max_conn - self.n_conn).max(0);
            }
            n
        };

        if self.sleeping_conn > 0 {
            n = 0;
        }

        if n + self.n_conn > self.stable_conn {
            let paused = self.pause_until.map_or(false, |until| now <= until);
            if !paused {
                self.stable_conn += 1;
                self.pause_until = Some(now);
                if self.stable_conn > self.max_conn {
                    self.stable_conn = self.max_conn;
                    n = 0;
                } else {
                    n = if self.n_conn < self.max_conn { 1 } else { 0 };
                    self.pause_until = Some(now + wait_stable);
                }
            } else if self.n_conn > 0 {
                n = 0;
            } else {
                n = n.min(1);
            }
        }

        // An unresolvable host gets a single connection that fails its tasks
        if self.invalid_host {
            n = if self.n_conn == 0 { 1 } else { 0 };
        }

        self.n_conn += n;
        n
    }
}

pub(crate) struct PortalData<T: Transport> {
    pub(crate) budget: ConnectionBudget,
    pub(crate) queue: TaskQueue,
    pub(crate) executing_workload: i64,
    pub(crate) connections: Vec<Arc<HostConnection<T>>>,
    pub(crate) closed: Vec<Arc<HostConnection<T>>>,
    pub(crate) direct: Vec<Arc<HostPortal<T>>>,
    pub(crate) dt_connect: Duration,
    pub(crate) closing_conn: i64,
    pub(crate) failed_conn_attempts: i64,
    pub(crate) successful_conn_attempts: i64,
    pub(crate) abort_conn_attempts: i64,
    pub(crate) cmds_processed: u64,
}

/// A destination: its pending tasks and the connections serving them.
pub(crate) struct HostPortal<T: Transport> {
    pub(crate) key: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) connect_context: ConnectContext,
    pub(crate) context: Weak<ContextShared<T>>,
    data: Mutex<PortalData<T>>,
    cond: Condvar,
    pub(crate) log: Logger,
}

impl<T> HostPortal<T>
where
    T: Transport,
{
    pub fn new(
        ctx: &ContextShared<T>,
        key: &str,
        connect_context: &ConnectContext,
        min_conn: i64,
        max_conn: i64,
        dt_connect: Duration,
    ) -> Arc<Self> {
        let (host, port) = split_hostport(key);
        let log = ctx.log.new(o!("host" => key.to_string()));
        let invalid_host = !ctx.transport.resolve(&host, port);
        if invalid_host {
            info!(log, "unable to resolve host");
        }

        Arc::new(HostPortal {
            key: key.to_string(),
            host,
            port,
            connect_context: ctx.transport.dup_connect_context(connect_context),
            context: ctx.me.clone(),
            data: Mutex::new(PortalData {
                budget: ConnectionBudget::new(min_conn, max_conn, invalid_host),
                queue: TaskQueue::new(),
                executing_workload: 0,
                connections: Vec::new(),
                closed: Vec::new(),
                direct: Vec::new(),
                dt_connect,
                closing_conn: 0,
                failed_conn_attempts: 0,
                successful_conn_attempts: 0,
                abort_conn_attempts: ctx.config.abort_conn_attempts,
                cmds_processed: 0,
            }),
            cond: Condvar::new(),
            log,
        })
    }

    pub fn lock(&self) -> MutexGuard<PortalData<T>> {
        self.data.lock().unwrap()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<PortalData<T>>> {
        self.data.try_lock().ok()
    }

    pub fn wait<'a>(
        &self,
        g: MutexGuard<'a, PortalData<T>>,
        timeout: Duration,
    ) -> MutexGuard<'a, PortalData<T>> {
        self.cond.wait_timeout(g, timeout).unwrap().0
    }

    pub fn signal(&self) {
        self.cond.notify_all();
    }

    pub fn invalid_host(&self) -> bool {
        self.lock().budget.invalid_host
    }

    /// Add `op` to the queue, at the front if `top`. The command's on-submit
    /// hook runs with the lock held.
    pub fn enqueue_locked(&self, data: &mut PortalData<T>, op: Gop, top: bool) {
        if top {
            data.queue.push_front(op.clone());
        } else {
            data.queue.push_back(op.clone());
        }
        if let Some(cmd) = op.command() {
            cmd.handler().on_submit(&op, &mut data.queue);
        }
        self.cond.notify_all();
    }

    /// Take the next task off the queue. The command's before-exec hook runs
    /// first so it can coalesce queued neighbours.
    pub fn dequeue_locked(&self, data: &mut PortalData<T>) -> Option<Gop> {
        let op = data.queue.front()?.clone();
        if let Some(cmd) = op.command() {
            cmd.handler().before_exec(&op, &mut data.queue);
        }
        data.queue.remove_op(&op);
        Some(op)
    }

    /// Empty the queue and complete every task with `status`.
    pub fn fail_tasks(&self, status: OpStatus) {
        let failed = {
            let mut data = self.lock();
            let mut failed = Vec::with_capacity(data.queue.len());
            while let Some(op) = self.dequeue_locked(&mut data) {
                failed.push(op);
            }
            failed
        };
        if !failed.is_empty() {
            info!(self.log, "failing queued tasks";
                "count" => failed.len(), "status" => %status);
        }
        for op in failed {
            op.mark_completed(status);
        }
    }

    /// Run the admission control loop and spawn whatever connections it
    /// asks for.
    pub fn check_connections(self: &Arc<Self>) {
        let ctx = match self.context.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };
        if ctx.is_shutting_down() {
            return;
        }

        let n = {
            let mut data = self.lock();
            let workload = data.queue.workload() + data.executing_workload;
            let queued = data.queue.len();
            data.budget.connections_needed(
                queued,
                workload,
                ctx.config.max_workload,
                ctx.config.wait_stable_time,
                Instant::now(),
            )
        };

        if n > 0 {
            debug!(self.log, "opening connections"; "count" => n);
        }
        for _ in 0..n {
            self.spawn_connection(&ctx);
        }
    }

    fn spawn_connection(self: &Arc<Self>, ctx: &ContextShared<T>) {
        if ctx.running_connections() >= ctx.config.max_connections {
            if let Some(hc) = ctx.find_connection_to_close() {
                debug!(self.log, "connection limit reached, closing one";
                    "conn" => hc.id());
                hc.close(true);
            }
        }

        if let Err(e) = HostConnection::create(self, ctx) {
            error!(self.log, "unable to create connection: {}", e);
        }
    }

    /// Join the threads of connections that have exited. In quick mode a
    /// connection still being closed by someone else is left for the next
    /// pass.
    pub fn reap(&self, quick: bool) {
        let closed = mem::take(&mut self.lock().closed);
        if closed.is_empty() {
            return;
        }

        let mut busy = Vec::new();
        for hc in closed {
            if hc.ready_to_reap(quick) {
                hc.join_recv();
                trace!(self.log, "reaped connection"; "conn" => hc.id());
            } else {
                busy.push(hc);
            }
        }

        if !busy.is_empty() {
            self.lock().closed.extend(busy);
        }
    }

    pub fn is_unused(&self) -> bool {
        let data = self.lock();
        data.budget.n_conn == 0
            && data.closing_conn == 0
            && data.queue.is_empty()
            && data.direct.is_empty()
            && data.closed.is_empty()
            && data.connections.is_empty()
    }

    /// Remove dedicated sub-portals that are no longer in use.
    pub fn compact_direct(&self, transport: &T) {
        let direct = mem::take(&mut self.lock().direct);
        let mut kept = Vec::with_capacity(direct.len());
        for shp in direct {
            shp.reap(true);
            if shp.is_unused() {
                shp.destroy(transport);
            } else {
                kept.push(shp);
            }
        }
        let mut data = self.lock();
        kept.append(&mut data.direct);
        data.direct = kept;
    }

    /// Find an idle dedicated sub-portal and queue `op` on it. Returns the
    /// op back if none is free.
    pub fn submit_to_idle_direct(&self, op: Gop) -> Result<Arc<Self>, Gop> {
        let data = self.lock();
        for shp in data.direct.iter() {
            let mut sdata = match shp.try_lock() {
                Some(sdata) => sdata,
                None => continue,
            };
            if !sdata.queue.is_empty() {
                continue;
            }
            let idle = match sdata.connections.first() {
                Some(hc) => hc.is_idle(),
                None => true,
            };
            if idle {
                shp.enqueue_locked(&mut sdata, op, true);
                return Ok(shp.clone());
            }
        }
        Err(op)
    }

    pub fn add_direct(&self, shp: Arc<Self>) {
        self.lock().direct.push(shp);
    }

    /// Shutdown, first pass: wait for starting connections to register, fail
    /// the queue with `error` and ask every connection to stop.
    pub fn request_shutdown(&self) {
        let tasks = {
            let mut data = loop {
                let data = self.lock();
                if data.connections.len() as i64 >= data.budget.n_conn {
                    break data;
                }
                drop(data);
                thread::sleep(SETTLE_POLL);
            };
            for hc in data.connections.iter() {
                hc.request_stop();
            }
            self.cond.notify_all();
            let tasks = data.queue.drain();
            tasks
        };
        for op in tasks {
            op.mark_completed(OpStatus::ERROR);
        }
    }

    /// Shutdown, second pass: wait for every connection to exit, shut down
    /// the dedicated sub-portals and release everything.
    pub fn shutdown(&self, transport: &T) {
        loop {
            {
                let data = self.lock();
                if data.closing_conn == 0 && data.budget.n_conn == 0 {
                    break;
                }
                trace!(self.log, "waiting for connections to close";
                    "closing" => data.closing_conn,
                    "n_conn" => data.budget.n_conn);
            }
            thread::sleep(SETTLE_POLL);
        }

        let direct = mem::take(&mut self.lock().direct);
        for shp in direct {
            shp.request_shutdown();
            shp.shutdown(transport);
        }

        let remaining = mem::take(&mut self.lock().connections);
        for hc in remaining {
            hc.close(false);
        }

        self.destroy(transport);
    }

    pub fn destroy(&self, transport: &T) {
        self.reap(false);
        transport.destroy_connect_context(self.connect_context.clone());
        debug!(self.log, "host portal destroyed";
            "commands_processed" => self.lock().cmds_processed);
    }

    pub fn stats(&self) -> PortalStats {
        let data = self.lock();
        PortalStats {
            intended_connections: count(data.budget.n_conn),
            live_connections: count(data.connections.len() as i64),
            closed_connections: count(data.closed.len() as i64),
            sleeping_connections: count(data.budget.sleeping_conn),
            stable_connections: data.budget.stable_conn,
            queued_tasks: data.queue.len(),
            queued_workload: data.queue.workload(),
            executing_workload: data.executing_workload,
            dedicated_portals: data.direct.len(),
            successful_connects: data.successful_conn_attempts.max(0) as u64,
            failed_connects: data.failed_conn_attempts.max(0) as u64,
            commands_processed: data.cmds_processed,
            invalid_host: data.budget.invalid_host,
        }
    }

    pub fn set_limits(&self, min_conn: i64, max_conn: i64, dt: Duration) {
        let mut data = self.lock();
        data.budget.min_conn = min_conn;
        data.budget.max_conn = max_conn;
        data.budget.stable_conn = max_conn;
        data.dt_connect = dt;
    }
}

fn count(n: i64) -> ConnectionCount {
    ConnectionCount::from(n.max(0) as u32)
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};

    const WAIT_STABLE: Duration = Duration::from_secs(15);

    #[derive(Clone, Debug)]
    struct BudgetInput {
        budget: ConnectionBudget,
        queued: usize,
        workload: i64,
        ceiling: i64,
        paused: bool,
    }

    impl Arbitrary for BudgetInput {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let max_conn = i64::from(u8::arbitrary(g) % 8) + 1;
            let min_conn = i64::from(u8::arbitrary(g)) % (max_conn + 1);
            let n_conn = i64::from(u8::arbitrary(g)) % (max_conn + 1);
            let stable_conn = i64::from(u8::arbitrary(g)) % (max_conn + 1);
            let sleeping_conn = i64::from(u8::arbitrary(g) % 3);
            BudgetInput {
                budget: ConnectionBudget {
                    n_conn,
                    stable_conn,
                    min_conn,
                    max_conn,
                    sleeping_conn,
                    pause_until: None,
                    invalid_host: bool::arbitrary(g) && bool::arbitrary(g),
                },
                queued: usize::from(u8::arbitrary(g) % 50),
                workload: i64::from(u16::arbitrary(g)),
                ceiling: i64::from(u8::arbitrary(g)) + 1,
                paused: bool::arbitrary(g),
            }
        }
    }

    fn run(input: &BudgetInput) -> (ConnectionBudget, i64) {
        let now = Instant::now();
        let mut budget = input.budget.clone();
        if input.paused {
            budget.pause_until = Some(now + WAIT_STABLE);
        }
        let n = budget.connections_needed(
            input.queued,
            input.workload,
            input.ceiling,
            WAIT_STABLE,
            now,
        );
        (budget, n)
    }

    #[test]
    fn workload_ceiling_caps_connections() {
        let mut budget = ConnectionBudget::new(1, 4, false);
        let now = Instant::now();

        // The first pass only brings the portal up to its minimum
        assert_eq!(budget.connections_needed(45, 45, 10, WAIT_STABLE, now), 1);
        assert_eq!(budget.n_conn, 1);

        // 45 units against a ceiling of 10 wants 5 connections, capped at 4
        let mut passes = 0;
        while budget.n_conn < 4 && passes < 10 {
            let n = budget.connections_needed(45, 45, 10, WAIT_STABLE, now);
            assert!(n >= 0);
            assert!(budget.n_conn <= 4);
            passes += 1;
        }
        assert_eq!(budget.n_conn, 4);
        assert_eq!(budget.connections_needed(45, 45, 10, WAIT_STABLE, now), 0);
        assert_eq!(budget.n_conn, 4);
    }

    #[test]
    fn empty_queue_needs_nothing() {
        let mut budget = ConnectionBudget::new(2, 4, true);
        assert_eq!(
            budget.connections_needed(0, 100, 10, WAIT_STABLE, Instant::now()),
            0
        );
    }

    #[test]
    fn stable_floor_rises_one_at_a_time() {
        let mut budget = ConnectionBudget::new(1, 4, false);
        budget.stable_conn = 1;
        budget.n_conn = 1;
        let now = Instant::now();

        assert_eq!(budget.connections_needed(40, 40, 10, WAIT_STABLE, now), 1);
        assert_eq!(budget.stable_conn, 2);
        assert_eq!(budget.n_conn, 2);

        // Paused until the stability interval passes
        assert_eq!(budget.connections_needed(40, 40, 10, WAIT_STABLE, now), 0);
        let later = now + WAIT_STABLE + Duration::from_secs(1);
        assert_eq!(budget.connections_needed(40, 40, 10, WAIT_STABLE, later), 1);
        assert_eq!(budget.stable_conn, 3);
    }

    #[test]
    fn invalid_host_gets_one_sink() {
        let mut budget = ConnectionBudget::new(3, 4, true);
        let now = Instant::now();
        assert_eq!(budget.connections_needed(10, 10, 1, WAIT_STABLE, now), 1);
        assert_eq!(budget.connections_needed(10, 10, 1, WAIT_STABLE, now), 0);
    }

    quickcheck! {
        fn prop_never_exceeds_max(input: BudgetInput) -> bool {
            let (budget, n) = run(&input);
            n >= 0
                && (n == 0 || budget.n_conn <= budget.max_conn.max(1))
                && budget.n_conn == input.budget.n_conn + n
        }

        fn prop_one_connection_per_pass_while_cooling(input: BudgetInput) -> bool {
            let (_, n) = run(&input);
            input.budget.sleeping_conn == 0 || n <= 1
        }

        fn prop_invalid_host_single_sink(input: BudgetInput) -> bool {
            let (_, n) = run(&input);
            if !input.budget.invalid_host {
                return true;
            }
            if input.queued > 0 && input.budget.n_conn == 0 {
                n == 1
            } else {
                n == 0
            }
        }
    }
}
