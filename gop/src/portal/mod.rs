// Copyright 2020 Joyent, Inc.

//! Portal contexts: connection-pooled execution of operations against remote
//! hosts.
//!
//! A [`PortalContext`](struct.PortalContext.html) keeps one host portal per
//! `host:port` destination. Each portal holds a FIFO queue of tasks and runs
//! between `min_connections` and `max_connections_per_host` host connections
//! that drain it. How a connection is opened and closed is up to the
//! [`Transport`](trait.Transport.html); what is written and read for each
//! task is up to the task's [`Command`](../command/trait.Command.html).

mod connection;
mod host_portal;
pub mod types;

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use slog::{debug, error, info, trace, Logger};
use timer::Guard;

use crate::command::{CommandOp, ConnectContext};
use crate::error::Error;
use crate::gop::{default_sort_tasks, ExecMode, Executor, Gop};
use crate::netstream::NetStream;
use crate::status::OpStatus;
use crate::system::GopSystem;

use self::connection::HostConnection;
use self::host_portal::HostPortal;
pub use self::types::*;

/// The binding between the runtime and a network protocol.
///
/// Only `connect` is required. The remaining functions have defaults that
/// suit most transports.
pub trait Transport: Send + Sync + Sized + 'static {
    /// Copy a connect context for a new host portal.
    fn dup_connect_context(&self, ctx: &ConnectContext) -> ConnectContext {
        ctx.clone()
    }

    /// Release a host portal's connect context.
    fn destroy_connect_context(&self, _ctx: ConnectContext) {}

    /// Connect `stream` to `host:port`, attaching the stream's halves on
    /// success. Must give up after `timeout`.
    fn connect(
        &self,
        stream: &NetStream,
        ctx: &ConnectContext,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> OpStatus;

    fn close_connection(&self, stream: &NetStream) {
        stream.close();
    }

    /// Route a submitted operation. The default honors the operation's
    /// execution mode.
    fn submit(&self, dispatch: Dispatch<'_, Self>, op: Gop) {
        dispatch.submit(op)
    }

    /// Order a queue's unstarted children before execution.
    fn sort_tasks(&self, queue: &Gop) -> Result<(), Error> {
        default_sort_tasks(queue)
    }

    /// Whether `host:port` can be resolved. Tasks for a host that cannot are
    /// failed with `invalid-host`.
    fn resolve(&self, host: &str, port: u16) -> bool {
        match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(_) => false,
        }
    }
}

/// Handed to [`Transport::submit`](trait.Transport.html#method.submit) to
/// place an operation on a shared queue or a dedicated connection.
pub struct Dispatch<'a, T: Transport> {
    ctx: &'a ContextShared<T>,
}

impl<'a, T> Dispatch<'a, T>
where
    T: Transport,
{
    /// Queue or dedicate according to the operation's execution mode
    pub fn submit(&self, op: Gop) {
        match op.exec_mode() {
            ExecMode::Queued => self.queued(op),
            ExecMode::Direct => self.direct(op),
        }
    }

    /// Append the operation to its destination's shared queue
    pub fn queued(&self, op: Gop) {
        self.ctx.queued_submit(op)
    }

    /// Run the operation on a connection of its own
    pub fn direct(&self, op: Gop) {
        self.ctx.direct_submit(op)
    }

    pub fn log(&self) -> &Logger {
        &self.ctx.log
    }
}

struct PortalTable<T: Transport> {
    portals: HashMap<String, Arc<HostPortal<T>>>,
    min_conn: i64,
    max_conn: i64,
    dt_connect: Duration,
}

// State shared by a context's handles, portals and connection threads
pub(crate) struct ContextShared<T: Transport> {
    pub(crate) me: Weak<ContextShared<T>>,
    pub(crate) transport: T,
    pub(crate) config: PortalConfig,
    pub(crate) log: Logger,
    running_threads: AtomicI64,
    shutting_down: AtomicBool,
    state: Mutex<ContextState>,
    table: Mutex<PortalTable<T>>,
}

impl<T> ContextShared<T>
where
    T: Transport,
{
    fn table(&self) -> MutexGuard<PortalTable<T>> {
        self.table.lock().unwrap()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn running_threads_add(&self, n: i64) {
        self.running_threads.fetch_add(n, Ordering::SeqCst);
    }

    pub fn running_connections(&self) -> i64 {
        self.running_threads.load(Ordering::SeqCst)
    }

    fn portal_for(
        &self,
        table: &mut PortalTable<T>,
        key: &str,
        cc: &ConnectContext,
        limits: Option<(i64, i64, Duration)>,
    ) -> Arc<HostPortal<T>> {
        if let Some(hp) = table.portals.get(key) {
            return hp.clone();
        }
        let (min_conn, max_conn, dt) =
            limits.unwrap_or((table.min_conn, table.max_conn, table.dt_connect));
        let hp = HostPortal::new(self, key, cc, min_conn, max_conn, dt);
        debug!(self.log, "host portal created"; "host" => key);
        table.portals.insert(key.to_string(), hp.clone());
        hp
    }

    fn queued_submit(&self, op: Gop) {
        let (key, cc) = match op.command() {
            Some(cmd) => {
                (cmd.hostport().to_string(), cmd.get_connect_context().clone())
            }
            None => return op.mark_completed(OpStatus::ERROR),
        };

        let hp = {
            let mut table = self.table();
            if self.is_shutting_down() {
                drop(table);
                return op.mark_completed(OpStatus::ERROR);
            }
            let hp = self.portal_for(&mut table, &key, &cc, None);
            let mut pdata = hp.lock();
            hp.enqueue_locked(&mut pdata, op, false);
            drop(pdata);
            hp
        };
        hp.check_connections();
    }

    fn direct_submit(&self, op: Gop) {
        let (key, cc) = match op.command() {
            Some(cmd) => {
                (cmd.hostport().to_string(), cmd.get_connect_context().clone())
            }
            None => return op.mark_completed(OpStatus::ERROR),
        };
        let single = (1, 1, DIRECT_CONNECT_TIMEOUT);

        let shp = {
            let mut table = self.table();
            if self.is_shutting_down() {
                drop(table);
                return op.mark_completed(OpStatus::ERROR);
            }
            let hp = self.portal_for(&mut table, &key, &cc, Some(single));
            match hp.submit_to_idle_direct(op) {
                Ok(shp) => shp,
                Err(op) => {
                    let shp = HostPortal::new(self, &key, &cc, 1, 1, single.2);
                    {
                        let mut sdata = shp.lock();
                        shp.enqueue_locked(&mut sdata, op, true);
                    }
                    hp.add_direct(shp.clone());
                    trace!(self.log, "dedicated portal created"; "host" => key);
                    shp
                }
            }
        };
        shp.check_connections();
    }

    /// The least loaded open connection across every portal and the first
    /// connection of each dedicated portal, claimed for closing.
    pub fn find_connection_to_close(&self) -> Option<Arc<HostConnection<T>>> {
        let mut best: Option<(i64, Arc<HostConnection<T>>)> = None;
        let mut consider = |hc: &Arc<HostConnection<T>>| {
            if let Some(workload) = hc.open_workload() {
                if best.as_ref().map_or(true, |(w, _)| workload < *w) {
                    best = Some((workload, hc.clone()));
                }
            }
        };

        {
            let table = self.table();
            for hp in table.portals.values() {
                let pdata = hp.lock();
                pdata.connections.iter().for_each(&mut consider);
                for shp in pdata.direct.iter() {
                    let sdata = shp.lock();
                    if let Some(hc) = sdata.connections.first() {
                        consider(hc);
                    }
                }
            }
        }

        match best {
            Some((_, hc)) if hc.mark_closing() => Some(hc),
            _ => None,
        }
    }

    pub fn compact(&self) {
        let removed = {
            let mut table = self.table();
            let mut removed = Vec::new();
            table.portals.retain(|_, hp| {
                hp.reap(true);
                hp.compact_direct(&self.transport);
                if hp.is_unused() {
                    removed.push(hp.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };

        if !removed.is_empty() {
            debug!(self.log, "compacted host portals"; "removed" => removed.len());
        }
        for hp in removed {
            hp.destroy(&self.transport);
        }
    }

    fn change_all_connections(&self, min_conn: i64, max_conn: i64, dt: Duration) {
        let mut table = self.table();
        table.min_conn = min_conn;
        table.max_conn = max_conn;
        table.dt_connect = dt;
        for hp in table.portals.values() {
            hp.set_limits(min_conn, max_conn, dt);
        }
    }

    fn portal_stats(&self, key: &str) -> Option<PortalStats> {
        let hp = self.table().portals.get(key).cloned();
        hp.map(|hp| hp.stats())
    }

    fn shutdown(&self) {
        let portals: Vec<Arc<HostPortal<T>>> = {
            let mut table = self.table();
            if self.shutting_down.swap(true, Ordering::SeqCst) {
                return;
            }
            table.portals.drain().map(|(_, hp)| hp).collect()
        };
        *self.state.lock().unwrap() = ContextState::Stopping;
        info!(self.log, "portal context shutting down";
            "portals" => portals.len());

        for hp in portals.iter() {
            hp.request_shutdown();
        }
        for hp in portals {
            hp.shutdown(&self.transport);
        }

        *self.state.lock().unwrap() = ContextState::Stopped;
        debug!(self.log, "portal context stopped";
            "running" => self.running_connections());
    }
}

impl<T> Executor for ContextShared<T>
where
    T: Transport,
{
    fn submit(&self, op: Gop) {
        if op.command().is_none() {
            error!(self.log, "{}", Error::MissingCommand; "id" => %op.id());
            return op.mark_completed(OpStatus::ERROR);
        }
        self.transport.submit(Dispatch { ctx: self }, op)
    }
}

/// A connection-pooled executor for operations bound to remote hosts.
///
/// Clones share the same portals and connections. Only the original handle
/// runs the compaction timer and may shut the context down; dropping it
/// shuts the context down.
pub struct PortalContext<T: Transport> {
    shared: Arc<ContextShared<T>>,
    system: GopSystem,
    log: Logger,
    compact_timer: Option<timer::Timer>,
    _compact_timer_guard: Option<Guard>,
}

impl<T> Clone for PortalContext<T>
where
    T: Transport,
{
    fn clone(&self) -> PortalContext<T> {
        PortalContext {
            shared: self.shared.clone(),
            system: self.system.clone(),
            log: self.log.clone(),
            compact_timer: None,
            _compact_timer_guard: None,
        }
    }
}

impl<T> PortalContext<T>
where
    T: Transport,
{
    pub fn new(system: &GopSystem, transport: T, po: PortalOptions) -> Self {
        let config = PortalConfig::from_options(&po);
        let log = po.log.unwrap_or_else(|| system.log().clone());
        let compact_interval = config.compact_interval;

        let shared = Arc::new_cyclic(|me| ContextShared {
            me: me.clone(),
            transport,
            log: log.clone(),
            running_threads: AtomicI64::new(0),
            shutting_down: AtomicBool::new(false),
            state: Mutex::new(ContextState::Running),
            table: Mutex::new(PortalTable {
                portals: HashMap::new(),
                min_conn: config.min_conn,
                max_conn: config.max_conn,
                dt_connect: config.connect_timeout,
            }),
            config,
        });

        let compact_timer = timer::Timer::new();
        let compact_timer_guard = start_compaction(
            &compact_timer,
            compact_interval,
            Arc::downgrade(&shared),
            log.clone(),
        );

        PortalContext {
            shared,
            system: system.clone(),
            log,
            compact_timer: Some(compact_timer),
            _compact_timer_guard: Some(compact_timer_guard),
        }
    }

    /// Create an operation executed by this context. A command without its
    /// own retry budget gets the context's `max_retry`.
    pub fn new_op(&self, mut cmd: CommandOp) -> Gop {
        cmd.default_retry_count(self.shared.config.max_retry);
        let executor: Arc<dyn Executor> = self.shared.clone();
        self.system.new_op(executor, Some(cmd))
    }

    /// Start `op` on a dedicated connection instead of its destination's
    /// shared queue.
    pub fn submit_direct(&self, op: &Gop) {
        op.set_exec_mode(ExecMode::Direct);
        op.start_execution();
    }

    /// Change the connection limits of every host portal, including those
    /// created later. Each portal's stable floor is reset to `max_conn`.
    pub fn change_all_connections(
        &self,
        min_conn: u32,
        max_conn: u32,
        connect_timeout: Duration,
    ) {
        info!(self.log, "changing connection limits";
            "min" => min_conn, "max" => max_conn);
        self.shared.change_all_connections(
            i64::from(min_conn),
            i64::from(max_conn),
            connect_timeout,
        );
    }

    /// Reap exited connections and remove unused host portals.
    pub fn compact(&self) {
        self.shared.compact();
    }

    /// Sort a queue's unstarted children with the transport's ordering.
    pub fn sort_tasks(&self, queue: &Gop) -> Result<(), Error> {
        self.shared.transport.sort_tasks(queue)
    }

    pub fn portal_stats(&self, hostport: &str) -> Option<PortalStats> {
        self.shared.portal_stats(hostport)
    }

    /// The number of connections whose send side is running
    pub fn running_connections(&self) -> i64 {
        self.shared.running_connections()
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn get_state(&self) -> String {
        self.shared.state.lock().unwrap().to_string()
    }

    /// Fail every queued task with `error`, stop every connection and
    /// release every host portal. Blocks until all connection threads have
    /// exited. This function may only be called on the original handle; a
    /// clone gets `Error::ShutdownCalledByClone`.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        if self.compact_timer.is_none() {
            return Err(Error::ShutdownCalledByClone);
        }

        trace!(self.log, "shutdown called by original portal context");
        self._compact_timer_guard.take();
        self.compact_timer.take();
        self.shared.shutdown();
        Ok(())
    }
}

impl<T> Drop for PortalContext<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        // Clones get an Err back and there is nothing more to do for them
        let _ = self.shutdown();
    }
}

fn start_compaction<T>(
    timer: &timer::Timer,
    interval: u64,
    shared: Weak<ContextShared<T>>,
    log: Logger,
) -> Guard
where
    T: Transport,
{
    debug!(log, "starting compaction task, interval {} seconds", interval);
    timer.schedule_repeating(ChronoDuration::seconds(interval as i64), move || {
        if let Some(shared) = shared.upgrade() {
            if !shared.is_shutting_down() {
                trace!(log, "compacting host portals");
                shared.compact();
            }
        }
    })
}
