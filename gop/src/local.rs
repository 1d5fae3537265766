// Copyright 2020 Joyent, Inc.

//! The local executor runs commands on a pool of worker threads without any
//! network connection. It backs synthetic operations such as
//! [`GopSystem::dummy`](../system/struct.GopSystem.html#method.dummy).
//!
//! The pool grows on demand from `min_threads` up to `max_threads` and
//! workers above the minimum exit after sitting idle. A local operation may
//! start and wait for other local operations. Every operation records how
//! deeply it is nested: one submitted from outside the pool has depth 1 and
//! one submitted while a depth `d` operation runs has depth `d + 1`. When
//! every regular worker is busy, a nested operation gets a reserve worker
//! dedicated to its depth, so a chain of waits never runs out of threads as
//! long as it is at most `max_depth` levels deep.

use std::cell::Cell;
use std::cmp;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use slog::{debug, error, trace, Logger};

use crate::command::Command;
use crate::error::Error;
use crate::gop::{Executor, Gop};
use crate::netstream::NetStream;
use crate::status::OpStatus;

/// The default number of workers kept alive while idle
pub const DEFAULT_MIN_THREADS: usize = 1;
/// The default number of regular workers
pub const DEFAULT_MAX_THREADS: usize = 4;
/// The default nesting depth covered by reserve workers
pub const DEFAULT_MAX_DEPTH: usize = 10;
/// The default time in seconds an extra worker waits for work before exiting
pub const DEFAULT_THREAD_IDLE: u64 = 1;

thread_local! {
    // Depth of the local operation running on this thread, 0 outside the pool
    static DEPTH: Cell<usize> = Cell::new(0);
}

/// A command whose receive phase reports a fixed status
#[derive(Clone, Copy, Debug)]
pub struct Immediate(pub OpStatus);

impl Command for Immediate {
    fn recv_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
        self.0
    }
}

/// Sizing of the local worker pool
#[derive(Clone, Copy, Debug)]
pub struct LocalConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub max_depth: usize,
    pub thread_idle: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            min_threads: DEFAULT_MIN_THREADS,
            max_threads: DEFAULT_MAX_THREADS,
            max_depth: DEFAULT_MAX_DEPTH,
            thread_idle: Duration::from_secs(DEFAULT_THREAD_IDLE),
        }
    }
}

/// A snapshot of the local pool
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocalStats {
    /// Regular workers alive
    pub threads: usize,
    /// Regular workers waiting for work
    pub idle: usize,
    /// Reserve workers running nested operations
    pub reserve: usize,
    /// Operations waiting for a worker
    pub queued: usize,
}

struct Job {
    op: Gop,
    depth: usize,
}

struct PoolState {
    jobs: VecDeque<Job>,
    threads: usize,
    idle: usize,
    // Indexed by depth; whether that depth's reserve worker is running
    reserve: Vec<bool>,
    stopping: bool,
    handles: Vec<JoinHandle<()>>,
    next_worker: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
    config: LocalConfig,
    log: Logger,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<PoolState> {
        self.state.lock().unwrap()
    }
}

/// Runs the three command phases of each submitted operation in order on a
/// bounded pool of worker threads.
pub struct LocalExecutor {
    shared: Arc<PoolShared>,
}

impl LocalExecutor {
    pub fn new(config: LocalConfig, log: Logger) -> Result<Self, Error> {
        let max_threads = cmp::max(config.max_threads, 1);
        let config = LocalConfig {
            max_threads,
            min_threads: cmp::min(config.min_threads, max_threads),
            max_depth: cmp::max(config.max_depth, 1),
            ..config
        };
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                threads: 0,
                idle: 0,
                reserve: vec![false; config.max_depth + 1],
                stopping: false,
                handles: Vec::new(),
                next_worker: 0,
            }),
            cond: Condvar::new(),
            config,
            log,
        });

        let started = {
            let mut state = shared.lock();
            (0..config.min_threads)
                .try_for_each(|_| spawn_worker(&shared, &mut state, None))
        };
        if let Err(e) = started {
            shared.lock().stopping = true;
            shared.cond.notify_all();
            return Err(e);
        }
        debug!(shared.log, "local executor started";
            "min_threads" => config.min_threads,
            "max_threads" => config.max_threads,
            "max_depth" => config.max_depth);
        Ok(LocalExecutor { shared })
    }

    pub fn stats(&self) -> LocalStats {
        let state = self.shared.lock();
        LocalStats {
            threads: state.threads,
            idle: state.idle,
            reserve: state.reserve.iter().filter(|r| **r).count(),
            queued: state.jobs.len(),
        }
    }

    /// Stop accepting work and wait for the workers to drain. Operations
    /// submitted afterwards complete with `error`.
    pub fn stop(&self) {
        let handles = {
            let mut state = self.shared.lock();
            state.stopping = true;
            self.shared.cond.notify_all();
            std::mem::take(&mut state.handles)
        };

        let me = thread::current().id();
        for handle in handles {
            // Stopped from one of our own operations; that worker exits once
            // its current operation returns.
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!(self.shared.log, "local worker panicked");
            }
        }

        // Nothing is left to run whatever is still queued
        let orphans: Vec<Job> = {
            let mut state = self.shared.lock();
            let mut orphans = Vec::new();
            if state.threads == 0 {
                orphans.extend(state.jobs.drain(..));
            }
            orphans
        };
        for job in orphans {
            job.op.mark_completed(OpStatus::ERROR);
        }
    }
}

impl Executor for LocalExecutor {
    fn submit(&self, op: Gop) {
        let depth = DEPTH.with(Cell::get) + 1;
        let mut state = self.shared.lock();
        if state.stopping {
            drop(state);
            debug!(self.shared.log, "local executor stopped"; "id" => %op.id());
            op.mark_completed(OpStatus::ERROR);
            return;
        }

        trace!(self.shared.log, "local operation queued";
            "id" => %op.id(), "depth" => depth);
        state.jobs.push_back(Job { op, depth });

        // Each idle worker takes at most one of the queued jobs
        if state.jobs.len() <= state.idle {
            self.shared.cond.notify_one();
            return;
        }

        let config = self.shared.config;
        let spawned = if state.threads < config.max_threads {
            spawn_worker(&self.shared, &mut state, None)
        } else if depth > 1 {
            let level = cmp::min(depth, config.max_depth);
            if state.reserve[level] {
                Ok(())
            } else {
                spawn_worker(&self.shared, &mut state, Some(level))
            }
        } else {
            Ok(())
        };

        if let Err(e) = spawned {
            error!(self.shared.log, "unable to start local worker: {}", e);
            if state.threads == 0 {
                if let Some(job) = state.jobs.pop_back() {
                    drop(state);
                    job.op.mark_completed(OpStatus::ERROR);
                }
            }
        }
    }

    fn supports_sync_exec(&self) -> bool {
        true
    }

    fn sync_exec(&self, op: &Gop) {
        let depth = DEPTH.with(Cell::get) + 1;
        run_at_depth(op, depth, &self.shared.log);
    }
}

impl Drop for LocalExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

// Called with the pool lock held. A reserve worker serves a single depth.
fn spawn_worker(
    shared: &Arc<PoolShared>,
    state: &mut PoolState,
    reserve: Option<usize>,
) -> Result<(), Error> {
    state.handles.retain(|h| !h.is_finished());
    let n = state.next_worker;
    state.next_worker += 1;

    let worker_shared = shared.clone();
    let builder = match reserve {
        Some(level) => {
            thread::Builder::new().name(format!("gop-local-r{}-{}", level, n))
        }
        None => thread::Builder::new().name(format!("gop-local-{}", n)),
    };
    let handle = builder
        .spawn(move || match reserve {
            Some(level) => reserve_worker(&worker_shared, level),
            None => regular_worker(&worker_shared),
        })
        .map_err(Error::SpawnFailure)?;

    match reserve {
        Some(level) => state.reserve[level] = true,
        None => state.threads += 1,
    }
    state.handles.push(handle);
    Ok(())
}

fn regular_worker(shared: &PoolShared) {
    let log = &shared.log;
    trace!(log, "local worker starting");
    let mut state = shared.lock();
    loop {
        if let Some(job) = state.jobs.pop_front() {
            drop(state);
            run_at_depth(&job.op, job.depth, log);
            state = shared.lock();
            continue;
        }
        if state.stopping {
            break;
        }

        state.idle += 1;
        let (guard, wait) = shared
            .cond
            .wait_timeout(state, shared.config.thread_idle)
            .unwrap();
        state = guard;
        state.idle -= 1;

        if wait.timed_out()
            && state.jobs.is_empty()
            && state.threads > shared.config.min_threads
        {
            break;
        }
    }
    state.threads -= 1;
    trace!(log, "local worker exiting");
}

// Runs queued operations at least `level` deep, then exits
fn reserve_worker(shared: &PoolShared, level: usize) {
    let log = &shared.log;
    trace!(log, "reserve worker starting"; "depth" => level);
    let mut state = shared.lock();
    loop {
        let next = state
            .jobs
            .iter()
            .position(|job| job.depth >= level)
            .and_then(|i| state.jobs.remove(i));
        match next {
            Some(job) => {
                drop(state);
                run_at_depth(&job.op, job.depth, log);
                state = shared.lock();
            }
            None => break,
        }
    }
    state.reserve[level] = false;
    trace!(log, "reserve worker exiting"; "depth" => level);
}

fn run_at_depth(op: &Gop, depth: usize, log: &Logger) {
    let outer = DEPTH.with(|d| d.replace(depth));
    run_local(op, log);
    DEPTH.with(|d| d.set(outer));
}

fn run_local(op: &Gop, log: &Logger) {
    let status = match op.command() {
        Some(cmd) => {
            let ns = NetStream::new();
            let handler = cmd.handler();
            cmd.start_clock();
            let mut status = handler.send_command(op, &ns);
            if status.is_success() {
                status = handler.send_phase(op, &ns);
            }
            if status.is_success() {
                status = handler.recv_phase(op, &ns);
            }
            cmd.stop_clock();
            status
        }
        None => OpStatus::SUCCESS,
    };
    trace!(log, "local operation finished";
        "id" => %op.id(), "status" => %status);
    op.mark_completed(status);
}

#[cfg(test)]
mod test {
    use super::*;

    use slog::{o, Drain};

    use crate::command::CommandOp;
    use crate::control::ControlPool;
    use crate::gop::GopId;
    use crate::system::{GopSystem, SystemOptions};

    struct FailsToSend;

    impl Command for FailsToSend {
        fn send_command(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
            OpStatus::DEAD
        }

        fn recv_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
            panic!("receive phase must not run after a failed send");
        }
    }

    // Waits for a chain of `levels` further local operations
    struct Nested {
        sys: GopSystem,
        levels: usize,
    }

    impl Command for Nested {
        fn recv_phase(&self, _op: &Gop, _ns: &NetStream) -> OpStatus {
            if self.levels == 0 {
                return self.sys.dummy(OpStatus::SUCCESS).wait_all();
            }
            let child = self.sys.new_local_op(CommandOp::new(
                "local:0",
                Nested {
                    sys: self.sys.clone(),
                    levels: self.levels - 1,
                },
            ));
            child.wait_all()
        }
    }

    fn small_system(max_threads: usize) -> GopSystem {
        GopSystem::new(SystemOptions {
            min_threads: Some(1),
            max_threads: Some(max_threads),
            ..SystemOptions::default()
        })
    }

    #[test]
    fn stopped_executor_fails_ops() {
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        let pool = ControlPool::new(2);
        let exec =
            Arc::new(LocalExecutor::new(LocalConfig::default(), log.clone()).unwrap());

        let op = Gop::new_op(
            GopId::from(1),
            pool.reserve(),
            exec.clone(),
            Some(CommandOp::new("local:0", FailsToSend)),
            log.clone(),
        );
        assert_eq!(op.wait_all(), OpStatus::DEAD);
        assert!(op.exec_time().is_some());

        exec.stop();
        assert_eq!(exec.stats().threads, 0);
        let late = Gop::new_op(
            GopId::from(2),
            pool.reserve(),
            exec,
            Some(CommandOp::new("local:0", Immediate(OpStatus::SUCCESS))),
            log,
        );
        assert_eq!(late.wait_all(), OpStatus::ERROR);
    }

    #[test]
    fn nested_ops_run_on_a_single_worker_pool() {
        let sys = small_system(1);
        let op = sys.new_local_op(CommandOp::new(
            "local:0",
            Nested {
                sys: sys.clone(),
                levels: 3,
            },
        ));
        assert_eq!(op.wait_all_timeout(10), OpStatus::SUCCESS);
        assert!(sys.local_stats().threads <= 1);
        sys.shutdown();
    }

    #[test]
    fn busy_pool_shares_one_reserve_per_depth() {
        let sys = small_system(2);
        let q = sys.new_queue();
        for _ in 0..6 {
            q.add(&sys.new_local_op(CommandOp::new(
                "local:0",
                Nested {
                    sys: sys.clone(),
                    levels: 1,
                },
            )))
            .unwrap();
        }
        assert_eq!(q.wait_all_timeout(10), OpStatus::SUCCESS);
        assert_eq!(q.tasks_finished(), 6);

        let stats = sys.local_stats();
        assert!(stats.threads <= 2);
        assert_eq!(stats.queued, 0);
        sys.shutdown();
    }

    #[test]
    fn extra_workers_exit_when_idle() {
        let sys = GopSystem::new(SystemOptions {
            min_threads: Some(1),
            max_threads: Some(3),
            thread_idle: Some(1),
            ..SystemOptions::default()
        });
        let q = sys.new_queue();
        for _ in 0..3 {
            q.add(&sys.new_local_op(CommandOp::new(
                "local:0",
                Nested {
                    sys: sys.clone(),
                    levels: 0,
                },
            )))
            .unwrap();
        }
        assert_eq!(q.wait_all(), OpStatus::SUCCESS);

        thread::sleep(Duration::from_secs(3));
        assert_eq!(sys.local_stats().threads, 1);
        sys.shutdown();
    }
}
