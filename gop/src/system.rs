// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, o, Drain, Logger};

use crate::command::CommandOp;
use crate::control::{ControlPool, ControlPoolStats};
use crate::error::Error;
use crate::gop::{Executor, Gop, GopId, GopState};
use crate::local::{
    Immediate, LocalConfig, LocalExecutor, LocalStats, DEFAULT_MAX_DEPTH,
    DEFAULT_MAX_THREADS, DEFAULT_MIN_THREADS, DEFAULT_THREAD_IDLE,
};
use crate::status::OpStatus;

/// The number of control blocks created up front unless configured otherwise
pub const DEFAULT_CONTROL_BLOCKS: usize = 64;

/// Options for a [`GopSystem`](struct.GopSystem.html)
#[derive(Clone, Debug, Default)]
pub struct SystemOptions {
    /// Control blocks to preallocate. Defaults to
    /// [`DEFAULT_CONTROL_BLOCKS`](constant.DEFAULT_CONTROL_BLOCKS.html).
    pub control_blocks: Option<usize>,
    /// Local workers kept alive while idle. Defaults to
    /// [`DEFAULT_MIN_THREADS`](../local/constant.DEFAULT_MIN_THREADS.html).
    pub min_threads: Option<usize>,
    /// Regular local workers. Defaults to
    /// [`DEFAULT_MAX_THREADS`](../local/constant.DEFAULT_MAX_THREADS.html).
    pub max_threads: Option<usize>,
    /// How deeply local operations may wait on each other before they
    /// share a reserve worker. Defaults to
    /// [`DEFAULT_MAX_DEPTH`](../local/constant.DEFAULT_MAX_DEPTH.html).
    pub max_depth: Option<usize>,
    /// Seconds an extra local worker waits for work before exiting
    pub thread_idle: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard library logging
    /// functionality.
    pub log: Option<Logger>,
}

struct SystemInner {
    pool: Arc<ControlPool<GopState>>,
    next_id: AtomicU64,
    local: Arc<LocalExecutor>,
    log: Logger,
}

/// The runtime's shared state: the control block pool, the operation id
/// source and the local executor. Every operation and portal context is
/// created from a `GopSystem`. Clones share the same state.
#[derive(Clone)]
pub struct GopSystem {
    inner: Arc<SystemInner>,
}

impl GopSystem {
    /// Create a new system.
    ///
    /// # Panics
    ///
    /// Panics if the local executor's worker thread cannot be spawned. Use
    /// [`try_new`](#method.try_new) to handle that case.
    pub fn new(options: SystemOptions) -> Self {
        match Self::try_new(options) {
            Ok(system) => system,
            Err(e) => panic!("unable to start gop system: {}", e),
        }
    }

    pub fn try_new(options: SystemOptions) -> Result<Self, Error> {
        let log = options.log.unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        let blocks = options.control_blocks.unwrap_or(DEFAULT_CONTROL_BLOCKS);
        let local = LocalExecutor::new(
            LocalConfig {
                min_threads: options.min_threads.unwrap_or(DEFAULT_MIN_THREADS),
                max_threads: options.max_threads.unwrap_or(DEFAULT_MAX_THREADS),
                max_depth: options.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
                thread_idle: Duration::from_secs(
                    options.thread_idle.unwrap_or(DEFAULT_THREAD_IDLE),
                ),
            },
            log.new(o!("executor" => "local")),
        )?;

        debug!(log, "gop system started"; "control_blocks" => blocks);
        Ok(GopSystem {
            inner: Arc::new(SystemInner {
                pool: ControlPool::new(blocks),
                next_id: AtomicU64::new(1),
                local: Arc::new(local),
                log,
            }),
        })
    }

    fn next_id(&self) -> GopId {
        GopId::from(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn new_queue(&self) -> Gop {
        Gop::new_queue(
            self.next_id(),
            self.inner.pool.reserve(),
            self.inner.log.clone(),
        )
    }

    /// Create a single operation executed by `executor`.
    pub fn new_op(
        &self,
        executor: Arc<dyn Executor>,
        cmd: Option<CommandOp>,
    ) -> Gop {
        Gop::new_op(
            self.next_id(),
            self.inner.pool.reserve(),
            executor,
            cmd,
            self.inner.log.clone(),
        )
    }

    /// Create an operation run by the local executor.
    pub fn new_local_op(&self, cmd: CommandOp) -> Gop {
        self.new_op(self.inner.local.clone(), Some(cmd))
    }

    /// Create an operation that completes with `status` as soon as it is
    /// started.
    pub fn dummy(&self, status: OpStatus) -> Gop {
        self.new_local_op(CommandOp::new("local:0", Immediate(status)))
    }

    pub fn control_stats(&self) -> ControlPoolStats {
        self.inner.pool.stats()
    }

    pub fn local_stats(&self) -> LocalStats {
        self.inner.local.stats()
    }

    pub fn log(&self) -> &Logger {
        &self.inner.log
    }

    /// Stop the local executor. Local operations submitted afterwards
    /// complete with `error`.
    pub fn shutdown(&self) {
        debug!(self.inner.log, "gop system shutting down");
        self.inner.local.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dummy_ops_complete_with_their_status() {
        let sys = GopSystem::new(SystemOptions {
            control_blocks: Some(4),
            ..SystemOptions::default()
        });
        let ok = sys.dummy(OpStatus::SUCCESS);
        let bad = sys.dummy(OpStatus::INVALID_HOST);
        assert_ne!(ok.id(), bad.id());
        assert_eq!(sys.control_stats().reserved, 2);

        assert!(ok.sync_exec());
        assert_eq!(bad.sync_exec_status(), OpStatus::INVALID_HOST);
        assert_eq!(sys.control_stats().reserved, 0);

        sys.shutdown();
        assert_eq!(sys.dummy(OpStatus::SUCCESS).wait_all(), OpStatus::ERROR);
    }
}
