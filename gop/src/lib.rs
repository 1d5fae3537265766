// Copyright 2020 Joyent, Inc.

//! An asynchronous operation runtime with per-destination connection pooling
//!
//! Gop is a library for issuing many small network commands against many
//! hosts and waiting for them as a group. Work is described by *operations*
//! (a [`Gop`](gop/struct.Gop.html)): either a single command bound for one
//! `host:port` destination, or a *queue* that aggregates other operations.
//! Operations are executed by a [`PortalContext`](portal/struct.PortalContext.html)
//! which keeps a small, self-regulating pool of connections per destination
//! and pipelines commands over them.
//!
//! The library relies on two traits supplied by the user: the
//! [`Transport`](portal/trait.Transport.html) trait and the
//! [`Command`](command/trait.Command.html) trait.
//!
//! ## Transports
//!
//! A *transport* knows how to open and close a connection to a destination.
//! Its `connect` function receives an empty
//! [`NetStream`](netstream/struct.NetStream.html) and attaches the read and
//! write halves of whatever it connected. A transport may also route
//! submitted operations differently, order the children of a queue before
//! they start, or decide how destination names are resolved.
//!
//! ## Commands
//!
//! A *command* is the protocol side of a single operation. It is split into
//! three phases: `send_command` and `send_phase` run on a connection's send
//! thread, and `recv_phase` runs later on the same connection's receive
//! thread. Because the two threads run independently, a connection keeps
//! several commands in flight at once and receives their results in the
//! order they were sent.
//!
//! Each command is wrapped in a [`CommandOp`](command/struct.CommandOp.html)
//! carrying the destination, a *workload* (an abstract cost, typically a
//! byte count), a timeout and a retry budget. Two further hooks run while
//! the command sits in its destination's queue and may *coalesce* queued
//! neighbours into it; coalesced operations complete together with the
//! operation that absorbed them.
//!
//! ## Queues
//!
//! A queue completes whenever none of its children are left running. It
//! succeeds only if every child succeeded. Adding a child to a completed
//! queue reopens it, so a caller may keep a fixed window of work in flight by
//! adding a new child each time `wait_any` hands one back. Callers may wait
//! for the whole queue, take children one at a time as they finish, walk the
//! failed children, or install a failure callback that resubmits failed work
//! before the queue gives up.
//!
//! ## Host portals
//!
//! Every destination gets a *host portal* holding a FIFO queue of tasks and
//! the connections draining it. The portal opens roughly one connection per
//! `max_workload` worth of queued and executing work, between
//! `min_connections` and `max_connections_per_host`. Growth is damped: after
//! a connection dies the portal only grows by one connection per
//! `wait_stable_time`. A connection whose command reports a dead connection
//! puts that command and everything it still had in flight back at the front
//! of the queue, charging the failing command one retry.
//!
//! When the total number of connections across all destinations reaches
//! `max_connections`, the least loaded connection is closed before a new one
//! is opened.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use gop::command::{Command, CommandOp};
//! use gop::netstream::NetStream;
//! use gop::portal::{PortalContext, PortalOptions};
//! use gop::status::OpStatus;
//! use gop::system::{GopSystem, SystemOptions};
//! use gop_tcp_transport::{LineCommand, TcpTransport};
//!
//! let system = GopSystem::new(SystemOptions::default());
//! let ctx = PortalContext::new(
//!     &system,
//!     TcpTransport::default(),
//!     PortalOptions::default(),
//! );
//!
//! let q = system.new_queue();
//! for i in 0..100 {
//!     let cmd = CommandOp::new("127.0.0.1:7777", LineCommand::new(format!("ping {}", i)))
//!         .timeout(Duration::from_secs(5));
//!     q.add(&ctx.new_op(cmd))?;
//! }
//! q.finished_submission()?;
//!
//! if q.wait_all() != OpStatus::SUCCESS {
//!     while let Some(failed) = q.next_failed() {
//!         println!("{} failed: {}", failed.id(), failed.status());
//!     }
//! }
//! ```

pub mod command;
pub mod control;
pub mod error;
pub mod gop;
pub mod local;
pub mod netstream;
pub mod portal;
pub mod status;
pub mod system;
