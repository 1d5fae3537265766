// Copyright 2020 Joyent, Inc.

// Pipelines a batch of line commands to a local echo server and reports the
// queue's progress as tasks finish.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use slog::{info, o, warn, Drain, Logger};

use gop::command::CommandOp;
use gop::portal::{PortalContext, PortalOptions};
use gop::system::{GopSystem, SystemOptions};
use gop_tcp_transport::{LineCommand, TcpTransport};

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let hostport = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for conn in listener.incoming().flatten() {
            thread::spawn(move || {
                let mut writer = conn.try_clone().unwrap();
                for line in BufReader::new(conn).lines().flatten() {
                    if writeln!(writer, "{}", line.to_uppercase()).is_err() {
                        break;
                    }
                }
            });
        }
    });

    let system = GopSystem::new(SystemOptions {
        control_blocks: Some(128),
        log: Some(log.clone()),
        ..SystemOptions::default()
    });
    let mut ctx = PortalContext::new(
        &system,
        TcpTransport::new(Some(log.clone())).read_timeout(Duration::from_secs(5)),
        PortalOptions {
            max_workload: Some(16),
            max_connections_per_host: Some(3),
            log: Some(log.clone()),
            ..PortalOptions::default()
        },
    );

    let q = system.new_queue();
    for i in 0..100 {
        let cmd = CommandOp::new(&hostport, LineCommand::new(format!("ping {}", i)));
        q.add(&ctx.new_op(cmd)).unwrap();
    }
    q.finished_submission().unwrap();
    q.start_execution();

    while let Some(op) = q.wait_any() {
        if !op.completed_successfully() {
            warn!(log, "task failed"; "id" => %op.id(), "status" => %op.status());
        }
    }

    info!(log, "queue finished";
        "status" => %q.status(),
        "failed" => q.tasks_failed(),
        "stats" => ?ctx.portal_stats(&hostport));

    ctx.shutdown().unwrap();
}
