use anyhow::bail;
use forkserver::{ForkServer, Registry, SpawnRequest, Value};
use nix::{
    fcntl::{fcntl, FcntlArg},
    unistd::Uid,
};
use std::{
    fs::File,
    io::{self, Read, Write},
};

/// Spawning workers creates user namespaces and writes their id maps, which
/// needs root. Tests that exercise the full spawn path are skipped without
/// it.
macro_rules! require_root {
    () => {
        if !Uid::effective().is_root() {
            eprintln!("skipping: requires root");
            return;
        }
    };
}

/// Workers inherit the harness's thread-local output capture across the
/// fork and clone, and the `print!` macros honor it. Entry functions must
/// write through the handle to reach the redirected descriptor.
fn write_stdout(s: &str) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(s.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn add_and_print(args: &[Value]) -> anyhow::Result<()> {
    let mut sum = 0i64;
    for arg in args {
        match arg {
            Value::Int(i) => sum += i,
            other => bail!("expected integer argument, got {other:?}"),
        }
    }
    write_stdout(&sum.to_string())
}

fn fail(_args: &[Value]) -> anyhow::Result<()> {
    bail!("entry exploded")
}

fn panic_entry(_args: &[Value]) -> anyhow::Result<()> {
    panic!("boom")
}

/// Print the numbers of all open file descriptors. After sandboxing the
/// worker must hold nothing but its redirected stdout and stderr.
fn probe_fds(_args: &[Value]) -> anyhow::Result<()> {
    let mut open = Vec::new();
    for fd in 0..64 {
        if fcntl(fd, FcntlArg::F_GETFD).is_ok() {
            open.push(fd.to_string());
        }
    }
    write_stdout(&open.join(","))
}

fn loader() -> Registry {
    Registry::new()
        .with_module("math_helpers")
        .with_entry("math_helpers.add", add_and_print)
        .with_entry("worker.fail", fail)
        .with_entry("worker.panic", panic_entry)
        .with_entry("worker.probe_fds", probe_fds)
}

fn read_all(fd: std::os::unix::prelude::OwnedFd) -> String {
    let mut buf = String::new();
    File::from(fd).read_to_string(&mut buf).expect("read");
    buf
}

#[test]
fn spawn_adds_and_captures_stdout() {
    require_root!();

    let loader = loader();
    let mut server = ForkServer::start(&loader, "math_helpers.add").expect("start");
    server
        .import_modules(vec!["math_helpers".into()])
        .expect("import");

    let worker = server
        .spawn(SpawnRequest::new(
            "worker-1",
            vec![Value::Int(2), Value::Int(3)],
        ))
        .expect("spawn");
    assert!(worker.pid > 0);

    let status = worker.wait().expect("wait");
    assert!(status.success(), "unexpected status {status}");
    assert_eq!(read_all(worker.stdout), "5");
    assert_eq!(read_all(worker.stderr), "");

    assert!(server.shutdown().expect("shutdown").success());
}

#[test]
fn sequential_spawns_report_distinct_pids_in_order() {
    require_root!();

    let loader = loader();
    let mut server = ForkServer::start(&loader, "math_helpers.add").expect("start");
    server
        .import_modules(vec!["math_helpers".into()])
        .expect("import");

    let cases = [(1i64, 2i64, "3"), (10, 20, "30"), (100, 200, "300")];
    let mut workers = Vec::new();
    for (i, (a, b, _)) in cases.iter().enumerate() {
        let worker = server
            .spawn(SpawnRequest::new(
                format!("worker-{i}"),
                vec![Value::Int(*a), Value::Int(*b)],
            ))
            .expect("spawn");
        workers.push(worker);
    }

    let mut pids = workers.iter().map(|w| w.pid).collect::<Vec<_>>();
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), cases.len(), "pids must be distinct");

    for (worker, (_, _, expected)) in workers.into_iter().zip(cases) {
        assert!(worker.wait().expect("wait").success());
        assert_eq!(read_all(worker.stdout), expected);
    }

    assert!(server.shutdown().expect("shutdown").success());
}

#[test]
fn failing_entry_exits_one_with_trace() {
    require_root!();

    let loader = loader();
    let mut server = ForkServer::start(&loader, "worker.fail").expect("start");
    server.import_modules(vec![]).expect("import");

    let worker = server
        .spawn(SpawnRequest::new("worker-fail", vec![]))
        .expect("spawn");

    let status = worker.wait().expect("wait");
    assert_eq!(status.code(), Some(forkserver::ExitStatus::ENTRY_FAILED));

    let stderr = read_all(worker.stderr);
    assert!(
        stderr.contains("entry exploded"),
        "missing trace in {stderr:?}"
    );
    assert_eq!(read_all(worker.stdout), "");

    assert!(server.shutdown().expect("shutdown").success());
}

#[test]
fn panicking_entry_exits_one() {
    require_root!();

    let loader = loader();
    let mut server = ForkServer::start(&loader, "worker.panic").expect("start");
    server.import_modules(vec![]).expect("import");

    let worker = server
        .spawn(SpawnRequest::new("worker-panic", vec![]))
        .expect("spawn");

    let status = worker.wait().expect("wait");
    assert_eq!(status.code(), Some(forkserver::ExitStatus::ENTRY_FAILED));
    assert!(read_all(worker.stderr).contains("boom"));

    assert!(server.shutdown().expect("shutdown").success());
}

#[test]
fn worker_sees_only_captured_streams() {
    require_root!();

    let loader = loader();
    let mut server = ForkServer::start(&loader, "worker.probe_fds").expect("start");
    server.import_modules(vec![]).expect("import");

    let worker = server
        .spawn(SpawnRequest::new("worker-probe", vec![]))
        .expect("spawn");

    assert!(worker.wait().expect("wait").success());
    // Stdin was closed in the fork-server, the session socket and pipe ends
    // inside the worker; only the redirected output streams remain.
    assert_eq!(read_all(worker.stdout), "1,2");

    assert!(server.shutdown().expect("shutdown").success());
}

#[test]
fn shutdown_without_spawn_is_clean() {
    let loader = loader();
    let mut server = ForkServer::start(&loader, "math_helpers.add").expect("start");
    server
        .import_modules(vec!["math_helpers".into()])
        .expect("import");

    let status = server.shutdown().expect("shutdown");
    assert!(status.success(), "unexpected status {status}");
}

#[test]
fn unknown_import_kills_session() {
    let loader = loader();
    let mut server = ForkServer::start(&loader, "math_helpers.add").expect("start");
    server
        .import_modules(vec!["does_not_exist".into()])
        .expect("send import");

    // The fork-server cannot safely proceed without the imports every worker
    // needs. The session is gone; the next request fails.
    let result = server.spawn(SpawnRequest::new("worker-1", vec![]));
    assert!(result.is_err());
    assert_eq!(server.shutdown().expect("shutdown").code(), Some(1));
}

#[test]
fn unresolvable_entry_kills_session() {
    let loader = loader();
    let mut server = ForkServer::start(&loader, "no.such.entry").expect("start");
    // Startup already failed inside the fork-server; the session observes it
    // on the first exchange.
    let _ = server.import_modules(vec![]);
    let result = server.spawn(SpawnRequest::new("worker-1", vec![]));
    assert!(result.is_err());
    assert_eq!(server.shutdown().expect("shutdown").code(), Some(1));
}
