use evloop::{kill_pid, Error, EventLoop, RunMode, SpawnOptions, Stdio};

use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn spawn_captures_stdout_then_eof_then_exit() {
    let mut lp = EventLoop::new().expect("create loop");

    let options = SpawnOptions::new("sh")
        .arg("-c")
        .arg("echo hi")
        .stdio(Stdio::Ignore)
        .stdio(Stdio::Pipe)
        .stdio(Stdio::Ignore);

    let events = Rc::new(RefCell::new(Vec::<String>::new()));
    let output = Rc::new(RefCell::new(Vec::<u8>::new()));

    let (child, pipes) = {
        let events = events.clone();
        lp.spawn(options, move |lp, child, status, signal| {
            events.borrow_mut().push(format!("exit:{status}:{signal}"));
            lp.close(child).expect("close process handle");
        })
        .expect("spawn")
    };
    assert!(lp.process_pid(child).expect("pid") > 0);

    let stdout = pipes[1].expect("stdout pipe");
    {
        let events = events.clone();
        let output = output.clone();
        lp.read_start(
            stdout,
            |_, _, suggested| vec![0; suggested],
            move |lp, stdout, res| match res {
                Ok(chunk) => output.borrow_mut().extend(chunk),
                Err(Error::Eof) => {
                    events.borrow_mut().push("eof".into());
                    lp.close(stdout).expect("close stdout pipe");
                }
                Err(err) => panic!("stdout read failed: {err}"),
            },
        )
        .expect("read_start");
    }

    assert!(!lp.run(RunMode::Default));

    assert_eq!(&*output.borrow(), b"hi\n");
    let events = events.borrow();
    assert!(events.contains(&"eof".to_string()), "events: {events:?}");
    assert!(events.contains(&"exit:0:0".to_string()), "events: {events:?}");
}

#[test]
fn kill_probe_tracks_child_liveness() {
    let mut lp = EventLoop::new().expect("create loop");

    let options = SpawnOptions::new("sleep").arg("10");
    let (child, _pipes) = lp
        .spawn(options, |lp, child, _status, signal| {
            assert_eq!(signal, libc_sigkill());
            lp.close(child).expect("close process handle");
        })
        .expect("spawn");

    let pid = lp.process_pid(child).expect("pid");
    assert_eq!(kill_pid(pid, 0), Ok(()), "probe of a live child");

    lp.process_kill(child, libc_sigkill()).expect("kill");
    assert!(!lp.run(RunMode::Default));

    // Reaped: the probe now fails.
    assert_eq!(kill_pid(pid, 0), Err(Error::Srch));
}

fn libc_sigkill() -> i32 {
    9
}

#[test]
fn spawn_reports_a_missing_program_synchronously() {
    let mut lp = EventLoop::new().expect("create loop");

    let options = SpawnOptions::new("/definitely/not/a/real/program");
    let err = lp
        .spawn(options, |_, _, _, _| panic!("exit callback for a spawn that failed"))
        .unwrap_err();

    assert_eq!(err, Error::NoEnt);
    assert!(!lp.run(RunMode::Default), "failed spawn leaves nothing behind");
}

#[test]
fn exit_callback_fires_exactly_once_per_child() {
    let mut lp = EventLoop::new().expect("create loop");
    let exits = Rc::new(RefCell::new(Vec::<i64>::new()));

    for code in [0i64, 3, 7] {
        let exits = exits.clone();
        let options = SpawnOptions::new("sh").arg("-c").arg(format!("exit {code}"));
        lp.spawn(options, move |lp, child, status, _signal| {
            exits.borrow_mut().push(status);
            lp.close(child).expect("close process handle");
        })
        .expect("spawn");
    }

    assert!(!lp.run(RunMode::Default));

    let mut exits = exits.borrow().clone();
    exits.sort_unstable();
    assert_eq!(exits, vec![0, 3, 7]);
}
