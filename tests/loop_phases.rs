use evloop::{EventLoop, RunMode};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn prepare_runs_before_check() {
    let mut lp = EventLoop::new().expect("create loop");
    let order = Rc::new(RefCell::new(Vec::new()));

    let prepare = lp.prepare_init().expect("prepare handle");
    {
        let order = order.clone();
        lp.prepare_start(prepare, move |lp, h| {
            order.borrow_mut().push("prepare");
            lp.prepare_stop(h).unwrap();
        })
        .expect("start prepare");
    }

    let check = lp.check_init().expect("check handle");
    {
        let order = order.clone();
        lp.check_start(check, move |lp, h| {
            order.borrow_mut().push("check");
            lp.check_stop(h).unwrap();
        })
        .expect("start check");
    }

    lp.run(RunMode::NoWait);
    assert_eq!(&*order.borrow(), &["prepare", "check"]);
}

#[test]
fn idle_fires_every_iteration() {
    let mut lp = EventLoop::new().expect("create loop");
    let count = Rc::new(Cell::new(0u32));

    let idle = lp.idle_init().expect("idle handle");
    {
        let count = count.clone();
        lp.idle_start(idle, move |lp, h| {
            count.set(count.get() + 1);
            if count.get() == 5 {
                lp.idle_stop(h).unwrap();
            }
        })
        .expect("start idle");
    }

    assert!(!lp.run(RunMode::Default));
    assert_eq!(count.get(), 5);
}

#[test]
fn close_callback_fires_once_in_a_later_iteration() {
    let mut lp = EventLoop::new().expect("create loop");
    let closed = Rc::new(Cell::new(0u32));

    let timer = lp.timer_init().expect("timer handle");
    lp.timer_start(timer, 60_000, 0, |_, _| {}).expect("start");

    {
        let closed = closed.clone();
        lp.close_with(timer, move |_, _| closed.set(closed.get() + 1))
            .expect("close");
    }
    // Closing is idempotent; the second callback never fires.
    lp.close_with(timer, |_, _| panic!("second close callback"))
        .expect("second close is a no-op");

    assert_eq!(closed.get(), 0, "close callback must not fire synchronously");

    // The iteration that requested the close does not finalize it.
    let more = lp.run(RunMode::Once);
    assert!(more, "close still pending");
    assert_eq!(closed.get(), 0);

    lp.run(RunMode::Once);
    assert_eq!(closed.get(), 1);
}

#[test]
fn unref_lets_the_loop_exit() {
    let mut lp = EventLoop::new().expect("create loop");

    let timer = lp.timer_init().expect("timer handle");
    lp.timer_start(timer, 60_000, 0, |_, _| panic!("must not fire"))
        .expect("start");
    lp.unref_handle(timer).expect("unref");

    assert!(!lp.run(RunMode::Default), "nothing keeps the loop alive");
}

#[test]
fn stop_breaks_a_default_run() {
    let mut lp = EventLoop::new().expect("create loop");
    let count = Rc::new(Cell::new(0u32));

    let idle = lp.idle_init().expect("idle handle");
    {
        let count = count.clone();
        lp.idle_start(idle, move |lp, _| {
            count.set(count.get() + 1);
            if count.get() == 3 {
                lp.stop();
            }
        })
        .expect("start idle");
    }

    assert!(lp.run(RunMode::Default), "idle handle still active");
    assert_eq!(count.get(), 3);
}

#[test]
fn fresh_loop_has_nothing_to_do() {
    let mut lp = EventLoop::new().expect("create loop");
    assert!(!lp.alive());
    assert!(!lp.run(RunMode::Default));
    assert!(!lp.run(RunMode::NoWait));
}
