use evloop::{EventLoop, RunMode};

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn sends_before_an_iteration_coalesce_into_one_callback() {
    let mut lp = EventLoop::new().expect("create loop");
    let fired = Rc::new(Cell::new(0u32));

    let async_h = {
        let fired = fired.clone();
        lp.async_init(move |_, _| fired.set(fired.get() + 1))
            .expect("async handle")
    };
    let sender = lp.async_sender(async_h).expect("sender");

    for _ in 0..1000 {
        sender.send();
    }

    lp.run(RunMode::NoWait);
    assert_eq!(fired.get(), 1, "a burst of sends coalesces into one callback");

    lp.close(async_h).expect("close async handle");
    assert!(!lp.run(RunMode::Default));
}

#[test]
fn hammered_sender_wakes_the_loop_and_the_final_send_is_observed() {
    const SENDS: u64 = 1_000_000;

    let mut lp = EventLoop::new().expect("create loop");
    let fired = Rc::new(Cell::new(0u64));
    let finished = Arc::new(AtomicBool::new(false));

    let async_h = {
        let fired = fired.clone();
        let finished = finished.clone();
        lp.async_init(move |lp, h| {
            fired.set(fired.get() + 1);
            if finished.load(Ordering::Acquire) {
                lp.close(h).expect("close async handle");
            }
        })
        .expect("async handle")
    };
    let sender = lp.async_sender(async_h).expect("sender");

    let producer = {
        let finished = finished.clone();
        thread::spawn(move || {
            for _ in 0..SENDS {
                sender.send();
            }
            finished.store(true, Ordering::Release);
            // The loop observes at least this final send.
            sender.send();
        })
    };

    assert!(!lp.run(RunMode::Default), "loop exits after the async handle closes");
    producer.join().expect("producer thread");

    assert!(fired.get() >= 1);
    assert!(fired.get() <= SENDS + 1, "callback fired more often than sends");
}

#[test]
fn async_handle_keeps_the_loop_alive_until_closed() {
    let mut lp = EventLoop::new().expect("create loop");
    let async_h = lp.async_init(|_, _| {}).expect("async handle");

    assert!(lp.alive());
    assert!(lp.run(RunMode::NoWait), "idle async handle keeps the loop ready");

    lp.close(async_h).expect("close");
    assert!(!lp.run(RunMode::Default));
}

#[test]
fn sender_outlives_the_loop_without_harm() {
    let mut lp = EventLoop::new().expect("create loop");
    let async_h = lp.async_init(|_, _| {}).expect("async handle");
    let sender = lp.async_sender(async_h).expect("sender");

    drop(lp);
    sender.send();
    sender.send();
}
