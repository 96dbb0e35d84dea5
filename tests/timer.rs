use evloop::{EventLoop, RunMode};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn one_shot_timer_fires_once_and_drains_the_loop() {
    let mut lp = EventLoop::new().expect("create loop");
    let fired = Rc::new(Cell::new(0u32));

    let timer = lp.timer_init().expect("timer handle");
    {
        let fired = fired.clone();
        lp.timer_start(timer, 50, 0, move |_, _| fired.set(fired.get() + 1))
            .expect("start timer");
    }

    let start = Instant::now();
    let more = lp.run(RunMode::Default);

    assert!(!more, "loop must drain after the only timer fired");
    assert_eq!(fired.get(), 1);
    assert!(
        start.elapsed() >= Duration::from_millis(50),
        "timer fired early: {:?}",
        start.elapsed()
    );
}

#[test]
fn repeating_timer_keeps_its_period() {
    let mut lp = EventLoop::new().expect("create loop");
    let fire_times = Rc::new(RefCell::new(Vec::new()));

    let timer = lp.timer_init().expect("timer handle");
    {
        let fire_times = fire_times.clone();
        lp.timer_start(timer, 50, 50, move |lp, h| {
            fire_times.borrow_mut().push(Instant::now());
            if fire_times.borrow().len() == 3 {
                lp.timer_stop(h).unwrap();
            }
        })
        .expect("start timer");
    }

    lp.run(RunMode::Default);

    let fire_times = fire_times.borrow();
    assert_eq!(fire_times.len(), 3);
    for pair in fire_times.windows(2) {
        let gap = pair[1] - pair[0];
        // Millisecond clock granularity allows a hair under the period.
        assert!(gap >= Duration::from_millis(45), "interval too short: {gap:?}");
    }
}

#[test]
fn zero_timeout_timer_started_in_a_callback_waits_for_the_next_iteration() {
    let mut lp = EventLoop::new().expect("create loop");

    // An unref'd prepare handle counts iterations without keeping the
    // loop alive.
    let iterations = Rc::new(Cell::new(0u64));
    let prepare = lp.prepare_init().expect("prepare handle");
    {
        let iterations = iterations.clone();
        lp.prepare_start(prepare, move |_, _| iterations.set(iterations.get() + 1))
            .expect("start prepare");
    }
    lp.unref_handle(prepare).expect("unref prepare");

    let started_at = Rc::new(Cell::new(0u64));
    let fired_at = Rc::new(Cell::new(0u64));

    let outer = lp.timer_init().expect("outer timer");
    let inner = lp.timer_init().expect("inner timer");
    {
        let iterations_outer = iterations.clone();
        let iterations_inner = iterations.clone();
        let started_at = started_at.clone();
        let fired_at = fired_at.clone();
        lp.timer_start(outer, 10, 0, move |lp, _| {
            started_at.set(iterations_outer.get());
            let fired_at = fired_at.clone();
            let iterations_inner = iterations_inner.clone();
            lp.timer_start(inner, 0, 0, move |_, _| {
                fired_at.set(iterations_inner.get());
            })
            .expect("start inner timer");
        })
        .expect("start outer timer");
    }

    lp.run(RunMode::Default);

    assert!(fired_at.get() > started_at.get(), "zero-timeout timer must not fire in the iteration that started it");
}

#[test]
fn stopped_timer_never_fires() {
    let mut lp = EventLoop::new().expect("create loop");

    let timer = lp.timer_init().expect("timer handle");
    lp.timer_start(timer, 20, 0, |_, _| panic!("stopped timer fired"))
        .expect("start timer");
    lp.timer_stop(timer).expect("stop timer");

    assert!(!lp.run(RunMode::Default));
}

#[test]
fn timer_again_rearms_with_the_repeat_interval() {
    let mut lp = EventLoop::new().expect("create loop");
    let fired = Rc::new(Cell::new(false));

    let timer = lp.timer_init().expect("timer handle");
    {
        let fired = fired.clone();
        lp.timer_start(timer, 60_000, 10, move |lp, h| {
            fired.set(true);
            lp.timer_stop(h).unwrap();
        })
        .expect("start timer");
    }
    lp.timer_stop(timer).expect("stop");
    lp.timer_again(timer).expect("again");

    let start = Instant::now();
    lp.run(RunMode::Default);

    assert!(fired.get());
    assert!(start.elapsed() < Duration::from_secs(10), "again must use the repeat interval, not the original timeout");
}

#[test]
fn timer_again_requires_a_repeat_interval() {
    let mut lp = EventLoop::new().expect("create loop");
    let timer = lp.timer_init().expect("timer handle");

    assert!(lp.timer_again(timer).is_err());

    lp.timer_start(timer, 10, 0, |_, _| {}).expect("start");
    assert!(lp.timer_again(timer).is_err(), "no repeat configured");
    lp.timer_stop(timer).expect("stop");
}

#[test]
fn repeat_interval_is_adjustable() {
    let mut lp = EventLoop::new().expect("create loop");
    let timer = lp.timer_init().expect("timer handle");

    assert_eq!(lp.timer_get_repeat(timer).unwrap(), 0);
    lp.timer_set_repeat(timer, 42).unwrap();
    assert_eq!(lp.timer_get_repeat(timer).unwrap(), 42);
}
