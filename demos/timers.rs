//! Repeating timer that stops itself after a second.

use evloop::{EventLoop, RunMode};

fn main() {
    let mut lp = EventLoop::new().expect("create loop");

    let ticker = lp.timer_init().expect("timer handle");
    lp.timer_start(ticker, 100, 250, |lp, h| {
        println!("tick at {}ms", lp.now());
        if lp.now() > 1000 {
            lp.close(h).unwrap();
        }
    })
    .expect("start timer");

    lp.run(RunMode::Default);
}
