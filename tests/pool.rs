use evloop::{Error, EventLoop, LoopBuilder, RunMode};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn pool_bounds_parallelism_and_completes_every_item() {
    let mut lp = LoopBuilder::new().pool_size(4).build().expect("create loop");

    let done = Rc::new(Cell::new(0u32));
    let loop_thread = thread::current().id();

    for _ in 0..100 {
        let done = done.clone();
        lp.queue_work(
            || {
                thread::sleep(Duration::from_millis(10));
                7u32
            },
            move |_, res| {
                assert_eq!(thread::current().id(), loop_thread, "done callback off the loop thread");
                assert_eq!(res.expect("work result"), 7);
                done.set(done.get() + 1);
            },
        )
        .expect("queue work");
    }

    let start = Instant::now();
    assert!(!lp.run(RunMode::Default));

    assert_eq!(done.get(), 100);
    // 100 sleeps of 10ms across at most 4 workers.
    assert!(
        start.elapsed() >= Duration::from_millis(250),
        "finished impossibly fast: {:?}",
        start.elapsed()
    );
}

#[test]
fn queued_work_can_be_cancelled_before_it_starts() {
    let mut lp = LoopBuilder::new().pool_size(1).build().expect("create loop");

    let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));

    {
        let log = log.clone();
        lp.queue_work(
            || thread::sleep(Duration::from_millis(100)),
            move |_, res| {
                res.expect("blocker result");
                log.borrow_mut().push("blocker done");
            },
        )
        .expect("queue blocker");
    }

    let victim = {
        let log = log.clone();
        lp.queue_work(
            || panic!("cancelled work must never run"),
            move |_, res: evloop::Result<()>| {
                assert_eq!(res, Err(Error::Canceled));
                log.borrow_mut().push("victim canceled");
            },
        )
        .expect("queue victim")
    };

    lp.cancel_work(victim).expect("cancel queued item");
    assert_eq!(lp.cancel_work(victim), Err(Error::Busy), "second cancel finds it gone from the queue");

    lp.run(RunMode::Default);
    assert_eq!(&*log.borrow(), &["victim canceled", "blocker done"]);
}

#[test]
fn fs_operations_round_trip_through_the_pool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("blob.bin");

    let mut lp = EventLoop::new().expect("create loop");

    let wrote = Rc::new(Cell::new(false));
    {
        let wrote = wrote.clone();
        lp.fs_write_file(path.clone(), b"stored via the pool".to_vec(), move |_, res| {
            res.expect("write file");
            wrote.set(true);
        })
        .expect("queue write");
    }
    lp.run(RunMode::Default);
    assert!(wrote.get());

    let contents = Rc::new(RefCell::new(Vec::new()));
    {
        let contents = contents.clone();
        lp.fs_read_file(path.clone(), move |_, res| {
            *contents.borrow_mut() = res.expect("read file");
        })
        .expect("queue read");
    }
    lp.run(RunMode::Default);
    assert_eq!(&*contents.borrow(), b"stored via the pool");

    let size = Rc::new(Cell::new(0u64));
    {
        let size = size.clone();
        lp.fs_stat(path.clone(), move |_, res| {
            size.set(res.expect("stat").len());
        })
        .expect("queue stat");
    }
    lp.run(RunMode::Default);
    assert_eq!(size.get(), b"stored via the pool".len() as u64);

    let listing = Rc::new(RefCell::new(Vec::new()));
    {
        let listing = listing.clone();
        lp.fs_readdir(dir.path().to_path_buf(), move |_, res| {
            *listing.borrow_mut() = res.expect("readdir");
        })
        .expect("queue readdir");
    }
    lp.run(RunMode::Default);
    assert_eq!(listing.borrow().len(), 1);
    assert_eq!(listing.borrow()[0], path);

    let missing = Rc::new(RefCell::new(None));
    {
        let missing = missing.clone();
        lp.fs_read_file(dir.path().join("absent"), move |_, res| {
            *missing.borrow_mut() = Some(res);
        })
        .expect("queue read of missing file");
    }
    lp.run(RunMode::Default);
    assert!(matches!(*missing.borrow(), Some(Err(Error::NoEnt))));
}

#[test]
fn getaddrinfo_resolves_loopback() {
    let mut lp = EventLoop::new().expect("create loop");
    let addrs = Rc::new(RefCell::new(Vec::new()));

    {
        let addrs = addrs.clone();
        lp.getaddrinfo("localhost", 80, move |_, res| {
            *addrs.borrow_mut() = res.expect("resolve localhost");
        })
        .expect("queue lookup");
    }
    lp.run(RunMode::Default);

    let addrs = addrs.borrow();
    assert!(!addrs.is_empty());
    assert!(addrs.iter().all(|addr| addr.port() == 80));
    assert!(addrs.iter().any(|addr| addr.ip().is_loopback()));
}
