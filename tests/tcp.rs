use evloop::{Error, EventLoop, RunMode};

use std::cell::{Cell, RefCell};
use std::io::Read;
use std::net::TcpStream as StdTcpStream;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

#[test]
fn tcp_ping_pong_round_trip() {
    let mut lp = EventLoop::new().expect("create loop");

    let server = lp.tcp_init().expect("server handle");
    lp.tcp_bind(server, "127.0.0.1:0".parse().unwrap())
        .expect("bind");
    let addr = lp.tcp_getsockname(server).expect("bound address");
    assert_ne!(addr.port(), 0);

    let log = Rc::new(RefCell::new(Vec::<&'static str>::new()));

    {
        let log = log.clone();
        lp.listen(server, 8, move |lp, server, res| {
            res.expect("connection event");
            let peer = lp.accept(server).expect("claim peer");
            lp.close(server).expect("close listener");

            let log = log.clone();
            lp.read_start(
                peer,
                |_, _, suggested| vec![0; suggested],
                move |lp, peer, res| match res {
                    Ok(data) => {
                        assert_eq!(data, b"ping");
                        log.borrow_mut().push("server got ping");
                        lp.write(peer, vec![b"pong".to_vec()], |_, _, res| {
                            res.expect("server write");
                        })
                        .expect("queue pong");
                    }
                    Err(Error::Eof) => {
                        let _ = lp.close(peer);
                    }
                    Err(err) => panic!("server read failed: {err}"),
                },
            )
            .expect("server read_start");
        })
        .expect("listen");
    }

    let client = lp.tcp_init().expect("client handle");
    {
        let log = log.clone();
        lp.tcp_connect(client, addr, move |lp, client, res| {
            res.expect("connect");
            lp.write(client, vec![b"ping".to_vec()], |_, _, res| {
                res.expect("client write");
            })
            .expect("queue ping");

            let log = log.clone();
            lp.read_start(
                client,
                |_, _, suggested| vec![0; suggested],
                move |lp, client, res| {
                    let data = res.expect("client read");
                    assert_eq!(data, b"pong");
                    log.borrow_mut().push("client got pong");
                    lp.close(client).expect("close client");
                },
            )
            .expect("client read_start");
        })
        .expect("connect");
    }

    assert!(!lp.run(RunMode::Default), "loop drains after both closes");
    assert_eq!(&*log.borrow(), &["server got ping", "client got pong"]);
}

#[test]
fn writes_complete_in_submission_order() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("std listener");
    let addr = listener.local_addr().unwrap();

    let reader = thread::spawn(move || {
        let (mut peer, _) = listener.accept().expect("accept");
        let mut bytes = Vec::new();
        peer.read_to_end(&mut bytes).expect("read_to_end");
        bytes
    });

    let mut lp = EventLoop::new().expect("create loop");
    let order = Rc::new(RefCell::new(Vec::<char>::new()));

    let client = lp.tcp_init().expect("client handle");
    {
        let order = order.clone();
        lp.tcp_connect(client, addr, move |lp, client, res| {
            res.expect("connect");
            for (tag, byte) in [('a', b'a'), ('b', b'b'), ('c', b'c')] {
                let order = order.clone();
                lp.write(client, vec![vec![byte; 200_000]], move |lp, client, res| {
                    res.expect("write");
                    order.borrow_mut().push(tag);
                    if order.borrow().len() == 3 {
                        lp.shutdown(client, |lp, client, res| {
                            res.expect("shutdown");
                            lp.close(client).expect("close client");
                        })
                        .expect("shutdown");
                    }
                })
                .expect("queue write");
            }
        })
        .expect("connect");
    }

    lp.run(RunMode::Default);

    assert_eq!(&*order.borrow(), &['a', 'b', 'c']);
    let bytes = reader.join().expect("reader thread");
    assert_eq!(bytes.len(), 600_000);
    assert!(bytes[..200_000].iter().all(|&b| b == b'a'));
    assert!(bytes[200_000..400_000].iter().all(|&b| b == b'b'));
    assert!(bytes[400_000..].iter().all(|&b| b == b'c'));
}

#[test]
fn write_after_shutdown_fails_with_pipe_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("std listener");
    let addr = listener.local_addr().unwrap();
    let hold = thread::spawn(move || listener.accept().map(|(peer, _)| peer));

    let mut lp = EventLoop::new().expect("create loop");
    let checked = Rc::new(Cell::new(false));

    let client = lp.tcp_init().expect("client handle");
    {
        let checked = checked.clone();
        lp.tcp_connect(client, addr, move |lp, client, res| {
            res.expect("connect");
            lp.shutdown(client, |lp, client, res| {
                res.expect("shutdown");
                lp.close(client).expect("close client");
            })
            .expect("shutdown");

            let err = lp
                .write(client, vec![b"late".to_vec()], |_, _, _| {
                    panic!("write after shutdown must not be queued")
                })
                .unwrap_err();
            assert_eq!(err, Error::Pipe);
            checked.set(true);
        })
        .expect("connect");
    }

    lp.run(RunMode::Default);
    assert!(checked.get());
    drop(hold.join());
}

#[test]
fn closing_a_listener_cancels_the_pending_peer() {
    let mut lp = EventLoop::new().expect("create loop");

    let server = lp.tcp_init().expect("server handle");
    lp.tcp_bind(server, "127.0.0.1:0".parse().unwrap())
        .expect("bind");
    let port = lp.tcp_getsockname(server).unwrap().port();

    let events = Rc::new(RefCell::new(Vec::<String>::new()));
    {
        let events = events.clone();
        // Never claims the peer, so it stays pending in the listener.
        lp.listen(server, 8, move |_, _, res| match res {
            Ok(()) => events.borrow_mut().push("incoming".into()),
            Err(err) => events.borrow_mut().push(format!("err:{}", err.code())),
        })
        .expect("listen");
    }

    let timer = lp.timer_init().expect("timer handle");
    lp.timer_start(timer, 50, 0, move |lp, _| {
        lp.close(server).expect("close listener");
    })
    .expect("start timer");

    let client = thread::spawn(move || {
        let peer = StdTcpStream::connect(("127.0.0.1", port)).expect("connect");
        thread::sleep(Duration::from_millis(150));
        drop(peer);
    });

    lp.run(RunMode::Default);
    client.join().expect("client thread");

    assert_eq!(
        &*events.borrow(),
        &["incoming".to_string(), "err:ECANCELED".to_string()]
    );
}

#[test]
fn read_stop_inside_the_callback_stops_delivery() {
    let mut lp = EventLoop::new().expect("create loop");

    let server = lp.tcp_init().expect("server handle");
    lp.tcp_bind(server, "127.0.0.1:0".parse().unwrap())
        .expect("bind");
    let port = lp.tcp_getsockname(server).unwrap().port();

    let reads = Rc::new(Cell::new(0u32));
    let accepted = Rc::new(Cell::new(None));

    {
        let reads = reads.clone();
        let accepted = accepted.clone();
        lp.listen(server, 8, move |lp, server, res| {
            res.expect("connection event");
            let peer = lp.accept(server).expect("claim peer");
            accepted.set(Some(peer));
            lp.close(server).expect("close listener");

            let reads = reads.clone();
            lp.read_start(
                peer,
                |_, _, suggested| vec![0; suggested],
                move |lp, peer, res| {
                    res.expect("read");
                    reads.set(reads.get() + 1);
                    lp.read_stop(peer).expect("read_stop");
                },
            )
            .expect("read_start");
        })
        .expect("listen");
    }

    // Gives the peer time to send a second chunk that must never arrive.
    let timer = lp.timer_init().expect("timer handle");
    {
        let accepted = accepted.clone();
        lp.timer_start(timer, 200, 0, move |lp, _| {
            if let Some(peer) = accepted.get() {
                lp.close(peer).expect("close accepted peer");
            }
        })
        .expect("start timer");
    }

    let writer = thread::spawn(move || {
        let mut peer = StdTcpStream::connect(("127.0.0.1", port)).expect("connect");
        use std::io::Write;
        peer.write_all(b"first").expect("first chunk");
        thread::sleep(Duration::from_millis(100));
        peer.write_all(b"second").expect("second chunk");
        thread::sleep(Duration::from_millis(200));
    });

    lp.run(RunMode::Default);
    writer.join().expect("writer thread");

    assert_eq!(reads.get(), 1, "read_stop must suppress further delivery");
}
