use evloop::{Error, EventLoop, RunMode};

use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn pipe_round_trips_bytes_over_a_bound_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("evloop.sock");

    let mut lp = EventLoop::new().expect("create loop");

    let server = lp.pipe_init().expect("server handle");
    lp.pipe_bind(server, &path).expect("bind");

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        lp.listen(server, 8, move |lp, server, res| {
            res.expect("pipe connection");
            let peer = lp.accept(server).expect("claim peer");
            lp.close(server).expect("close listener");

            let received = received.clone();
            lp.read_start(
                peer,
                |_, _, suggested| vec![0; suggested],
                move |lp, peer, res| match res {
                    Ok(data) => received.borrow_mut().extend(data),
                    Err(Error::Eof) => {
                        let _ = lp.close(peer);
                    }
                    Err(err) => panic!("pipe read failed: {err}"),
                },
            )
            .expect("read_start");
        })
        .expect("listen");
    }

    let client = lp.pipe_init().expect("client handle");
    lp.pipe_connect(client, &path, move |lp, client, res| {
        res.expect("pipe connect");
        lp.write(client, vec![b"over the pipe".to_vec()], |lp, client, res| {
            res.expect("pipe write");
            lp.shutdown(client, |lp, client, _| {
                lp.close(client).expect("close client");
            })
            .expect("shutdown");
        })
        .expect("queue write");
    })
    .expect("connect");

    assert!(!lp.run(RunMode::Default));
    assert_eq!(&*received.borrow(), b"over the pipe");
}

#[test]
fn pipe_connect_to_a_missing_path_reports_through_the_callback() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nobody-listens-here.sock");

    let mut lp = EventLoop::new().expect("create loop");
    let seen = Rc::new(RefCell::new(None));

    let client = lp.pipe_init().expect("client handle");
    {
        let seen = seen.clone();
        lp.pipe_connect(client, &path, move |lp, client, res| {
            *seen.borrow_mut() = Some(res);
            lp.close(client).expect("close client");
        })
        .expect("connect call itself succeeds");
    }

    lp.run(RunMode::Default);
    assert_eq!(*seen.borrow(), Some(Err(Error::NoEnt)));
}

#[test]
fn pipe_bind_rejects_oversized_paths() {
    let mut lp = EventLoop::new().expect("create loop");
    let pipe = lp.pipe_init().expect("pipe handle");

    let long = "x".repeat(300);
    assert_eq!(lp.pipe_bind(pipe, &long), Err(Error::NameTooLong));
}
