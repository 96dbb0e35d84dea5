//! TCP echo server: `nc 127.0.0.1 7000` to try it.

use evloop::{EventLoop, RunMode};

fn main() {
    let mut lp = EventLoop::new().expect("create loop");

    let server = lp.tcp_init().expect("tcp handle");
    lp.tcp_bind(server, "127.0.0.1:7000".parse().unwrap())
        .expect("bind");
    lp.listen(server, 128, |lp, server, res| {
        if res.is_err() {
            return;
        }
        let client = lp.accept(server).expect("claim peer");
        lp.read_start(
            client,
            |_, _, suggested| vec![0; suggested],
            |lp, client, res| match res {
                Ok(data) => {
                    lp.write(client, vec![data], |_, _, _| {}).unwrap();
                }
                Err(_) => {
                    let _ = lp.close(client);
                }
            },
        )
        .expect("read_start");
    })
    .expect("listen");

    println!("echoing on 127.0.0.1:7000");
    lp.run(RunMode::Default);
}
