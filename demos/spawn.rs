//! Spawns `ls -l`, captures its stdout through a pipe.

use evloop::{EventLoop, RunMode, SpawnOptions, Stdio};

fn main() {
    let mut lp = EventLoop::new().expect("create loop");

    let options = SpawnOptions::new("ls")
        .arg("-l")
        .stdio(Stdio::Ignore)
        .stdio(Stdio::Pipe)
        .stdio(Stdio::InheritFd(2));

    let (_child, pipes) = lp
        .spawn(options, |_, _, status, signal| {
            println!("child exited: status {status}, signal {signal}");
        })
        .expect("spawn");

    let stdout = pipes[1].expect("stdout pipe");
    lp.read_start(
        stdout,
        |_, _, suggested| vec![0; suggested],
        |lp, stdout, res| match res {
            Ok(chunk) => print!("{}", String::from_utf8_lossy(&chunk)),
            Err(_) => {
                let _ = lp.close(stdout);
            }
        },
    )
    .expect("read_start");

    lp.run(RunMode::Default);
}
