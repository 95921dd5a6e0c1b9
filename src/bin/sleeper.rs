use std::thread::sleep;
use std::time::Duration;
use std::{env, thread};

pub fn main() {
    let args: Vec<String> = env::args().collect();
    let sleep_base_sec: u64 = match args.as_slice() {
        [_, flag, secs] if flag == "-s" => secs.parse().unwrap(),
        _ => 1,
    };

    let threads: Vec<_> = (0..3)
        .map(|i| {
            thread::spawn(move || loop {
                sleep(Duration::from_secs(sleep_base_sec + 2 * i));
            })
        })
        .collect();

    threads.into_iter().for_each(|t| t.join().unwrap());
}
