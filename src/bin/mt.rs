use std::process::exit;
use std::thread;
use std::time::Duration;

fn main() {
    let jh1 = thread::spawn(|| partial_sum(0..10_000));
    let jh2 = thread::spawn(|| partial_sum(10_000..20_000));

    let total = jh1.join().unwrap() + jh2.join().unwrap();
    println!("total {total}");

    // distinct exit code tells the sum was computed by both threads
    exit(if total == 199_990_000 { 3 } else { 1 });
}

fn partial_sum(range: std::ops::Range<u64>) -> u64 {
    thread::sleep(Duration::from_millis(50));
    range.sum()
}
