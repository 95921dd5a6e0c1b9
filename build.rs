fn main() {
    if !cfg!(target_os = "linux") {
        println!(
            "cargo:warning={} native process layer only works on linux, other backends are still available",
            env!("CARGO_PKG_NAME")
        );
    }
}
