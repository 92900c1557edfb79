use std::process;

fn main() {
    if let Err(err) = tidemark::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
