//! Terminal logging setup shared by both binaries, in `quinn-proto`'s
//! example style: a plain compact `slog-term` drain wrapped in a
//! `Mutex` rather than an async drain, since this crate's dispatch
//! loop is itself single-threaded.

use slog::Drain;

pub fn term_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = std::sync::Mutex::new(drain).fuse();
    slog::Logger::root(drain, slog::o!())
}
