//! Remote-role entry point: terminates the encrypted tunnel and
//! connects onward to whatever destination the decrypted address
//! header names.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mio::{Events, Poll};

use ss_relay_core::resolver::StdResolver;
use ss_relay_core::timeout::TIMEOUT_PRECISION;
use ss_relay_core::{logging, now_secs, Config, Server};

#[derive(Parser)]
#[command(about = "Encrypted SOCKS5 tunnel: remote (server) role")]
struct Args {
    #[arg(short = 'c', long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();
    let log = logging::term_logger();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let listen_addr = match config.listen_address(false) {
        Ok(a) => a,
        Err(e) => {
            slog::error!(log, "configuration error"; "error" => %e);
            process::exit(1);
        }
    };

    let resolver = Arc::new(StdResolver);
    let mut server = match Server::bind(
        listen_addr,
        false,
        config.password.clone().into_bytes(),
        config.timeout,
        None,
        resolver,
        log.clone(),
    ) {
        Ok(s) => s,
        Err(e) => {
            slog::error!(log, "failed to bind"; "error" => %e);
            process::exit(1);
        }
    };

    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            slog::error!(log, "failed to create poller"; "error" => %e);
            process::exit(1);
        }
    };
    if let Err(e) = server.attach_to_loop(poll.registry()) {
        slog::error!(log, "failed to register listener"; "error" => %e);
        process::exit(1);
    }

    slog::info!(log, "listening"; "addr" => %listen_addr, "role" => "remote");

    let mut events = Events::with_capacity(1024);
    loop {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(TIMEOUT_PRECISION))) {
            slog::error!(log, "poll failed"; "error" => %e);
            break;
        }
        let now = now_secs();
        if let Err(e) = server.dispatch(&events, poll.registry(), now) {
            slog::error!(log, "fatal dispatch error"; "error" => %e);
            break;
        }
    }

    server.close(poll.registry());
}
