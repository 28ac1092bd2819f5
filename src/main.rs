//! sockmux - A Multiplexed, Pre-forking Socket Server
//!
//! This is the main entry point for the sockmux binary.
//! It binds the listening socket, resolves the handler, and either runs one
//! event loop in-process or forks workers and supervises them.

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use sockmux::config::{Cli, ServerConfig};
use sockmux::handler::HandlerFactory;
use sockmux::http::TextResponder;
use sockmux::server::Server;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn print_banner(cli: &Cli) {
    println!(
        r#"
sockmux v{} - Multiplexed, Pre-forking Socket Server
──────────────────────────────────────────────────────────────
Handler:   {:?}
Workers:   {}
Listening: {}

Use Ctrl+C to shutdown gracefully.
"#,
        sockmux::VERSION,
        cli.handler,
        cli.processes,
        cli.bind_address()
    );
}

/// Binds a non-blocking listener with the requested backlog.
fn bind(address: &str, backlog: i32) -> anyhow::Result<mio::net::TcpListener> {
    let listener = std::net::TcpListener::bind(address)
        .with_context(|| format!("failed to bind {}", address))?;

    // std listens with its own backlog; listening again only resizes it.
    // SAFETY: the descriptor belongs to `listener`, which is alive.
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } == -1 {
        return Err(io::Error::last_os_error()).context("failed to set listen backlog");
    }
    listener.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(listener))
}

fn run_standalone(
    listener: mio::net::TcpListener,
    factory: HandlerFactory,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&stop))
            .context("failed to install signal handler")?;
    }

    let server = Server::new(listener, factory, config)?.with_stop_flag(stop);
    let stats = server.stats();
    server.run()?;

    info!(
        accepted = stats.connections_accepted.load(std::sync::atomic::Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}

#[cfg(target_os = "linux")]
fn run_forking(
    listener: mio::net::TcpListener,
    factory: HandlerFactory,
    cli: &Cli,
) -> anyhow::Result<()> {
    use sockmux::ipc::{IpcKey, SysvLock, SysvQueue, SysvStore};
    use sockmux::supervisor::ForkingServer;

    let lock = SysvLock::create(IpcKey::Private).context("failed to create accept lock")?;
    let store = SysvStore::create(IpcKey::Private).context("failed to create serial store")?;
    let queue = SysvQueue::create(IpcKey::Private).context("failed to create heartbeat queue")?;

    ForkingServer::new(
        listener,
        factory,
        cli.server_config(),
        cli.supervisor_config(),
        lock,
        store,
        queue,
    )
    .run()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run_forking(
    _listener: mio::net::TcpListener,
    _factory: HandlerFactory,
    _cli: &Cli,
) -> anyhow::Result<()> {
    anyhow::bail!("forking workers needs System V IPC, which is only supported on Linux")
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Set up logging
    FmtSubscriber::builder()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&cli);

    let listener = bind(&cli.bind_address(), cli.backlog)?;
    info!(
        addr = %cli.bind_address(),
        handler = ?cli.handler,
        processes = cli.processes,
        "Listening"
    );

    // Handlers are resolved once, before any fork.
    let factory = cli.handler.factory(Arc::new(TextResponder::default()));

    if cli.supervisor_config().processes <= 1 {
        run_standalone(listener, factory, cli.server_config())
    } else {
        run_forking(listener, factory, &cli)
    }
}
