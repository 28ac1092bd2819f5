use super::heartbeat::{unix_now, Heartbeat};
use super::registry::WorkerRegistry;
use super::SupervisorError;
use crate::config::{ServerConfig, SupervisorConfig};
use crate::handler::HandlerFactory;
use crate::ipc::{KeyValueStore, Lock, MessageQueue};
use crate::server::{LoopHooks, Server};
use mio::net::TcpListener;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::future::Future;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Store key of the next connection number.
pub const SERIAL_KEY: &str = "serial";

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Longest the supervisor sleeps between checks.
const SUPERVISE_TICK: Duration = Duration::from_secs(1);

/// Poll interval while waiting for workers to exit.
const REAP_TICK: Duration = Duration::from_millis(100);

/// Exponential delay after consecutive failures, capped at `BACKOFF_MAX`.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
}

impl Backoff {
    fn failed(&mut self) -> Duration {
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << self.failures.min(10))
            .min(BACKOFF_MAX);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Loop hooks of one forked worker: accept gate, shared serial, heartbeats.
pub struct WorkerHooks<'a, L: Lock, S: KeyValueStore, Q: MessageQueue> {
    worker: u32,
    lock: L,
    store: &'a S,
    queue: &'a Q,
    heartbeat_interval: Duration,
    next_beat: Instant,
    lock_retry_at: Option<Instant>,
    lock_backoff: Backoff,
    beat_backoff: Backoff,
}

impl<'a, L: Lock, S: KeyValueStore, Q: MessageQueue> WorkerHooks<'a, L, S, Q> {
    /// `lock` must be this worker's own handle; the first heartbeat goes out
    /// on the first tick.
    pub fn new(worker: u32, lock: L, store: &'a S, queue: &'a Q, heartbeat_interval: Duration) -> Self {
        Self {
            worker,
            lock,
            store,
            queue,
            heartbeat_interval,
            next_beat: Instant::now(),
            lock_retry_at: None,
            lock_backoff: Backoff::default(),
            beat_backoff: Backoff::default(),
        }
    }

    fn send_heartbeat(&mut self, heartbeat: Heartbeat) -> bool {
        match self.queue.send(&heartbeat.encode()) {
            Ok(()) => {
                self.beat_backoff.reset();
                true
            }
            Err(e) => {
                let delay = self.beat_backoff.failed();
                warn!(worker = self.worker, error = %e, retry_ms = delay.as_millis() as u64, "Failed to send heartbeat");
                self.next_beat = Instant::now() + delay;
                false
            }
        }
    }
}

fn open_count(open: usize) -> u32 {
    u32::try_from(open).unwrap_or(u32::MAX)
}

impl<L: Lock, S: KeyValueStore, Q: MessageQueue> LoopHooks for WorkerHooks<'_, L, S, Q> {
    fn try_enter_accept(&mut self) -> bool {
        if let Some(at) = self.lock_retry_at {
            if Instant::now() < at {
                return false;
            }
            self.lock_retry_at = None;
        }
        match self.lock.try_acquire() {
            Ok(won) => {
                self.lock_backoff.reset();
                won
            }
            Err(e) => {
                let delay = self.lock_backoff.failed();
                warn!(worker = self.worker, error = %e, retry_ms = delay.as_millis() as u64, "Accept lock unavailable");
                self.lock_retry_at = Some(Instant::now() + delay);
                false
            }
        }
    }

    fn leave_accept(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!(worker = self.worker, error = %e, "Failed to release accept lock");
        }
    }

    fn next_connection_id(&mut self) -> u64 {
        match self.store.increment(SERIAL_KEY, 1) {
            Ok(next) => u64::try_from(next - 1).unwrap_or(0),
            Err(e) => {
                warn!(worker = self.worker, error = %e, "Connection serial unavailable");
                0
            }
        }
    }

    fn worker(&self) -> Option<u32> {
        Some(self.worker)
    }

    fn tick(&mut self, open: usize) {
        let now = Instant::now();
        if now < self.next_beat {
            return;
        }
        if self.send_heartbeat(Heartbeat::alive(self.worker, open_count(open))) {
            self.next_beat = now + self.heartbeat_interval;
        }
    }

    fn shutdown(&mut self, open: usize) {
        if self.lock.is_held() {
            self.leave_accept();
        }
        self.send_heartbeat(Heartbeat::sentinel(self.worker, open_count(open)));
    }
}

/// Parent-side supervision: drains heartbeats, reaps children, tracks state.
pub struct Supervisor<'a, Q: MessageQueue> {
    queue: &'a Q,
    registry: WorkerRegistry,
    tick: Duration,
}

impl<'a, Q: MessageQueue> Supervisor<'a, Q> {
    pub fn new(queue: &'a Q, registry: WorkerRegistry, heartbeat_interval: Duration) -> Self {
        Self {
            queue,
            registry,
            tick: heartbeat_interval.min(SUPERVISE_TICK),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Applies every queued heartbeat. Returns how many were read.
    pub fn drain(&mut self, now: u64) -> usize {
        let mut count = 0;
        loop {
            match self.queue.receive() {
                Ok(Some(raw)) => {
                    count += 1;
                    match Heartbeat::decode(&raw) {
                        Ok(heartbeat) => self.registry.record(&heartbeat, now),
                        Err(e) => warn!(error = %e, "Discarding malformed heartbeat"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read heartbeat queue");
                    break;
                }
            }
        }
        count
    }

    /// Collects children that have exited, without blocking.
    pub fn reap(&mut self) {
        for pid in self.registry.running_pids() {
            let mut status = 0;
            // SAFETY: waitpid only writes the status integer we own.
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret == pid {
                self.record_exit(pid, status);
            } else if ret == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD) {
                self.registry.mark_exited(pid);
            }
        }
    }

    fn reap_blocking(&mut self) {
        for pid in self.registry.running_pids() {
            let mut status = 0;
            loop {
                // SAFETY: as in `reap`.
                let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
                if ret == pid {
                    self.record_exit(pid, status);
                    break;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    self.registry.mark_exited(pid);
                    break;
                }
            }
        }
    }

    fn record_exit(&mut self, pid: i32, status: libc::c_int) {
        let worker = self.registry.mark_exited(pid);
        if libc::WIFEXITED(status) {
            info!(worker = ?worker, pid, code = libc::WEXITSTATUS(status), "Worker exited");
        } else if libc::WIFSIGNALED(status) {
            warn!(worker = ?worker, pid, signal = libc::WTERMSIG(status), "Worker killed by signal");
        }
    }

    /// One supervision pass.
    pub fn check(&mut self, now: u64) {
        self.drain(now);
        self.reap();
        self.registry.sweep(now);
    }

    fn signal_all(&self, sig: libc::c_int) {
        for pid in self.registry.running_pids() {
            // SAFETY: kill has no memory effects.
            if unsafe { libc::kill(pid, sig) } == -1 {
                let err = io::Error::last_os_error();
                warn!(pid, signal = sig, error = %err, "Failed to signal worker");
            }
        }
    }

    /// Supervises until `shutdown` resolves or every worker has exited.
    pub async fn watch<F>(&mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = io::Result<()>>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut shutdown => {
                    result.map_err(SupervisorError::Signal)?;
                    info!("Shutdown signal received, stopping workers");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.check(unix_now());
                    if !self.registry.is_empty() && self.registry.all_exited() {
                        warn!("Every worker has exited");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sends SIGTERM to every running worker and waits up to `grace` for
    /// them to exit; stragglers get SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) {
        self.signal_all(libc::SIGTERM);
        let deadline = Instant::now() + grace;
        loop {
            self.drain(unix_now());
            self.reap();
            if self.registry.running_pids().is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining = self.registry.running_pids().len(), "Workers ignored SIGTERM, killing them");
                self.signal_all(libc::SIGKILL);
                self.reap_blocking();
                return;
            }
            tokio::time::sleep(REAP_TICK).await;
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() -> io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

/// N worker processes sharing one listener, plus the parent that watches them.
pub struct ForkingServer<L, S, Q> {
    listener: TcpListener,
    factory: HandlerFactory,
    server_config: ServerConfig,
    config: SupervisorConfig,
    lock: L,
    store: S,
    queue: Q,
}

impl<L, S, Q> ForkingServer<L, S, Q>
where
    L: Lock + Clone,
    S: KeyValueStore,
    Q: MessageQueue,
{
    /// The primitives must be visible to forked children, so in-memory
    /// backends only work for a single process.
    pub fn new(
        listener: TcpListener,
        factory: HandlerFactory,
        server_config: ServerConfig,
        config: SupervisorConfig,
        lock: L,
        store: S,
        queue: Q,
    ) -> Self {
        Self {
            listener,
            factory,
            server_config,
            config,
            lock,
            store,
            queue,
        }
    }

    /// Forks the workers and supervises them until a shutdown signal.
    ///
    /// Returns in the parent only, after every worker has exited and the
    /// coordination primitives have been destroyed.
    pub fn run(self) -> Result<(), SupervisorError> {
        let ForkingServer {
            listener,
            factory,
            server_config,
            config,
            lock,
            store,
            queue,
        } = self;

        store.set(SERIAL_KEY, 1)?;
        let mut registry = WorkerRegistry::new(config.worker_timeout);
        let mut listener = Some(listener);
        let mut factory = Some(factory);
        let mut fork_error = None;

        for worker in 0..config.processes {
            // SAFETY: the parent is still single-threaded here; the tokio
            // runtime is only built after the last fork.
            match unsafe { libc::fork() } {
                -1 => {
                    fork_error = Some(io::Error::last_os_error());
                    break;
                }
                0 => {
                    let code = match (listener.take(), factory.take()) {
                        (Some(listener), Some(factory)) => {
                            let hooks = WorkerHooks::new(
                                worker,
                                lock.clone(),
                                &store,
                                &queue,
                                config.heartbeat_interval,
                            );
                            run_worker(listener, factory, server_config.clone(), hooks)
                        }
                        _ => 1,
                    };
                    std::process::exit(code);
                }
                pid => {
                    info!(worker, pid, "Forked worker");
                    registry.register(worker, Some(pid), unix_now());
                }
            }
        }
        drop(listener);
        drop(factory);

        let mut result = match fork_error {
            Some(e) => {
                error!(error = %e, forked = registry.len(), "Failed to fork worker");
                Err(SupervisorError::Fork(e))
            }
            None => Ok(()),
        };

        let mut supervisor = Supervisor::new(&queue, registry, config.heartbeat_interval);
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(async {
                if result.is_ok() {
                    info!(workers = config.processes, "Supervising workers");
                    result = supervisor.watch(shutdown_signal()).await;
                }
                supervisor.terminate(config.worker_timeout).await;
            }),
            Err(e) => {
                error!(error = %e, "Failed to start supervisor runtime");
                supervisor.signal_all(libc::SIGKILL);
                supervisor.reap_blocking();
                result = result.and(Err(SupervisorError::Runtime(e)));
            }
        }
        drop(supervisor);

        for (name, destroyed) in [
            ("lock", lock.destroy()),
            ("store", store.destroy()),
            ("queue", queue.destroy()),
        ] {
            if let Err(e) = destroyed {
                warn!(primitive = name, error = %e, "Failed to remove IPC object");
            }
        }
        info!("All workers stopped");
        result
    }
}

/// Body of a forked child. Returns the process exit code.
fn run_worker<H: LoopHooks>(
    listener: TcpListener,
    factory: HandlerFactory,
    config: ServerConfig,
    hooks: H,
) -> i32 {
    let worker = hooks.worker();
    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&stop)) {
            error!(worker = ?worker, error = %e, "Failed to install signal handler");
            return 1;
        }
    }

    let server = match Server::with_hooks(listener, factory, config, hooks) {
        Ok(server) => server.with_stop_flag(stop),
        Err(e) => {
            error!(worker = ?worker, error = %e, "Failed to start worker");
            return 1;
        }
    };
    info!(worker = ?worker, pid = std::process::id(), "Worker started");
    match server.run() {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
