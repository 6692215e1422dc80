use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpSocket, TcpStream, lookup_host},
    select,
    sync::{Semaphore, watch},
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    handler::{CloseCause, Services, handle_connection},
};

pub const BUSY_REPLY: &str = "Server busy, try again later\n";

// Pause after a failed accept so a persistent error (e.g. fd exhaustion) cannot spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Stops the accept loop. Cheap to clone; stopping twice is the same as once.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn stop(&self) {
        if !self.flag.send_replace(true) {
            info!("relay stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.flag.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

/// Number of connection handlers currently running.
#[derive(Clone, Default)]
pub struct ActiveConnections(Arc<AtomicUsize>);

impl ActiveConnections {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.clone())
    }

    fn leave(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the active count when the handler task ends, including on abort or panic.
struct ActiveGuard(ActiveConnections);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.leave();
    }
}

type HandlerSet = JoinSet<(SocketAddr, CloseCause)>;

pub struct Relay {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    services: Arc<Services>,
    permits: Arc<Semaphore>,
    active: ActiveConnections,
    stop: StopHandle,
}

impl Relay {
    /// Binds the configured address with the configured backlog.
    ///
    /// Every address `host` resolves to is tried in order; the first that
    /// binds wins. No retry happens beyond that.
    pub async fn bind(config: ServerConfig, services: Services) -> Result<Self, RelayError> {
        let bind_error = |source| RelayError::Bind {
            host: config.host.clone(),
            port: config.port,
            source,
        };

        let candidates = lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(bind_error)?;

        let mut last_err = None;
        let mut listener = None;
        for addr in candidates {
            match listen_on(addr, config.max_pending_connections) {
                Ok(bound) => {
                    listener = Some(bound);
                    break;
                }
                Err(err) => {
                    debug!(%addr, ?err, "bind attempt failed");
                    last_err = Some(err);
                }
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => {
                let err = last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
                });
                return Err(bind_error(err));
            }
        };

        let port = listener.local_addr().map(|addr| addr.port()).unwrap_or(config.port);
        services
            .report(&format!("server started on {}:{port}", config.host))
            .await;

        Ok(Self {
            listener,
            permits: Arc::new(Semaphore::new(
                config.max_active_connections.min(Semaphore::MAX_PERMITS),
            )),
            config: Arc::new(config),
            services: Arc::new(services),
            active: ActiveConnections::default(),
            stop: StopHandle::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn active_connections(&self) -> ActiveConnections {
        self.active.clone()
    }

    /// Accepts connections until stopped, then drains in-flight handlers.
    ///
    /// Handlers still running once the shutdown grace period has passed are
    /// aborted.
    pub async fn run(self) {
        let Relay {
            listener,
            config,
            services,
            permits,
            active,
            stop,
        } = self;
        let mut stopped = stop.subscribe();
        let mut handlers = HandlerSet::new();

        loop {
            if *stopped.borrow_and_update() {
                break;
            }
            select! {
                _ = stopped.changed() => {}
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            dispatch(stream, peer, &config, &services, &permits, &active, &mut handlers).await;
                        }
                        Err(err) => {
                            warn!(error = ?err, "failed to accept connection");
                            services.report(&format!("accept failed: {err}")).await;
                            sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    log_finished(joined);
                }
            }
        }

        drop(listener);
        info!("relay stopped accepting connections");
        services.report("server stopped").await;
        drain(handlers, config.shutdown_grace, &services).await;
    }

    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let stop = self.stop_handle();
        let run = self.run();
        tokio::pin!(run);

        select! {
            _ = &mut run => return,
            _ = shutdown => stop.stop(),
        }
        run.await;
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                // Without a signal handler the relay runs until killed.
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn listen_on(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn dispatch(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    services: &Arc<Services>,
    permits: &Arc<Semaphore>,
    active: &ActiveConnections,
    handlers: &mut HandlerSet,
) {
    let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
        reject(stream, peer, services).await;
        return;
    };

    let guard = active.enter();
    let count = active.get();
    let task_services = Arc::clone(services);
    let max_message_bytes = config.max_message_bytes;
    handlers.spawn(async move {
        let _permit = permit;
        let _guard = guard;
        // Recorded from the task so a slow activity log never stalls accept.
        task_services
            .report(&format!("active connections: {count}"))
            .await;
        let cause = handle_connection(stream, peer, task_services, max_message_bytes).await;
        (peer, cause)
    });

    debug!(%peer, active = count, "connection dispatched");
}

async fn reject(mut stream: TcpStream, peer: SocketAddr, services: &Services) {
    warn!(%peer, "rejecting connection, relay at capacity");
    if let Err(err) = stream.write_all(BUSY_REPLY.as_bytes()).await {
        debug!(%peer, ?err, "failed to send busy reply");
    }
    let _ = stream.shutdown().await;
    services
        .report(&format!("rejected {peer}: at capacity"))
        .await;
}

fn log_finished(joined: Result<(SocketAddr, CloseCause), JoinError>) {
    match joined {
        Ok((peer, cause)) => debug!(%peer, %cause, "handler finished"),
        Err(err) if err.is_panic() => warn!(error = ?err, "connection handler panicked"),
        Err(err) => debug!(error = ?err, "connection handler cancelled"),
    }
}

async fn drain(mut handlers: HandlerSet, grace: Duration, services: &Services) {
    if handlers.is_empty() {
        return;
    }
    info!(in_flight = handlers.len(), ?grace, "waiting for in-flight connections");

    let drained = timeout(grace, async {
        while let Some(joined) = handlers.join_next().await {
            log_finished(joined);
        }
    })
    .await;

    if drained.is_err() {
        let remaining = handlers.len();
        handlers.shutdown().await;
        warn!(remaining, "forced close of connections after shutdown grace period");
        services
            .report(&format!(
                "forced close of {remaining} connection(s) after {grace:?} grace period"
            ))
            .await;
    }
}
