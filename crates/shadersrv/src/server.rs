//! Server assembly: startup ordering, the accept loop with its admission
//! ceiling, per-connection workers, and the tick worker that drives all
//! background maintenance.

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::net::TcpListener;
use tracing::{info, trace, warn};

use crate::{
    allowlist::AllowList,
    cache::CompileCache,
    codec::FramedStream,
    config::Config,
    dispatch,
    error::ServerError,
    error_log::{ErrorLog, LogSink},
    shaderlist::ShaderListStore,
    status,
};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const ADMISSION_POLL: Duration = Duration::from_millis(10);

/// Everything a job needs, passed by reference instead of living in
/// process-wide singletons.
pub struct Server {
    pub config: Config,
    pub cache: CompileCache,
    pub lists: ShaderListStore,
    pub error_log: ErrorLog,
    pub allow: AllowList,

    pub active_compiles: AtomicI64,
    pub max_active_compiles: AtomicI64,
    pub connection_count: AtomicI64,
    pub exception_count: AtomicI64,
    pub request_number: AtomicU64,
    pub fallback_cursor: AtomicU32,
    pub total_compile_ms: AtomicU64,
    temp_counter: AtomicU64,
}

impl Server {
    /// Builds the server around a populated [`Config`].
    pub async fn build(config: Config) -> Arc<Self> {
        let mut allow = AllowList::parse(&config.allow_list);
        allow.admit_local_host().await;

        let cache = CompileCache::new(&config.cache_dir);
        let lists = ShaderListStore::new(&config.cache_dir, config.print_list_updates);
        let error_log = ErrorLog::new(
            config.mail_interval,
            config.dedupe_errors,
            Box::new(LogSink),
        );

        Arc::new(Server {
            cache,
            lists,
            error_log,
            allow,
            config,
            active_compiles: AtomicI64::new(0),
            max_active_compiles: AtomicI64::new(0),
            connection_count: AtomicI64::new(0),
            exception_count: AtomicI64::new(0),
            request_number: AtomicU64::new(0),
            fallback_cursor: AtomicU32::new(0),
            total_compile_ms: AtomicU64::new(0),
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Creates the working directories and brings the cache up. Must finish
    /// before the accept loop starts so no lookup races the load.
    pub fn prepare(&self) {
        for dir in [
            &self.config.cache_dir,
            &self.config.temp_dir,
            &self.config.error_dir,
            &self.config.shader_dir,
        ] {
            if let Err(error) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), %error, "could not create working directory");
            }
        }

        if self.config.caching {
            self.cache.startup();
        } else {
            info!("caching disabled by config");
        }
    }

    /// Full startup: prepare, bind, status listener, serve until killed.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        self.prepare();

        let port = self.config.tcp_port;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        info!(port, "listening for compile requests");

        if let Some(status_port) = port.checked_add(1).filter(|_| port != 0) {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, status_port)).await {
                Ok(status_listener) => {
                    info!(port = status_port, "status page available");
                    tokio::spawn(status::serve(self.clone(), status_listener));
                }
                Err(error) => warn!(%error, "could not bind status listener"),
            }
        }

        tokio::select! {
            result = self.clone().serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down; flushing pending work");
                self.cache.flush_pending().await;
                self.lists.save_all().await;
                Ok(())
            }
        }
    }

    /// Accepts connections on an already-bound listener. Public so tests can
    /// drive the server on an ephemeral port.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        tokio::spawn(tick_loop(self.clone()));

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "accept failed");
                    tokio::time::sleep(ADMISSION_POLL).await;
                    continue;
                }
            };

            let peer_ip = match addr {
                std::net::SocketAddr::V4(v4) => *v4.ip(),
                std::net::SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            if !self.allow.permits(peer_ip) {
                warn!(
                    peer = %peer_ip,
                    "unauthorized IP tried to connect; add it to the whitelist if it should be"
                );
                drop(stream);
                continue;
            }

            self.connection_count.fetch_add(1, Ordering::SeqCst);
            let server = self.clone();
            tokio::spawn(serve_connection(server, FramedStream::new(stream)));

            // Admission ceiling: hold further accepts while saturated.
            let mut logged = false;
            while self.connection_count.load(Ordering::SeqCst)
                >= self.config.max_connections as i64
            {
                if !logged {
                    info!("waiting for a request to finish before accepting another connection");
                    logged = true;
                }
                tokio::time::sleep(ADMISSION_POLL).await;
            }
        }
    }

    pub fn count_exception(&self) {
        self.exception_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count_request(&self) {
        self.request_number.fetch_add(1, Ordering::SeqCst);
    }

    /// Process-wide index for `<n>.In`/`<n>.Out` temp-file pairs.
    pub fn next_temp_index(&self) -> u64 {
        self.temp_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// One request, one response, close.
async fn serve_connection(server: Arc<Server>, mut sock: FramedStream) {
    let peer = sock.peer_ip();
    match sock.recv_frame().await {
        Ok(payload) => {
            let reply = dispatch::handle_request(&server, payload, peer).await;
            if let Err(error) = sock
                .send_response(&reply.body, reply.state, reply.version)
                .await
            {
                warn!(peer = %peer, %error, "failed to send response");
            }
        }
        Err(error) => {
            warn!(peer = %peer, %error, "dropping connection: invalid request frame");
        }
    }
    server.connection_count.fetch_sub(1, Ordering::SeqCst);
}

/// Single maintenance task: error-report delivery, shader-list saves, cache
/// appends, and a periodic status line. Subsystem failures are contained
/// and logged inside each call; nothing here can take the loop down.
async fn tick_loop(server: Arc<Server>) {
    let mut last_status = Instant::now();
    loop {
        let started = Instant::now();

        if last_status.elapsed() >= TICK_INTERVAL {
            last_status = started;
            trace!(
                compile_tasks = server.active_compiles.load(Ordering::SeqCst),
                open_sockets = FramedStream::open_socket_count(),
                exceptions = server.exception_count.load(Ordering::SeqCst),
                "tick"
            );
        }

        server.error_log.tick();
        server.lists.tick().await;
        server.cache.flush_pending().await;

        let elapsed = started.elapsed();
        if elapsed < TICK_INTERVAL {
            tokio::time::sleep(TICK_INTERVAL - elapsed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn temp_indexes_are_unique_and_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::build(Config::with_root(dir.path())).await;
        let first = server.next_temp_index();
        let second = server.next_temp_index();
        assert!(second > first);
    }

    #[tokio::test]
    async fn build_wires_the_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path());
        config.allow_list = vec!["192.168.1.0/24".to_string()];
        let server = Server::build(config).await;
        assert!(server.allow.permits("192.168.1.10".parse().unwrap()));
        assert!(server.allow.permits(Ipv4Addr::LOCALHOST));
        assert!(!server.allow.permits("192.168.2.5".parse().unwrap()));
    }
}
