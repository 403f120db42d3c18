//! Core server: binds the listener, accepts connections, and hands each one
//! to its own handler task.
//!
//! Owns the client registry, the operator log, the dispatch policy and the
//! shutdown coordinator. Also exposes the administrative surface used by the
//! console (list, disconnect, log snapshot, stop).

use crate::commands::{CommandRegistry, DispatchPolicy, Dispatcher};
use crate::config::ServerConfig;
use crate::handler::{self, HandlerContext};
use crate::log_sink::LogSink;
use crate::registry::{ClientRegistry, ConnectionId, SessionInfo};
use crate::shutdown::{RunState, ShutdownCoordinator};
use rexec_core::protocol::SERVER_BUSY;
use rexec_core::{FileStopSignal, NeverStop, RexecError, RexecResult, StopSignal};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Pending-connection queue length passed to `listen`.
const LISTEN_BACKLOG: u32 = 5;

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The rexec server instance.
pub struct RexecServer {
    /// Server configuration.
    config: ServerConfig,
    /// State shared with every connection handler.
    ctx: Arc<HandlerContext>,
    /// Run state and stop requests.
    shutdown: Arc<ShutdownCoordinator>,
    /// One permit per live connection.
    connection_slots: Arc<Semaphore>,
}

impl RexecServer {
    /// Create a server whose external stop signal follows the config.
    pub fn new(config: ServerConfig) -> RexecResult<Self> {
        let signal: Arc<dyn StopSignal> = if config.stop_flag_enabled {
            Arc::new(FileStopSignal::new(config.stop_flag_path.clone()))
        } else {
            Arc::new(NeverStop)
        };
        Self::with_stop_signal(config, signal)
    }

    /// Create a server polling the given stop signal.
    pub fn with_stop_signal(config: ServerConfig, signal: Arc<dyn StopSignal>) -> RexecResult<Self> {
        config.validate()?;

        let policy = if config.allow_list {
            let registry = CommandRegistry::with_builtins(&config.commands)?;
            DispatchPolicy::AllowListed(Arc::new(registry))
        } else {
            warn!("allow-list disabled: authenticated clients can run any shell command");
            DispatchPolicy::Unrestricted
        };
        let dispatcher = Dispatcher::new(policy, config.command_timeout);

        let shutdown = Arc::new(ShutdownCoordinator::new(signal));
        let ctx = Arc::new(HandlerContext {
            access_code: config.access_code.clone(),
            dispatcher,
            clients: Arc::new(ClientRegistry::new()),
            log: Arc::new(LogSink::new(config.log_capacity)),
            shutdown: shutdown.subscribe(),
        });

        Ok(Self {
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            config,
            ctx,
            shutdown,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind a reusable-address listener on the configured address.
    pub fn bind(&self) -> RexecResult<TcpListener> {
        let addr = self.config.socket_addr()?;
        let bind_err = |e: std::io::Error| RexecError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)
    }

    /// Bind and serve until stopped.
    pub async fn run(self: Arc<Self>) -> RexecResult<()> {
        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                self.ctx.log.append(format!("[Server Error] {e}"));
                return Err(e);
            }
        };
        self.serve(listener).await
    }

    /// Accept loop on an already-bound listener.
    ///
    /// Wakes at least once per poll interval to check the stop signal.
    /// Returns after the listener is closed and every session was told to
    /// exit.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> RexecResult<()> {
        if self.shutdown.start()? {
            self.ctx.log.append(format!(
                "[Stop flag cleared] removed stale {}",
                self.shutdown.signal_description()
            ));
        }

        let local = listener.local_addr()?;
        self.ctx.log.append(format!("[Server started on {local}]"));
        info!(
            addr = %local,
            allow_list = self.config.allow_list,
            max_connections = self.config.max_connections,
            stop_signal = %self.shutdown.signal_description(),
            "rexec-server ready"
        );

        let poll_interval = self.config.poll_interval;
        loop {
            if self.shutdown.poll_signal() {
                self.ctx
                    .log
                    .append("[Stop flag detected] Shutting down server.");
            }
            if !self.shutdown.is_running() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_handler(stream, remote),
                    Err(e) => {
                        self.ctx.log.append(format!("[Accept error] {e}"));
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                _ = self.shutdown.stopping() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        // Close the listener before touching sessions so nothing new starts.
        drop(listener);
        self.ctx.log.append("[Stopping server]");
        let disconnected = self.ctx.clients.disconnect_all().await;
        debug!(disconnected, "sessions told to exit");
        self.shutdown.mark_stopped();
        self.ctx.log.append("[Server stopped]");
        Ok(())
    }

    fn spawn_handler(&self, stream: TcpStream, remote: SocketAddr) {
        let Ok(permit) = self.connection_slots.clone().try_acquire_owned() else {
            self.ctx.log.append(format!(
                "[Busy] refused {remote}: {} connections already open",
                self.config.max_connections
            ));
            tokio::spawn(async move {
                let mut stream = stream;
                if let Err(e) = stream.write_all(SERVER_BUSY.as_bytes()).await {
                    debug!(remote = %remote, error = %e, "could not send busy notice");
                }
                let _ = stream.shutdown().await;
            });
            return;
        };

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let (reader, writer) = stream.into_split();
            handler::handle_connection(ctx, reader, writer, remote).await;
        });
    }

    // ── Administrative surface ─────────────────────────────────────────

    /// Ask the accept loop to stop. Returns `false` if not running.
    pub fn request_shutdown(&self) -> bool {
        let requested = self.shutdown.request_stop();
        if requested {
            self.ctx.log.append("[Shutdown requested]");
        }
        requested
    }

    pub fn run_state(&self) -> RunState {
        self.shutdown.state()
    }

    /// Resolve once a stop has been requested by any path.
    pub async fn stopping(&self) {
        self.shutdown.stopping().await
    }

    /// Authenticated sessions, ordered by connection ID.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.ctx.clients.list().await
    }

    /// Send `exit` to a session and close it. Unknown IDs are a no-op.
    pub async fn disconnect_session(&self, id: ConnectionId) -> bool {
        let address = self.ctx.clients.address_of(id).await;
        let disconnected = self.ctx.clients.force_disconnect(id).await;
        if let Some(address) = address.filter(|_| disconnected) {
            self.ctx
                .log
                .append(format!("[Manually disconnected] {address}"));
        }
        disconnected
    }

    pub async fn session_count(&self) -> usize {
        self.ctx.clients.count().await
    }

    /// The operator log.
    pub fn log(&self) -> &LogSink {
        &self.ctx.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_core::protocol::{granted_banner, ACCESS_PROMPT, WRONG_CODE};
    use rexec_core::ManualStopSignal;
    use tokio::io::AsyncReadExt;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".into(),
            port: 1957,
            poll_interval: Duration::from_millis(50),
            stop_flag_enabled: false,
            ..ServerConfig::default()
        }
    }

    struct Running {
        server: Arc<RexecServer>,
        addr: SocketAddr,
        task: JoinHandle<RexecResult<()>>,
    }

    async fn start(config: ServerConfig, signal: Arc<dyn StopSignal>) -> Running {
        let server = Arc::new(RexecServer::with_stop_signal(config, signal).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(server.clone().serve(listener));
        Running { server, addr, task }
    }

    async fn start_default() -> Running {
        start(test_config(), Arc::new(NeverStop)).await
    }

    async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        tokio::time::timeout(WAIT, async {
            while !String::from_utf8_lossy(&collected).contains(needle) {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed before {needle:?}");
                collected.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .unwrap();
        String::from_utf8_lossy(&collected).into_owned()
    }

    async fn read_to_eof(stream: &mut TcpStream) -> String {
        let mut collected = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut collected))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&collected).into_owned()
    }

    async fn login(addr: SocketAddr, server: &RexecServer) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        read_until(&mut stream, ACCESS_PROMPT).await;
        stream.write_all(b"1957").await.unwrap();
        let allowed = if server.config().allow_list {
            Some(CommandRegistry::with_builtins(&server.config().commands).unwrap().tokens())
        } else {
            None
        };
        let banner = granted_banner(allowed.as_deref());
        assert_eq!(read_until(&mut stream, &banner).await, banner);
        stream
    }

    async fn wait_for_sessions(server: &RexecServer, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while server.list_sessions().await.len() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {expected} sessions"));
    }

    #[tokio::test]
    async fn wrong_code_gets_rejection_then_close() {
        let running = start_default().await;
        let mut stream = TcpStream::connect(running.addr).await.unwrap();
        read_until(&mut stream, ACCESS_PROMPT).await;
        stream.write_all(b"9999").await.unwrap();

        assert_eq!(read_to_eof(&mut stream).await, WRONG_CODE);
        // The log line lands right after the socket is closed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(running
            .server
            .log().snapshot()
            .iter()
            .any(|e| e.text.starts_with("[Auth Failed]")));
        assert!(running.server.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn get_ip_then_exit() {
        let running = start_default().await;
        let mut stream = login(running.addr, &running.server).await;

        stream.write_all(b"get_ip").await.unwrap();
        let mut buf = [0u8; 4096];
        let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);

        stream.write_all(b"exit").await.unwrap();
        assert_eq!(read_to_eof(&mut stream).await, "");
        wait_for_sessions(&running.server, 0).await;
    }

    #[tokio::test]
    async fn unknown_token_is_refused() {
        let running = start_default().await;
        let mut stream = login(running.addr, &running.server).await;

        stream.write_all(b"shutdown -h now").await.unwrap();
        let reply = read_until(&mut stream, "not allowed.").await;
        assert_eq!(reply, "Command 'shutdown -h now' not allowed.");
    }

    #[tokio::test]
    async fn two_clients_then_one() {
        let running = start_default().await;
        let mut first = login(running.addr, &running.server).await;
        let mut second = login(running.addr, &running.server).await;
        wait_for_sessions(&running.server, 2).await;

        first.write_all(b"get_ip").await.unwrap();
        second.write_all(b"bogus").await.unwrap();
        read_until(&mut second, "not allowed.").await;
        let mut buf = [0u8; 64];
        assert!(first.read(&mut buf).await.unwrap() > 0);

        first.write_all(b" Exit \n").await.unwrap();
        assert_eq!(read_to_eof(&mut first).await, "");
        wait_for_sessions(&running.server, 1).await;

        let remaining = running.server.list_sessions().await;
        assert_eq!(remaining[0].address, second.local_addr().unwrap());
    }

    #[tokio::test]
    async fn admin_disconnect_sends_exit() {
        let running = start_default().await;
        let mut stream = login(running.addr, &running.server).await;
        wait_for_sessions(&running.server, 1).await;

        let id = running.server.list_sessions().await[0].id;
        assert!(running.server.disconnect_session(id).await);
        assert_eq!(read_to_eof(&mut stream).await, "exit");
        wait_for_sessions(&running.server, 0).await;
        assert!(!running.server.disconnect_session(id).await);
    }

    #[tokio::test]
    async fn stop_signal_stops_accepting_and_disconnects() {
        let signal = Arc::new(ManualStopSignal::new());
        let running = start(test_config(), signal.clone()).await;
        let mut stream = login(running.addr, &running.server).await;
        wait_for_sessions(&running.server, 1).await;

        signal.raise();
        tokio::time::timeout(WAIT, running.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(read_to_eof(&mut stream).await, "exit");
        assert_eq!(running.server.run_state(), RunState::Stopped);
        assert!(running.server.list_sessions().await.is_empty());
        assert!(TcpStream::connect(running.addr).await.is_err());

        let log: Vec<_> = running.server.log().snapshot().into_iter().map(|e| e.text).collect();
        assert!(log.iter().any(|l| l.starts_with("[Stop flag detected]")));
        assert!(log.iter().any(|l| l == "[Server stopped]"));
        assert!(!running.server.request_shutdown());
    }

    #[tokio::test]
    async fn stop_flag_file_stops_server() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("server_stop.flag");
        let config = ServerConfig {
            stop_flag_enabled: true,
            stop_flag_path: flag.clone(),
            ..test_config()
        };
        let server = Arc::new(RexecServer::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(server.clone().serve(listener));

        tokio::time::sleep(Duration::from_millis(100)).await;
        FileStopSignal::new(&flag).raise().unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(server.run_state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn request_shutdown_is_idempotent() {
        let running = start_default().await;
        wait_until_running(&running.server).await;
        assert!(running.server.request_shutdown());
        assert!(!running.server.request_shutdown());
        tokio::time::timeout(WAIT, running.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!running.server.request_shutdown());
    }

    async fn wait_until_running(server: &RexecServer) {
        tokio::time::timeout(WAIT, async {
            while server.run_state() != RunState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn connection_ceiling_turns_extra_clients_away() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let running = start(config, Arc::new(NeverStop)).await;
        let _first = login(running.addr, &running.server).await;

        let mut second = TcpStream::connect(running.addr).await.unwrap();
        assert_eq!(read_to_eof(&mut second).await, SERVER_BUSY);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unrestricted_mode_runs_shell_lines() {
        let config = ServerConfig {
            allow_list: false,
            ..test_config()
        };
        let running = start(config, Arc::new(NeverStop)).await;
        let mut stream = login(running.addr, &running.server).await;

        stream.write_all(b"echo rexec-check").await.unwrap();
        assert_eq!(read_until(&mut stream, "\n").await, "rexec-check\n");

        stream.write_all(b"true").await.unwrap();
        assert_eq!(
            read_until(&mut stream, "]").await,
            "[Command executed]"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_closes_session_whose_peer_stopped_reading() {
        let config = ServerConfig {
            allow_list: false,
            ..test_config()
        };
        let running = start(config, Arc::new(NeverStop)).await;
        let mut stream = login(running.addr, &running.server).await;
        wait_for_sessions(&running.server, 1).await;

        // Far more output than the socket buffers hold, and nobody reads it.
        stream.write_all(b"head -c 20000000 /dev/zero").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let started = std::time::Instant::now();
        assert!(running.server.request_shutdown());
        tokio::time::timeout(WAIT, running.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(running.server.run_state(), RunState::Stopped);

        tokio::time::timeout(WAIT, async {
            while !running.server.log().render().contains("[Disconnected]") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mut drained = Vec::new();
        let closed = tokio::time::timeout(WAIT, stream.read_to_end(&mut drained)).await;
        assert!(closed.is_ok(), "socket still open after shutdown");
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            port: occupied.local_addr().unwrap().port(),
            ..test_config()
        };
        let server = Arc::new(RexecServer::new(config).unwrap());
        let err = server.clone().run().await.unwrap_err();
        assert!(matches!(err, RexecError::Bind { .. }));
        assert_eq!(server.run_state(), RunState::Idle);
        assert!(server
            .log().snapshot()
            .iter()
            .any(|e| e.text.starts_with("[Server Error]")));
    }

    #[test]
    fn invalid_config_is_rejected_before_binding() {
        let config = ServerConfig {
            access_code: String::new(),
            ..test_config()
        };
        assert!(matches!(
            RexecServer::new(config),
            Err(RexecError::ConfigInvalid(_))
        ));
    }
}
