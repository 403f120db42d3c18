//! Per-connection protocol.
//!
//! Drives one session from the access-code prompt through the command loop:
//! 1. Server sends the access prompt
//! 2. Client sends the code (one attempt)
//! 3. Server rejects and closes, or grants and registers the session
//! 4. Client sends commands, server replies with their output
//! 5. `exit`/`quit`, peer close, transport failure or a server-side close
//!    ends the loop, and the session is torn down exactly once

use crate::commands::{DispatchOutcome, Dispatcher};
use crate::log_sink::LogSink;
use crate::registry::{ClientRegistry, ConnectionId, SessionLink};
use rexec_core::protocol::{
    granted_banner, ACCESS_PROMPT, CODE_READ_LIMIT, COMMAND_READ_LIMIT, WRONG_CODE,
};
use rexec_core::{decode_lossy, is_exit_token, RexecError, RexecResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tracing::debug;

/// Log lines longer than this are cut.
const LOG_RESULT_LIMIT: usize = 1000;

/// Everything a handler needs from the server, shared by all connections.
pub struct HandlerContext {
    pub access_code: String,
    pub dispatcher: Dispatcher,
    pub clients: Arc<ClientRegistry>,
    pub log: Arc<LogSink>,
    /// Flips to `true` when the server shuts down.
    pub shutdown: watch::Receiver<bool>,
}

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitingCode,
    Authenticated,
    Closed,
}

/// Why the command loop ended.
#[derive(Debug)]
enum CloseReason {
    ExitToken,
    PeerClosed,
    ServerClosed,
    Transport(RexecError),
}

/// A single read outcome.
enum Inbound {
    Data(Vec<u8>),
    Eof,
    Closed,
}

struct Session<R> {
    id: ConnectionId,
    remote: SocketAddr,
    state: AuthState,
    reader: R,
    link: Arc<SessionLink>,
    closed: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

/// Run the full protocol on one accepted connection.
pub async fn handle_connection<R, W>(
    ctx: Arc<HandlerContext>,
    reader: R,
    writer: W,
    remote: SocketAddr,
) where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (link, closed) = SessionLink::new(writer);
    let mut session = Session {
        id: ctx.clients.next_id(),
        remote,
        state: AuthState::AwaitingCode,
        reader,
        link,
        closed,
        shutdown: ctx.shutdown.clone(),
    };
    debug!(id = session.id, remote = %remote, "connection accepted");

    match session.authenticate(&ctx).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            ctx.log.append(format!("[Error] {remote} - {e}"));
            session.link.close().await;
            return;
        }
    }

    let reason = session.command_loop(&ctx).await;
    session.finish(&ctx, reason).await;
}

impl<R> Session<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Prompt for and check the access code. `Ok(false)` means rejected.
    async fn authenticate(&mut self, ctx: &HandlerContext) -> RexecResult<bool> {
        self.link.send(ACCESS_PROMPT.as_bytes()).await?;

        let code = match self.read_chunk(CODE_READ_LIMIT).await? {
            Inbound::Data(bytes) => decode_lossy(&bytes),
            Inbound::Eof => String::new(),
            Inbound::Closed => {
                debug!(remote = %self.remote, "server closed connection before authentication");
                self.link.close().await;
                self.state = AuthState::Closed;
                return Ok(false);
            }
        };

        if code.trim().as_bytes() != ctx.access_code.as_bytes() {
            if let Err(e) = self.link.send(WRONG_CODE.as_bytes()).await {
                debug!(remote = %self.remote, error = %e, "could not deliver rejection");
            }
            self.link.close().await;
            self.state = AuthState::Closed;
            ctx.log.append(format!("[Auth Failed] {}", self.remote));
            return Ok(false);
        }

        let allowed = ctx.dispatcher.allowed_tokens();
        self.link
            .send(granted_banner(allowed.as_deref()).as_bytes())
            .await?;

        ctx.clients
            .register(self.id, self.remote, self.link.clone())
            .await;
        self.state = AuthState::Authenticated;
        ctx.log.append(format!("[Connected] {}", self.remote));
        Ok(true)
    }

    async fn command_loop(&mut self, ctx: &HandlerContext) -> CloseReason {
        let ip = self.remote.ip();
        loop {
            let bytes = match self.read_chunk(COMMAND_READ_LIMIT).await {
                Ok(Inbound::Data(bytes)) => bytes,
                Ok(Inbound::Eof) => return CloseReason::PeerClosed,
                Ok(Inbound::Closed) => return CloseReason::ServerClosed,
                Err(e) => return CloseReason::Transport(e),
            };

            let text = decode_lossy(&bytes);
            if is_exit_token(&text) {
                return CloseReason::ExitToken;
            }
            let command = text.trim();

            let outcome = tokio::select! {
                outcome = ctx.dispatcher.dispatch(command) => outcome,
                _ = self.closed.wait_for(|closed| *closed) => return CloseReason::ServerClosed,
                _ = self.shutdown.wait_for(|stopping| *stopping) => return CloseReason::ServerClosed,
            };
            if let Err(e) = self.link.send(outcome.reply().as_bytes()).await {
                if self.link.is_closed() {
                    return CloseReason::ServerClosed;
                }
                return CloseReason::Transport(e);
            }

            match &outcome {
                DispatchOutcome::NotAllowed(_) => {
                    ctx.log
                        .append(format!("[{ip}] tried disallowed command: {command}"));
                }
                DispatchOutcome::Completed(reply) | DispatchOutcome::Failed(reply) => {
                    ctx.log
                        .append(format!("[{ip}] > {command}\n{}", truncate_for_log(reply)));
                }
            }
        }
    }

    /// Terminal step: consumes the session so it can only run once.
    async fn finish(mut self, ctx: &HandlerContext, reason: CloseReason) {
        debug!(id = self.id, remote = %self.remote, ?reason, "session ending");
        if let CloseReason::Transport(e) = &reason {
            ctx.log.append(format!("[Error] {} - {e}", self.remote));
        }

        match reason {
            CloseReason::ServerClosed => self.link.force_disconnect().await,
            _ => self.link.close().await,
        }
        if self.state == AuthState::Authenticated {
            ctx.clients.unregister(self.id).await;
        }
        self.state = AuthState::Closed;
        ctx.log.append(format!("[Disconnected] {}", self.remote));
    }

    /// Read at most `limit` bytes, giving up early if the link is closed or
    /// the server shuts down.
    async fn read_chunk(&mut self, limit: usize) -> RexecResult<Inbound> {
        let mut buf = vec![0u8; limit];
        tokio::select! {
            read = self.reader.read(&mut buf) => {
                let n = read.map_err(|e| RexecError::Transport(format!("receive failed: {e}")))?;
                if n == 0 {
                    return Ok(Inbound::Eof);
                }
                buf.truncate(n);
                Ok(Inbound::Data(buf))
            }
            _ = self.closed.wait_for(|closed| *closed) => Ok(Inbound::Closed),
            _ = self.shutdown.wait_for(|stopping| *stopping) => Ok(Inbound::Closed),
        }
    }
}

fn truncate_for_log(text: &str) -> String {
    if text.chars().count() > LOG_RESULT_LIMIT {
        let cut: String = text.chars().take(LOG_RESULT_LIMIT).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
