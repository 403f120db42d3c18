//! `rexec connect <host>` — interactive command loop.
//!
//! Authenticates, prints the advertised commands, then sends each input
//! line as a command until `exit`/`quit`, end of input, or the server ends
//! the session.

use anyhow::{Context, Result};
use rexec_core::is_exit_token;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use super::Target;
use crate::session::RemoteSession;

/// Run an interactive session on stdin/stdout.
pub async fn run(target: &Target) -> Result<()> {
    info!(host = %target.host, port = target.port, "connecting");
    let session = RemoteSession::open(
        &target.host,
        target.port,
        &target.access_code,
        target.timeout,
    )
    .await
    .with_context(|| format!("failed to open session on {}:{}", target.host, target.port))?;

    let stdin = BufReader::new(tokio::io::stdin());
    drive(session, stdin, tokio::io::stdout()).await
}

/// Command loop over arbitrary input and output streams.
pub async fn drive<R, W>(mut session: RemoteSession, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut greeting = String::from("Access granted.\n");
    if let Some(commands) = session.allowed_commands() {
        greeting.push_str("Available commands:\n");
        for command in commands {
            greeting.push_str(&format!("  {command}\n"));
        }
    }
    greeting.push_str("Type 'exit' to disconnect.\n");
    output.write_all(greeting.as_bytes()).await?;

    let mut lines = input.lines();
    loop {
        output.write_all(b"> ").await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            debug!("input closed");
            break;
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if is_exit_token(command) {
            break;
        }

        let reply = session.send_command(command).await?;
        if reply.is_server_exit() {
            output.write_all(b"[Disconnected by server]\n").await?;
            output.flush().await?;
            return Ok(());
        }

        output.write_all(reply.text.as_bytes()).await?;
        if !reply.text.ends_with('\n') {
            output.write_all(b"\n").await?;
        }
        if reply.closed {
            output.write_all(b"[Connection closed]\n").await?;
            output.flush().await?;
            return Ok(());
        }
    }

    session.close().await;
    output.write_all(b"[Disconnected]\n").await?;
    output.flush().await?;
    Ok(())
}
