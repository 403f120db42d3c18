//! `rexec exec <host> <command>` — run one command and print its output.
//!
//! Exits non-zero when the server refuses the command or reports an error.

use anyhow::{Context, Result};
use tracing::info;

use super::Target;
use crate::session::{RemoteSession, Reply};

/// Run `command` on the target and print the reply.
pub async fn run(target: &Target, command: &str) -> Result<()> {
    info!(host = %target.host, port = target.port, command = %command, "exec");

    let mut session = RemoteSession::open(
        &target.host,
        target.port,
        &target.access_code,
        target.timeout,
    )
    .await
    .with_context(|| format!("failed to open session on {}:{}", target.host, target.port))?;

    let reply = session
        .send_command(command)
        .await
        .with_context(|| format!("command '{command}' failed"))?;
    if !reply.closed {
        session.close().await;
    }

    print!("{}", reply.text);
    if !reply.text.ends_with('\n') {
        println!();
    }

    if reply.is_server_exit() {
        anyhow::bail!("server closed the session");
    }
    if is_refusal(&reply) {
        anyhow::bail!("server refused '{command}'");
    }
    Ok(())
}

/// Whether a reply reports a rejected or failed command.
pub fn is_refusal(reply: &Reply) -> bool {
    let text = reply.text.trim();
    text.starts_with("[Error]") || (text.starts_with("Command '") && text.ends_with("' not allowed."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> Reply {
        Reply {
            text: text.to_string(),
            closed: false,
        }
    }

    #[test]
    fn refusals_are_recognised() {
        assert!(is_refusal(&reply("Command 'reboot' not allowed.")));
        assert!(is_refusal(&reply("[Error] command timed out after 30s")));
        assert!(!is_refusal(&reply("192.168.1.14")));
        assert!(!is_refusal(&reply("[OK]")));
    }
}
