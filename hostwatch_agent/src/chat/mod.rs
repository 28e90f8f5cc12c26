//! Command channel: long-polls the bot API and answers the admin's commands
//! from the published usage views.

pub mod api;
pub mod format;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

use crate::sampler::Job;
use crate::state::UsageView;
use crate::types::{CoreUsage, PeerRecord};

pub use api::{ChatError, ChatTransport, HttpChatApi, SendMessage, Update};

pub const CMD_HW_USAGE: &str = "/hw_usage";
pub const CMD_WG_USAGE: &str = "/wg_usage";

/// Poll period of the listener loop.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    HwUsage,
    WgUsage,
    Help,
}

impl Command {
    /// Anything that is not a known command gets the help reply.
    /// A `@botname` suffix is accepted.
    pub fn parse(text: &str) -> Self {
        let word = text.split_whitespace().next().unwrap_or_default();
        let cmd = word.split('@').next().unwrap_or_default();
        match cmd {
            CMD_HW_USAGE => Command::HwUsage,
            CMD_WG_USAGE => Command::WgUsage,
            _ => Command::Help,
        }
    }
}

pub struct ChatListener<T> {
    transport: T,
    admin_id: i64,
    host: String,
    cpu: UsageView<CoreUsage>,
    // None when the peer reconciler is disabled
    peers: Option<UsageView<PeerRecord>>,
    last_update_id: Option<i64>,
    poll_timeout: Duration,
    cancel: CancellationToken,
    span: Span,
}

impl<T: ChatTransport> ChatListener<T> {
    pub fn new(
        transport: T,
        admin_id: i64,
        cpu: UsageView<CoreUsage>,
        peers: Option<UsageView<PeerRecord>>,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            transport,
            admin_id,
            host: local_host(),
            cpu,
            peers,
            last_update_id: None,
            poll_timeout: api::POLL_TIMEOUT,
            cancel,
            span,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn last_update_id(&self) -> Option<i64> {
        self.last_update_id
    }

    /// Only private messages from the admin are handled.
    pub fn should_skip(&self, update: &Update) -> bool {
        let Some(msg) = update.message.as_ref() else {
            return true;
        };
        let Some(from) = msg.from.as_ref() else {
            return true;
        };
        from.id != self.admin_id
            || msg.chat.kind != api::CHAT_TYPE_PRIVATE
            || msg.chat.id != self.admin_id
    }

    pub async fn reply_text(&self, command: Command) -> String {
        let body = match command {
            Command::HwUsage => {
                let usage = self.cpu.current().await;
                format::cpu_message(usage.as_deref())
            }
            Command::WgUsage => {
                let usage = match &self.peers {
                    Some(view) => view.current().await,
                    None => None,
                };
                format::peer_message(usage.as_deref(), now_unix())
            }
            Command::Help => format::help_message(),
        };
        format!("{}{body}", format::host_header(&self.host))
    }

    pub async fn handle_update(&self, update: &Update) -> Result<(), ChatError> {
        if self.should_skip(update) {
            debug!(update_id = update.update_id, "update skipped");
            return Ok(());
        }
        let text = update
            .message
            .as_ref()
            .map(|m| m.text.as_str())
            .unwrap_or_default();
        let command = Command::parse(text);
        debug!(update_id = update.update_id, ?command, "handling command");

        let reply = SendMessage::markdown(self.admin_id, self.reply_text(command).await);
        self.transport.send_message(&reply).await?;
        Ok(())
    }

    /// One long-poll round. The offset advances past every handled update and
    /// stops at the first one that fails.
    pub async fn poll(&mut self) -> Result<(), ChatError> {
        let offset = self.last_update_id.map(|id| id + 1);
        let updates = self
            .transport
            .get_updates(offset, self.poll_timeout)
            .await?;

        for update in &updates {
            self.handle_update(update).await?;
            self.last_update_id = Some(update.update_id);
        }
        Ok(())
    }
}

impl<T: ChatTransport + 'static> Job for ChatListener<T> {
    fn span(&self) -> Span {
        self.span.clone()
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = self.poll() => result,
        };

        match result {
            Err(e) if e.is_timeout() => {
                debug!("poll timed out");
                Ok(())
            }
            other => other.context("can't handle updates"),
        }
    }
}

fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(Command::parse("/hw_usage"), Command::HwUsage);
        assert_eq!(Command::parse("/wg_usage@hostwatch_bot"), Command::WgUsage);
        assert_eq!(Command::parse("  /hw_usage now"), Command::HwUsage);
        assert_eq!(Command::parse("/start"), Command::Help);
        assert_eq!(Command::parse(""), Command::Help);
    }
}
