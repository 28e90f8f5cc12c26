//! Command channel with an in-memory transport.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostwatch_agent::chat::api::{Chat, Message, User};
use hostwatch_agent::chat::format::{self, HELP};
use hostwatch_agent::chat::{ChatError, ChatListener, ChatTransport, SendMessage, Update};
use hostwatch_agent::sampler::Job;
use hostwatch_agent::state::UsageView;
use hostwatch_agent::types::{CoreUsage, PeerRecord};
use tokio_util::sync::CancellationToken;
use tracing::Span;

const ADMIN: i64 = 42;

#[derive(Clone, Default)]
struct FakeTransport {
    batches: Arc<Mutex<VecDeque<Result<Vec<Update>, ChatError>>>>,
    offsets: Arc<Mutex<Vec<Option<i64>>>>,
    sent: Arc<Mutex<Vec<SendMessage>>>,
    // replies containing any of these markers fail to send
    fail_on: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    fn push(&self, batch: Result<Vec<Update>, ChatError>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    fn sent(&self) -> Vec<SendMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl ChatTransport for FakeTransport {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        _timeout: Duration,
    ) -> Result<Vec<Update>, ChatError> {
        self.offsets.lock().unwrap().push(offset);
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ChatError::Timeout))
    }

    async fn send_message(&self, request: &SendMessage) -> Result<Message, ChatError> {
        if self
            .fail_on
            .lock()
            .unwrap()
            .iter()
            .any(|marker| request.text.contains(marker.as_str()))
        {
            return Err(ChatError::Api("Bad Request: can't parse entities".into()));
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(Message {
            message_id: 1,
            from: None,
            chat: Chat {
                id: request.chat_id,
                kind: "private".into(),
            },
            text: request.text.clone(),
        })
    }
}

fn update(id: i64, from: i64, chat_id: i64, kind: &str, text: &str) -> Update {
    Update {
        update_id: id,
        message: Some(Message {
            message_id: id,
            from: Some(User { id: from }),
            chat: Chat {
                id: chat_id,
                kind: kind.into(),
            },
            text: text.into(),
        }),
    }
}

fn admin(id: i64, text: &str) -> Update {
    update(id, ADMIN, ADMIN, "private", text)
}

struct Setup {
    transport: FakeTransport,
    cpu: UsageView<CoreUsage>,
    peers: UsageView<PeerRecord>,
    listener: ChatListener<FakeTransport>,
}

fn setup() -> Setup {
    let transport = FakeTransport::default();
    let cpu = UsageView::new();
    let peers = UsageView::new();
    let listener = ChatListener::new(
        transport.clone(),
        ADMIN,
        cpu.clone(),
        Some(peers.clone()),
        CancellationToken::new(),
        Span::none(),
    )
    .with_host("box");
    Setup {
        transport,
        cpu,
        peers,
        listener,
    }
}

#[tokio::test]
async fn only_private_admin_messages_are_answered() {
    let mut s = setup();
    s.transport.push(Ok(vec![
        update(1, 7, 7, "private", "/hw_usage"),
        update(2, ADMIN, -100, "group", "/hw_usage"),
        update(3, ADMIN, 7, "private", "/hw_usage"),
        Update {
            update_id: 4,
            message: None,
        },
        admin(5, "/hw_usage"),
    ]));

    s.listener.poll().await.unwrap();
    let sent = s.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, ADMIN);
    assert_eq!(sent[0].parse_mode, "MarkdownV2");
    assert!(sent[0].disable_notification);
    // skipped updates still advance the offset
    assert_eq!(s.listener.last_update_id(), Some(5));
}

#[tokio::test]
async fn cpu_reply_before_and_after_first_sample() {
    let mut s = setup();
    s.transport.push(Ok(vec![admin(1, "/hw_usage")]));
    s.listener.poll().await.unwrap();

    s.cpu
        .publish(vec![
            CoreUsage {
                slug: "cpu0".into(),
                percentage: 12,
            },
            CoreUsage {
                slug: "cpu1".into(),
                percentage: 100,
            },
        ])
        .await;
    s.transport.push(Ok(vec![admin(2, "/hw_usage@hostwatch_bot")]));
    s.listener.poll().await.unwrap();

    let sent = s.transport.sent();
    assert!(sent[0].text.starts_with("🖥 `box`\n"));
    assert!(sent[0].text.contains("not found"));
    assert!(sent[1].text.contains("`cpu0` \\- 12%"));
    assert!(sent[1].text.contains("`cpu1` \\- 100%"));
    assert!(sent.iter().all(|m| m.text.ends_with(HELP)));
}

#[tokio::test]
async fn peer_reply_distinguishes_missing_and_empty() {
    let mut s = setup();
    s.transport.push(Ok(vec![admin(1, "/wg_usage")]));
    s.listener.poll().await.unwrap();

    s.peers.publish(Vec::new()).await;
    s.transport.push(Ok(vec![admin(2, "/wg_usage")]));
    s.listener.poll().await.unwrap();

    let sent = s.transport.sent();
    assert!(sent[0].text.contains("is not found"));
    assert!(sent[1].text.contains("is empty"));
}

#[tokio::test]
async fn unknown_text_gets_help() {
    let mut s = setup();
    s.transport.push(Ok(vec![admin(1, "hello there")]));
    s.listener.poll().await.unwrap();

    let sent = s.transport.sent();
    assert_eq!(sent[0].text, format!("🖥 `box`\n{}", format::help_message()));
}

#[tokio::test]
async fn offset_stops_at_first_failed_update() {
    let mut s = setup();
    s.transport.fail_on.lock().unwrap().push("Hello".into());
    s.transport.push(Ok(vec![
        admin(10, "/hw_usage"),
        admin(11, "/start"),
        admin(12, "/hw_usage"),
    ]));

    assert!(s.listener.poll().await.is_err());
    assert_eq!(s.listener.last_update_id(), Some(10));
    assert_eq!(s.transport.sent().len(), 1);

    // the failed update is fetched again
    s.transport.push(Ok(Vec::new()));
    s.listener.poll().await.unwrap();
    let offsets = s.transport.offsets.lock().unwrap().clone();
    assert_eq!(offsets, [None, Some(11)]);
}

#[tokio::test]
async fn timeouts_are_quiet_and_errors_are_reported() {
    let mut s = setup();
    s.transport.push(Err(ChatError::Timeout));
    s.transport.push(Err(ChatError::EmptyResult));

    assert!(s.listener.tick().await.is_ok());
    assert!(s.listener.tick().await.is_err());
    assert_eq!(s.listener.last_update_id(), None);
}

#[tokio::test]
async fn disabled_peer_view_reads_as_not_found() {
    let transport = FakeTransport::default();
    let mut listener = ChatListener::new(
        transport.clone(),
        ADMIN,
        UsageView::new(),
        None,
        CancellationToken::new(),
        Span::none(),
    );
    transport.push(Ok(vec![admin(1, "/wg_usage")]));
    listener.poll().await.unwrap();
    assert!(transport.sent()[0].text.contains("is not found"));
}

#[test]
fn peer_lines_show_status_handshake_and_transfer() {
    let now = 1_700_000_000;
    let peers = [
        PeerRecord {
            name: "laptop".into(),
            latest_handshake: now - 30,
            transfer_rx: 2048,
            transfer_tx: 0,
        },
        PeerRecord {
            name: "phone".into(),
            latest_handshake: 0,
            transfer_rx: 0,
            transfer_tx: 0,
        },
    ];
    let text = format::peer_message(Some(&peers[..]), now);

    assert!(text.contains("`laptop` is `online`"));
    assert!(text.contains(&format!(
        "handshaked at `{}`",
        format::format_handshake(now - 30)
    )));
    assert!(text.contains("received `2.00 KiB`"));
    assert!(!text.contains("sent "));
    assert!(text.contains("`phone` is `offline`"));
    assert_eq!(text.matches("handshaked at").count(), 1);
}
