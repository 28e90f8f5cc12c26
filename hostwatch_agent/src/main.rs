//! hostwatch agent entry point: wires the samplers, the chat listener and the
//! tag store, then runs until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};
use tracing_subscriber::{fmt, EnvFilter};

use hostwatch_agent::chat::{self, ChatListener, HttpChatApi};
use hostwatch_agent::cli::{parse_args, CliAction};
use hostwatch_agent::config::AgentConfig;
use hostwatch_agent::cpu::{CpuSampler, ProcStatFile};
use hostwatch_agent::peers::{NameResolver, PeerReconciler, StatusCommand};
use hostwatch_agent::sampler::{listen, Listener};
use hostwatch_agent::state::UsageView;
use hostwatch_agent::store::{BlobStore, TagStore};

fn init_tracing(cli_level: Option<&str>) -> Result<()> {
    let directive = cli_level
        .map(str::to_owned)
        .or_else(|| std::env::var("HOSTWATCH_LOG").ok())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".into());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("invalid log level: {directive}"))?;
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = match parse_args(std::env::args()) {
        CliAction::Run { log_level } => log_level,
        CliAction::Help(msg) | CliAction::Version(msg) => {
            println!("{msg}");
            return Ok(());
        }
        CliAction::Error(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    init_tracing(log_level.as_deref())?;
    let cfg = AgentConfig::from_env().context("loading config")?;
    info!(version = env!("CARGO_PKG_VERSION"), ?cfg, "starting hostwatch agent");

    let store = Arc::new(TagStore::new(cfg.store.root.clone(), info_span!("tag_store")));
    store
        .prepare()
        .with_context(|| format!("preparing tag store at {}", cfg.store.root.display()))?;

    let cancel = CancellationToken::new();
    let result = run(&cfg, store.clone(), cancel.clone()).await;
    cancel.cancel();

    // the working dir goes away exactly once, whatever happened above
    if let Err(e) = store.clean() {
        error!("can't clean tag store: {e}");
    }
    info!("bye");
    result
}

async fn run(cfg: &AgentConfig, store: Arc<TagStore>, cancel: CancellationToken) -> Result<()> {
    let mut listeners: Vec<Listener> = Vec::new();

    // a failed setup still has to stop whatever already started
    let started = start_listeners(cfg, store, &cancel, &mut listeners).await;
    if started.is_ok() {
        info!(listeners = listeners.len(), "started");
        wait_for_signal().await;
    }

    cancel.cancel();
    for listener in listeners {
        let name = listener.name();
        if let Err(e) = listener.wait().await {
            error!(name, "listener failed: {e:#}");
        }
    }
    started
}

async fn start_listeners(
    cfg: &AgentConfig,
    store: Arc<TagStore>,
    cancel: &CancellationToken,
    listeners: &mut Vec<Listener>,
) -> Result<()> {
    let cpu_view = UsageView::new();
    let cpu = CpuSampler::new(
        ProcStatFile::new(&cfg.cpu.source),
        cpu_view.clone(),
        info_span!("cpu_sampler"),
    );
    listeners.push(listen("cpu_sampler", cfg.cpu.period, cpu, cancel.child_token()).await?);

    let peer_view = match &cfg.peers {
        Some(peer_cfg) => {
            let resolver = NameResolver::new(&peer_cfg.conf_dir, peer_cfg.conf_pattern.clone())?;
            let status = StatusCommand::new(
                peer_cfg.command.clone(),
                peer_cfg.args.clone(),
                peer_cfg.command_timeout,
            );
            let view = UsageView::new();
            let blobs: Arc<dyn BlobStore> = store;
            let peers = PeerReconciler::new(
                resolver,
                status,
                blobs,
                view.clone(),
                info_span!("peer_reconciler"),
            );
            peers.prepare().context("preparing peer reconciler")?;
            let listener =
                listen("peer_reconciler", peer_cfg.period, peers, cancel.child_token()).await?;
            listeners.push(listener);
            Some(view)
        }
        None => {
            info!("peer reconciler disabled");
            None
        }
    };

    match &cfg.chat {
        Some(chat_cfg) => {
            let api = HttpChatApi::new(chat_cfg.api_url.clone(), chat_cfg.token.clone())
                .context("building chat client")?;
            let token = cancel.child_token();
            let listener = ChatListener::new(
                api,
                chat_cfg.admin_id,
                cpu_view,
                peer_view,
                token.clone(),
                info_span!("chat_listener"),
            );
            listeners.push(listen("chat_listener", chat::TICK_PERIOD, listener, token).await?);
        }
        None => info!("chat listener disabled, HOSTWATCH_CHAT_TOKEN not set"),
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => error!("can't register SIGTERM handler: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("can't listen for SIGINT: {e}");
    }
    info!("received SIGINT, shutting down");
}
