//! Terminal chat client for the event platform.
//!
//! Usage:
//!   teamlink -c teamlink.conf
//!   teamlink -c teamlink.conf --token <bearer> --verbose
//!
//! Commands on stdin: `/mode ai|admin|team`, `/peer <id>` (`/peer` alone for
//! the team channel), `/all <text>`, `/connect`, `/disconnect`, `/quit`.
//! Anything else is sent to the active conversation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use teamlink::config::{self, ClientConfig};
use teamlink::link::{ConnectionManager, WsConnector};
use teamlink::live::LiveUpdates;
use teamlink::session::{ChatHistory, ChatMode, Direction, HttpHistory, NoHistory, SessionContext};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "teamlink", about = "Resilient chat client for the event platform")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "teamlink.conf")]
    config: PathBuf,

    /// Bearer token; overrides the configuration file.
    #[arg(long, conflicts_with = "cookie")]
    token: Option<String>,

    /// Session cookie (`sessionid=...`); overrides the configuration file.
    #[arg(long)]
    cookie: Option<String>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("teamlink: config error: {e}");
            process::exit(1);
        }
    };
    if let Some(token) = cli.token {
        cfg.auth_token = Some(token);
    }
    if let Some(cookie) = cli.cookie {
        cfg.auth_token = None;
        cfg.session_cookie = Some(cookie);
    }
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("teamlink: config validation: {e}");
        process::exit(1);
    }

    let result = match cfg.history_url.clone() {
        Some(base) => match HttpHistory::new(&base, cfg.credentials()) {
            Ok(history) => run(cfg, history).await,
            Err(e) => Err(anyhow::Error::new(e).context("history_url")),
        },
        None => run(cfg, NoHistory).await,
    };
    if let Err(e) = result {
        error!("teamlink: {e:#}");
        process::exit(1);
    }
}

async fn run<H: ChatHistory>(cfg: ClientConfig, history: H) -> anyhow::Result<()> {
    let ws_url = cfg.ws_url.clone().context("ws_url is required")?;
    let chat = WsConnector::new(ws_url, cfg.credentials());
    info!("chat endpoint {}", chat.url());
    let link = ConnectionManager::spawn(chat, cfg.link_settings());
    let session = Arc::new(SessionContext::new(link, history));

    let live = cfg.live_url.clone().map(|url| {
        let connector = WsConnector::new(url, cfg.credentials());
        info!("live endpoint {}", connector.url());
        LiveUpdates::spawn(connector, cfg.link_settings())
    });

    tokio::spawn(print_status(Arc::clone(&session)));
    tokio::spawn(print_messages(Arc::clone(&session)));
    if let Some(live) = &live {
        tokio::spawn(print_live(live.subscribe()));
    }

    if cfg.auto_connect {
        session.connect()?;
        if let Some(live) = &live {
            live.connect()?;
        }
    }
    session.switch_mode(ChatMode::Ai).await;
    info!("teamlink ready; type /quit to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&session, live.as_ref(), line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    session.disconnect()?;
    if let Some(live) = &live {
        live.disconnect()?;
    }
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line<H: ChatHistory>(
    session: &SessionContext<H>,
    live:    Option<&LiveUpdates>,
    line:    &str,
) -> bool {
    let (cmd, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    let outcome = match cmd {
        "/quit" => return false,
        "/mode" => match arg.parse::<ChatMode>() {
            Ok(mode) => {
                session.switch_mode(mode).await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        "/peer" => session.select_peer((!arg.is_empty()).then_some(arg)).await,
        "/all" => session.send_broadcast(arg).map(drop),
        "/connect" => live
            .map_or(Ok(()), LiveUpdates::connect)
            .and_then(|()| session.connect()),
        "/disconnect" => live
            .map_or(Ok(()), LiveUpdates::disconnect)
            .and_then(|()| session.disconnect()),
        _ => session.send_message(line, None).map(drop),
    };
    if let Err(e) = outcome {
        warn!("{line}: {e}");
    }
    true
}

async fn print_status<H: ChatHistory>(session: Arc<SessionContext<H>>) {
    let mut rx = session.link().watch_status();
    while rx.changed().await.is_ok() {
        let status = *rx.borrow_and_update();
        if status.terminal {
            println!("** link lost; /connect to try again");
        } else {
            println!("** {} (retry {}, {} queued)", status.state, status.attempt, status.queued);
        }
    }
}

async fn print_messages<H: ChatHistory>(session: Arc<SessionContext<H>>) {
    let mut changes = session.changes();
    let mut shown: HashSet<String> = HashSet::new();
    while changes.changed().await.is_ok() {
        let fresh: Vec<String> = session.with_state(|s| {
            let Some(conv) = s.active_conversation() else { return Vec::new() };
            conv.messages
                .iter()
                .filter(|m| shown.insert(m.id.clone()))
                .map(|m| match m.direction {
                    Direction::System   => format!("-- {}", m.body),
                    Direction::Outgoing => format!("{} > {}", m.timestamp.format("%H:%M"), m.body),
                    Direction::Incoming => {
                        format!("{} {}: {}", m.timestamp.format("%H:%M"), m.sender_id, m.body)
                    }
                })
                .collect()
        });
        for line in fresh {
            println!("{line}");
        }
    }
}

async fn print_live(mut rx: tokio::sync::broadcast::Receiver<teamlink::live::LiveEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(event) => println!("** live: {event:?}"),
            Err(RecvError::Lagged(n)) => warn!("live: {n} event(s) missed"),
            Err(RecvError::Closed) => break,
        }
    }
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) {
    let level = if verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}
