use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;

use slot_sentinel::config::{
    get_config_path, get_data_dir, get_storage_path, load_config, parse_target_texts_input,
    save_config, PRODUCT_NAME,
};
use slot_sentinel::dom::NodeSnapshot;
use slot_sentinel::selector::Selector;
use slot_sentinel::watch::{NotificationDetails, MATCH_MESSAGE};
use slot_sentinel::{
    run_notifier, spawn_watch, Document, Dom, FileStore, Matcher, Notification, Notifier,
    PageSnapshot, Settings, SettingsStore,
};

#[derive(Parser)]
#[command(name = PRODUCT_NAME, version, about = "Watch a page for an available slot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Save settings and turn monitoring on
    Set {
        #[arg(long)]
        selector: String,
        #[arg(long)]
        color: String,
        /// Comma separated, at most three are kept
        #[arg(long)]
        texts: String,
    },
    /// Turn monitoring off
    Stop,
    /// Show paths, settings and monitoring state
    Status,
    /// Report matcher outcomes for every selector match in a page snapshot
    Check {
        #[arg(long)]
        page: PathBuf,
    },
    /// Run the watcher against a page snapshot
    Replay {
        #[arg(long)]
        page: PathBuf,
        /// Scripted insertions
        #[arg(long)]
        mutations: Option<PathBuf>,
        /// Seconds to keep running after the last insertion
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Update channel settings in config.json
    Config {
        /// Push service access token
        #[arg(long)]
        push_token: Option<String>,
        #[arg(long)]
        push_url: Option<String>,
        #[arg(long)]
        push_enabled: Option<bool>,
        #[arg(long)]
        desktop_enabled: Option<bool>,
        /// Desktop notification timeout in milliseconds
        #[arg(long)]
        desktop_timeout_ms: Option<u32>,
    },
    /// Send a notification through every channel, ignoring the rate limit
    TestNotify {
        #[arg(long, default_value = "Test notification")]
        text: String,
        #[arg(long, default_value = "about:blank")]
        url: String,
    },
}

/// One scripted insertion for `replay`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptedInsert {
    #[serde(default)]
    after_ms: u64,
    /// CSS selector of the parent; `<body>` when absent.
    #[serde(default)]
    parent: Option<String>,
    node: NodeSnapshot,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn set(store: &FileStore, selector: String, color: String, texts: String) -> Result<()> {
    let target_texts = parse_target_texts_input(&texts);
    if selector.trim().is_empty() || color.trim().is_empty() || target_texts.is_empty() {
        bail!("Please fill in all fields.");
    }
    let settings = Settings {
        selector: selector.trim().to_string(),
        target_color: color.trim().to_string(),
        target_texts,
    };
    let (settings, _) = settings
        .validate()
        .map_err(|e| anyhow::anyhow!("{}: {}", e.status(), e))?;

    store.update(&mut |state| {
        state.settings = Some(settings.clone());
        state.monitoring_state = true;
    })?;
    println!("Settings saved! Monitoring started.");
    Ok(())
}

fn stop(store: &FileStore) -> Result<()> {
    store.update(&mut |state| state.monitoring_state = false)?;
    println!("Monitoring stopped");
    Ok(())
}

fn status(store: &FileStore) -> Result<()> {
    let state = store.load()?;
    println!("data dir:     {}", get_data_dir().display());
    println!("config:       {}", get_config_path().display());
    println!("storage:      {}", get_storage_path().display());
    println!("monitoring:   {}", if state.monitoring_state { "on" } else { "off" });
    match &state.settings {
        Some(settings) => {
            println!("selector:     {}", settings.selector);
            println!("target color: {}", settings.target_color);
            println!("target texts: {}", settings.target_texts.join(", "));
        }
        None => println!("settings:     (none)"),
    }
    Ok(())
}

struct ChannelChanges {
    push_token: Option<String>,
    push_url: Option<String>,
    push_enabled: Option<bool>,
    desktop_enabled: Option<bool>,
    desktop_timeout_ms: Option<u32>,
}

fn configure(changes: ChannelChanges) -> Result<()> {
    let mut config = load_config()?;
    let push = &mut config.channels.push;
    if let Some(token) = changes.push_token {
        push.access_token = token;
    }
    if let Some(url) = changes.push_url {
        push.api_url = url;
    }
    if let Some(enabled) = changes.push_enabled {
        push.enabled = enabled;
    }
    let desktop = &mut config.channels.desktop;
    if let Some(enabled) = changes.desktop_enabled {
        desktop.enabled = enabled;
    }
    if let Some(timeout_ms) = changes.desktop_timeout_ms {
        desktop.timeout_ms = timeout_ms;
    }
    save_config(&config)?;

    println!(
        "push:    {} ({})",
        if config.channels.push.enabled { "on" } else { "off" },
        config.channels.push.api_url
    );
    println!(
        "token:   {}",
        if config.channels.push.access_token.is_empty() { "(not set)" } else { "(set)" }
    );
    println!(
        "desktop: {} ({} ms)",
        if config.channels.desktop.enabled { "on" } else { "off" },
        config.channels.desktop.timeout_ms
    );
    Ok(())
}

fn check(store: &FileStore, page: &Path) -> Result<()> {
    let snapshot: PageSnapshot = read_json(page)?;
    let doc = Document::from_snapshot(&snapshot);
    let settings = store.load()?.settings.unwrap_or_default();
    let (settings, selector) = settings
        .validate()
        .map_err(|e| anyhow::anyhow!("{}: {}", e.status(), e))?;
    let matcher = Matcher::from_settings(&settings)?;

    let mut found = 0;
    for node in doc.query_selector_all(doc.body(), &selector) {
        let outcome = matcher.matches(&doc, node);
        found += 1;
        println!(
            "{} text={} color={} match={}",
            doc.tag_name(node).unwrap_or("?"),
            outcome.text_hit,
            outcome.color_hit,
            outcome.is_match()
        );
    }
    if found == 0 {
        println!("no elements match {}", selector);
    }
    Ok(())
}

async fn replay(
    store: Arc<FileStore>,
    page: &Path,
    mutations: Option<&Path>,
    duration: u64,
) -> Result<()> {
    let snapshot: PageSnapshot = read_json(page)?;
    let script: Vec<ScriptedInsert> = match mutations {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };

    let config = load_config()?;
    let doc = Arc::new(Mutex::new(Document::from_snapshot(&snapshot)));
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = spawn_watch(doc.clone(), store.clone(), tx)?;
    let notifier = tokio::spawn(run_notifier(Notifier::from_config(store, &config), rx));

    for insert in script {
        tokio::time::sleep(Duration::from_millis(insert.after_ms)).await;
        let mut doc = doc.lock().unwrap_or_else(|e| e.into_inner());
        let parent = match &insert.parent {
            Some(css) => {
                let selector: Selector = css.parse()?;
                let body = doc.body();
                match doc.query_selector_all(body, &selector).first() {
                    Some(id) => *id,
                    None => {
                        log::warn!("[watch] no parent matches {}, skipping insert", css);
                        continue;
                    }
                }
            }
            None => doc.body(),
        };
        doc.insert_snapshot(parent, &insert.node)?;
        doc.flush_mutations();
    }

    tokio::time::sleep(Duration::from_secs(duration)).await;
    log::info!("[watch] replay finished in state {:?}", handle.state().await);
    handle.shutdown().await;
    notifier.await?;
    Ok(())
}

async fn test_notify(store: Arc<FileStore>, text: String, url: String) -> Result<()> {
    let config = load_config()?;
    let notifier = Notifier::from_config(store, &config);
    let notification = Notification {
        message: MATCH_MESSAGE.to_string(),
        details: NotificationDetails {
            element: "TEST".to_string(),
            text,
            url,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        },
    };
    let report = notifier.send_all(&notification).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let store = Arc::new(FileStore::open_default());

    match cli.command {
        Command::Set { selector, color, texts } => set(&store, selector, color, texts),
        Command::Stop => stop(&store),
        Command::Status => status(&store),
        Command::Check { page } => check(&store, &page),
        Command::Replay { page, mutations, duration } => {
            replay(store, &page, mutations.as_deref(), duration).await
        }
        Command::Config {
            push_token,
            push_url,
            push_enabled,
            desktop_enabled,
            desktop_timeout_ms,
        } => configure(ChannelChanges {
            push_token,
            push_url,
            push_enabled,
            desktop_enabled,
            desktop_timeout_ms,
        }),
        Command::TestNotify { text, url } => test_notify(store, text, url).await,
    }
}
