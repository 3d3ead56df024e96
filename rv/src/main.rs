//! rv - command-line front end for the rendezvous sync service

use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rendezvous::cli::{Cli, Command};
use rendezvous::client::Client;
use rendezvous::config::Config;
use rendezvous::domain::{Event, STATE_INITIALIZED_GLOBAL, State, Topic, events_key};
use rendezvous::error::SyncError;
use rendezvous::watch::WatchClient;

/// Schema tag for topics published and read from the command line
const JSON_SCHEMA: &str = "json";

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {e}"))?;

    debug!(?level, "Logging initialized");
    Ok(())
}

/// Token cancelled by Ctrl-C or, when given, after `timeout`
fn interrupt_token(timeout: Option<Duration>) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        match timeout {
            Some(timeout) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(timeout) => {}
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        child.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match &cli.command {
        Command::Keys { state, topic } => cmd_keys(&cli, state.as_deref(), topic.as_deref()),
        Command::Signal { state } => cmd_signal(&cli, &config, state).await,
        Command::Barrier { state, target, timeout } => {
            cmd_barrier(&cli, &config, state, *target, timeout.map(Duration::from_secs)).await
        }
        Command::Publish { topic, payload } => cmd_publish(&cli, &config, topic, payload).await,
        Command::Subscribe { topic, count } => cmd_subscribe(&cli, &config, topic, *count).await,
        Command::Ranks => cmd_ranks(&cli, &config).await,
        Command::Events => cmd_events(&cli, &config).await,
        Command::Watch => cmd_watch(&cli, &config).await,
    }
}

async fn connect(cli: &Cli, config: &Config) -> Result<Client> {
    let identity = cli.identity().context("Run identity is incomplete")?;
    info!(%identity, "connecting");
    Client::connect(config, Some(identity))
        .await
        .context("Failed to connect to store")
}

fn cmd_keys(cli: &Cli, state: Option<&str>, topic: Option<&str>) -> Result<()> {
    let identity = cli.identity().context("Run identity is incomplete")?;
    println!("{} {}", "events:".cyan(), events_key(&identity));
    println!(
        "{} {}",
        "global:".cyan(),
        State::new(STATE_INITIALIZED_GLOBAL).key(&identity)
    );
    println!(
        "{} {}",
        "group:".cyan(),
        State::initialized_group(&identity.group_id).key(&identity)
    );
    if let Some(state) = state {
        println!("{} {}", "state:".cyan(), State::new(state).key(&identity));
    }
    if let Some(topic) = topic {
        let topic = Topic::<serde_json::Value>::with_schema(topic, JSON_SCHEMA);
        println!("{} {}", "topic:".cyan(), topic.key(&identity));
        println!("{} {}", "schema:".cyan(), topic.schema_key(&identity));
    }
    Ok(())
}

async fn cmd_signal(cli: &Cli, config: &Config, state: &str) -> Result<()> {
    let client = connect(cli, config).await?;
    let seq = client.signal_entry(&State::new(state)).await?;
    println!("{} {} entered as #{}", "✓".green(), state.cyan(), seq);
    client.close().await?;
    Ok(())
}

async fn cmd_barrier(cli: &Cli, config: &Config, state: &str, target: u64, timeout: Option<Duration>) -> Result<()> {
    let client = connect(cli, config).await?;
    let token = interrupt_token(timeout);
    let outcome = client.barrier(&State::new(state), target, &token).await?.wait().await;
    client.close().await?;

    match outcome {
        Ok(()) => {
            println!("{} {} reached {}", "✓".green(), state.cyan(), target);
            Ok(())
        }
        Err(SyncError::Cancelled) => Err(eyre!("Gave up waiting for {state} to reach {target}")),
        Err(e) => Err(e.into()),
    }
}

async fn cmd_publish(cli: &Cli, config: &Config, topic: &str, payload: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let client = connect(cli, config).await?;
    let position = client
        .publish(&Topic::with_schema(topic, JSON_SCHEMA), &value)
        .await?;
    println!("{} published to {} at position {}", "✓".green(), topic.cyan(), position);
    client.close().await?;
    Ok(())
}

async fn cmd_subscribe(cli: &Cli, config: &Config, topic: &str, count: Option<usize>) -> Result<()> {
    let client = connect(cli, config).await?;
    let token = interrupt_token(None);
    let topic = Topic::<serde_json::Value>::with_schema(topic, JSON_SCHEMA);
    let mut subscription = client.subscribe(&topic, &token).await?;

    let mut seen = 0usize;
    while count.is_none_or(|n| seen < n) {
        match subscription.next().await {
            Some(Ok(value)) => {
                seen += 1;
                println!("{}", value);
            }
            Some(Err(SyncError::Cancelled)) | None => break,
            Some(Err(e)) => {
                client.close().await?;
                return Err(e.into());
            }
        }
    }
    if subscription.dropped() > 0 {
        eprintln!("{} {} messages dropped", "!".yellow(), subscription.dropped());
    }
    client.close().await?;
    Ok(())
}

async fn cmd_ranks(cli: &Cli, config: &Config) -> Result<()> {
    let client = connect(cli, config).await?;
    let ranks = client.claim_ranks().await?;
    println!("global: {}", ranks.global.to_string().yellow());
    println!("group:  {}", ranks.group.to_string().yellow());
    client.close().await?;
    Ok(())
}

async fn cmd_events(cli: &Cli, config: &Config) -> Result<()> {
    let identity = cli.identity().context("Run identity is incomplete")?;
    let watcher = WatchClient::connect(config).await.context("Failed to connect to store")?;
    let events = watcher.fetch_all_events(&identity).await?;
    if events.is_empty() {
        println!("No events recorded");
    }
    for event in events {
        print_event(&event)?;
    }
    Ok(())
}

async fn cmd_watch(cli: &Cli, config: &Config) -> Result<()> {
    let identity = cli.identity().context("Run identity is incomplete")?;
    let watcher = WatchClient::connect(config).await.context("Failed to connect to store")?;
    let mut events = watcher.subscribe_events(&identity, interrupt_token(None));
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => print_event(&event)?,
            Err(SyncError::Cancelled) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn print_event(event: &Event) -> Result<()> {
    let kind = match event {
        Event::Failure { .. } | Event::Crash { .. } => event.kind().red(),
        Event::Success { .. } => event.kind().green(),
        _ => event.kind().normal(),
    };
    println!("{} {}", kind, serde_json::to_string(event)?.dimmed());
    Ok(())
}
