use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use clap::{Args, Parser, Subcommand};
use pika_relay_runtime::nip11::fetch_relay_info;
use pika_relay_runtime::{Config, Context, Event, Filter, Pool};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "pikarelay")]
#[command(about = "Query, follow and publish to Nostr relays through a relay pool")]
struct Cli {
    /// Relay websocket URLs
    #[arg(long, required = true)]
    relay: Vec<String>,

    /// Apply NOSTR_* environment overrides to the runtime config
    #[arg(long)]
    env_config: bool,

    /// Merge concurrent queries per relay
    #[arg(long)]
    batch: bool,

    /// Grace period after an EOSE quorum, in milliseconds
    #[arg(long, default_value_t = 2000)]
    quorum_grace_ms: u64,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// One-shot query; prints matching events as JSON lines
    Query {
        #[command(flatten)]
        filter: FilterArgs,

        /// Give up after this many seconds (partial results are printed)
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Follow a live subscription, deduplicated across relays
    Listen {
        #[command(flatten)]
        filter: FilterArgs,

        /// Timeout in seconds (0 = run until interrupted)
        #[arg(long, default_value_t = 0)]
        timeout: u64,
    },

    /// Publish a signed event (JSON, or "-" for stdin)
    Publish {
        #[arg(long)]
        event: String,

        /// Seconds to wait for each relay's OK
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// NIP-45 COUNT on every relay
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Fetch each relay's NIP-11 document
    Info {
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },

    /// Run a query, then dump runtime counters and pool health
    Metrics {
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// Raw NIP-01 filter JSON; other filter flags are ignored when set
    #[arg(long)]
    filter: Option<String>,

    #[arg(long)]
    kind: Vec<u16>,

    /// Author pubkey (hex)
    #[arg(long)]
    author: Vec<String>,

    /// Event id (hex)
    #[arg(long)]
    id: Vec<String>,

    /// Tag selector as LETTER=VALUE, e.g. t=nostr
    #[arg(long)]
    tag: Vec<String>,

    #[arg(long)]
    since: Option<u64>,

    #[arg(long)]
    until: Option<u64>,

    #[arg(long)]
    limit: Option<usize>,
}

impl FilterArgs {
    fn build(&self) -> anyhow::Result<Filter> {
        if let Some(raw) = &self.filter {
            return Filter::from_json(raw).context("parse --filter");
        }
        let mut filter = Filter::new();
        if !self.kind.is_empty() {
            filter = filter.kinds(self.kind.iter().copied());
        }
        if !self.author.is_empty() {
            filter = filter.authors(self.author.iter().cloned());
        }
        if !self.id.is_empty() {
            filter = filter.ids(self.id.iter().cloned());
        }
        for selector in &self.tag {
            let (letter, value) = selector
                .split_once('=')
                .ok_or_else(|| anyhow!("tag selector must be LETTER=VALUE: {selector}"))?;
            let mut chars = letter.chars();
            let (Some(letter), None) = (chars.next(), chars.next()) else {
                return Err(anyhow!("tag name must be a single letter: {letter}"));
            };
            filter = filter.tag(letter, [value]);
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(until) = self.until {
            filter = filter.until(until);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter.validate().context("invalid filter")?;
        Ok(filter)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let pool = Pool::new(Arc::new(config(&cli)));

    match &cli.cmd {
        Command::Query { filter, timeout } => cmd_query(&cli, &pool, filter, *timeout).await,
        Command::Listen { filter, timeout } => cmd_listen(&cli, &pool, filter, *timeout).await,
        Command::Publish { event, timeout } => cmd_publish(&cli, &pool, event, *timeout).await,
        Command::Count { filter } => cmd_count(&cli, &pool, filter).await,
        Command::Info { timeout } => cmd_info(&cli, *timeout).await,
        Command::Metrics { filter } => cmd_metrics(&cli, &pool, filter).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn config(cli: &Cli) -> Config {
    let config = if cli.env_config {
        Config::from_env()
    } else {
        Config::default()
    };
    config
        .with_batching(cli.batch)
        .with_quorum_grace(Duration::from_millis(cli.quorum_grace_ms))
}

fn print(v: serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(&v).unwrap_or_default());
}

fn print_line(v: serde_json::Value) {
    println!("{v}");
}

fn read_event(arg: &str) -> anyhow::Result<Event> {
    let raw = if arg == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read event from stdin")?;
        buf
    } else {
        arg.to_string()
    };
    let event = Event::from_json(raw.trim()).context("parse event JSON")?;
    event.verify().context("event does not verify")?;
    Ok(event)
}

// ── Commands ────────────────────────────────────────────────────────────────

async fn cmd_query(cli: &Cli, pool: &Pool, filter: &FilterArgs, timeout: u64) -> anyhow::Result<()> {
    let filter = filter.build()?;
    let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(timeout));
    let events = pool
        .query_single(&ctx, &cli.relay, filter)
        .await
        .context("query")?;
    for event in &events {
        println!("{}", event.as_json());
    }
    tracing::info!(events = events.len(), "query done");
    Ok(())
}

async fn cmd_listen(cli: &Cli, pool: &Pool, filter: &FilterArgs, timeout: u64) -> anyhow::Result<()> {
    let filter = filter.build()?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    pool.set_event_middleware(move |event| {
        let _ = tx.send(event);
    });
    pool.start();
    let sub = pool
        .subscribe(&cli.relay, filter, true)
        .await
        .context("subscribe")?;
    if sub.relay_count() == 0 {
        return Err(anyhow!("no relay accepted the subscription"));
    }

    let deadline = (timeout > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(timeout));
    loop {
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => println!("{}", event.as_json()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep => break,
        }
    }

    pool.unsubscribe(&sub);
    pool.stop();
    pool.stopped().await;
    Ok(())
}

async fn cmd_publish(cli: &Cli, pool: &Pool, event: &str, timeout: u64) -> anyhow::Result<()> {
    let event = read_event(event)?;
    let mut accepted = 0usize;
    for url in &cli.relay {
        let relay = match pool.ensure_relay(url).await {
            Ok(Some(relay)) => relay,
            Ok(None) => {
                print_line(json!({"relay": url, "accepted": false, "message": "relay browned"}));
                continue;
            }
            Err(err) => {
                print_line(json!({"relay": url, "accepted": false, "message": err.to_string()}));
                continue;
            }
        };
        match relay
            .publish_and_wait(&event, Duration::from_secs(timeout))
            .await
        {
            Ok(status) => {
                accepted += usize::from(status.accepted);
                print_line(json!({
                    "relay": relay.url(),
                    "accepted": status.accepted,
                    "message": status.message,
                }));
            }
            Err(err) => {
                print_line(json!({"relay": relay.url(), "accepted": false, "message": err.to_string()}));
            }
        }
    }
    if accepted == 0 {
        return Err(anyhow!("no relay accepted event {}", event.id));
    }
    Ok(())
}

async fn cmd_count(cli: &Cli, pool: &Pool, filter: &FilterArgs) -> anyhow::Result<()> {
    let filter = filter.build()?;
    let ctx = Context::background();
    for url in &cli.relay {
        let line = match pool.ensure_relay(url).await {
            Ok(Some(relay)) => match relay.count(&ctx, filter.clone()).await {
                Ok(count) => json!({"relay": relay.url(), "count": count}),
                Err(err) => json!({"relay": relay.url(), "error": err.to_string()}),
            },
            Ok(None) => json!({"relay": url, "error": "relay browned"}),
            Err(err) => json!({"relay": url, "error": err.to_string()}),
        };
        print_line(line);
    }
    Ok(())
}

async fn cmd_info(cli: &Cli, timeout: u64) -> anyhow::Result<()> {
    for url in &cli.relay {
        let info = fetch_relay_info(url, Duration::from_secs(timeout))
            .await
            .with_context(|| format!("fetch relay info for {url}"))?;
        print(json!({
            "relay": url,
            "info": serde_json::to_value(&info).context("encode relay info")?,
        }));
    }
    Ok(())
}

async fn cmd_metrics(cli: &Cli, pool: &Pool, filter: &FilterArgs) -> anyhow::Result<()> {
    let filter = filter.build()?;
    let events = pool
        .query_single(&Context::background(), &cli.relay, filter)
        .await
        .context("query")?;
    let relays: Vec<serde_json::Value> = pool
        .relays()
        .iter()
        .map(|r| json!({"url": r.url(), "status": r.status().to_string()}))
        .collect();
    print(json!({
        "events": events.len(),
        "relays": relays,
        "counters": serde_json::to_value(pool.metrics().snapshot()).context("encode metrics")?,
        "queues": serde_json::to_value(pool.queue_metrics()).context("encode queue metrics")?,
        "brown_list": serde_json::to_value(pool.brown_list_stats()).context("encode brown list")?,
    }));
    Ok(())
}
