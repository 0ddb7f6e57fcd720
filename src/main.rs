mod cli;
mod config;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use pondok::{
  shared, FetchError, NoopSnapshotStore, QueryClient, RestClient, SnapshotStore,
  SqliteSnapshotStore,
};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "pondok")]
#[command(about = "Query the pesantren directory through the local query cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pondok/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve one resource and print it as JSON
  Get {
    /// Resource kind or alias, e.g. `pesantren-list` or `p`
    kind: String,
    /// Parameters as name=value, e.g. `page=2 filter.province="Jawa Barat"`
    params: Vec<String>,
    /// Keep watching, refetching every SECS seconds
    #[arg(short, long, value_name = "SECS")]
    watch: Option<u64>,
  },
  /// List the known resource kinds
  Kinds,
  /// Delete the persisted cache snapshot
  ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  match args.command {
    Command::Get {
      kind,
      params,
      watch,
    } => get(&config, &kind, &params, watch).await,
    Command::Kinds => {
      for kind in cli::RESOURCE_KINDS {
        println!("{:<20} {:<24} {}", kind.name, kind.aliases.join(", "), kind.description);
      }
      Ok(())
    }
    Command::ClearCache => {
      SqliteSnapshotStore::open()?.clear()?;
      println!("Cache snapshot cleared");
      Ok(())
    }
  }
}

/// Log to a daily rolling file so stdout stays clean for JSON output.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("pondok")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "pondok.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pondok=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn rest_client(config: &config::Config) -> Result<RestClient> {
  let base = Url::parse(&config.api.base_url)
    .map_err(|e| eyre!("Invalid api.base_url {}: {}", config.api.base_url, e))?;
  let mut rest = RestClient::new(base, config.api.timeout())?;
  for (kind, route) in &config.api.routes {
    rest = rest.with_route(kind, route);
  }
  if let Some(token) = config::Config::get_api_token() {
    rest = rest.with_token(token);
  }
  Ok(rest)
}

async fn get(config: &config::Config, kind: &str, params: &[String], watch: Option<u64>) -> Result<()> {
  let client = QueryClient::new(config.cache.clone());
  let snapshots: Box<dyn SnapshotStore> = if config.persist {
    Box::new(SqliteSnapshotStore::open()?)
  } else {
    Box::new(NoopSnapshotStore)
  };
  let restored = client.hydrate(snapshots.as_ref())?;
  info!(restored, "starting");

  let key = cli::build_key(kind, params)?;
  let fetcher = shared(rest_client(config)?);

  match watch {
    None => {
      let result = client
        .resolve(&key, fetcher)
        .await
        .map_err(|e| explain(kind, e))?;
      let output = json!({
        "key": key.canonical(),
        "source": format!("{:?}", result.source),
        "cached_at": result.cached_at.map(|t| t.to_rfc3339()),
        "data": result.data.as_deref(),
      });
      println!("{}", serde_json::to_string_pretty(&output)?);

      // let a background revalidation land before the snapshot is written
      client.queries().settled(&key).await;
    }
    Some(secs) => {
      let mut resource = client.use_resource(key.clone(), fetcher);
      let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
      ticker.tick().await;

      loop {
        tokio::select! {
          state = resource.changed() => {
            let output = json!({
              "key": key.canonical(),
              "status": format!("{:?}", state.status),
              "fetching": state.fetching,
              "error": state.error.as_ref().map(ToString::to_string),
              "data": state.data.as_deref(),
            });
            println!("{}", serde_json::to_string(&output)?);
          }
          _ = ticker.tick() => {
            if let Err(err) = resource.refetch().await {
              info!(error = %err, "refetch failed");
            }
          }
          _ = tokio::signal::ctrl_c() => break,
        }
      }
    }
  }

  let saved = client.dehydrate(snapshots.as_ref())?;
  info!(saved, "done");
  Ok(())
}

/// Point at the kinds list when a kind has no route.
fn explain(kind: &str, err: FetchError) -> color_eyre::Report {
  match err {
    FetchError::InvalidRequest(_) => {
      let suggestions: Vec<&str> = cli::get_suggestions(kind)
        .iter()
        .take(3)
        .map(|k| k.name)
        .collect();
      if suggestions.is_empty() {
        eyre!("{} (run `pondok kinds` for the list)", err)
      } else {
        eyre!("{} (did you mean: {}?)", err, suggestions.join(", "))
      }
    }
    other => eyre!(other),
  }
}
