use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use edgecache::binding::{BindingConfig, BindingPhase, DataBinding};
use edgecache::cache::{CacheSource, QueryParams};
use edgecache::collections::{self, COLLECTIONS};
use edgecache::config::Config;
use edgecache::{CachedApiClient, FetchError, ReadRequest};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::event::{Event, EventHandler};

#[derive(Parser, Debug)]
#[command(name = "edgecache")]
#[command(about = "Cached access to the IoT console collection API")]
#[command(version)]
pub struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/edgecache/config.yaml)
  #[arg(short, long, global = true)]
  pub config: Option<PathBuf>,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Read a collection, or one record when an id is given
  Get {
    collection: String,
    id: Option<String>,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,
    /// Always hit the network
    #[arg(long)]
    skip_cache: bool,
  },
  /// Create a record from a JSON body
  Create {
    collection: String,
    #[arg(long)]
    data: String,
  },
  /// Update a record from a JSON body
  Update {
    collection: String,
    id: String,
    #[arg(long)]
    data: String,
  },
  /// Delete a record
  Delete { collection: String, id: String },
  /// Print every change of a live binding until Ctrl-C
  Watch {
    collection: String,
    id: Option<String>,
    #[arg(short, long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,
    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,
  },
  /// Inspect or reset the local cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// List known collections
  Collections,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Entry counts and collection state for the current scope
  Stats,
  /// Delete every entry of the current scope
  Clear,
  /// Mark a collection stale
  Invalidate { collection: String },
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
  match s.split_once('=') {
    Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
    _ => Err(format!("expected key=value, got '{}'", s)),
  }
}

/// Load config and start logging. The guard must outlive the command.
fn setup(path: Option<&Path>) -> Result<(Config, WorkerGuard)> {
  let config = Config::load(path)?;
  let guard = edgecache::logging::init(&config.logging)?;
  Ok((config, guard))
}

pub async fn run(args: Args) -> Result<()> {
  let config_path = args.config.as_deref();

  match args.command {
    Command::Collections => {
      for c in COLLECTIONS {
        println!("{:<16} {:<36} {}", c.name, c.aliases.join(", "), c.description);
      }
      Ok(())
    }
    Command::Get {
      collection,
      id,
      query,
      skip_cache,
    } => {
      let (config, _guard) = setup(config_path)?;
      let client = network_client(&config)?;
      let request = read_request(&collection, id, query).skip_cache(skip_cache);
      let (result, refresh) = client.read_tracked(request).await.map_err(report)?;
      if let (CacheSource::Cache, Some(at)) = (result.source, result.stored_at) {
        eprintln!("(cached at {})", at.to_rfc3339());
      }
      print_json(&result.data)?;

      // The process exits next; let the refresh reach storage first
      if let Some(refresh) = refresh {
        if let Err(e) = refresh.await {
          warn!(error = %e, "background refresh did not complete");
        }
      }
      Ok(())
    }
    Command::Create { collection, data } => {
      let (config, _guard) = setup(config_path)?;
      let client = network_client(&config)?;
      let created = client
        .create(&canonical(&collection), parse_body(&data)?)
        .await
        .map_err(report)?;
      print_json(&created)
    }
    Command::Update {
      collection,
      id,
      data,
    } => {
      let (config, _guard) = setup(config_path)?;
      let client = network_client(&config)?;
      let updated = client
        .update(&canonical(&collection), &id, parse_body(&data)?)
        .await
        .map_err(report)?;
      print_json(&updated)
    }
    Command::Delete { collection, id } => {
      let (config, _guard) = setup(config_path)?;
      let client = network_client(&config)?;
      client
        .delete(&canonical(&collection), &id)
        .await
        .map_err(report)?;
      eprintln!("Deleted {} {}", collection, id);
      Ok(())
    }
    Command::Watch {
      collection,
      id,
      query,
      interval_ms,
    } => {
      let (config, _guard) = setup(config_path)?;
      let client = network_client(&config)?;
      watch(&client, &collection, id, query, Duration::from_millis(interval_ms)).await
    }
    Command::Cache(command) => {
      let (config, _guard) = setup(config_path)?;
      let token = Config::get_api_token().ok();
      let store = config.build_store(Arc::new(config.scope(token.as_deref())))?;
      match command {
        CacheCommand::Stats => {
          let stats = store.stats();
          println!("scope:     {}", stats.scope);
          println!("memory:    {} entries", stats.memory_entries);
          println!("persisted: {} entries", stats.persisted_entries);
          for state in stats.collections {
            let invalidated = state
              .last_invalidated
              .map(|at| at.to_rfc3339())
              .unwrap_or_else(|| "never".to_string());
            println!("  {:<16} invalidated {}", state.name, invalidated);
          }
        }
        CacheCommand::Clear => {
          store.teardown();
          println!("Cleared cache for scope {}", store.scope_id());
        }
        CacheCommand::Invalidate { collection } => {
          let name = canonical(&collection);
          let at = store.invalidate_collection(&name);
          println!("Invalidated {} at {}", name, at.to_rfc3339());
        }
      }
      Ok(())
    }
  }
}

async fn watch(
  client: &CachedApiClient,
  collection: &str,
  id: Option<String>,
  query: Vec<(String, String)>,
  tick_rate: Duration,
) -> Result<()> {
  let name = canonical(collection);
  let config = match id {
    Some(id) => BindingConfig::detail(name, id),
    None => BindingConfig::list(name),
  }
  .with_params(query.into_iter().collect());

  let mut binding: DataBinding<Value> = DataBinding::new(client, config);
  let label = binding.key().description();
  info!(key = %label, "watching");
  binding.mount();
  print_state(&binding, &label)?;

  let mut events = EventHandler::new(tick_rate);
  while let Some(event) = events.next().await {
    match event {
      Event::Tick => {
        if binding.poll() {
          print_state(&binding, &label)?;
        }
      }
      Event::Interrupt => break,
    }
  }

  binding.unmount();
  Ok(())
}

fn print_state(binding: &DataBinding<Value>, label: &str) -> Result<()> {
  match binding.phase() {
    BindingPhase::Loading => eprintln!("[{}] loading", label),
    BindingPhase::Ready => {
      if let Some(data) = binding.data() {
        print_json(data)?;
      }
    }
    BindingPhase::Errored => {
      eprintln!("[{}] error: {}", label, binding.error().unwrap_or("unknown error"));
    }
    BindingPhase::Idle | BindingPhase::Unmounted => {}
  }
  Ok(())
}

fn network_client(config: &Config) -> Result<CachedApiClient> {
  let token = Config::get_api_token()?;
  config.build_client(Some(token))
}

fn read_request(collection: &str, id: Option<String>, query: Vec<(String, String)>) -> ReadRequest {
  let name = canonical(collection);
  let request = match id {
    Some(id) => ReadRequest::detail(name, id),
    None => ReadRequest::list(name),
  };
  request.with_params(query.into_iter().collect::<QueryParams>())
}

/// Resolve aliases; unknown names are passed through with a hint.
fn canonical(input: &str) -> String {
  if let Some(c) = collections::resolve(input) {
    return c.name.to_string();
  }
  let hints: Vec<&str> = collections::suggestions(input).iter().map(|c| c.name).collect();
  if hints.is_empty() {
    eprintln!("warning: unknown collection '{}'", input);
  } else {
    eprintln!(
      "warning: unknown collection '{}' (did you mean {}?)",
      input,
      hints.join(", ")
    );
  }
  input.to_string()
}

fn parse_body(data: &str) -> Result<Value> {
  serde_json::from_str(data).map_err(|e| eyre!("--data is not valid JSON: {}", e))
}

fn print_json(value: &Value) -> Result<()> {
  let text = serde_json::to_string_pretty(value)
    .map_err(|e| eyre!("Failed to format response: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn report(err: FetchError) -> color_eyre::Report {
  eyre!("{}", err.user_message())
}
