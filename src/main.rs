use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use url::Url;

use shadowfiles::cache::{SqliteStorage, Tier};
use shadowfiles::config::Config;
use shadowfiles::interceptor::{Request, BYPASS_HEADER};
use shadowfiles::network::Network;
use shadowfiles::protocol::Status;
use shadowfiles::registry::SqliteRegistry;
use shadowfiles::{
  logging, FetchOutcome, PageClient, RegisterOptions, Registrar, ShadowFiles, ShadowWorker,
  WorkerHost, WorkerState,
};

#[derive(Parser, Debug)]
#[command(name = "shadowfiles")]
#[command(about = "Serve local shadow files in place of network responses")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shadowfiles/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Page origin shadow paths resolve against
  #[arg(long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Register and activate the shadow worker
  Register {
    /// Worker script URL (default from config)
    #[arg(long)]
    script: Option<String>,
    #[arg(long)]
    scope: Option<String>,
    /// Replace an existing registration; starts a new generation
    #[arg(long)]
    force: bool,
  },
  /// Remove the registration at a scope
  Unregister {
    #[arg(long)]
    scope: Option<String>,
  },
  /// Store a file as the shadow response for a path
  Put {
    path: String,
    file: PathBuf,
    #[arg(long)]
    content_type: Option<String>,
    /// Extra response header, as NAME=VALUE
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
    #[arg(long, value_parser = parse_tier)]
    tier: Option<Tier>,
  },
  /// Store every file under a directory, one independent update per file
  Import {
    dir: PathBuf,
    /// Path prefix the directory is mounted at
    #[arg(long, default_value = "/")]
    prefix: String,
    #[arg(long, value_parser = parse_tier)]
    tier: Option<Tier>,
    #[arg(long, default_value_t = 8)]
    concurrency: usize,
  },
  /// Remove the shadow response for a path
  Delete {
    path: String,
    /// Only this tier (default: every tier)
    #[arg(long, value_parser = parse_tier)]
    tier: Option<Tier>,
  },
  /// Check whether a path is shadowed (exit code 1 when absent)
  Exists { path: String },
  /// Request a URL through the worker, falling through to the network
  Fetch {
    url: String,
    /// Skip shadow lookup entirely
    #[arg(long)]
    bypass: bool,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List worker registrations
  Registrations,
}

fn parse_header(s: &str) -> Result<(String, String), String> {
  let (name, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

fn parse_tier(s: &str) -> Result<Tier, String> {
  s.parse().map_err(|e: color_eyre::Report| e.to_string())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config { origin, ..config }
  } else {
    config
  };

  let _guard = logging::init(&config)?;
  run(config, args.command).await
}

async fn run(config: Config, command: Cmd) -> Result<ExitCode> {
  let origin = config.origin_url()?;
  let database = config.database_path()?;
  info!(db = %database.display(), %origin, "Starting");

  let storage = SqliteStorage::open(&database)?;
  let host = WorkerHost::new(ShadowWorker::new(storage, config.update_tier)).spawn();
  let facade = ShadowFiles::new(SqliteRegistry::open(&database, host.clone())?, origin.clone());
  let page = PageClient::new(host.clone(), origin.clone(), config.reply_timeout());

  match command {
    Cmd::Register {
      script,
      scope,
      force,
    } => {
      let scope = scope.unwrap_or_else(|| config.scope.clone());
      if force {
        let normalized = facade.normalize_scope(Some(&scope))?;
        if facade.registrar().unregister(&normalized).await? {
          println!("Unregistered {}", normalized);
        }
      }

      let registration = facade
        .register(RegisterOptions {
          script_url: script.unwrap_or_else(|| config.script_url.clone()),
          scope: Some(scope),
        })
        .await?;
      facade.ready().await?;
      println!(
        "Registered {} at {}",
        registration.script_url, registration.scope
      );
    }
    Cmd::Unregister { scope } => {
      let scope = facade.normalize_scope(Some(scope.as_deref().unwrap_or(&config.scope)))?;
      if facade.registrar().unregister(&scope).await? {
        println!("Unregistered {}", scope);
      } else {
        println!("Nothing registered at {}", scope);
      }
    }
    Cmd::Registrations => {
      for registration in facade.registrar().get_registrations().await? {
        println!(
          "{}\t{}\t{}",
          registration.scope,
          registration.script_url,
          registration.state.as_str()
        );
      }
    }
    Cmd::Put {
      path,
      file,
      content_type,
      headers,
      tier,
    } => {
      require_registration(&facade, &config).await?;
      let body = tokio::fs::read(&file)
        .await
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let mut response_headers = BTreeMap::new();
      response_headers.insert(
        "content-type".to_string(),
        content_type.unwrap_or_else(|| guess_content_type(&file).to_string()),
      );
      response_headers.extend(headers);

      match page.update(&path, body, response_headers, tier).await? {
        Status::Success => println!("Stored {}", path),
        Status::Fail => return Err(eyre!("Worker failed to store {}", path)),
      }
    }
    Cmd::Import {
      dir,
      prefix,
      tier,
      concurrency,
    } => {
      require_registration(&facade, &config).await?;
      let files = collect_files(&dir, &origin, &prefix)?;
      let total = files.len();

      let failures: Vec<(String, String)> = stream::iter(files)
        .map(|(path, file)| {
          let page = &page;
          async move {
            let outcome = upload(page, &path, &file, tier).await;
            (path, outcome)
          }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|(path, outcome)| async move {
          match outcome {
            Ok(Status::Success) => None,
            Ok(Status::Fail) => Some((path, "worker reported failure".to_string())),
            Err(e) => Some((path, e.to_string())),
          }
        })
        .collect()
        .await;

      for (path, reason) in &failures {
        eprintln!("Failed {}: {}", path, reason);
      }
      println!("Imported {}/{} files", total - failures.len(), total);
      if !failures.is_empty() {
        return Ok(ExitCode::FAILURE);
      }
    }
    Cmd::Delete { path, tier } => {
      require_registration(&facade, &config).await?;
      match page.delete(&path, tier).await? {
        Status::Success => println!("Deleted {}", path),
        Status::Fail => return Err(eyre!("Worker failed to delete {}", path)),
      }
    }
    Cmd::Exists { path } => {
      require_registration(&facade, &config).await?;
      if page.exists(&path).await? {
        println!("{} is shadowed", path);
      } else {
        println!("{} is not shadowed", path);
        return Ok(ExitCode::FAILURE);
      }
    }
    Cmd::Fetch {
      url,
      bypass,
      output,
    } => {
      require_registration(&facade, &config).await?;
      let url = origin
        .join(&url)
        .map_err(|e| eyre!("Invalid url '{}': {}", url, e))?;
      let mut request = Request::get(url);
      if bypass {
        request = request.with_header(BYPASS_HEADER, "1");
      }

      let response = match host.fetch(request.clone()).await? {
        FetchOutcome::Substituted(response) => response,
        FetchOutcome::Passthrough => Network::new()?.fetch(&request).await?,
      };

      eprintln!("{}", response.status);
      for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
      }
      match output {
        Some(path) => std::fs::write(&path, &response.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout().write_all(&response.body)?,
      }
    }
  }

  Ok(ExitCode::SUCCESS)
}

/// Commands other than `register` need an active worker for the scope.
async fn require_registration<R: Registrar>(
  facade: &ShadowFiles<R>,
  config: &Config,
) -> Result<()> {
  let scope = facade.normalize_scope(Some(&config.scope))?;
  match facade.registrar().get_registration(&scope).await? {
    Some(registration) if registration.state == WorkerState::Active => Ok(()),
    Some(registration) => Err(eyre!(
      "Shadow worker for {} is {}; run `shadowfiles register --force`",
      registration.scope,
      registration.state.as_str()
    )),
    None => Err(eyre!(
      "No shadow worker registered for {}; run `shadowfiles register` first",
      scope
    )),
  }
}

async fn upload(page: &PageClient, path: &str, file: &Path, tier: Option<Tier>) -> Result<Status> {
  let body = tokio::fs::read(file)
    .await
    .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
  let mut headers = BTreeMap::new();
  headers.insert(
    "content-type".to_string(),
    guess_content_type(file).to_string(),
  );
  page.update(path, body, headers, tier).await
}

/// Every regular file under `dir`, paired with the shadow path it maps to.
///
/// Symlinked directories are skipped so a link cycle cannot loop the walk.
fn collect_files(dir: &Path, origin: &Url, prefix: &str) -> Result<Vec<(String, PathBuf)>> {
  let mut files = Vec::new();
  let mut pending = vec![dir.to_path_buf()];

  while let Some(current) = pending.pop() {
    let entries = std::fs::read_dir(&current)
      .map_err(|e| eyre!("Failed to read directory {}: {}", current.display(), e))?;
    for entry in entries {
      let entry = entry.map_err(|e| eyre!("Failed to read directory entry: {}", e))?;
      let path = entry.path();
      let file_type = entry
        .file_type()
        .map_err(|e| eyre!("Failed to stat {}: {}", path.display(), e))?;
      if file_type.is_dir() {
        pending.push(path);
        continue;
      }
      if file_type.is_symlink() && path.is_dir() {
        warn!(path = %path.display(), "Skipping symlinked directory");
        continue;
      }

      let relative = path
        .strip_prefix(dir)
        .map_err(|e| eyre!("Failed to relativize {}: {}", path.display(), e))?;
      files.push((shadow_path(origin, prefix, relative)?, path));
    }
  }

  files.sort();
  Ok(files)
}

/// URL path for a file at `relative` under a directory mounted at `prefix`.
///
/// Each file name becomes one percent-encoded segment, so `#`, `?` and `%`
/// stay part of the path.
fn shadow_path(origin: &Url, prefix: &str, relative: &Path) -> Result<String> {
  let mut url = origin
    .join(prefix)
    .map_err(|e| eyre!("Invalid prefix '{}': {}", prefix, e))?;
  {
    let mut segments = url
      .path_segments_mut()
      .map_err(|_| eyre!("Origin {} cannot carry paths", origin))?;
    segments.pop_if_empty();
    for component in relative.components() {
      segments.push(&component.as_os_str().to_string_lossy());
    }
  }
  Ok(url.path().to_string())
}

fn guess_content_type(path: &Path) -> &'static str {
  let extension = path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_ascii_lowercase());

  match extension.as_deref() {
    Some("html") | Some("htm") => "text/html",
    Some("css") => "text/css",
    Some("js") | Some("mjs") => "text/javascript",
    Some("json") => "application/json",
    Some("txt") => "text/plain",
    Some("svg") => "image/svg+xml",
    Some("png") => "image/png",
    Some("jpg") | Some("jpeg") => "image/jpeg",
    Some("gif") => "image/gif",
    Some("webp") => "image/webp",
    Some("wasm") => "application/wasm",
    Some("woff2") => "font/woff2",
    _ => "application/octet-stream",
  }
}
