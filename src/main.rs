use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use halcache::hal;
use halcache::logging::init_logging;
use halcache::transport::HttpTransport;
use halcache::{Config, FindListOptions, RemoteData, RemoteDataStreamExt, Session};

#[derive(Parser, Debug)]
#[command(name = "halcache")]
#[command(about = "Fetch and watch HAL/REST resources through a TTL cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/halcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch one resource, optionally following link relations
  Get {
    href: String,
    /// Relation to follow from the fetched resource; repeatable. The
    /// relation must be declared for the payload's `type` under `resources`
    #[arg(short, long)]
    follow: Vec<String>,
    /// Always hit the network
    #[arg(long)]
    no_cache: bool,
  },
  /// Fetch one page of a collection
  List {
    href: String,
    /// 1-based page number
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    size: u32,
  },
  /// Print every snapshot of a resource until interrupted
  Watch { href: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(config.log.file.as_deref())?;

  let transport = Arc::new(HttpTransport::new(&config)?);
  let session = Session::start(&config, transport);

  let result = match args.command {
    Command::Get {
      href,
      follow,
      no_cache,
    } => get(&session, &href, &follow, no_cache).await,
    Command::List { href, page, size } => list(&session, &href, page, size).await,
    Command::Watch { href } => watch(&session, &href).await,
  };

  session.shutdown();
  result
}

async fn get(session: &Session, href: &str, follow: &[String], no_cache: bool) -> Result<()> {
  let mut options = session.default_options();
  if no_cache {
    options = options.bypass_cache();
  }

  let mut payload = first_payload(session.builder().from_key::<Value>(href, &options)).await?;

  for relation in follow {
    let handle = session
      .builder()
      .resolve_link_value(&payload, relation)
      .with_options(options.clone());
    if let Some(error) = handle.error() {
      return Err(eyre!("Cannot follow '{}': {}", relation, error));
    }
    payload = first_payload(handle.stream()).await?;
  }

  println!("{}", serde_json::to_string_pretty(&payload)?);
  Ok(())
}

async fn list(session: &Session, href: &str, page: u32, size: u32) -> Result<()> {
  let service = session.service(href);
  let rd = service
    .find_all::<Value>(&FindListOptions::page(page, size), &session.default_options())
    .first_completed()
    .next()
    .await
    .ok_or_else(|| eyre!("No response for {}", href))?;

  let list = into_result(rd)?;
  let info = list.page_info;
  println!(
    "page {}/{} ({} of {} elements)",
    info.current_page,
    info.total_pages,
    list.page.len(),
    info.total_elements
  );
  for item in &list.page {
    let label = hal::self_href(item).unwrap_or("<no self link>");
    println!("{}", label);
  }
  Ok(())
}

async fn watch(session: &Session, href: &str) -> Result<()> {
  let mut snapshots = session
    .builder()
    .from_key::<Value>(href, &session.default_options());

  loop {
    tokio::select! {
      next = snapshots.next() => match next {
        Some(rd) => println!("{}", describe(&rd)),
        None => return Ok(()),
      },
      _ = tokio::signal::ctrl_c() => return Ok(()),
    }
  }
}

async fn first_payload(
  stream: futures::stream::BoxStream<'static, RemoteData<Value>>,
) -> Result<Value> {
  let rd = stream
    .first_completed()
    .next()
    .await
    .ok_or_else(|| eyre!("Request was abandoned"))?;
  into_result(rd)
}

fn into_result<T>(rd: RemoteData<T>) -> Result<T> {
  if rd.has_failed() == Some(true) {
    return Err(eyre!(
      "Request failed ({}): {}",
      rd.status_code()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "no response".to_string()),
      rd.error_message().unwrap_or("unknown error")
    ));
  }
  if rd.has_no_content() {
    return Err(eyre!("The server returned no content"));
  }
  rd.into_payload()
    .ok_or_else(|| eyre!("Response carried no payload"))
}

fn describe(rd: &RemoteData<Value>) -> String {
  let mut line = format!("[{}] {}", rd.last_updated().format("%H:%M:%S"), rd.state());
  if let Some(status) = rd.status_code() {
    line.push_str(&format!(" {}", status));
  }
  if let Some(message) = rd.error_message() {
    line.push_str(&format!(" {}", message));
  }
  if let Some(link) = rd.payload().and_then(hal::self_href) {
    line.push_str(&format!(" {}", link));
  }
  line
}
