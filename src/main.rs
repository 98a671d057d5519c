//! Interpose CLI

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use interpose::config::Config;
use interpose::har::{self, HarMode};
use interpose::network::FrontDoor;
use interpose::Engine;

#[derive(Parser)]
#[command(name = "interpose")]
#[command(about = "Network interception and virtualization engine")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the front door with routes, HAR archive and conditions from a config file
    Serve {
        /// Configuration file path
        #[arg(short, long, env = "INTERPOSE_CONFIG")]
        config: PathBuf,

        /// Override the HTTP listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Summarize a HAR file
    HarInfo {
        /// HAR file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Command::Serve { config, listen } => serve(&config, listen).await,
        Command::HarInfo { file } => har_info(&file),
    }
}

async fn serve(path: &std::path::Path, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(listen) = listen {
        config.server.listen = listen;
    }

    info!("Interpose v{}", env!("CARGO_PKG_VERSION"));

    let engine = Arc::new(Engine::new(config.engine_options()));

    let har = match &config.har {
        Some(har) => Some(
            engine
                .load_har_archive(&har.path, har.options.clone())
                .await
                .with_context(|| format!("loading HAR archive {}", har.path.display()))?,
        ),
        None => None,
    };

    // Static routes go last so they take precedence over the archive
    let routes = config.register_routes(&engine).await?;
    info!("{} static routes registered", routes);

    let door = FrontDoor::new(Arc::clone(&engine), config.server_options());
    let result = door.run().await;

    engine.close().await;

    if let Some(har) = har {
        let stats = har.stats();
        info!(
            "HAR archive: {} entries, {} hits, {} misses",
            stats.entries, stats.hits, stats.misses
        );
        if har.archive().mode() == HarMode::Record {
            har.save()
                .with_context(|| format!("saving HAR archive {}", har.path().display()))?;
            info!("HAR archive saved to {}", har.path().display());
        }
    }

    if let Err(e) = &result {
        warn!("Front door stopped with error: {}", e);
    }
    result.map_err(Into::into)
}

fn har_info(path: &std::path::Path) -> anyhow::Result<()> {
    let document = har::read_document(path).with_context(|| format!("reading {}", path.display()))?;
    let (methods, keys) = har::summarize(&document);

    println!("HAR file: {}", path.display());
    println!("Version: {}", document.log.version);
    println!(
        "Creator: {} {}",
        document.log.creator.name, document.log.creator.version
    );
    println!("Entries: {}", document.log.entries.len());
    println!();

    println!("By method:");
    for (method, count) in &methods {
        println!("  {method:<8} {count}");
    }
    println!();

    println!("Distinct request keys: {}", keys.len());
    for (key, count) in &keys {
        println!("  {count:>4}  {key}");
    }

    Ok(())
}
