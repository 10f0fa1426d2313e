//! pk - parser registry command line
//!
//! Inspect and execute persisted parser definitions, and list Chrome tabs
//! available for authoring sessions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parsekit::cdp::{self, discovery::DEFAULT_DEBUG_PORT};
use parsekit::registry::ParserRegistry;
use std::io::Read;
use std::path::PathBuf;

/// Parser synthesis and execution toolkit
#[derive(Parser, Debug)]
#[command(name = "pk")]
#[command(version)]
#[command(about = "Resolve and run persisted web parsers")]
struct Args {
    /// Directory holding parser definition files
    #[arg(short, long, default_value = "parsers")]
    parsers: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which parser definition a URL resolves to
    Resolve {
        /// URL to resolve
        url: String,
    },
    /// Run the resolved parser against a document and print records as JSON
    Parse {
        /// URL used for resolution
        url: String,
        /// HTML file to parse; reads stdin when omitted
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
    },
    /// List registered definitions, optionally for one domain
    List {
        /// Restrict to this domain
        domain: Option<String>,
    },
    /// List open Chrome page tabs on the debug port
    Tabs {
        /// Chrome remote debugging port
        #[arg(short, long, default_value_t = DEFAULT_DEBUG_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Resolve { url } => {
            let registry = load_registry(&args.parsers)?;
            match registry.resolve(&url) {
                Some(definition) => {
                    println!("{}", serde_json::to_string_pretty(definition.as_ref())?)
                }
                None => {
                    eprintln!("no parser registered for {url}");
                    std::process::exit(1);
                }
            }
        }
        Command::Parse { url, file } => {
            let registry = load_registry(&args.parsers)?;
            let html = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading stdin")?;
                    buf
                }
            };
            let records = parsekit::parse(&registry, &url, &html);
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::List { domain } => {
            let registry = load_registry(&args.parsers)?;
            let definitions = match domain {
                Some(d) => registry.definitions_for(&d),
                None => registry.definitions(),
            };
            for definition in definitions {
                let path = definition.path_pattern.as_deref().unwrap_or("*");
                println!(
                    "{} v{}  {}  selector: {}",
                    definition.domain, definition.version, path, definition.selector
                );
            }
        }
        Command::Tabs { port } => {
            let tabs = cdp::list_tabs(port).await?;
            for tab in tabs {
                println!("{}  {}  {}", tab.id, tab.url, tab.title);
            }
        }
    }

    Ok(())
}

fn load_registry(dir: &PathBuf) -> Result<ParserRegistry> {
    let registry = ParserRegistry::load(dir)
        .with_context(|| format!("loading parsers from {}", dir.display()))?;
    for warning in registry.load_warnings() {
        tracing::warn!("skipped definition file: {warning}");
    }
    Ok(registry)
}
