use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use eventscope::api::AppState;
use eventscope::config::Config;
use eventscope::workflow::{DescribeTarget, DescriptionSession, TargetKind};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eventscope")]
#[command(about = "Ask Mixpanel questions in natural language and curate its event catalog")]
#[command(version)]
struct Args {
    /// Catalog database path (overrides CATALOG_DB_PATH)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question about your analytics data
    Ask {
        /// The question in natural language
        question: String,

        /// Print the interpretation and call traces
        #[arg(long)]
        debug: bool,
    },
    /// Populate the catalog from Mixpanel
    Discover {
        #[command(subcommand)]
        target: DiscoverTarget,
    },
    /// List catalogued events
    Events,
    /// Print the catalog
    Export {
        #[arg(long, value_enum, default_value = "full")]
        format: ExportFormat,
    },
    /// Draft a description with the model, review it, then save it
    Describe {
        #[arg(value_enum)]
        kind: KindArg,
        id: i64,
    },
}

#[derive(Subcommand)]
enum DiscoverTarget {
    /// Top events
    Events,
    /// Top properties of one event
    Properties { event_id: i64 },
    /// Sample values of one property
    Values { property_id: i64 },
    /// Events, then properties of every event
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Full,
    Compact,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Event,
    Property,
}

impl From<KindArg> for TargetKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Event => TargetKind::Event,
            KindArg::Property => TargetKind::Property,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(path) = args.catalog {
        config.catalog_path = path;
    }
    let state = AppState::from_config(&config)?;

    match args.command {
        Commands::Ask { question, debug } => {
            let result = state.pipeline.run(&question).await?;
            println!("{}", result.summary);
            println!("\nOpen in Mixpanel: {}", result.analytics_link);
            if debug {
                println!("\n=== Query ===");
                println!("{}", serde_json::to_string_pretty(&result.query)?);
                println!("\n=== Debug ===");
                println!("{}", serde_json::to_string_pretty(&result.debug)?);
            }
        }
        Commands::Discover { target } => match target {
            DiscoverTarget::Events => {
                let count = state.discovery.discover_events().await?;
                println!("Discovered {} events", count);
            }
            DiscoverTarget::Properties { event_id } => {
                let found = state.discovery.discover_properties(event_id).await?;
                println!("Discovered {} properties for {}", found.count, found.event_name);
            }
            DiscoverTarget::Values { property_id } => {
                let found = state.discovery.discover_values(property_id).await?;
                println!("Discovered {} values ({})", found.count, found.data_type);
                println!("{}", serde_json::to_string_pretty(&found.values)?);
            }
            DiscoverTarget::All => {
                let summary = state.discovery.discover_all().await?;
                println!(
                    "Discovered {} events, {} properties",
                    summary.event_count, summary.property_count
                );
                for failure in &summary.errors {
                    println!("  failed: {} - {}", failure.event, failure.error);
                }
            }
        },
        Commands::Events => {
            for summary in state.catalog.list_events()? {
                let event = summary.event;
                println!(
                    "{:>6}  {:<40} {:>10}  {} properties  [{}]",
                    event.id,
                    event.name,
                    event.event_count.map(|c| c.to_string()).unwrap_or_default(),
                    summary.property_count,
                    event.description_source
                );
            }
        }
        Commands::Export { format } => match format {
            ExportFormat::Full => {
                println!("{}", serde_json::to_string_pretty(&state.catalog.export_full()?)?)
            }
            ExportFormat::Compact => println!("{}", state.catalog.export_compact()?),
        },
        Commands::Describe { kind, id } => {
            let target = DescribeTarget { kind: kind.into(), id };
            describe_interactively(&state, target).await?;
        }
    }

    Ok(())
}

/// Preview a draft, let the user accept, edit or discard it.
async fn describe_interactively(state: &AppState, target: DescribeTarget) -> Result<()> {
    let mut session = DescriptionSession::new();
    let preview = session.preview(&state.workflow, target).await?;

    println!("Context sent to the model:");
    println!("{}", serde_json::to_string_pretty(&preview.context)?);
    println!("\nDraft:\n  {}\n", preview.description);
    print!("[a]ccept, [e]dit, or [d]iscard? ");
    io::stdout().flush()?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let choice = lines.next().transpose()?.unwrap_or_default();

    match choice.trim().to_ascii_lowercase().as_str() {
        "a" | "accept" => {
            session.confirm(&state.workflow, &preview.description)?;
            println!("Saved.");
        }
        "e" | "edit" => {
            print!("New description: ");
            io::stdout().flush()?;
            let edited = lines.next().transpose()?.unwrap_or_default();
            let edited = edited.trim();
            if edited.is_empty() {
                session.discard();
                println!("Empty description, nothing saved.");
            } else {
                session.confirm(&state.workflow, edited)?;
                println!("Saved.");
            }
        }
        _ => {
            session.discard();
            info!(kind = %target.kind, id = target.id, "Draft discarded");
            println!("Discarded.");
        }
    }
    Ok(())
}
