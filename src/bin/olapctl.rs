/// olapctl - local driver for olap-delta
///
/// Works against a JSON snapshot of the in-memory store: every invocation
/// loads the snapshot, runs one command through the request service and
/// saves the snapshot back.
///
/// Usage:
///   olapctl put <collection> <json>          - Insert or replace a source document
///   olapctl remove <collection> <id>         - Delete a source document
///   olapctl cube create <name> --model <m>   - Build a cube
///   olapctl cube list                        - List cubes
///   olapctl cube delete <name>               - Drop a cube
///   olapctl cube rebuild <name>              - Rebuild a cube from scratch
///   olapctl update                           - Fold pending changes into all cubes
///   olapctl aggregate <cube> [-d ..] [-m ..] - Query a cube
///   olapctl run [--interval-ms <ms>]         - Keep cubes updated until Ctrl-C
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use olap_delta::query::DimensionFilter;
use olap_delta::types::ID_FIELD;
use olap_delta::{
    AggregateRequest, Coordinator, Granularity, MemoryStore, Model, OlapConfig, Request, Response,
    Service, TimeFormat, logging, persistence, service,
};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

/// olapctl - incrementally maintained OLAP cubes
#[derive(Parser)]
#[command(name = "olapctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Snapshot file path (default: ~/.olap-delta/db.json)
    #[arg(short, long, global = true)]
    db_path: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert a source document, or replace it if its `_id` exists
    ///
    /// Examples:
    ///   olapctl put population '{"city": "Lyon", "males": 12}'
    ///   olapctl put population '{"_id": "lyon", "city": "Lyon", "males": 13}'
    Put {
        /// Source collection
        collection: String,

        /// Document (JSON object)
        document: String,
    },

    /// Delete a source document
    Remove {
        /// Source collection
        collection: String,

        /// Document id
        id: String,
    },

    /// Manage cubes
    #[command(subcommand)]
    Cube(CubeCommands),

    /// Fold pending changes into every cube
    Update,

    /// Query a cube
    ///
    /// Examples:
    ///   olapctl aggregate byCity -d city -m males
    ///   olapctl aggregate byHour -d ts:day -m procLength --iso
    ///   olapctl aggregate byHour -m procLength --filter '{"ts": {"$range": {"from": 0, "to": 1}}}'
    Aggregate {
        /// Cube name
        cube: String,

        /// Dimension to group by, optionally `id:granularity`
        #[arg(short = 'd', long = "dimension")]
        dimensions: Vec<String>,

        /// Measure to sum
        #[arg(short = 'm', long = "measure")]
        measures: Vec<String>,

        /// Dimension filters as a JSON object
        #[arg(long)]
        filter: Option<String>,

        /// Render time dimensions as RFC 3339
        #[arg(long)]
        iso: bool,
    },

    /// Buffer changes and update cubes periodically until Ctrl-C
    Run {
        /// Update interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum CubeCommands {
    /// Build a new cube
    ///
    /// Example:
    ///   olapctl cube create byCity --model '{"source": "db.population",
    ///     "dimensions": [{"path": "city", "id": "city"}],
    ///     "measures": [{"path": "males", "id": "males"}]}'
    Create {
        /// Cube name
        name: String,

        /// Model as JSON, or `@path` to a JSON file
        #[arg(short, long)]
        model: String,

        /// Create the cube empty instead of scanning the source
        #[arg(long)]
        skip_build: bool,

        /// Entity the cube is principally about
        #[arg(long)]
        principal_entity: Option<String>,
    },

    /// List cubes
    List,

    /// Drop a cube
    Delete {
        /// Cube name
        name: String,
    },

    /// Rebuild a cube from a full scan
    Rebuild {
        /// Cube name
        name: String,
    },
}

/// Get the default snapshot path (~/.olap-delta/db.json)
fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".olap-delta")
        .join("db.json")
}

fn load_config(cli: &Cli) -> Result<OlapConfig> {
    let mut config = match &cli.config {
        Some(path) => OlapConfig::from_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => {
            let mut config = OlapConfig::default();
            // One-shot commands print results on stdout; keep the log quiet.
            if !matches!(cli.command, Commands::Run { .. }) {
                config.logger.level = "warn".to_string();
            }
            config
        }
    };
    config = config.with_env();
    Ok(config)
}

/// Format JSON for pretty printing
fn format_json(value: &JsonValue) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Unwrap a service response, turning an error response into an error.
fn expect_ok(response: Response) -> Result<Response> {
    match response {
        Response::Error { code, message } => anyhow::bail!("{} ({})", message, code),
        ok => Ok(ok),
    }
}

fn parse_model(raw: &str) -> Result<Model> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file {}", path))?,
        None => raw.to_string(),
    };
    service::decode_json(&text).with_context(|| "Invalid model JSON".to_string())
}

fn parse_request(
    dimensions: &[String],
    measures: &[String],
    filter: Option<&str>,
    iso: bool,
) -> Result<AggregateRequest> {
    let mut request = AggregateRequest::new();
    for dimension in dimensions {
        request = match dimension.split_once(':') {
            Some((id, granularity)) => {
                let granularity: Granularity = granularity.parse()?;
                request.dimension_at(id, granularity)
            }
            None => request.dimension(dimension.as_str()),
        };
    }
    for measure in measures {
        request = request.measure(measure.as_str());
    }
    if let Some(filter) = filter {
        let filters: BTreeMap<String, DimensionFilter> =
            serde_json::from_str(filter).with_context(|| format!("Invalid filter JSON: {}", filter))?;
        for (id, filter) in filters {
            request = request.filter(id, filter);
        }
    }
    if iso {
        request = request.time_format(TimeFormat::Iso);
    }
    Ok(request)
}

async fn put_document(store: &MemoryStore, collection: &str, raw: &str) -> Result<()> {
    let document: JsonValue =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON document: {}", raw))?;
    if !document.is_object() {
        anyhow::bail!("Document must be a JSON object");
    }

    let existing_id = document
        .get(ID_FIELD)
        .map(olap_delta::types::id_to_string);
    let replaced = match &existing_id {
        Some(id) => store
            .replace_document(collection, id, document.clone())
            .await
            .context("Failed to replace document")?,
        None => false,
    };

    let id = if replaced {
        existing_id.unwrap_or_default()
    } else {
        store
            .insert_document(collection, document)
            .await
            .context("Failed to insert document")?
    };

    println!("{}", "OK".green().bold());
    println!(
        "  {}: {}/{}",
        if replaced { "Replaced" } else { "Inserted" },
        collection.cyan(),
        id.cyan()
    );
    Ok(())
}

async fn execute(command: Commands, store: &MemoryStore, service: &Service) -> Result<()> {
    match command {
        Commands::Put {
            collection,
            document,
        } => put_document(store, &collection, &document).await,

        Commands::Remove { collection, id } => {
            if !store
                .delete_document(&collection, &id)
                .await
                .context("Failed to delete document")?
            {
                anyhow::bail!("Document not found: {}/{}", collection, id);
            }
            println!("{}", "OK".green().bold());
            println!("  Removed: {}/{}", collection.cyan(), id.cyan());
            Ok(())
        }

        Commands::Cube(CubeCommands::Create {
            name,
            model,
            skip_build,
            principal_entity,
        }) => {
            let model = parse_model(&model)?;
            let response = expect_ok(
                service
                    .handle(Request::CreateCube {
                        name: name.clone(),
                        model,
                        principal_entity,
                        skip_build,
                    })
                    .await,
            )?;
            println!("{}", format!("Cube '{}' created.", name).green().bold());
            if let Some(cube) = response.get("cube") {
                println!("  Watermark: {}", format_json(&cube["lastProcessed"]).bright_black());
            }
            Ok(())
        }

        Commands::Cube(CubeCommands::List) => {
            let response = expect_ok(service.handle(Request::ListCubes).await)?;
            let cubes = response
                .get("cubes")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            if cubes.is_empty() {
                println!("{}", "No cubes found".yellow());
                return Ok(());
            }
            println!("{}", "Cubes:".bold());
            for cube in cubes {
                let name = cube["id"].as_str().unwrap_or_default().to_string();
                let source = cube["model"]["source"].as_str().unwrap_or_default().to_string();
                let valid = cube["valid"].as_bool().unwrap_or(false);
                println!(
                    "  {} {} {}",
                    name.cyan(),
                    format!("({})", source).bright_black(),
                    if valid { "valid".green() } else { "invalid".red() }
                );
            }
            Ok(())
        }

        Commands::Cube(CubeCommands::Delete { name }) => {
            expect_ok(service.handle(Request::DeleteCube { name: name.clone() }).await)?;
            println!("{}", format!("Cube '{}' deleted.", name).green());
            Ok(())
        }

        Commands::Cube(CubeCommands::Rebuild { name }) => {
            expect_ok(service.handle(Request::RebuildCube { name: name.clone() }).await)?;
            println!("{}", format!("Cube '{}' rebuilt.", name).green());
            Ok(())
        }

        Commands::Update => {
            let response = expect_ok(service.handle(Request::UpdateAggregates).await)?;
            if let Some(report) = response.get("report") {
                println!("{}", format_json(report));
            }
            Ok(())
        }

        Commands::Aggregate {
            cube,
            dimensions,
            measures,
            filter,
            iso,
        } => {
            let request = parse_request(&dimensions, &measures, filter.as_deref(), iso)?;
            let response = expect_ok(service.handle(Request::Aggregate { cube, request }).await)?;
            let rows = response.get("rows").cloned().unwrap_or(JsonValue::Null);
            println!("{}", format_json(&rows));
            Ok(())
        }

        Commands::Run { interval_ms } => {
            expect_ok(service.handle(Request::StartBuffering).await)?;
            let response = expect_ok(service.handle(Request::StartAutoUpdate { interval_ms }).await)?;
            let interval = response.get("intervalMs").cloned().unwrap_or(JsonValue::Null);

            println!("{}", "Keeping cubes up to date".green().bold());
            println!("  Interval: {} ms", interval);
            println!();
            println!("{}", "Press Ctrl+C to stop".bright_black());

            signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            println!();
            println!("{}", "Shutting down...".yellow());
            Ok(())
        }
    }
}

async fn save(store: &MemoryStore, path: &Path) -> Result<()> {
    persistence::save(store, path)
        .await
        .with_context(|| format!("Failed to save {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init(&config.logger).context("Failed to initialize logging")?;

    let db_path = cli.db_path.clone().unwrap_or_else(default_db_path);
    let store = Arc::new(
        persistence::load_or_default(&db_path)
            .await
            .with_context(|| format!("Failed to load {}", db_path.display()))?,
    );

    let is_run = matches!(cli.command, Commands::Run { .. });
    let coordinator = Coordinator::connect(store.clone(), store.change_log(), config)
        .await
        .context("Failed to connect")?;
    coordinator.load_cubes().await.context("Failed to load cubes")?;
    if is_run {
        coordinator.restore().await.context("Failed to restore coordinator state")?;
    }
    let service = Service::new(coordinator);

    let result = execute(cli.command, &store, &service).await;

    service.shutdown().await;
    save(&store, &db_path).await?;

    if let Err(e) = result {
        eprintln!("{}", "Error".red().bold());
        eprintln!("  {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
