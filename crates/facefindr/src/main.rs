use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facefindr_core::{CandidateSource, MatchCriterion};
use facefindr_store::{ingest_photo, BucketStore, CatalogSource, PhotoCatalog};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{EngineHandle, MatchRequest};

#[derive(Parser)]
#[command(name = "facefindr", about = "Find yourself in event photos with a selfie")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and embed the faces in an image
    Detect {
        image: PathBuf,
        /// Include the embedding vectors in the output
        #[arg(long)]
        embeddings: bool,
    },
    /// Compare a selfie with one photo
    Verify {
        selfie: PathBuf,
        image: PathBuf,
        #[command(flatten)]
        criterion: CriterionArgs,
    },
    /// Rank the photos in an event bucket against a selfie
    Match {
        /// Bucket holding the event's photos
        #[arg(long)]
        event: String,
        selfie: PathBuf,
        #[command(flatten)]
        ranking: RankingArgs,
    },
    /// Manage the photo catalog
    #[command(subcommand)]
    Catalog(CatalogCommands),
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Create an event
    AddEvent { name: String },
    /// Upload photos into an event
    AddPhoto {
        #[arg(long)]
        event_id: i64,
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// List events, or the photos of one event
    List {
        /// Only events whose name contains this text
        #[arg(long)]
        search: Option<String>,
        #[arg(long, conflicts_with = "search")]
        event_id: Option<i64>,
    },
    /// Rank a cataloged event's photos against a selfie
    Match {
        #[arg(long)]
        event_id: i64,
        selfie: PathBuf,
        #[command(flatten)]
        ranking: RankingArgs,
    },
}

#[derive(Args)]
struct CriterionArgs {
    /// Minimum cosine similarity (higher is stricter)
    #[arg(long, conflicts_with = "max_distance")]
    threshold: Option<f32>,
    /// Maximum embedding distance (lower is stricter)
    #[arg(long)]
    max_distance: Option<f32>,
}

impl CriterionArgs {
    fn criterion(&self) -> Option<MatchCriterion> {
        match (self.threshold, self.max_distance) {
            (Some(min_similarity), _) => Some(MatchCriterion::Cosine { min_similarity }),
            (None, Some(max_distance)) => Some(MatchCriterion::Distance { max_distance }),
            (None, None) => None,
        }
    }
}

#[derive(Args)]
struct RankingArgs {
    /// Keep only the N best matches (0 keeps all)
    #[arg(long)]
    top_k: Option<usize>,
    #[command(flatten)]
    criterion: CriterionArgs,
}

impl RankingArgs {
    fn top_k(&self) -> Option<usize> {
        self.top_k.filter(|&k| k > 0)
    }
}

#[derive(Serialize)]
struct DetectedFace {
    bbox: facefindr_core::BoundingBox,
    embedding_dim: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Detect { image, embeddings } => {
            let engine = start_engine(&config)?;
            let detections = engine.embed(read_image(&image)?).await?;
            let faces: Vec<DetectedFace> = detections
                .into_iter()
                .map(|d| DetectedFace {
                    bbox: d.bbox,
                    embedding_dim: d.embedding.values.len(),
                    embedding: embeddings.then_some(d.embedding.values),
                })
                .collect();
            print_json(&serde_json::json!({ "faces": faces }))?;
            engine.shutdown().await;
        }
        Commands::Verify {
            selfie,
            image,
            criterion,
        } => {
            let engine = start_engine(&config)?;
            let verdict = engine
                .verify(read_image(&selfie)?, read_image(&image)?, criterion.criterion())
                .await?;
            print_json(&verdict)?;
            engine.shutdown().await;
        }
        Commands::Match {
            event,
            selfie,
            ranking,
        } => {
            let buckets = BucketStore::open(&config.bucket_root)?;
            run_match(&config, Arc::new(buckets), event, &selfie, &ranking).await?;
        }
        Commands::Catalog(command) => run_catalog(&config, command).await?,
    }

    Ok(())
}

async fn run_catalog(config: &Config, command: CatalogCommands) -> Result<()> {
    let catalog = Arc::new(PhotoCatalog::open(&config.catalog_path)?);
    let buckets = Arc::new(BucketStore::open(&config.bucket_root)?);

    match command {
        CatalogCommands::AddEvent { name } => {
            let event = catalog.create_event(&name)?;
            buckets.create_bucket(&event.bucket())?;
            print_json(&event)?;
        }
        CatalogCommands::AddPhoto { event_id, photos } => {
            let mut added = Vec::with_capacity(photos.len());
            for path in &photos {
                let bytes = read_image(path)?;
                let extension = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("jpg");
                added.push(ingest_photo(&catalog, &buckets, event_id, &bytes, extension)?);
            }
            print_json(&added)?;
        }
        CatalogCommands::List { search, event_id } => match event_id {
            Some(id) => {
                catalog.event(id)?;
                print_json(&catalog.photos_for_event(id)?)?;
            }
            None => print_json(&catalog.list_events(search.as_deref())?)?,
        },
        CatalogCommands::Match {
            event_id,
            selfie,
            ranking,
        } => {
            let source = CatalogSource::new(catalog, buckets);
            run_match(config, Arc::new(source), event_id.to_string(), &selfie, &ranking).await?;
        }
    }
    Ok(())
}

async fn run_match(
    config: &Config,
    source: Arc<dyn CandidateSource>,
    event: String,
    selfie: &Path,
    ranking: &RankingArgs,
) -> Result<()> {
    let selfie = read_image(selfie)?;
    let engine = start_engine(config)?;
    let response = engine
        .find_matches(MatchRequest {
            selfie,
            source,
            event,
            criterion: ranking.criterion.criterion(),
            top_k: ranking.top_k(),
        })
        .await;
    engine.shutdown().await;
    print_json(&response?)
}

fn start_engine(config: &Config) -> Result<EngineHandle> {
    engine::spawn_engine(config)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
