use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hina_core::trainer::{self, TrainOptions};
use hina_core::{classify, validator};
use hina_core::{Config, DetectorModel, GalleryStore, MajorityVoteMatcher, OnnxFaceEncoder};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hina", version, about = "Face identification: train a gallery, validate it, identify images")]
struct Cli {
    /// Gallery file (overrides config)
    #[arg(short, long, global = true)]
    gallery: Option<PathBuf>,

    /// Directory with the ONNX models (overrides config)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Detector variant: fast or accurate (overrides config)
    #[arg(short = 'm', long = "model", global = true)]
    model: Option<DetectorModel>,

    /// Match tolerance (overrides config)
    #[arg(short, long, global = true)]
    tolerance: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the gallery from <ROOT>/<identity>/<image> directories
    Train {
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        /// Encode the existing staging directory instead of re-preprocessing
        #[arg(long)]
        reuse_staging: bool,

        /// Staging directory (overrides config)
        #[arg(long)]
        staging_dir: Option<PathBuf>,
    },
    /// Identify every image under a directory and report accuracy
    Validate {
        #[arg(default_value = "validation")]
        dir: PathBuf,
    },
    /// Identify the faces in one image
    Identify {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Show gallery metadata and enrolled identities
    Inspect,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().context("loading configuration")?;
    if let Some(path) = cli.gallery {
        config.gallery_path = path;
    }
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }
    if let Some(model) = cli.model {
        config.detector_model = model;
    }
    if let Some(tolerance) = cli.tolerance {
        config.tolerance = tolerance;
    }
    config.validate().context("invalid configuration")?;
    tracing::debug!(
        gallery = %config.gallery_path.display(),
        models = %config.model_dir.display(),
        detector = %config.detector_model,
        tolerance = config.tolerance,
        "resolved configuration"
    );

    let store = GalleryStore::new(&config.gallery_path);
    let matcher = MajorityVoteMatcher::new(config.tolerance)?;

    match cli.command {
        Commands::Train {
            roots,
            reuse_staging,
            staging_dir,
        } => {
            let mut encoder = load_encoder(&config)?;
            let options = TrainOptions {
                staging_dir: staging_dir.unwrap_or(config.staging_dir),
                reuse_staging,
                preprocess: config.preprocess,
            };
            let (gallery, report) = trainer::train(&roots, &mut encoder, &matcher, &store, &options)
                .context("training failed")?;

            for item in &report.skipped {
                println!("skipped {}: {}", item.path.display(), item.reason);
            }
            println!("{report}");
            println!(
                "gallery: {} ({} entries)",
                store.path().display(),
                gallery.len()
            );
        }
        Commands::Validate { dir } => {
            let gallery = store.load().context("loading gallery")?;
            let mut encoder = load_encoder(&config)?;
            let report = validator::validate(&dir, &gallery, &mut encoder, &matcher, &config.preprocess)
                .context("validation failed")?;

            for outcome in &report.outcomes {
                if outcome.faces.is_empty() {
                    println!("{}: no faces", outcome.path.display());
                }
                for face in &outcome.faces {
                    let verdict = match &outcome.expected {
                        Some(expected) if face.result.label.as_ref() == Some(expected) => " ok",
                        Some(_) => " WRONG",
                        None => "",
                    };
                    println!(
                        "{}: {}{verdict}",
                        outcome.path.display(),
                        face.result.display_label()
                    );
                }
            }
            for item in &report.skipped {
                println!("skipped {}: {}", item.path.display(), item.reason);
            }
            println!("{report}");
        }
        Commands::Identify { file } => {
            let gallery = store.load().context("loading gallery")?;
            let mut encoder = load_encoder(&config)?;
            let classification =
                classify::classify_file(&file, &mut encoder, &matcher, &gallery, &config.preprocess)
                    .with_context(|| format!("identifying {}", file.display()))?;

            if classification.faces.is_empty() {
                println!("no faces found");
            }
            for face in &classification.faces {
                let b = &face.bbox;
                let distance = face
                    .result
                    .distance
                    .map(|d| format!("{d:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} votes={} distance={} box=({:.0}, {:.0}, {:.0}, {:.0})",
                    face.result.display_label(),
                    face.result.votes,
                    distance,
                    b.x,
                    b.y,
                    b.width,
                    b.height
                );
            }
        }
        Commands::Inspect => {
            let gallery = store.load().context("loading gallery")?;
            println!("gallery:    {}", store.path().display());
            println!("id:         {}", gallery.id());
            println!("created:    {}", gallery.created_at());
            println!("model:      {}", gallery.model_version());
            println!("dimension:  {}", gallery.dimension());
            println!("entries:    {}", gallery.len());
            let identities = gallery.identities();
            println!("identities: {}", identities.len());
            for (label, count) in identities {
                println!("  {label:<24} {count}");
            }
        }
    }

    Ok(())
}

fn load_encoder(config: &Config) -> Result<OnnxFaceEncoder> {
    let encoder = OnnxFaceEncoder::load(&config.model_dir, config.detector_model).with_context(|| {
        format!(
            "loading face models from {} (detector {})",
            config.model_dir.display(),
            config.detector_model
        )
    })?;
    tracing::info!(detector = %config.detector_model, "face models loaded");
    Ok(encoder)
}
