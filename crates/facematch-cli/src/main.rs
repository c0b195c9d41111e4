use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::detector::{DEFAULT_CROP_SIZE, DEFAULT_MIN_FACE_SIZE};
use facematch_core::embedder::DEFAULT_INPUT_SIZE;
use facematch_core::{
    CropSettings, Embedding, EmbedderSettings, EuclideanMatcher, FaceDetector, FaceEmbedder,
    Gallery, GalleryEntry, Identification, OnnxEmbedder, ScrfdDetector,
};
use facematch_transport::{ImageRequest, MatchResponse, SpoolQueue, Verdict};
use image::DynamicImage;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facematch", about = "Face gallery matching CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Models {
    /// SCRFD face detection model
    #[arg(long)]
    detector_model: PathBuf,
    /// Face embedding model
    #[arg(long)]
    embedder_model: PathBuf,
    /// Version tag of the embedding model
    #[arg(long)]
    model_version: Option<String>,
    /// Smallest accepted face side, in pixels
    #[arg(long, default_value_t = DEFAULT_MIN_FACE_SIZE)]
    min_face_size: f32,
    /// Side length of face crops
    #[arg(long, default_value_t = DEFAULT_CROP_SIZE)]
    crop_size: u32,
    /// Side length of the embedder input
    #[arg(long, default_value_t = DEFAULT_INPUT_SIZE)]
    input_size: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what a gallery file contains
    Inspect {
        gallery: PathBuf,
    },
    /// Match a precomputed embedding (JSON array of floats) against a gallery
    Match {
        gallery: PathBuf,
        embedding: PathBuf,
        /// Answer Unknown when the nearest distance exceeds this
        #[arg(long, value_parser = parse_max_distance)]
        max_distance: Option<f32>,
    },
    /// Detect, embed and match one image
    Identify {
        image: PathBuf,
        #[arg(short, long)]
        gallery: PathBuf,
        #[arg(long, value_parser = parse_max_distance)]
        max_distance: Option<f32>,
        #[command(flatten)]
        models: Models,
    },
    /// Build a gallery from a directory of face images, labelled by file name
    Enroll {
        dir: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        #[command(flatten)]
        models: Models,
    },
    /// Queue an image for the edge daemon
    Submit {
        image: PathBuf,
        #[arg(long)]
        inbox: PathBuf,
        /// Request id; a random one is generated when omitted
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Print and remove all pending responses
    Responses {
        #[arg(long)]
        queue: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { gallery } => {
            let gallery = load_gallery(&gallery)?;
            println!("entries:       {}", gallery.len());
            match gallery.dimension() {
                Some(d) => println!("dimension:     {d}"),
                None => println!("dimension:     -"),
            }
            println!("model version: {}", gallery.model_version().unwrap_or("-"));
            for (i, entry) in gallery.entries().iter().enumerate() {
                println!("  [{i}] {}", entry.label);
            }
        }
        Commands::Match {
            gallery,
            embedding,
            max_distance,
        } => {
            let gallery = load_gallery(&gallery)?;
            let raw = std::fs::read(&embedding)
                .with_context(|| format!("reading {}", embedding.display()))?;
            let probe = parse_embedding(&raw)?;
            let id = EuclideanMatcher::from_max_distance(max_distance)?.identify(&probe, &gallery)?;
            print_identification(&id);
        }
        Commands::Identify {
            image,
            gallery,
            max_distance,
            models,
        } => {
            let gallery = load_gallery(&gallery)?;
            let mut pipeline = Pipeline::load(&models)?;
            let img = image::open(&image).with_context(|| format!("opening {}", image.display()))?;
            match pipeline.embed(&img)? {
                Some(probe) => {
                    let id = EuclideanMatcher::from_max_distance(max_distance)?.identify(&probe, &gallery)?;
                    print_identification(&id);
                }
                None => println!("{}", Verdict::NoFace),
            }
        }
        Commands::Enroll { dir, out, models } => {
            let mut pipeline = Pipeline::load(&models)?;
            let mut entries = Vec::new();
            for path in image_files(&dir)? {
                let Some(label) = enroll_label(&path) else {
                    continue;
                };
                let img = match image::open(&path) {
                    Ok(img) => img,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                        continue;
                    }
                };
                match pipeline.embed(&img)? {
                    Some(embedding) => {
                        tracing::info!(%label, path = %path.display(), "enrolled");
                        entries.push(GalleryEntry::new(embedding, label));
                    }
                    None => tracing::warn!(path = %path.display(), "no face found, skipped"),
                }
            }
            if entries.is_empty() {
                bail!("no faces enrolled from {}", dir.display());
            }
            let gallery = Gallery::from_entries(entries, models.model_version.clone())?;
            gallery
                .save(&out)
                .with_context(|| format!("writing {}", out.display()))?;
            println!("Enrolled {} faces into {}", gallery.len(), out.display());
        }
        Commands::Submit {
            image,
            inbox,
            request_id,
        } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let filename = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let queue = SpoolQueue::open(&inbox).context("opening inbox")?;
            queue.send(&ImageRequest::new(&bytes, request_id.as_str(), filename))?;
            println!("{request_id}");
        }
        Commands::Responses { queue } => {
            let queue = SpoolQueue::open(&queue).context("opening response queue")?;
            loop {
                let batch = queue.receive(64)?;
                if batch.is_empty() {
                    break;
                }
                for delivery in &batch {
                    match MatchResponse::parse(&delivery.body) {
                        Ok(response) => println!("{}", serde_json::to_string(&response)?),
                        Err(e) => tracing::warn!(id = %delivery.id, error = %e, "malformed response"),
                    }
                    queue.ack(delivery)?;
                }
            }
        }
    }

    Ok(())
}

/// Detector and embedder chained: image in, embedding of its face out.
struct Pipeline {
    detector: ScrfdDetector,
    embedder: OnnxEmbedder,
}

impl Pipeline {
    fn load(models: &Models) -> Result<Self> {
        let detector = ScrfdDetector::load(
            &models.detector_model,
            CropSettings {
                min_face_size: models.min_face_size,
                crop_size: models.crop_size,
            },
        )
        .context("loading face detector")?;
        let embedder = OnnxEmbedder::load(
            &models.embedder_model,
            EmbedderSettings {
                input_size: models.input_size,
                dimension: None,
                model_version: models.model_version.clone(),
            },
        )
        .context("loading embedding model")?;
        Ok(Self { detector, embedder })
    }

    fn embed(&mut self, image: &DynamicImage) -> Result<Option<Embedding>> {
        let Some(face) = self.detector.detect(image)? else {
            return Ok(None);
        };
        let embedding = self.embedder.extract(&DynamicImage::ImageRgb8(face.image))?;
        Ok(Some(embedding))
    }
}

fn load_gallery(path: &Path) -> Result<Gallery> {
    Gallery::load(path).with_context(|| format!("loading gallery {}", path.display()))
}

fn parse_max_distance(raw: &str) -> Result<f32, String> {
    let d: f32 = raw.parse().map_err(|e| format!("{e}"))?;
    EuclideanMatcher::from_max_distance(Some(d)).map_err(|e| e.to_string())?;
    Ok(d)
}

fn parse_embedding(raw: &[u8]) -> Result<Embedding> {
    let values: Vec<f32> = serde_json::from_slice(raw).context("embedding must be a JSON array of numbers")?;
    Ok(Embedding::new(values))
}

fn print_identification(id: &Identification) {
    println!("{}", Verdict::from(id.result.clone()));
    if let Some(nearest) = id.nearest {
        println!("nearest: #{} at distance {:.4}", nearest.index, nearest.distance);
    }
}

/// Label for an enrollment image: the file name up to its first `.`.
fn label_for(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let label = name.split('.').next().unwrap_or(name);
    (!label.is_empty()).then(|| label.to_string())
}

/// Label to enroll `path` under, or `None` when the file must be skipped.
///
/// Labels that read back as a result string (`Unknown`, `No-Face`) would
/// make responses ambiguous.
fn enroll_label(path: &Path) -> Option<String> {
    let label = label_for(path)?;
    if Verdict::is_reserved(&label) {
        tracing::warn!(%label, path = %path.display(), "label is a reserved result string, skipped");
        return None;
    }
    Some(label)
}

/// Regular files in `dir`, sorted by name so enrollment order is stable.
fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
