use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use timeclock_core::{
    capture_enrollment, scheduler, CaptureError, DetectionStatus, Disposition, EmbeddingExtractor,
    EnrollmentCapture, EuclideanMatcher, FrameError, FrameSource, Identity, IdentityId,
    LoopConfig, Matcher, RecognitionSink, DEFAULT_MATCH_THRESHOLD,
};
use timeclock_hw::{camera, CameraSource, StillSource};
use timeclock_models::OnnxExtractor;
use timeclock_store::Store;

#[derive(Parser)]
#[command(name = "timeclock", about = "Timeclock operator CLI")]
struct Cli {
    /// Database file (default: $TIMECLOCK_DB_PATH or $XDG_DATA_HOME/timeclock/timeclock.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Model directory (default: $TIMECLOCK_MODEL_DIR or $XDG_DATA_HOME/timeclock/models)
    #[arg(long, global = true)]
    models: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an employee from a photo or the camera
    Enroll {
        /// Name shown on the kiosk
        #[arg(short, long)]
        name: String,
        /// Enroll from an image file instead of the camera
        #[arg(long, conflicts_with = "camera")]
        image: Option<PathBuf>,
        /// Camera device (default: $TIMECLOCK_CAMERA_DEVICE or /dev/video0)
        #[arg(long)]
        camera: Option<String>,
        /// Frames to try before giving up when no face is found
        #[arg(long, default_value_t = 5)]
        attempts: usize,
        /// Extra JSON stored with the employee, e.g. '{"badge": 17}'
        #[arg(long)]
        metadata: Option<String>,
    },
    /// List enrolled employees
    List,
    /// Remove an enrolled employee (their punches are kept)
    Remove {
        /// Employee ID to remove
        id: String,
    },
    /// Resolve the face in an image against the enrolled employees
    Identify {
        #[arg(long)]
        image: PathBuf,
        /// Maximum Euclidean distance for a match
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
    },
    /// Run the detection loop over recorded images and print recognitions
    Replay {
        /// Image file or directory of images, played in name order
        path: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
        /// Suppression window after a recognition
        #[arg(long, default_value_t = 3000)]
        cooldown_ms: u64,
        /// Delay between frames
        #[arg(long, default_value_t = 50)]
        cadence_ms: u64,
    },
    /// Show recorded punches, newest first
    Punches {
        /// Only this employee
        #[arg(long)]
        employee: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List V4L2 capture devices
    Devices,
    /// Grab one frame from the camera and report on it
    Test {
        /// Camera device (default: $TIMECLOCK_CAMERA_DEVICE or /dev/video0)
        #[arg(long)]
        camera: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let model_dir = cli.models.unwrap_or_else(default_model_dir);

    match cli.command {
        Commands::Enroll {
            name,
            image,
            camera,
            attempts,
            metadata,
        } => {
            let metadata: serde_json::Value = match metadata {
                Some(raw) => serde_json::from_str(&raw).context("--metadata is not valid JSON")?,
                None => serde_json::json!({}),
            };
            let mut extractor = load_extractor(&model_dir)?;

            let capture = match image {
                Some(path) => {
                    let mut source = StillSource::open(&path)?;
                    capture_with_retries(&mut source, &mut extractor, 1).await?
                }
                None => {
                    let device = camera.unwrap_or_else(default_camera);
                    println!("Look at the camera ({device})...");
                    let mut source = CameraSource::spawn(&device, 4)
                        .with_context(|| format!("failed to open camera {device}"))?;
                    capture_with_retries(&mut source, &mut extractor, attempts.max(1)).await?
                }
            };

            let store = Store::open(&db_path).await?;
            let identity = store
                .add_identity(&name, capture.embedding, metadata)
                .await
                .context("failed to save employee")?;
            println!(
                "Enrolled {} as {} (face confidence {:.2})",
                identity.display_name, identity.id, capture.confidence
            );
        }
        Commands::List => {
            let store = Store::open(&db_path).await?;
            let employees = store.list_employees().await?;
            if employees.is_empty() {
                println!("No employees enrolled");
            }
            for employee in employees {
                println!(
                    "{}  {}  enrolled {}  dim={}",
                    employee.identity.id,
                    employee.identity.display_name,
                    employee.created_at.format("%Y-%m-%d %H:%M"),
                    employee.identity.embedding.dim()
                );
            }
        }
        Commands::Remove { id } => {
            let store = Store::open(&db_path).await?;
            if !store.remove_identity(&IdentityId::from(id.as_str())).await? {
                bail!("no employee with id {id}");
            }
            println!("Removed {id}");
        }
        Commands::Identify { image, threshold } => {
            let matcher = EuclideanMatcher::new(threshold)?;
            let mut extractor = load_extractor(&model_dir)?;
            let mut source = StillSource::open(&image)?;
            let capture = capture_with_retries(&mut source, &mut extractor, 1).await?;

            let store = Store::open(&db_path).await?;
            let registry = store.registry().await?;
            match matcher.compare(&capture.embedding, &registry)? {
                Some(found) => println!(
                    "{} ({}) at distance {:.3}",
                    found.identity.display_name, found.identity.id, found.distance
                ),
                None => println!("Not recognized ({} employees enrolled)", registry.len()),
            }
        }
        Commands::Replay {
            path,
            threshold,
            cooldown_ms,
            cadence_ms,
        } => {
            let source = StillSource::open(&path)?.once();
            let frames = source.len();
            let extractor = load_extractor(&model_dir)?;
            let store = Store::open(&db_path).await?;
            let registry = store.registry().await?;
            let config = LoopConfig {
                threshold,
                cooldown: Duration::from_millis(cooldown_ms),
                cadence: Duration::from_millis(cadence_ms),
                ..LoopConfig::default()
            };

            let running = scheduler::spawn(source, extractor, registry, ReplayPrinter, config)?;
            let handle = running.handle();
            // the source reports itself unavailable once the last image is played
            let mut snapshots = handle.watch();
            while snapshots.borrow_and_update().status != DetectionStatus::CameraUnavailable {
                if snapshots.changed().await.is_err() {
                    break;
                }
            }
            let stats = running.shutdown().await?;
            println!(
                "{frames} image(s): {} face(s), {} recognition(s), {} suppressed, {} unknown",
                stats.faces, stats.fired, stats.suppressed, stats.no_match
            );
        }
        Commands::Punches { employee, limit } => {
            let store = Store::open(&db_path).await?;
            let names: HashMap<IdentityId, String> = store
                .list_identities()
                .await?
                .into_iter()
                .map(|i| (i.id, i.display_name))
                .collect();
            let filter = employee.map(IdentityId::from);
            let punches = store.list_punches(filter.as_ref(), limit).await?;
            if punches.is_empty() {
                println!("No punches recorded");
            }
            for punch in punches {
                let name = names
                    .get(&punch.employee_id)
                    .map(String::as_str)
                    .unwrap_or("(removed)");
                println!(
                    "{}  {:<3}  {}  {}",
                    punch.at.format("%Y-%m-%d %H:%M:%S"),
                    punch.kind,
                    name,
                    punch.employee_id
                );
            }
        }
        Commands::Devices => {
            let devices = camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}  {} ({})", device.path, device.name, device.driver);
            }
        }
        Commands::Test { camera } => {
            let device = camera.unwrap_or_else(default_camera);
            let mut source = CameraSource::spawn(&device, 4)
                .with_context(|| format!("failed to open camera {device}"))?;
            match source.current_frame().await {
                Ok(frame) => println!(
                    "{device}: {}x{} frame #{}, average brightness {:.1}",
                    frame.width,
                    frame.height,
                    frame.sequence,
                    frame.avg_brightness()
                ),
                Err(FrameError::Dark) => println!("{device}: frame too dark"),
                Err(e) => bail!("{device}: {e}"),
            }
        }
    }

    Ok(())
}

/// Prints each debounced recognition during a replay.
struct ReplayPrinter;

impl RecognitionSink for ReplayPrinter {
    async fn on_identity_recognized(&self, identity: &Identity, distance: f32) -> Disposition {
        println!(
            "{} ({}) at distance {:.3}",
            identity.display_name, identity.id, distance
        );
        Disposition::Hold
    }
}

fn load_extractor(model_dir: &Path) -> Result<OnnxExtractor> {
    OnnxExtractor::load(model_dir).with_context(|| {
        format!(
            "failed to load face models from {} (expected {} and {})",
            model_dir.display(),
            timeclock_models::DETECTOR_MODEL,
            timeclock_models::RECOGNIZER_MODEL
        )
    })
}

/// Capture one face, retrying on frames without a usable face.
async fn capture_with_retries<S, E>(
    source: &mut S,
    extractor: &mut E,
    attempts: usize,
) -> Result<EnrollmentCapture>
where
    S: FrameSource,
    E: EmbeddingExtractor,
{
    for attempt in 1..=attempts {
        match capture_enrollment(source, extractor).await {
            Ok(capture) => return Ok(capture),
            Err(CaptureError::NoFace | CaptureError::Camera(FrameError::Dark))
                if attempt < attempts =>
            {
                tracing::debug!(attempt, "no usable face, retrying");
            }
            Err(CaptureError::NoFace) => bail!("no face found after {attempts} attempt(s)"),
            Err(e) => return Err(e.into()),
        }
    }
    bail!("no face found after {attempts} attempt(s)")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("timeclock")
}

fn default_db_path() -> PathBuf {
    std::env::var("TIMECLOCK_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("timeclock.db"))
}

fn default_model_dir() -> PathBuf {
    std::env::var("TIMECLOCK_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("models"))
}

fn default_camera() -> String {
    std::env::var("TIMECLOCK_CAMERA_DEVICE").unwrap_or_else(|_| "/dev/video0".to_string())
}
