mod config;
mod interactive;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use rollcall_core::database::{open_labeled_images, scan_enrollment_dir};
use rollcall_core::{
    DetectorProfile, EnrollmentDatabase, FaceDetector, FaceRecognizer, Roster, Session,
};
use rollcall_hw::Camera;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an enrollment database from a directory of labeled face images
    Enroll {
        /// Directory with one subdirectory of images per identity
        faces_dir: PathBuf,
        /// Roster CSV (identity_id, display_name)
        #[arg(short, long)]
        roster: PathBuf,
        /// Where to write the database
        #[arg(short, long, default_value = "enrollment.json")]
        output: PathBuf,
    },
    /// Mark attendance from still images and export the ledger
    Mark {
        #[command(flatten)]
        session: SessionArgs,
        /// Images to classify, one face each
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Interactive camera session
    Session {
        #[command(flatten)]
        session: SessionArgs,
        /// V4L2 device path (overrides ROLLCALL_CAMERA_DEVICE)
        #[arg(short, long)]
        camera: Option<String>,
    },
    /// Summarize an enrollment database as JSON
    Inspect {
        #[arg(short, long)]
        database: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(clap::Args)]
struct SessionArgs {
    /// Roster CSV (identity_id, display_name)
    #[arg(short, long)]
    roster: PathBuf,
    /// Treat the roster as a previous attendance export and keep its statuses
    #[arg(long)]
    resume: bool,
    /// Enrollment database produced by `enroll`
    #[arg(short, long)]
    database: PathBuf,
    /// Neighbors consulted per match
    #[arg(short)]
    k: Option<usize>,
    /// Maximum mean distance for a confident match
    #[arg(short, long)]
    threshold: Option<f32>,
    /// Directory for timestamped attendance files
    #[arg(long)]
    export_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct DatabaseSummary<'a> {
    path: String,
    records: usize,
    identities: usize,
    dimension: Option<usize>,
    model_version: Option<&'a str>,
    per_identity: BTreeMap<&'a str, usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Enroll {
            faces_dir,
            roster,
            output,
        } => enroll(&config, &faces_dir, &roster, &output),
        Commands::Mark { session, images } => mark(&config, &session, &images),
        Commands::Session { session, camera } => live(&config, &session, camera),
        Commands::Inspect { database } => inspect(&database),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(())
        }
    }
}

fn load_models(
    config: &Config,
    profile: DetectorProfile,
) -> Result<(FaceDetector, FaceRecognizer)> {
    let detector = FaceDetector::load(&config.scrfd_model_path(), profile)
        .context("loading face detector (set ROLLCALL_MODEL_DIR to the model directory)")?;
    let recognizer = FaceRecognizer::load(&config.arcface_model_path())
        .context("loading face recognizer (set ROLLCALL_MODEL_DIR to the model directory)")?;
    Ok((detector, recognizer))
}

fn load_roster(path: &Path, resume: bool) -> Result<Roster> {
    let roster = if resume {
        Roster::load_attendance(path)
    } else {
        Roster::load_csv(path)
    }
    .with_context(|| format!("reading roster {}", path.display()))?;
    if roster.is_empty() {
        bail!("roster {} has no identities", path.display());
    }
    Ok(roster)
}

fn open_session(config: &Config, args: &SessionArgs) -> Result<Session> {
    let roster = load_roster(&args.roster, args.resume)?;
    let database = EnrollmentDatabase::load_json(&args.database)
        .with_context(|| format!("reading enrollment database {}", args.database.display()))?;
    let params = config.match_params(args.k, args.threshold)?;
    let session = Session::new(database, roster, params)?;
    tracing::info!(
        records = session.database().len(),
        identities = session.roster().len(),
        k = session.params().k,
        threshold = session.params().threshold,
        "session ready"
    );
    Ok(session)
}

fn enroll(config: &Config, faces_dir: &Path, roster: &Path, output: &Path) -> Result<()> {
    let roster = load_roster(roster, false)?;
    let labeled = scan_enrollment_dir(faces_dir, &roster)
        .with_context(|| format!("scanning {}", faces_dir.display()))?;
    if labeled.is_empty() {
        bail!("no enrollment images under {} match the roster", faces_dir.display());
    }

    let (mut detector, mut recognizer) = load_models(config, DetectorProfile::Accurate)?;
    let (database, stats) =
        EnrollmentDatabase::build(open_labeled_images(labeled), &mut detector, &mut recognizer)
            .context("building enrollment database")?;

    database
        .save_json(output)
        .with_context(|| format!("writing {}", output.display()))?;

    let per_identity = database.identity_counts();
    println!(
        "Enrolled {} faces for {} identities from {} images ({} without a face, {} failed) -> {}",
        stats.records,
        per_identity.len(),
        stats.images_seen,
        stats.skipped_no_face,
        stats.skipped_failed,
        output.display()
    );
    for entry in roster.entries() {
        if !per_identity.contains_key(entry.identity_id.as_str()) {
            println!(
                "  warning: no enrolled faces for {} ({})",
                entry.identity_id, entry.display_name
            );
        }
    }
    Ok(())
}

fn mark(config: &Config, args: &SessionArgs, images: &[PathBuf]) -> Result<()> {
    let mut session = open_session(config, args)?;
    let (mut detector, mut recognizer) = load_models(config, DetectorProfile::Fast)?;

    // Attendance marked before a fatal error is still exported.
    let result = images.iter().try_for_each(|path| {
        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read image; skipping");
                return Ok(());
            }
        };
        print!("{}: ", path.display());
        interactive::report(&mut session, &image, &mut detector, &mut recognizer).map(|_| ())
    });

    let export_dir = args.export_dir.clone().unwrap_or_else(|| config.export_dir.clone());
    interactive::export(&session, &export_dir)?;
    result
}

fn live(config: &Config, args: &SessionArgs, camera: Option<String>) -> Result<()> {
    let mut session = open_session(config, args)?;
    let (mut detector, mut recognizer) = load_models(config, DetectorProfile::Fast)?;

    let device = camera.unwrap_or_else(|| config.camera_device.clone());
    let mut camera = Camera::open(&device).with_context(|| format!("opening camera {device}"))?;
    camera.warm_up(config.warmup_frames);

    let export_dir = args.export_dir.clone().unwrap_or_else(|| config.export_dir.clone());
    let stdin = std::io::stdin();
    interactive::run(
        &mut session,
        &mut camera,
        &mut detector,
        &mut recognizer,
        &export_dir,
        stdin.lock(),
    )
}

fn inspect(path: &Path) -> Result<()> {
    let database = EnrollmentDatabase::load_json(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let per_identity = database.identity_counts();
    let summary = DatabaseSummary {
        path: path.display().to_string(),
        records: database.len(),
        identities: per_identity.len(),
        dimension: database.dimension(),
        model_version: database.model_version(),
        per_identity,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
