use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use studylamp_core::loader::ULTRAFACE_MODEL_FILE;
use studylamp_core::{DetectionModel, FaceDetector};
use studylamp_hw::{Camera, CaptureConstraints, CaptureDevice, V4l2Device, VideoTrack};
use tokio_stream::StreamExt;

#[derive(Parser)]
#[command(name = "studylamp", about = "Studylamp study assistant CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Pause presence detection
    Pause,
    /// Resume presence detection
    Resume,
    /// Reload the model if needed and reopen the camera
    Restart,
    /// Keep detecting presence while paused
    Override {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Ask the study assistant something
    Chat {
        /// Message text
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Print the conversation so far
    History,
    /// Store the API token used for chat
    Login {
        token: String,
    },
    /// Forget the API token
    Logout,
    /// Check backend health now
    Health,
    /// Print presence changes as they happen
    Watch,
    /// Run camera diagnostics
    Test {
        /// Device node (default: first user-facing camera)
        #[arg(short, long)]
        device: Option<String>,
        /// Save the captured frame as an image
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also run face detection on the frame
        #[arg(long)]
        detect: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

// `#[zbus::proxy]` generates `StudylampProxy`, including a
// `receive_presence_changed` stream for the signal.
#[zbus::proxy(
    interface = "io.studylamp.Studylamp1",
    default_service = "io.studylamp.Studylamp1",
    default_path = "/io/studylamp/Studylamp1"
)]
trait Studylamp {
    async fn status(&self) -> zbus::Result<String>;
    async fn pause(&self) -> zbus::Result<()>;
    async fn resume(&self) -> zbus::Result<()>;
    async fn set_auto_pause_override(&self, enabled: bool) -> zbus::Result<()>;
    async fn restart_camera(&self) -> zbus::Result<()>;
    async fn chat(&self, message: &str) -> zbus::Result<String>;
    async fn history(&self) -> zbus::Result<String>;
    async fn set_credential(&self, token: &str) -> zbus::Result<()>;
    async fn check_health(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn presence_changed(&self, present: bool) -> zbus::Result<()>;
}

async fn connect() -> Result<StudylampProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    StudylampProxy::new(&connection)
        .await
        .context("studylampd is not running")
}

fn print_json(text: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => print_json(&connect().await?.status().await?)?,
        Commands::Pause => {
            connect().await?.pause().await?;
            println!("Presence detection paused");
        }
        Commands::Resume => {
            connect().await?.resume().await?;
            println!("Presence detection resumed");
        }
        Commands::Restart => {
            connect().await?.restart_camera().await?;
            println!("Camera restart requested; see `studylamp status`");
        }
        Commands::Override { state } => {
            let enabled = matches!(state, Toggle::On);
            connect().await?.set_auto_pause_override(enabled).await?;
            println!("Auto-pause override {}", if enabled { "on" } else { "off" });
        }
        Commands::Chat { message } => {
            let reply = connect().await?.chat(&message.join(" ")).await?;
            println!("{reply}");
        }
        Commands::History => {
            let text = connect().await?.history().await?;
            let thread: serde_json::Value = serde_json::from_str(&text)?;
            let messages = thread["messages"].as_array().cloned().unwrap_or_default();
            if messages.is_empty() {
                println!("No messages yet");
            }
            for m in messages {
                let role = m["role"].as_str().unwrap_or("?");
                let body = m["text"].as_str().unwrap_or("");
                println!("{role:>9}: {body}");
            }
        }
        Commands::Login { token } => {
            if token.trim().is_empty() {
                bail!("token must not be empty");
            }
            connect().await?.set_credential(&token).await?;
            println!("Signed in");
        }
        Commands::Logout => {
            connect().await?.set_credential("").await?;
            println!("Signed out");
        }
        Commands::Health => print_json(&connect().await?.check_health().await?)?,
        Commands::Watch => {
            let proxy = connect().await?;
            let mut changes = proxy.receive_presence_changed().await?;
            println!("Watching presence (Ctrl-C to stop)");
            while let Some(signal) = changes.next().await {
                let args = signal.args()?;
                let stamp = chrono::Local::now().format("%H:%M:%S");
                println!("{stamp} {}", if args.present { "present" } else { "away" });
            }
        }
        Commands::Test {
            device,
            output,
            detect,
        } => camera_test(device, output, detect).await?,
    }

    Ok(())
}

/// Talk to the camera directly, bypassing the daemon.
async fn camera_test(device: Option<String>, output: Option<PathBuf>, detect: bool) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        bail!("no V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let constraints = CaptureConstraints {
        device,
        ..CaptureConstraints::default()
    };
    let frame = tokio::task::spawn_blocking(move || {
        let mut track = V4l2Device::new(2).acquire(&constraints)?;
        println!("Opened {}", track.label());
        track.read_frame()
    })
    .await??;

    println!(
        "Captured {}x{} frame: brightness {:.1}, {}",
        frame.width,
        frame.height,
        frame.avg_brightness(),
        if frame.is_dark { "dark" } else { "ok" }
    );

    if let Some(path) = output {
        image::save_buffer(
            &path,
            &frame.data,
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved frame to {}", path.display());
    }

    if detect {
        let model_path = studylamp_core::default_model_dir().join(ULTRAFACE_MODEL_FILE);
        let detector = tokio::task::spawn_blocking(move || FaceDetector::load(&model_path)).await??;
        let detection = detector.infer(&frame.data, frame.width, frame.height)?;
        println!(
            "Face {} (confidence {:.2}, counts as {:?})",
            if detection.present { "found" } else { "not found" },
            detection.confidence,
            detection.classify()
        );
    }

    Ok(())
}
