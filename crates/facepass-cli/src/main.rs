use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facepass_core::{IdentitySummary, StreamMode};
use facepass_hw::{Camera, CameraSource};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.facepass.Daemon1",
    default_service = "org.facepass.Daemon1",
    default_path = "/org/facepass/Daemon1"
)]
trait Daemon {
    async fn enroll(&self, name: &str, email: &str, paths: Vec<String>) -> zbus::Result<i64>;
    async fn enroll_from_camera(&self, name: &str, email: &str) -> zbus::Result<i64>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn get_identity(&self, id: i64) -> zbus::Result<String>;
    async fn remove_identity(&self, name: &str) -> zbus::Result<u32>;
    async fn start_stream(&self, mode: &str, output_path: &str) -> zbus::Result<String>;
    async fn stop_stream(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser, Debug)]
#[command(name = "facepass", about = "Facepass face identity and visit tracking CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enroll a new identity from sample images
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        email: String,
        /// Sample images (about 10 work well)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Enroll a new identity from the daemon's camera
    EnrollCamera {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        email: String,
    },
    /// List enrolled identities
    List {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one identity
    Show { id: i64 },
    /// Remove every identity with this name
    Remove { name: String },
    /// Control the annotated MJPEG stream
    Stream {
        #[command(subcommand)]
        action: StreamAction,
    },
    /// Show daemon status
    Status,
    /// List local V4L2 capture devices
    Devices,
    /// Capture one frame straight from a camera
    Snapshot {
        #[arg(short, long, default_value = "/dev/video2")]
        device: String,
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
        /// Frames to discard while exposure settles
        #[arg(long, default_value_t = 4)]
        warmup: usize,
    },
}

#[derive(Subcommand, Debug)]
enum StreamAction {
    /// Start streaming into a file
    Start {
        #[arg(short, long, default_value = "recognition")]
        mode: StreamMode,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Stop the running stream
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no V4L2 capture devices found");
            }
            for d in devices {
                println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::Snapshot {
            device,
            output,
            warmup,
        } => snapshot(&device, &output, warmup),
        command => run_remote(command, cli.system).await,
    }
}

async fn run_remote(command: Commands, system: bool) -> Result<()> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let daemon = DaemonProxy::new(&conn).await.context("is facepassd running?")?;

    match command {
        Commands::Enroll { name, email, images } => {
            let paths = images
                .iter()
                .map(|p| absolute(p))
                .collect::<Result<Vec<_>>>()?;
            let id = daemon.enroll(&name, &email, paths).await?;
            println!("enrolled {name} as #{id}");
        }
        Commands::EnrollCamera { name, email } => {
            println!("Look at the camera...");
            let id = daemon.enroll_from_camera(&name, &email).await?;
            println!("enrolled {name} as #{id}");
        }
        Commands::List { json } => {
            let raw = daemon.list_identities().await?;
            if json {
                println!("{raw}");
            } else {
                let identities: Vec<IdentitySummary> = serde_json::from_str(&raw)?;
                print!("{}", render_table(&identities));
            }
        }
        Commands::Show { id } => {
            let raw = daemon.get_identity(id).await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Remove { name } => {
            let removed = daemon.remove_identity(&name).await?;
            println!("removed {removed} identit{}", if removed == 1 { "y" } else { "ies" });
        }
        Commands::Stream { action } => match action {
            StreamAction::Start { mode, output } => {
                let output = absolute(&output)?;
                let id = daemon.start_stream(&mode.to_string(), &output).await?;
                println!("stream {id} writing to {output}");
            }
            StreamAction::Stop => {
                if daemon.stop_stream().await? {
                    println!("stream stopped");
                } else {
                    println!("no stream running");
                }
            }
        },
        Commands::Status => {
            let raw = daemon.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        local @ (Commands::Devices | Commands::Snapshot { .. }) => bail!("{local:?} runs locally"),
    }

    Ok(())
}

/// The daemon resolves paths against its own working directory.
fn absolute(path: &Path) -> Result<String> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    path.to_str()
        .map(str::to_string)
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn snapshot(device: &str, output: &Path, warmup: usize) -> Result<()> {
    let mut source = CameraSource::open(device, 640, 480, Duration::from_secs(2))
        .with_context(|| format!("opening {device}"))?;
    source.warm_up(warmup)?;
    let (frames, dark) = source.capture_frames(1)?;
    let Some(frame) = frames.into_iter().next() else {
        bail!("only dark frames captured ({dark}); is the lens covered?");
    };
    frame
        .save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("{}x{} frame saved to {}", frame.width(), frame.height(), output.display());
    Ok(())
}

fn render_table(identities: &[IdentitySummary]) -> String {
    if identities.is_empty() {
        return "no identities enrolled\n".to_string();
    }
    let name_width = identities.iter().map(|i| i.name.len()).max().unwrap_or(0).max(4);
    let mut out = format!("{:>5}  {:<name_width$}  {:>6}  {:>7}  LAST VISIT\n", "ID", "NAME", "VISITS", "REWARDS");
    for identity in identities {
        let last = identity
            .last_visit
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:>5}  {:<name_width$}  {:>6}  {:>7}  {last}\n",
            identity.id.0, identity.name, identity.visits, identity.rewards
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use facepass_core::IdentityId;

    #[test]
    fn test_parse_stream_start() {
        let cli = Cli::try_parse_from(["facepass", "stream", "start", "--mode", "enrollment", "-o", "/tmp/out.mjpeg"])
            .unwrap();
        match cli.command {
            Commands::Stream {
                action: StreamAction::Start { mode, output },
            } => {
                assert_eq!(mode, StreamMode::Enrollment);
                assert_eq!(output, PathBuf::from("/tmp/out.mjpeg"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_mode() {
        assert!(Cli::try_parse_from(["facepass", "stream", "start", "--mode", "party", "-o", "x"]).is_err());
    }

    #[test]
    fn test_enroll_needs_images() {
        assert!(Cli::try_parse_from(["facepass", "enroll", "--name", "ana"]).is_err());
        let cli = Cli::try_parse_from(["facepass", "--system", "enroll", "-n", "ana", "a.jpg", "b.jpg"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Enroll { images, .. } if images.len() == 2));
    }

    #[test]
    fn test_absolute_joins_cwd() {
        let abs = absolute(Path::new("frames/a.jpg")).unwrap();
        assert!(Path::new(&abs).is_absolute());
        assert!(abs.ends_with("frames/a.jpg"));
        assert_eq!(absolute(Path::new("/x/y.png")).unwrap(), "/x/y.png");
    }

    #[test]
    fn test_render_table() {
        assert_eq!(render_table(&[]), "no identities enrolled\n");
        let rows = vec![IdentitySummary {
            id: IdentityId(3),
            name: "Noor".into(),
            email: "noor@example.com".into(),
            visits: 2,
            rewards: 30,
            last_visit: None,
        }];
        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("REWARDS"));
        assert!(lines[1].contains("Noor") && lines[1].ends_with('-'));
    }
}
