use anyhow::{Context, Result};
use clap::Parser;
use scicam_core::{BusKind, CommandStatus, Config, StatusReport};
use std::io::IsTerminal;
use std::process::ExitCode;
use std::time::Duration;

mod command;
mod render;

use command::{Command, ParseOutcome};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Initialization reboots the camera, which takes longer than other commands.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "scicam", about = "Control a SciCam camera daemon")]
struct Cli {
    /// Camera config name under $CAMD_CONFIG_ROOT, or a path to a json file
    config: String,
    /// Command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[zbus::proxy(
    interface = "org.rockit.Camera1",
    default_path = "/org/rockit/Camera"
)]
trait Camera {
    async fn initialize(&self) -> zbus::Result<i32>;
    async fn shutdown(&self) -> zbus::Result<i32>;
    async fn set_temperature(&self, warm: bool, temperature: f64, quiet: bool) -> zbus::Result<i32>;
    async fn set_exposure(&self, exposure: f64, quiet: bool) -> zbus::Result<i32>;
    async fn start_sequence(&self, count: u32, quiet: bool) -> zbus::Result<i32>;
    async fn stop_sequence(&self, quiet: bool) -> zbus::Result<i32>;
    async fn report_status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = run(&cli).await?;
    // Negative codes wrap the same way a shell sees them
    Ok(ExitCode::from(code as u8))
}

async fn run(cli: &Cli) -> Result<i32> {
    let prefix = format!("scicam {}", cli.config);

    if cli.args.first().map(String::as_str) == Some("completion") {
        println!("{}", command::completion(&cli.args[1..]).join(" "));
        return Ok(0);
    }

    let command = match Command::parse(&prefix, &cli.args) {
        Ok(command) => command,
        Err(ParseOutcome::Usage) => {
            print!("{}", command::usage(&prefix));
            return Ok(0);
        }
        Err(ParseOutcome::Invalid(message)) => {
            println!("{message}");
            return Ok(-1);
        }
    };

    let path = scicam_core::config::resolve(&cli.config);
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    let code = tokio::select! {
        result = execute(&config, &command) => result,
        _ = tokio::signal::ctrl_c() => {
            // ctrl-c aborts whatever the camera is doing
            match stop(&config).await {
                Ok(0) => Ok(CommandStatus::TerminatedByUser.code()),
                other => other,
            }
        }
    };

    let code = code.unwrap_or_else(|e| {
        tracing::debug!(error = %e, "daemon call failed");
        CommandStatus::DaemonUnreachable.code()
    });

    if code != 0 && code != -1 {
        println!("{}", CommandStatus::message(code));
    }
    Ok(code)
}

async fn connect(config: &Config, timeout: Duration) -> zbus::Result<CameraProxy<'static>> {
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let connection = builder.method_timeout(timeout).build().await?;
    CameraProxy::builder(&connection)
        .destination(config.daemon.clone())?
        .build()
        .await
}

async fn stop(config: &Config) -> zbus::Result<i32> {
    connect(config, DEFAULT_TIMEOUT)
        .await?
        .stop_sequence(false)
        .await
}

async fn execute(config: &Config, command: &Command) -> zbus::Result<i32> {
    let timeout = match command {
        Command::Init => INIT_TIMEOUT,
        _ => DEFAULT_TIMEOUT,
    };
    let camera = connect(config, timeout).await?;

    match *command {
        Command::Status => {
            let json = camera.report_status().await?;
            let report = StatusReport::from_json(&json)
                .map_err(|e| zbus::Error::Failure(format!("invalid status report: {e}")))?;
            let style = render::Style {
                ansi: std::io::stdout().is_terminal(),
            };
            for line in render::status_lines(&report, style) {
                println!("{line}");
            }
            Ok(0)
        }
        Command::Exposure(seconds) => camera.set_exposure(seconds, false).await,
        Command::Temperature(Some(degrees)) => camera.set_temperature(false, degrees, false).await,
        Command::Temperature(None) => camera.set_temperature(true, 0.0, false).await,
        Command::Start(count) => camera.start_sequence(count, false).await,
        Command::Stop => camera.stop_sequence(false).await,
        Command::Init => camera.initialize().await,
        Command::Kill => camera.shutdown().await,
    }
}
