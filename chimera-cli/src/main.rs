use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tabled::{Table, Tabled};

use chimera_agent::agent::{ImageStatus, ReloadReport, ValidationReport};
use chimera_agent::client::ControlClient;
use chimera_agent::model::Profile;
use chimera_agent::protocol::{Command, ListKind, ProtocolError, Response, StatusCode};
use chimera_agent::providers::ExecOutput;
use chimera_agent::reconciler::ActionReport;
use chimera_agent::reconciler::plan::Action;
use chimera_agent::server::AgentStatus;
use chimera_agent::store::ContainerView;

/// Exit code when the agent cannot be reached or answers garbage.
const CONNECTION_FAILURE: i32 = 6;

#[derive(Parser)]
#[command(name = "chimera")]
#[command(about = "CLI for the chimera container agent", long_about = None)]
struct Cli {
    /// Agent control socket
    #[arg(short, long, default_value = "/run/chimera/agent.sock")]
    socket: PathBuf,

    /// Print the raw JSON response
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List images, containers or profiles
    List {
        #[arg(value_enum)]
        kind: Kind,
    },

    /// Show agent status, or one container
    Status {
        /// Container name
        name: Option<String>,
    },

    /// Create and start a declared container
    Spawn { name: String },

    /// Start a container
    Start { name: String },

    /// Stop a container
    Stop { name: String },

    /// Restart a container, even if it is running
    Restart { name: String },

    /// Stop and delete a container
    Remove { name: String },

    /// Run a command inside a running container
    Exec {
        name: String,

        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Open a shell in a running container
    Shell { name: String },

    /// Image operations
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },

    /// Desired-state operations
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Profile operations
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// Pull a declared image
    Pull { name: String },
    /// List declared images
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Check the desired state without applying it
    Validate,
    /// Load the desired state and reconcile
    Reload,
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// List profiles
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Images,
    Containers,
    Profiles,
}

impl Commands {
    fn into_command(self) -> Command {
        match self {
            Commands::List { kind } => Command::List {
                kind: match kind {
                    Kind::Images => ListKind::Images,
                    Kind::Containers => ListKind::Containers,
                    Kind::Profiles => ListKind::Profiles,
                },
            },
            Commands::Status { name } => Command::Status { name },
            Commands::Spawn { name } => Command::Spawn { name },
            Commands::Start { name } => Command::Start { name },
            Commands::Stop { name } => Command::Stop { name },
            Commands::Restart { name } => Command::Restart { name },
            Commands::Remove { name } => Command::Remove { name },
            Commands::Exec { name, argv } => Command::Exec { name, argv },
            Commands::Shell { name } => Command::Shell { name },
            Commands::Image {
                command: ImageCommands::Pull { name },
            } => Command::ImagePull { name },
            Commands::Image {
                command: ImageCommands::List,
            } => Command::ImageList,
            Commands::Config {
                command: ConfigCommands::Validate,
            } => Command::ConfigValidate,
            Commands::Config {
                command: ConfigCommands::Reload,
            } => Command::ConfigReload,
            Commands::Profile {
                command: ProfileCommands::List,
            } => Command::ProfileList,
        }
    }
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DESIRED")]
    desired: String,
    #[tabled(rename = "OBSERVED")]
    observed: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "PROFILE")]
    profile: String,
    #[tabled(rename = "MANAGED")]
    managed: String,
    #[tabled(rename = "DRIFT")]
    drift: String,
}

impl From<&ContainerView> for ContainerRow {
    fn from(view: &ContainerView) -> Self {
        let desired = match &view.desired {
            Some(spec) => format!("{}/{}", label(&spec.ensure), spec.state),
            None => "-".to_string(),
        };
        let observed = match &view.observed {
            Some(o) => o.active.to_string(),
            None => "absent".to_string(),
        };
        let drift = match &view.drift {
            Some(d) if d.permanent => format!("{} (failed)", d.reason),
            Some(d) => d.reason.to_string(),
            None => "-".to_string(),
        };
        Self {
            name: view.name.clone(),
            desired,
            observed,
            image: view
                .desired
                .as_ref()
                .map_or_else(|| "-".to_string(), |s| s.image.clone()),
            profile: view
                .desired
                .as_ref()
                .map_or_else(|| "-".to_string(), |s| s.profile.clone()),
            managed: if view.managed { "yes" } else { "no" }.to_string(),
            drift,
        }
    }
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "VERIFY")]
    verify: String,
    #[tabled(rename = "PRESENCE")]
    presence: String,
    #[tabled(rename = "SOURCE")]
    source: String,
}

impl From<&ImageStatus> for ImageRow {
    fn from(image: &ImageStatus) -> Self {
        Self {
            name: image.name.clone(),
            kind: label(&image.kind),
            verify: label(&image.verify),
            presence: label(&image.presence),
            source: image.source.clone(),
        }
    }
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "ACTION")]
    kind: String,
    #[tabled(rename = "CONTAINER")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "ATTEMPTS")]
    attempts: u32,
    #[tabled(rename = "ERROR")]
    error: String,
}

impl From<&Action> for ActionRow {
    fn from(action: &Action) -> Self {
        Self {
            kind: action.kind.to_string(),
            name: action.name.clone(),
            status: label(&action.status),
            attempts: action.attempts,
            error: action
                .error
                .as_ref()
                .map_or_else(|| "-".to_string(), |e| e.message.clone()),
        }
    }
}

/// Wire name of a serde enum value.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "?".to_string(),
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(
        || "never".to_string(),
        |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

fn payload<T: DeserializeOwned>(response: &Response) -> Result<T, ProtocolError> {
    response.payload_as()?.ok_or_else(|| {
        ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "response carries no payload",
        ))
    })
}

fn print_containers(views: &[ContainerView]) {
    if views.is_empty() {
        println!("No containers found");
    } else {
        let rows: Vec<ContainerRow> = views.iter().map(ContainerRow::from).collect();
        println!("{}", Table::new(rows));
    }
}

fn print_actions(actions: &[Action]) {
    if !actions.is_empty() {
        let rows: Vec<ActionRow> = actions.iter().map(ActionRow::from).collect();
        println!("{}", Table::new(rows));
    }
}

fn print_report(report: &ActionReport) {
    print_actions(&report.actions);
    let state = report
        .observed
        .as_ref()
        .map_or_else(|| "absent".to_string(), |o| o.active.to_string());
    println!("{}: {}", report.name, state);
    if let Some(drift) = &report.drift {
        println!("Drift:   {} ({})", drift.reason, drift.detail);
    }
}

fn print_view(view: &ContainerView) {
    println!("Name:      {}", view.name);
    match &view.desired {
        Some(spec) => {
            println!("Desired:   {}/{}", label(&spec.ensure), spec.state);
            println!("Image:     {}", spec.image);
            println!("Profile:   {}", spec.profile);
            println!("Autostart: {}", spec.autostart);
        }
        None => println!("Desired:   -"),
    }
    match &view.observed {
        Some(o) => println!(
            "Observed:  {} (at {})",
            o.active,
            format_time(Some(o.observed_at))
        ),
        None => println!("Observed:  absent"),
    }
    println!("Managed:   {}", view.managed);
    if let Some(drift) = &view.drift {
        println!(
            "Drift:     {} since {} ({} attempts{})",
            drift.reason,
            format_time(Some(drift.detected_at)),
            drift.attempts,
            if drift.permanent { ", failed" } else { "" }
        );
        println!("           {}", drift.detail);
    }
}

/// Print a successful response; returns the process exit code.
async fn render(command: &Command, response: &Response) -> Result<i32, ProtocolError> {
    match command {
        Command::Status { name: None } => {
            let status: AgentStatus = payload(response)?;
            println!("Node:            {}", status.node);
            println!("Generation:      {}", status.generation);
            println!("Last pass:       {}", format_time(status.last_pass));
            println!("Last collection: {}", format_time(status.last_collection));
            println!();
            print_containers(&status.containers);
        }
        Command::Status { name: Some(_) } => print_view(&payload(response)?),
        Command::List {
            kind: ListKind::Containers,
        } => print_containers(&payload::<Vec<ContainerView>>(response)?),
        Command::List {
            kind: ListKind::Images,
        }
        | Command::ImageList => {
            let images: Vec<ImageStatus> = payload(response)?;
            if images.is_empty() {
                println!("No images declared");
            } else {
                let rows: Vec<ImageRow> = images.iter().map(ImageRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
        Command::List {
            kind: ListKind::Profiles,
        }
        | Command::ProfileList => {
            let profiles: Vec<Profile> = payload(response)?;
            if profiles.is_empty() {
                println!("No profiles declared");
            } else {
                let rows: Vec<ProfileRow> = profiles
                    .into_iter()
                    .map(|p| ProfileRow {
                        name: p.name,
                        description: p.description.unwrap_or_else(|| "-".to_string()),
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
        }
        Command::Spawn { .. }
        | Command::Start { .. }
        | Command::Stop { .. }
        | Command::Restart { .. }
        | Command::Remove { .. } => print_report(&payload(response)?),
        Command::Exec { .. } => {
            let output: ExecOutput = payload(response)?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            return Ok(output.exit_code);
        }
        Command::Shell { .. } => {
            let value: serde_json::Value = payload(response)?;
            let argv: Vec<String> = serde_json::from_value(value["argv"].clone())?;
            return run_shell(&argv).await;
        }
        Command::ImagePull { .. } => {
            let image: ImageStatus = payload(response)?;
            println!("Image {}: {}", image.name, label(&image.presence));
        }
        Command::ConfigValidate => {
            let report: ValidationReport = payload(response)?;
            println!(
                "Node {}: {} containers, {} images, {} profiles, {} cloud-init documents",
                report.node, report.containers, report.images, report.profiles, report.cloud_init
            );
            for (name, problem) in &report.problems {
                println!("  {}: {}", name, problem);
            }
            if !report.is_valid() {
                return Ok(StatusCode::UpstreamFailure.exit_code());
            }
            println!("Configuration is valid");
        }
        Command::ConfigReload => {
            let report: ReloadReport = payload(response)?;
            println!(
                "Applied generation {} ({} containers)",
                report.generation, report.containers
            );
            print_actions(&report.actions);
        }
    }
    Ok(0)
}

/// Hand the terminal to the argv the agent returned.
async fn run_shell(argv: &[String]) -> Result<i32, ProtocolError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(StatusCode::Internal.exit_code());
    };
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await?;
    Ok(status.code().unwrap_or(1))
}

async fn run(cli: Cli) -> Result<i32, ProtocolError> {
    let command = cli.command.into_command();
    let mut client = ControlClient::connect(&cli.socket).await.map_err(|e| {
        ProtocolError::Io(std::io::Error::other(format!(
            "cannot connect to chimera agent at {}: {}",
            cli.socket.display(),
            e
        )))
    })?;
    let response = client.call(command.clone()).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(response.status.exit_code());
    }
    if !response.status.is_success() {
        if let Ok(report) = payload::<ActionReport>(&response) {
            print_report(&report);
        }
        eprintln!(
            "Error ({}): {}",
            label(&response.status),
            response.error.as_deref().unwrap_or("request failed")
        );
        return Ok(response.status.exit_code());
    }
    render(&command, &response).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            CONNECTION_FAILURE
        }
    };
    std::process::exit(code);
}
