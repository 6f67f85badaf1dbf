//! labvm - simulated per-student lab environment with HTTP API.
//!
//! Usage:
//!   labvm serve [--port 8080]      # Start HTTP server
//!   labvm shell [--student alice]  # Interactive session on stdin

use clap::{Args as ClapArgs, Parser, Subcommand};
use labvm::config::LabConfig;
use labvm::error::LabError;
use labvm::http_server;
use labvm::sandbox::{SandboxConfig, DEFAULT_ROOT};
use labvm::session::{SessionController, SessionOptions};
use labvm::state::AppState;
use labvm::terminal::Verb;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "labvm")]
#[command(about = "Simulated student lab with a sandboxed shell and HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    lab: LabArgs,
}

#[derive(ClapArgs, Debug)]
struct LabArgs {
    /// Base URL of the exercise content service
    #[arg(long, global = true)]
    content_url: Option<String>,

    /// Local exercise catalog used when no content URL is given
    #[arg(long, global = true)]
    exercises_file: Option<PathBuf>,

    /// Directory for session snapshots (in memory when omitted)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Sandbox root inside the simulated file system
    #[arg(long, global = true, default_value = DEFAULT_ROOT)]
    root: String,

    /// Allowed command; repeat to build the allow-list (default: every verb)
    #[arg(long = "allow", global = true)]
    allowed: Vec<String>,

    /// Blocked path; repeat for several
    #[arg(long = "block", global = true, default_values = ["/etc", "/root"])]
    blocked: Vec<String>,

    /// Let sessions leave the sandbox root
    #[arg(long, global = true)]
    unsandboxed: bool,

    /// Autosave interval in seconds
    #[arg(long, global = true, default_value = "30")]
    autosave_secs: u64,

    /// Idle session lifetime in seconds
    #[arg(long, global = true, default_value = "300")]
    ttl_secs: u64,

    /// Timeout for content and store calls in milliseconds
    #[arg(long, global = true, default_value = "3000")]
    timeout_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Run one lab session interactively on stdin
    Shell {
        #[arg(long, default_value = "student")]
        student: String,

        #[arg(long, default_value = "")]
        course: String,

        /// Resume the stored snapshot of this session id
        #[arg(long)]
        session: Option<String>,
    },
}

impl LabArgs {
    fn into_config(self) -> Result<LabConfig, LabError> {
        let allowed: Vec<String> = if self.allowed.is_empty() {
            Verb::ALL.iter().map(|v| v.name().to_string()).collect()
        } else {
            self.allowed
        };
        Ok(LabConfig {
            sandbox: SandboxConfig::new(&self.root, allowed, self.blocked)?,
            sandboxed: !self.unsandboxed,
            autosave_interval: Duration::from_secs(self.autosave_secs),
            session_ttl: Duration::from_secs(self.ttl_secs),
            collaborator_timeout: Duration::from_millis(self.timeout_ms),
            content_url: self.content_url,
            exercises_file: self.exercises_file,
            store_dir: self.store_dir,
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let state = match args.lab.into_config().and_then(AppState::new) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    let result = match args.command {
        Commands::Serve { port } => http_server::run_server(port, state)
            .await
            .map_err(LabError::from),
        Commands::Shell {
            student,
            course,
            session,
        } => run_shell(state, student, course, session).await,
    };

    if let Err(e) = result {
        error!(error = %e, "labvm exited with an error");
        exit(1);
    }
}

async fn run_shell(
    state: AppState,
    student: String,
    course: String,
    session_id: Option<String>,
) -> Result<(), LabError> {
    let resume = session_id.is_some();
    let options = SessionOptions {
        session_id,
        student_id: student,
        course_id: course,
        sandboxed: state.config.sandboxed,
        ..SessionOptions::default()
    };
    let mut session = state.new_session(options)?;
    if resume {
        match session.load_state(None).await {
            Ok(()) | Err(LabError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    let shared = session.into_shared();
    SessionController::start_autosave(&shared, state.config.autosave_interval).await;
    let loader = shared.clone();
    tokio::spawn(async move {
        if let Err(e) = SessionController::load_exercises(&loader).await {
            warn!(error = %e, "Exercise load abandoned");
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let prompt = {
            let session = shared.lock().await;
            format!("{}$ ", session.terminal().current_directory())
        };
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, ending session");
                None
            }
        };
        let Some(line) = line else { break };
        let text = match line.trim() {
            "exit" | "logout" => break,
            ":save" => {
                let snapshot = SessionController::save_shared(&shared).await?;
                format!("saved {}", snapshot.session_id)
            }
            ":load" => match SessionController::load_shared(&shared, None).await {
                Ok(()) => "state restored".to_string(),
                Err(e) => e.to_string(),
            },
            _ => {
                let output = shared.lock().await.execute_command(&line)?;
                if output.clear_screen {
                    stdout.write_all(b"\x1b[2J\x1b[H").await?;
                }
                output.text
            }
        };
        if !text.is_empty() {
            stdout.write_all(text.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
    }

    let result = shared.lock().await.destroy().await;
    result
}
