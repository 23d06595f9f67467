//! Conductor CLI: run and steer agent-driven feature workflows.
//!
//! Every invocation opens the SQLite database, drives the engine in the
//! foreground, and exits once the workflow pauses or finishes.

use clap::{Parser, Subcommand};

use conductor_cli::commands::{self, follow::ClarifyMode, workflow::RunArgs, EngineOptions};

/// Conductor: multi-step AI workflow runner
#[derive(Parser)]
#[command(name = "conductor", version, about = "Conductor: multi-step AI workflow runner")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "CONDUCTOR_DB_PATH", default_value = "conductor.db")]
    db: String,

    /// Engine configuration file (YAML)
    #[arg(long, env = "CONDUCTOR_CONFIG")]
    config: Option<String>,

    /// Use a scripted agent instead of spawning `claude`
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a workflow and run it until it pauses or ends
    Run {
        /// Short feature name
        #[arg(long)]
        name: String,
        /// Feature request given to the agents
        request: String,
        /// Workflow type: planning or implementation
        #[arg(long = "type", default_value = "implementation")]
        workflow_type: String,
        /// Pause policy: continuous, auto_pause, or gates_only
        #[arg(long, default_value = "gates_only")]
        pause: String,
        /// Comma-separated step types overriding the template
        #[arg(long)]
        steps: Option<String>,
        /// Skip clarification questions instead of prompting
        #[arg(long)]
        skip_questions: bool,
    },

    /// List workflows
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Show a workflow and its steps
    Show {
        workflow_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Resume a paused workflow
    Resume {
        workflow_id: String,
        #[arg(long)]
        skip_questions: bool,
    },

    /// Cancel a workflow
    Cancel { workflow_id: String },

    /// Start a new workflow with the same request and plan
    Rerun {
        workflow_id: String,
        #[arg(long)]
        skip_questions: bool,
    },

    /// Fail steps left running by a crashed process and pause their workflows
    Recover,

    /// Manage individual steps
    Step {
        #[command(subcommand)]
        action: StepAction,
    },
}

#[derive(Subcommand)]
enum StepAction {
    /// Retry a failed step
    Retry {
        step_id: String,
        #[arg(long)]
        skip_questions: bool,
    },
    /// Skip a pending step
    Skip { step_id: String },
    /// Replace a completed step's output
    Edit {
        step_id: String,
        /// New output text
        #[arg(long)]
        text: Option<String>,
        /// Read the new output from a file
        #[arg(long)]
        file: Option<String>,
    },
    /// Show a step's activity log
    Activity {
        step_id: String,
        #[arg(long)]
        json: bool,
    },
}

fn clarify_mode(skip_questions: bool) -> ClarifyMode {
    if skip_questions {
        ClarifyMode::Skip
    } else {
        ClarifyMode::Interactive
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_core=warn,conductor_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    let options = EngineOptions {
        db_path: cli.db,
        config_path: cli.config,
        dry_run: cli.dry_run,
    };
    let controller = match commands::init_controller(&options) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match command {
        Commands::Run {
            name,
            request,
            workflow_type,
            pause,
            steps,
            skip_questions,
        } => commands::workflow::run(
            &controller,
            RunArgs {
                feature_name: name,
                feature_request: request,
                workflow_type,
                pause_behavior: pause,
                steps,
                mode: clarify_mode(skip_questions),
            },
        )
        .await
        .map(|_| ()),
        Commands::List { status, json } => {
            commands::workflow::list(&controller, status.as_deref(), json).await
        }
        Commands::Show { workflow_id, json } => {
            commands::workflow::show(&controller, &workflow_id, json).await
        }
        Commands::Resume {
            workflow_id,
            skip_questions,
        } => commands::workflow::resume(&controller, &workflow_id, clarify_mode(skip_questions))
            .await
            .map(|_| ()),
        Commands::Cancel { workflow_id } => commands::workflow::cancel(&controller, &workflow_id).await,
        Commands::Rerun {
            workflow_id,
            skip_questions,
        } => commands::workflow::rerun(&controller, &workflow_id, clarify_mode(skip_questions))
            .await
            .map(|_| ()),
        Commands::Recover => commands::workflow::recover(&controller).await,
        Commands::Step { action } => match action {
            StepAction::Retry {
                step_id,
                skip_questions,
            } => commands::step::retry(&controller, &step_id, clarify_mode(skip_questions))
                .await
                .map(|_| ()),
            StepAction::Skip { step_id } => commands::step::skip(&controller, &step_id).await,
            StepAction::Edit {
                step_id,
                text,
                file,
            } => commands::step::edit(&controller, &step_id, text, file).await,
            StepAction::Activity { step_id, json } => {
                commands::step::activity(&controller, &step_id, json).await
            }
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
