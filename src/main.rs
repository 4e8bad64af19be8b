use ad_sdlc::agent::{AgentInvoker, CliAgentInvoker};
use ad_sdlc::config::{AgentsConfig, WorkflowConfig};
use ad_sdlc::errors::PipelineError;
use ad_sdlc::init::{config_root, init_project, is_initialized};
use ad_sdlc::model::{PipelineMode, Project};
use ad_sdlc::pipeline::{
    ApprovalDecision, ApprovalGate, Detection, Orchestrator, RequestSource, ResumeMode, Session,
    SessionStatus, StartRequest, detect_mode, stages_for,
};
use ad_sdlc::pool::{AgentWorkerBackend, ControllerState, GhReviewBackend};
use ad_sdlc::scratchpad::{Scratchpad, Section};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "ad-sdlc")]
#[command(version, about = "Agent-driven SDLC pipeline orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the .ad-sdlc project structure
    Init {
        /// Project name (defaults to the directory name)
        name: Option<String>,
    },
    /// Start a new pipeline session
    Start {
        /// Read the request from a file
        #[arg(long, conflicts_with_all = ["url", "text"])]
        file: Option<PathBuf>,
        /// Fetch the request from a URL
        #[arg(long, conflicts_with = "text")]
        url: Option<String>,
        /// Inline request text
        #[arg(long)]
        text: Option<String>,
        /// Bypass human approval gates
        #[arg(long)]
        skip_approval: bool,
    },
    /// Resume a paused or interrupted session
    Resume {
        session_id: String,
        /// Treat every stage before this one as pre-completed
        #[arg(long)]
        start_from: Option<String>,
    },
    /// Show session and worker pool state
    Status {
        project_id: Option<String>,
    },
    /// Print recent log output
    Logs {
        /// Filter to one agent/correlation id
        #[arg(long)]
        agent: Option<String>,
        /// Minimum level (error, warn, info, debug, trace)
        #[arg(long)]
        level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let log_dir = config_root(&project_dir).join("logs");
    let _log_guard =
        ad_sdlc::logging::init(log_dir.exists().then_some(log_dir.as_path()), cli.verbose);

    match run(cli, project_dir).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<PipelineError>()
                .map(|e| e.exit_code())
                .unwrap_or(3);
            std::process::ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli, project_dir: PathBuf) -> Result<std::process::ExitCode> {
    match cli.command {
        Commands::Init { name } => {
            cmd_init(&project_dir, name.as_deref())?;
            Ok(std::process::ExitCode::SUCCESS)
        }
        Commands::Start {
            file,
            url,
            text,
            skip_approval,
        } => {
            let source = match (file, url, text) {
                (Some(path), _, _) => RequestSource::File(path),
                (_, Some(url), _) => RequestSource::Url(url),
                (_, _, Some(text)) => RequestSource::Text(text),
                _ => {
                    return Err(PipelineError::BadRequest(
                        "start needs one of --file, --url, or --text".into(),
                    )
                    .into());
                }
            };
            let request = StartRequest {
                source,
                resume: ResumeMode::Fresh,
                skip_approval,
                pre_completed: BTreeSet::new(),
            };
            cmd_run_pipeline(&project_dir, request, None).await
        }
        Commands::Resume {
            session_id,
            start_from,
        } => cmd_resume(&project_dir, &session_id, start_from.as_deref()).await,
        Commands::Status { project_id } => {
            cmd_status(&project_dir, project_id.as_deref())?;
            Ok(std::process::ExitCode::SUCCESS)
        }
        Commands::Logs { agent, level } => {
            cmd_logs(&project_dir, agent.as_deref(), level.as_deref())?;
            Ok(std::process::ExitCode::SUCCESS)
        }
    }
}

fn cmd_init(project_dir: &PathBuf, name: Option<&str>) -> Result<()> {
    // Detect before scaffolding: the scaffold itself writes the config
    // the detector keys on.
    let detection = detect_mode(project_dir, false);
    let result = init_project(project_dir)?;
    let pad = Scratchpad::new(result.root.clone());

    if find_projects(&pad)?.is_empty() {
        let project_name = name
            .map(str::to_string)
            .or_else(|| {
                project_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "project".to_string());
        let mode = match detection {
            Detection::Mode(mode) => mode,
            Detection::Ambiguous => prompt_mode()?,
        };
        let project = Project::new(&project_name, mode);
        pad.set(&Section::Project, &project.id, &project)
            .map_err(PipelineError::from)?;
        println!("Initialized project {} ({}, mode: {})", project_name, project.id, mode);
    } else if result.created {
        println!("Initialized {}", result.root.display());
    } else {
        println!("Already initialized: {}", result.root.display());
    }
    Ok(())
}

async fn cmd_run_pipeline(
    project_dir: &PathBuf,
    request: StartRequest,
    project_id: Option<&str>,
) -> Result<std::process::ExitCode> {
    if !is_initialized(project_dir) {
        return Err(PipelineError::BadRequest(
            "project not initialized; run `ad-sdlc init` first".into(),
        )
        .into());
    }
    require_credentials()?;

    let root = config_root(project_dir);
    let workflow = WorkflowConfig::load(&root.join("config/workflow.yaml"))?.apply_env();
    let agents = AgentsConfig::load(&root.join("config/agents.yaml"))?;
    let pad = Scratchpad::new(root.clone()).with_history_limit(workflow.history_limit);

    let mut project = match project_id {
        Some(id) => load_project(&pad, id)?,
        None => {
            let mut projects = find_projects(&pad)?;
            projects.sort_by_key(|p| p.updated_at);
            projects
                .pop()
                .ok_or_else(|| PipelineError::BadRequest("no project found; run `ad-sdlc init`".into()))?
        }
    };

    let invoker: Arc<dyn AgentInvoker> = Arc::new(CliAgentInvoker::new(
        &workflow.agent_cli,
        project_dir.clone(),
        agents.roles.clone(),
    ));
    let worker_backend = Arc::new(AgentWorkerBackend::new(
        invoker.clone(),
        project_dir.clone(),
        workflow.verify.clone(),
    ));
    let review_backend = Arc::new(GhReviewBackend::new(project_dir.clone()));

    let skip_approval = request.skip_approval || workflow.skip_approval;
    let mut orchestrator = Orchestrator::new(
        project_dir.clone(),
        pad,
        workflow,
        invoker,
        worker_backend,
    )
    .with_review_backend(review_backend);
    if !skip_approval {
        orchestrator = orchestrator.with_approvals(Arc::new(InteractiveApprovals));
    }

    // Ctrl-C pauses at the next stage boundary; in-flight work finishes.
    let pause = orchestrator.pause_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("pause requested; finishing the current stage");
            pause.store(true, Ordering::SeqCst);
        }
    });

    match orchestrator.run(&mut project, &request).await {
        Ok(session) => {
            print_session(&session);
            match session.status {
                SessionStatus::Completed => Ok(std::process::ExitCode::SUCCESS),
                _ => Ok(std::process::ExitCode::from(2)),
            }
        }
        Err(err) => {
            eprintln!("pipeline failed: {err}");
            Ok(std::process::ExitCode::from(err.exit_code() as u8))
        }
    }
}

async fn cmd_resume(
    project_dir: &PathBuf,
    session_id: &str,
    start_from: Option<&str>,
) -> Result<std::process::ExitCode> {
    let root = config_root(project_dir);
    let pad = Scratchpad::new(root);
    let session: Session = pad
        .get::<Session>(&Section::Session(session_id.to_string()), "")
        .map_err(PipelineError::from)?
        .map(|s| s.value)
        .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;

    let mut pre_completed = BTreeSet::new();
    if let Some(stage_name) = start_from {
        let stages = stages_for(session.mode);
        let position = stages
            .iter()
            .position(|s| s.name == stage_name)
            .ok_or_else(|| PipelineError::UnknownStage(stage_name.to_string()))?;
        pre_completed = stages[..position]
            .iter()
            .map(|s| s.name.to_string())
            .collect();
    }

    let request = StartRequest {
        source: RequestSource::Text(String::new()),
        resume: ResumeMode::Resume(session_id.to_string()),
        skip_approval: false,
        pre_completed,
    };
    let project_id = session.project_id.clone();
    cmd_run_pipeline(project_dir, request, Some(&project_id)).await
}

fn cmd_status(project_dir: &PathBuf, project_id: Option<&str>) -> Result<()> {
    let root = config_root(project_dir);
    if !root.exists() {
        println!("Not initialized.");
        return Ok(());
    }
    let pad = Scratchpad::new(root);
    let projects = match project_id {
        Some(id) => vec![load_project(&pad, id)?],
        None => find_projects(&pad)?,
    };
    if projects.is_empty() {
        println!("No projects.");
        return Ok(());
    }

    for project in projects {
        println!(
            "{} ({})  mode: {}  state: {}",
            project.name, project.id, project.mode, project.state
        );
        if let Ok(Some(state)) = pad.get::<ControllerState>(&Section::ControllerState, &project.id)
        {
            let state = state.value;
            println!(
                "  workers: {} slots, counts: {:?}",
                state.capacity, state.counts
            );
            for worker in &state.workers {
                println!(
                    "    {}  {:?}  current: {}  done: {}  success rate: {:.0}%",
                    worker.id,
                    worker.status,
                    worker.current_issue.as_deref().unwrap_or("-"),
                    worker.tasks_completed,
                    worker.success_rate() * 100.0
                );
            }
            for bottleneck in &state.bottlenecks {
                println!("  bottleneck: {bottleneck}");
            }
        }
        for session in find_sessions(&pad, &project.id)? {
            println!(
                "  session {}  {:?}  stages: {}",
                session.id,
                session.status,
                session.stages.len()
            );
        }
    }
    Ok(())
}

fn cmd_logs(project_dir: &PathBuf, agent: Option<&str>, level: Option<&str>) -> Result<()> {
    let logs_dir = config_root(project_dir).join("logs");
    if !logs_dir.exists() {
        println!("No logs.");
        return Ok(());
    }
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&logs_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let level_filter = level.map(str::to_ascii_uppercase);
    for file in files {
        let content = std::fs::read_to_string(&file)?;
        for line in content.lines() {
            if let Some(level) = &level_filter
                && !line.contains(level.as_str())
            {
                continue;
            }
            if let Some(agent) = agent
                && !line.contains(agent)
            {
                continue;
            }
            println!("{line}");
        }
    }
    Ok(())
}

/// Interactive gate prompt, in the style of the rest of the CLI.
struct InteractiveApprovals;

impl ApprovalGate for InteractiveApprovals {
    fn review(&self, stage: &str, output: &str) -> ApprovalDecision {
        use dialoguer::{Input, Select, theme::ColorfulTheme};

        println!();
        println!(
            "{} {}",
            console::style("Approval gate:").bold(),
            console::style(stage).cyan()
        );
        let preview: String = output.chars().take(800).collect();
        println!("{}", console::style(preview).dim());

        let theme = ColorfulTheme::default();
        let choice = Select::with_theme(&theme)
            .with_prompt("Approve this stage?")
            .items(&["Approve", "Reject"])
            .default(0)
            .interact();

        match choice {
            Ok(0) => ApprovalDecision::Approved {
                by: whoami(),
            },
            Ok(_) => {
                let reason: String = Input::with_theme(&theme)
                    .with_prompt("Rejection reason")
                    .allow_empty(true)
                    .interact_text()
                    .unwrap_or_default();
                ApprovalDecision::Rejected {
                    by: whoami(),
                    reason,
                }
            }
            Err(_) => {
                // Non-interactive terminal: approve and note it.
                eprintln!("no terminal for approval prompt; auto-approving {stage}");
                ApprovalDecision::Approved {
                    by: "auto".to_string(),
                }
            }
        }
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

fn prompt_mode() -> Result<PipelineMode> {
    use dialoguer::{Select, theme::ColorfulTheme};
    let modes = [
        PipelineMode::Enhancement,
        PipelineMode::Import,
        PipelineMode::Greenfield,
    ];
    let labels = ["enhancement", "import", "greenfield"];
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Pipeline mode is ambiguous; pick one")
        .items(&labels)
        .default(0)
        .interact()
        .unwrap_or(0);
    Ok(modes[choice])
}

fn require_credentials() -> Result<()> {
    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        return Err(PipelineError::MissingCredential("ANTHROPIC_API_KEY").into());
    }
    if std::env::var("GITHUB_TOKEN").is_err() {
        return Err(PipelineError::MissingCredential("GITHUB_TOKEN").into());
    }
    Ok(())
}

fn find_projects(pad: &Scratchpad) -> Result<Vec<Project>> {
    let info_dir = pad.root().join("scratchpad/info");
    let mut projects = Vec::new();
    if !info_dir.exists() {
        return Ok(projects);
    }
    for entry in std::fs::read_dir(&info_dir)? {
        let entry = entry?;
        let project_id = entry.file_name().to_string_lossy().into_owned();
        if let Ok(Some(project)) = pad.get::<Project>(&Section::Project, &project_id) {
            projects.push(project.value);
        }
    }
    Ok(projects)
}

fn load_project(pad: &Scratchpad, project_id: &str) -> Result<Project> {
    Ok(pad
        .get_required::<Project>(&Section::Project, project_id)
        .map_err(PipelineError::from)?
        .value)
}

fn find_sessions(pad: &Scratchpad, project_id: &str) -> Result<Vec<Session>> {
    let sessions_dir = pad.root().join("sessions");
    let mut sessions = Vec::new();
    if !sessions_dir.exists() {
        return Ok(sessions);
    }
    for entry in std::fs::read_dir(&sessions_dir)? {
        let entry = entry?;
        let Some(session_id) = entry
            .file_name()
            .to_string_lossy()
            .strip_suffix(".yaml")
            .map(str::to_string)
        else {
            continue;
        };
        if let Ok(Some(session)) = pad.get::<Session>(&Section::Session(session_id), project_id)
            && session.value.project_id == project_id
        {
            sessions.push(session.value);
        }
    }
    sessions.sort_by_key(|s| s.started_at);
    Ok(sessions)
}

fn print_session(session: &Session) {
    println!();
    println!(
        "Session {}  {:?}  ({} mode)",
        session.id, session.status, session.mode
    );
    for stage in &session.stages {
        let mark = match stage.status {
            ad_sdlc::pipeline::StageStatus::Completed => "✓",
            ad_sdlc::pipeline::StageStatus::Skipped => "→",
            ad_sdlc::pipeline::StageStatus::Failed => "✗",
            ad_sdlc::pipeline::StageStatus::PendingApproval => "?",
        };
        println!("  {mark} {}", stage.stage);
    }
    if session.status != SessionStatus::Completed {
        println!("Resume with: ad-sdlc resume {}", session.id);
    }
}
