mod config;
mod log_cmd;
mod merge_cmd;
mod project_cmds;
mod run_cmd;
mod runner_ctx;
mod subtask_cmds;
mod task_cmds;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use foreman_db::pool;

#[derive(Parser)]
#[command(name = "foreman", about = "Orchestration core for autonomous coding agents against a GitHub repo")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Root directory for logs and worktrees (overrides FOREMAN_DATA_DIR env var)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Command used to invoke the coding agent for Planner/Worker attempts
    #[arg(long, global = true, default_value = "claude")]
    agent_command: String,

    /// Arguments passed to the agent command, comma-separated
    #[arg(long, global = true, value_delimiter = ',')]
    agent_args: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/foreman")]
        db_url: String,
        /// Path to the tracker CLI binary used by External Sync
        #[arg(long, default_value = "tracker")]
        tracker_cli_path: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the foreman database (requires config file or env vars)
    DbInit,
    /// Project management
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Subtask management
    Subtask {
        #[command(subcommand)]
        command: SubtaskCommands,
    },
    /// Run the dispatch loop for a project until Ctrl+C
    Run {
        /// Project ID to drive
        project_id: String,
    },
    /// Record that a subtask's PR has landed, unblocking its dependents
    Merge {
        /// Project ID the subtask belongs to
        project_id: String,
        /// Subtask ID whose PR was merged
        subtask_id: String,
    },
    /// Print an agent run's captured log file
    Log {
        /// Run ID to print the log for
        run_id: String,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a new project
    Add {
        /// GitHub "owner/repo" slug
        owner_repo: String,
        /// Default branch Subtask branches are based on and PRs target
        #[arg(long, default_value = "main")]
        default_branch: String,
        /// Local path the repo is cloned to
        #[arg(long)]
        clone_path: String,
        /// Prefix the issue tracker uses for this project's issues
        #[arg(long)]
        tracker_prefix: String,
    },
    /// List projects owned by a user
    List {
        /// User ID to list projects for
        user_id: String,
    },
    /// Show project details
    Show {
        /// Project ID to show
        project_id: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Submit a task and run one Planner attempt in the foreground
    Add {
        /// Project ID the task belongs to
        project_id: String,
        /// Short task title
        title: String,
        /// Full task description handed to the Planner
        description: String,
    },
    /// List tasks for a project
    List {
        /// Project ID to list tasks for
        project_id: String,
    },
    /// Show task details
    Show {
        /// Task ID to show
        task_id: String,
    },
}

#[derive(Subcommand)]
enum SubtaskCommands {
    /// List subtasks for a task
    List {
        /// Task ID to list subtasks for
        task_id: String,
    },
    /// Show subtask details, including past runs
    Show {
        /// Subtask ID to show
        subtask_id: String,
    },
    /// Retry a subtask that is BLOCKED(FAILURE)
    Retry {
        /// Project ID the subtask belongs to
        project_id: String,
        /// Subtask ID to retry
        subtask_id: String,
    },
}

/// Execute the `foreman init` command: write config file.
fn cmd_init(db_url: &str, tracker_cli_path: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
        tracker: config::TrackerSection { cli_path: Some(tracker_cli_path.to_string()) },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url      = {db_url}");
    println!("  tracker.cli_path  = {tracker_cli_path}");
    println!();
    println!("Next: run `foreman db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `foreman db-init` command: create database and run migrations.
async fn cmd_db_init(cli_database_url: Option<&str>, cli_data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve(cli_database_url, cli_data_dir)?;

    println!("Initializing foreman database...");

    pool::ensure_database_exists(&resolved.db).await?;
    let db_pool = pool::create_pool(&resolved.db).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("foreman db-init complete.");
    Ok(())
}

fn parse_uuid(label: &str, raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid {label}: {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { db_url, tracker_cli_path, force } = &cli.command {
        cmd_init(db_url, tracker_cli_path, *force)?;
        return Ok(());
    }
    if matches!(cli.command, Commands::DbInit) {
        cmd_db_init(cli.database_url.as_deref(), cli.data_dir.clone()).await?;
        return Ok(());
    }

    let resolved = config::resolve(cli.database_url.as_deref(), cli.data_dir.clone())?;
    let db_pool = pool::create_pool(&resolved.db).await?;

    let result = run_command(cli.command, db_pool.clone(), resolved, cli.agent_command, cli.agent_args).await;
    db_pool.close().await;

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_command(
    command: Commands,
    pool: sqlx::PgPool,
    config: foreman_core::config::ServiceConfig,
    agent_command: String,
    agent_args: Vec<String>,
) -> anyhow::Result<()> {
    match command {
        Commands::Init { .. } | Commands::DbInit => unreachable!("handled in main before config resolution"),
        Commands::Project { command } => match command {
            ProjectCommands::Add { owner_repo, default_branch, clone_path, tracker_prefix } => {
                project_cmds::run_add(&pool, &owner_repo, &default_branch, &clone_path, &tracker_prefix).await
            }
            ProjectCommands::List { user_id } => {
                project_cmds::run_list(&pool, parse_uuid("user ID", &user_id)?).await
            }
            ProjectCommands::Show { project_id } => project_cmds::run_show(&pool, &project_id).await,
        },
        Commands::Task { command } => match command {
            TaskCommands::Add { project_id, title, description } => {
                let project_id = parse_uuid("project ID", &project_id)?;
                task_cmds::run_add(pool, config, project_id, &title, &description, agent_command, agent_args).await
            }
            TaskCommands::List { project_id } => {
                task_cmds::run_list(&pool, parse_uuid("project ID", &project_id)?).await
            }
            TaskCommands::Show { task_id } => task_cmds::run_show(&pool, &task_id).await,
        },
        Commands::Subtask { command } => match command {
            SubtaskCommands::List { task_id } => {
                subtask_cmds::run_list(&pool, parse_uuid("task ID", &task_id)?).await
            }
            SubtaskCommands::Show { subtask_id } => subtask_cmds::run_show(&pool, &subtask_id).await,
            SubtaskCommands::Retry { project_id, subtask_id } => {
                let project_id = parse_uuid("project ID", &project_id)?;
                let subtask_id = parse_uuid("subtask ID", &subtask_id)?;
                subtask_cmds::run_retry(pool, config, project_id, subtask_id, agent_command, agent_args).await
            }
        },
        Commands::Run { project_id } => {
            let project_id = parse_uuid("project ID", &project_id)?;
            run_cmd::run(pool, config, project_id, agent_command, agent_args).await
        }
        Commands::Merge { project_id, subtask_id } => {
            let project_id = parse_uuid("project ID", &project_id)?;
            let subtask_id = parse_uuid("subtask ID", &subtask_id)?;
            merge_cmd::run_merge(pool, config, project_id, subtask_id, agent_command, agent_args).await
        }
        Commands::Log { run_id } => log_cmd::run_log(&pool, &run_id).await,
    }
}
