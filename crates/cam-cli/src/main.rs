mod config;
mod serve_cmd;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use cam_db::pool;
use cam_db::queries::{agent_definitions, tasks as task_db, templates as template_db, workers as worker_db};

use config::CamConfig;

#[derive(Parser)]
#[command(name = "cam", about = "Core orchestration engine for a coding-agent fleet")]
struct Cli {
    /// SQLite database path (overrides DATABASE_PATH env var and config file)
    #[arg(long, global = true)]
    database_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Address to bind (overrides CAM_BIND_ADDR env var)
        #[arg(long)]
        bind: Option<String>,
        /// Port to bind
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Create the database file and run migrations
    DbInit,
    /// Inspect tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Inspect workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Inspect task templates
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },
    /// Inspect agent definitions
    AgentDefinition {
        #[command(subcommand)]
        command: AgentDefinitionCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks (optionally filtered by group)
    List {
        /// Filter by group ID
        #[arg(long)]
        group: Option<String>,
    },
    /// Show a single task by ID
    Show {
        /// Task ID
        task_id: String,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// List registered workers
    List,
    /// Show a single worker by ID
    Show {
        /// Worker ID
        worker_id: String,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// List task templates
    List,
}

#[derive(Subcommand)]
enum AgentDefinitionCommands {
    /// List agent definitions
    List,
}

/// Execute the `cam db-init` command: create the database file and run migrations.
async fn cmd_db_init(cli_db_path: Option<&str>) -> Result<()> {
    let resolved = CamConfig::resolve(cli_db_path);

    println!("Initializing database at {}...", resolved.db_config.database_path);

    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("cam db-init complete.");
    Ok(())
}

fn print_task_row(task: &cam_db::models::Task) {
    println!(
        "  [{:<14}] {} (attempt {}/{}, group {})",
        task.status.to_string(),
        task.id,
        task.retry_count,
        task.max_retries,
        task.group_id.as_deref().unwrap_or("-"),
    );
}

async fn cmd_task_list(pool: &sqlx::SqlitePool, group: Option<&str>) -> Result<()> {
    let tasks = match group {
        Some(group_id) => task_db::list_tasks_for_group(pool, group_id).await?,
        None => task_db::list_tasks(pool, &task_db::TaskFilter::default()).await?,
    };

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!("Tasks:");
    for task in &tasks {
        print_task_row(task);
    }
    Ok(())
}

async fn cmd_task_show(pool: &sqlx::SqlitePool, task_id: &str) -> Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
    let task = task_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

async fn cmd_worker_list(pool: &sqlx::SqlitePool) -> Result<()> {
    let workers = worker_db::list_workers(pool).await?;
    if workers.is_empty() {
        println!("No workers found.");
        return Ok(());
    }
    println!("Workers:");
    for w in &workers {
        println!(
            "  [{:<10}] {} ({}, last heartbeat {})",
            w.status.to_string(),
            w.id,
            w.mode,
            w.last_heartbeat_at,
        );
    }
    Ok(())
}

async fn cmd_worker_show(pool: &sqlx::SqlitePool, worker_id: &str) -> Result<()> {
    let worker = worker_db::get_worker(pool, worker_id)
        .await?
        .with_context(|| format!("worker {worker_id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&worker)?);
    Ok(())
}

async fn cmd_template_list(pool: &sqlx::SqlitePool) -> Result<()> {
    let templates = template_db::list(pool).await?;
    if templates.is_empty() {
        println!("No templates found.");
        return Ok(());
    }
    println!("Templates:");
    for t in &templates {
        println!("  {} - {}", t.id, t.name);
    }
    Ok(())
}

async fn cmd_agent_definition_list(pool: &sqlx::SqlitePool) -> Result<()> {
    let defs = agent_definitions::list(pool).await?;
    if defs.is_empty() {
        println!("No agent definitions found.");
        return Ok(());
    }
    println!("Agent definitions:");
    for d in &defs {
        println!("  {} - {} ({})", d.id, d.display_name, d.runtime);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DbInit => {
            cmd_db_init(cli.database_path.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = CamConfig::resolve(cli.database_path.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

            let bus = cam_core::EventBus::default();
            let bind_addr = bind
                .or_else(|| std::env::var("CAM_BIND_ADDR").ok())
                .unwrap_or_else(|| "0.0.0.0".to_string());

            serve_cmd::run_serve(db_pool, bus, &bind_addr, port).await?;
        }
        Commands::Task { command } => {
            let resolved = CamConfig::resolve(cli.database_path.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                TaskCommands::List { group } => cmd_task_list(&db_pool, group.as_deref()).await,
                TaskCommands::Show { task_id } => cmd_task_show(&db_pool, &task_id).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Worker { command } => {
            let resolved = CamConfig::resolve(cli.database_path.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                WorkerCommands::List => cmd_worker_list(&db_pool).await,
                WorkerCommands::Show { worker_id } => cmd_worker_show(&db_pool, &worker_id).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Template { command } => {
            let resolved = CamConfig::resolve(cli.database_path.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                TemplateCommands::List => cmd_template_list(&db_pool).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::AgentDefinition { command } => {
            let resolved = CamConfig::resolve(cli.database_path.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                AgentDefinitionCommands::List => cmd_agent_definition_list(&db_pool).await,
            };
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
