// ============================================================================
// tambun - donation bot server and ledger admin tool
// ============================================================================
// Usage:
//   tambun serve [--port 3000]                 Run the webhook server
//   tambun seed                                Install default keywords/settings
//   tambun add-project --name NAME [...]       Create a fundraising project
//   tambun list-projects [--status STATUS]     List projects
//   tambun update-project --project ID [...]   Rename, re-target or close a project
//   tambun delete-project --project ID         Remove a project
//   tambun add-expense --project ID ...        Record money spent
//   tambun list-expenses --project ID          List a project's expenses
//   tambun update-expense --expense ID [...]   Correct an expense
//   tambun delete-expense --expense ID         Remove an expense
//   tambun add-keyword WORD ACTION             Add or change a chat keyword
//   tambun list-keywords                       List chat keywords
//   tambun balance [--project ID]              Collected / spent / left
//   tambun list-donations [--status STATUS]    List donation records
//   tambun stats                               Show database statistics
//   tambun export --format json                Export the ledger as JSON
//   tambun set-setting KEY VALUE               Set a bot setting
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tambun_core::server::{self, WebhookServer};
use tambun_core::{
    BotConfig, DonationFilter, DonationLedger, DonationStatus, EventHandler, KeywordAction, LedgerDb,
    LineClient, MessagingClient, NewProject, ProjectStatus, SummaryScheduler,
};
use tracing::{info, warn};

/// Donation bot for LINE chats
#[derive(Parser)]
#[command(name = "tambun", version, about = "Serve the donation bot and manage its ledger")]
struct Cli {
    /// Path to the database file (default: ~/.tambun/ledger.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server and the daily summary scheduler
    Serve {
        /// Listen port (default: $PORT or 3000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Install default keywords and settings
    Seed,

    /// Create a fundraising project
    AddProject {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Who receives the money
        #[arg(long)]
        destination: Option<String>,
        /// PromptPay QR image URL
        #[arg(long)]
        qr_url: Option<String>,
        #[arg(long)]
        goal: Option<f64>,
    },

    /// List projects with optional status filter
    ListProjects {
        /// Filter by status: active, completed, archived
        #[arg(long)]
        status: Option<String>,
    },

    /// Change a project's details or status
    UpdateProject {
        #[arg(long)]
        project: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        destination: Option<String>,
        /// PromptPay QR image URL
        #[arg(long)]
        qr_url: Option<String>,
        #[arg(long)]
        goal: Option<f64>,
        /// active, completed or archived
        #[arg(long)]
        status: Option<String>,
    },

    /// Delete a project (its donations and expenses are kept)
    DeleteProject {
        #[arg(long)]
        project: String,
    },

    /// Record an expense against a project
    AddExpense {
        #[arg(long)]
        project: String,
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        description: String,
        #[arg(long)]
        receipt_url: Option<String>,
    },

    /// List a project's expenses
    ListExpenses {
        #[arg(long)]
        project: String,
    },

    /// Correct an expense; the project total follows
    UpdateExpense {
        #[arg(long)]
        expense: String,
        #[arg(long)]
        amount: Option<f64>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        receipt_url: Option<String>,
    },

    /// Delete an expense and take it off the project total
    DeleteExpense {
        #[arg(long)]
        expense: String,
    },

    /// Add or change a chat keyword
    AddKeyword {
        keyword: String,
        /// show-projects or show-summary
        action: String,
        /// Store the keyword switched off
        #[arg(long)]
        inactive: bool,
    },

    /// List chat keywords
    ListKeywords,

    /// Show collected, spent and remaining money
    Balance {
        /// Only this project (default: all)
        #[arg(long)]
        project: Option<String>,
    },

    /// List donation records
    ListDonations {
        /// Filter by status: waiting-slip, waiting-confirmation, confirmed, rejected
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },

    /// Show database statistics
    Stats,

    /// Export full database contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Set a bot setting (thank_you_message, summary_time, summary_group_id)
    SetSetting { key: String, value: String },
}

fn parse_status(s: &str) -> Result<DonationStatus> {
    DonationStatus::from_str(s).ok_or_else(|| {
        anyhow!(
            "Unknown status '{}'. Valid values: waiting-slip, waiting-confirmation, confirmed, rejected",
            s
        )
    })
}

fn parse_project_status(s: &str) -> Result<ProjectStatus> {
    ProjectStatus::from_str(s)
        .ok_or_else(|| anyhow!("Unknown status '{}'. Valid values: active, completed, archived", s))
}

fn parse_keyword_action(s: &str) -> Result<KeywordAction> {
    KeywordAction::from_str(s)
        .ok_or_else(|| anyhow!("Unknown action '{}'. Valid values: show-projects, show-summary", s))
}

fn format_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ms))
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so `export` output stays clean
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tambun=info".parse()?)
                .add_directive("tambun_core=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = BotConfig::from_env();
    if cli.db_path.is_some() {
        config.db_path = cli.db_path.clone();
    }

    let db = Arc::new(LedgerDb::open(config.db_path.as_deref())?);
    let ledger = DonationLedger::new(Arc::clone(&db));

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            let runtime = tokio::runtime::Runtime::new()
                .map_err(|e| anyhow!("Failed to start tokio runtime: {}", e))?;
            runtime.block_on(cmd_serve(db, config))
        }
        Commands::Seed => cmd_seed(&ledger),
        Commands::AddProject {
            name,
            description,
            destination,
            qr_url,
            goal,
        } => cmd_add_project(
            &db,
            NewProject {
                name,
                description,
                destination,
                promptpay_qr_url: qr_url,
                goal_amount: goal,
            },
        ),
        Commands::ListProjects { status } => cmd_list_projects(&db, status),
        Commands::UpdateProject {
            project,
            name,
            description,
            destination,
            qr_url,
            goal,
            status,
        } => cmd_update_project(
            &db,
            &project,
            ProjectEdit {
                name,
                description,
                destination,
                qr_url,
                goal,
                status,
            },
        ),
        Commands::DeleteProject { project } => cmd_delete_project(&db, &project),
        Commands::AddExpense {
            project,
            amount,
            description,
            receipt_url,
        } => cmd_add_expense(&ledger, &project, amount, &description, receipt_url),
        Commands::ListExpenses { project } => cmd_list_expenses(&db, &project),
        Commands::UpdateExpense {
            expense,
            amount,
            description,
            receipt_url,
        } => cmd_update_expense(&db, &expense, amount, description, receipt_url),
        Commands::DeleteExpense { expense } => cmd_delete_expense(&db, &expense),
        Commands::AddKeyword {
            keyword,
            action,
            inactive,
        } => cmd_add_keyword(&db, &keyword, &action, !inactive),
        Commands::ListKeywords => cmd_list_keywords(&db),
        Commands::Balance { project } => cmd_balance(&ledger, project),
        Commands::ListDonations { status, project } => cmd_list_donations(&db, status, project),
        Commands::Stats => cmd_stats(&db),
        Commands::Export { format } => cmd_export(&db, &format),
        Commands::SetSetting { key, value } => {
            db.put_setting(&key, &value)?;
            println!("{} = {}", key, value);
            Ok(())
        }
    }
}

async fn cmd_serve(db: Arc<LedgerDb>, config: BotConfig) -> Result<()> {
    info!("Starting tambun webhook server");
    config.warn_if_incomplete();

    tokio::fs::create_dir_all(&config.uploads_dir)
        .await
        .map_err(|e| anyhow!("Failed to create uploads directory: {}", e))?;

    let messenger: Arc<dyn MessagingClient> =
        Arc::new(LineClient::new(config.channel_access_token.clone()));
    let handler = Arc::new(EventHandler::new(db, Arc::clone(&messenger), &config));

    let scheduler = Arc::new(SummaryScheduler::new(handler.ledger().clone(), messenger));
    let summary_task = scheduler.spawn();

    let listener = server::listen(&format!("0.0.0.0:{}", config.port))?;
    let webhook = Arc::new(WebhookServer::new(
        Arc::clone(&handler),
        config.channel_secret.clone(),
        tokio::runtime::Handle::current(),
    ));
    let http = Arc::clone(&listener);
    let server_thread = std::thread::Builder::new()
        .name("webhook".into())
        .spawn(move || webhook.run(&http))
        .map_err(|e| anyhow!("Failed to spawn server thread: {}", e))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutting down");

    listener.unblock();
    summary_task.abort();
    handler.drain_background().await;
    match tokio::task::spawn_blocking(move || server_thread.join()).await {
        Ok(Ok(())) => {}
        _ => warn!("Webhook server thread did not exit cleanly"),
    }
    Ok(())
}

fn cmd_seed(ledger: &DonationLedger) -> Result<()> {
    let written = ledger.seed_defaults()?;
    println!("Seeded {} keyword/setting rows.", written);
    Ok(())
}

fn cmd_add_project(db: &LedgerDb, new: NewProject) -> Result<()> {
    if new.name.trim().is_empty() {
        anyhow::bail!("Project name must not be empty");
    }
    let project = db.create_project(new)?;
    println!("Created project {} ({})", project.id, project.name);
    Ok(())
}

fn cmd_list_projects(db: &LedgerDb, status_filter: Option<String>) -> Result<()> {
    let filter = status_filter.as_deref().map(parse_project_status).transpose()?;
    let projects = db.list_projects(filter)?;

    if projects.is_empty() {
        println!("No projects found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:>12}  {:>12}  {}",
        "PROJECT ID", "STATUS", "COLLECTED", "GOAL", "NAME"
    );
    println!("{}", "-".repeat(96));

    for project in &projects {
        println!(
            "{:<36}  {:<10}  {:>12.2}  {:>12}  {}",
            project.id,
            format!("{:?}", project.status),
            project.current_amount,
            project
                .goal_amount
                .map(|g| format!("{:.2}", g))
                .unwrap_or_else(|| "-".into()),
            project.name
        );
    }

    println!("\nTotal: {} projects", projects.len());
    Ok(())
}

/// Fields `update-project` may change; unset ones stay as they are
struct ProjectEdit {
    name: Option<String>,
    description: Option<String>,
    destination: Option<String>,
    qr_url: Option<String>,
    goal: Option<f64>,
    status: Option<String>,
}

fn cmd_update_project(db: &LedgerDb, project_id: &str, edit: ProjectEdit) -> Result<()> {
    let status = edit.status.as_deref().map(parse_project_status).transpose()?;
    if edit.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        anyhow::bail!("Project name must not be empty");
    }
    if edit.goal.is_some_and(|g| !(g.is_finite() && g > 0.0)) {
        anyhow::bail!("Goal must be a positive amount");
    }

    let updated = db.update_project(project_id, |p| {
        if let Some(name) = edit.name {
            *p.name = name.trim().to_string();
        }
        if edit.description.is_some() {
            *p.description = edit.description;
        }
        if edit.destination.is_some() {
            *p.destination = edit.destination;
        }
        if edit.qr_url.is_some() {
            *p.promptpay_qr_url = edit.qr_url;
        }
        if edit.goal.is_some() {
            *p.goal_amount = edit.goal;
        }
        if let Some(status) = status {
            *p.status = status;
        }
    })?;

    match updated {
        Some(project) => {
            println!("Updated project {} ({}, {:?})", project.id, project.name, project.status);
            Ok(())
        }
        None => Err(anyhow!("Project not found: {}", project_id)),
    }
}

fn cmd_delete_project(db: &LedgerDb, project_id: &str) -> Result<()> {
    let donations = db.list_donations(&DonationFilter {
        project_id: Some(project_id.to_string()),
        ..Default::default()
    })?;
    if !donations.is_empty() {
        warn!(
            "Project {} has {} donation record(s); consider --status archived instead",
            project_id,
            donations.len()
        );
    }

    if db.delete_project(project_id)? {
        println!("Deleted project {}", project_id);
        Ok(())
    } else {
        Err(anyhow!("Project not found: {}", project_id))
    }
}

fn cmd_add_expense(
    ledger: &DonationLedger,
    project_id: &str,
    amount: f64,
    description: &str,
    receipt_url: Option<String>,
) -> Result<()> {
    let (expense, balance) = ledger.spend(project_id, amount, description, receipt_url)?;
    println!("Recorded expense {} ({:.2})", expense.id, expense.amount);
    println!("Balance of {}: {:.2}", balance.name, balance.balance);
    Ok(())
}

fn cmd_list_expenses(db: &LedgerDb, project_id: &str) -> Result<()> {
    let expenses = db.list_expenses(project_id)?;
    if expenses.is_empty() {
        println!("No expenses found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:>12}  {:<23}  {}",
        "EXPENSE ID", "AMOUNT", "CREATED AT", "DESCRIPTION"
    );
    println!("{}", "-".repeat(100));
    for expense in &expenses {
        println!(
            "{:<36}  {:>12.2}  {:<23}  {}",
            expense.id,
            expense.amount,
            format_timestamp(expense.created_at),
            expense.description
        );
    }

    let total: f64 = expenses.iter().map(|e| e.amount).sum();
    println!("\nTotal: {} expenses, {:.2}", expenses.len(), total);
    Ok(())
}

fn cmd_update_expense(
    db: &LedgerDb,
    expense_id: &str,
    amount: Option<f64>,
    description: Option<String>,
    receipt_url: Option<String>,
) -> Result<()> {
    if description.as_deref().is_some_and(|d| d.trim().is_empty()) {
        anyhow::bail!("Description must not be empty");
    }
    let description = description.map(|d| d.trim().to_string());

    match db.update_expense(expense_id, amount, description, receipt_url)? {
        Some(expense) => {
            println!("Updated expense {} ({:.2})", expense.id, expense.amount);
            Ok(())
        }
        None => Err(anyhow!("Expense not found: {}", expense_id)),
    }
}

fn cmd_delete_expense(db: &LedgerDb, expense_id: &str) -> Result<()> {
    if db.delete_expense(expense_id)? {
        println!("Deleted expense {}", expense_id);
        Ok(())
    } else {
        Err(anyhow!("Expense not found: {}", expense_id))
    }
}

fn cmd_add_keyword(db: &LedgerDb, keyword: &str, action: &str, is_active: bool) -> Result<()> {
    let action = parse_keyword_action(action)?;
    let stored = db.upsert_keyword(keyword, action, is_active)?;
    println!(
        "{} -> {}{}",
        stored.keyword,
        stored.action.as_str(),
        if stored.is_active { "" } else { " (inactive)" }
    );
    Ok(())
}

fn cmd_list_keywords(db: &LedgerDb) -> Result<()> {
    let keywords = db.list_keywords()?;
    if keywords.is_empty() {
        println!("No keywords found. Run `tambun seed` to install the defaults.");
        return Ok(());
    }

    println!("{:<20}  {:<14}  {}", "KEYWORD", "ACTION", "ACTIVE");
    println!("{}", "-".repeat(44));
    for keyword in &keywords {
        println!(
            "{:<20}  {:<14}  {}",
            keyword.keyword,
            keyword.action.as_str(),
            if keyword.is_active { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn cmd_balance(ledger: &DonationLedger, project: Option<String>) -> Result<()> {
    let ids: Vec<String> = match project {
        Some(id) => vec![id],
        None => ledger
            .db()
            .list_projects(None)?
            .into_iter()
            .map(|p| p.id)
            .collect(),
    };

    println!(
        "{:<30}  {:>12}  {:>12}  {:>12}",
        "PROJECT", "COLLECTED", "EXPENSES", "BALANCE"
    );
    println!("{}", "-".repeat(72));
    for id in ids {
        let b = ledger.balance(&id)?;
        let name: String = b.name.chars().take(30).collect();
        println!(
            "{:<30}  {:>12.2}  {:>12.2}  {:>12.2}",
            name, b.collected, b.expenses, b.balance
        );
    }
    Ok(())
}

fn cmd_list_donations(db: &LedgerDb, status: Option<String>, project: Option<String>) -> Result<()> {
    let mut filter = DonationFilter {
        project_id: project,
        ..Default::default()
    };
    if let Some(status) = status.as_deref().map(parse_status).transpose()? {
        filter = filter.with_statuses(&[status]);
    }
    let donations = db.list_donations(&filter)?;

    if donations.is_empty() {
        println!("No donations found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:>10}  {:<23}  {}",
        "DONATION ID", "STATUS", "AMOUNT", "CREATED AT", "DONOR"
    );
    println!("{}", "-".repeat(110));

    for donation in &donations {
        println!(
            "{:<36}  {:<20}  {:>10.2}  {:<23}  {}",
            donation.id,
            donation.status.as_str(),
            donation.final_amount,
            format_timestamp(donation.created_at),
            donation.display_name.chars().take(24).collect::<String>()
        );
    }

    println!("\nTotal: {} donations", donations.len());
    Ok(())
}

fn cmd_stats(db: &LedgerDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Tambun Ledger Stats ===");
    match db.path() {
        Some(path) => println!("Database: {}", path.display()),
        None => println!("Database: (in memory)"),
    }
    println!();
    println!("Projects:  {} total, {} active", stats.total_projects, stats.active_projects);
    println!("Donations: {} total", stats.total_donations);
    for (status, count) in &stats.donation_counts {
        println!("  {:22} {}", status, count);
    }
    println!("Confirmed: {:.2}", stats.confirmed_amount);
    println!("Expenses:  {}", stats.total_expenses);
    println!("Open conversations: {}", stats.open_conversations);

    Ok(())
}

fn cmd_export(db: &LedgerDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let projects = db.list_projects(None)?;
    let mut expenses = Vec::new();
    for project in &projects {
        expenses.extend(db.list_expenses(&project.id)?);
    }
    let settings: serde_json::Map<String, serde_json::Value> = db
        .list_settings()?
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": db.stats()?,
        "settings": settings,
        "keywords": db.list_keywords()?,
        "projects": projects,
        "donations": db.list_donations(&DonationFilter::default())?,
        "expenses": expenses,
        "conversations": db.list_states()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
