use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use jobtrack::db::Database;
use jobtrack::logging::init_logging;
use jobtrack::{DocumentKind, Job, JobDocument, NewJob, Outcome, RemoteConfig, SyncAdvisory, Tracker};

#[derive(Parser)]
#[command(name = "jobtrack")]
#[command(about = "Job application tracker - pipeline stages, checklists and stats")]
struct Cli {
    /// Database file (defaults to $JOBTRACK_DB, then the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account and log in
    Signup {
        name: String,
        email: String,
        #[arg(short, long)]
        password: String,
    },

    /// Log in
    Login {
        email: String,
        #[arg(short, long)]
        password: String,
    },

    /// Log out
    Logout,

    /// Show the logged in user
    Whoami,

    /// Track a new application
    Add {
        company: String,
        title: String,

        /// Stage (defaults to the first stage)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value = "")]
        description: String,

        #[arg(short, long)]
        link: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,

        /// Start without the default Resume / Cover Letter checklist
        #[arg(long)]
        no_docs: bool,
    },

    /// List applications
    List {
        /// Only show jobs in this stage
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show application details
    Show {
        /// Job ID (or unique prefix)
        id: String,
    },

    /// Edit application fields
    Edit {
        /// Job ID (or unique prefix)
        id: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        link: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Move an application to another stage
    Move {
        /// Job ID (or unique prefix)
        id: String,
        stage: String,
    },

    /// Delete an application
    Delete {
        /// Job ID (or unique prefix)
        id: String,
    },

    /// Manage an application's document checklist
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },

    /// Manage pipeline stages
    Stage {
        #[command(subcommand)]
        command: StageCommands,
    },

    /// Show counts per stage
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configure the remote document store
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },

    /// Import applications that only exist in the remote store
    Sync,
}

#[derive(Subcommand)]
enum DocCommands {
    /// Add a checklist item
    Add {
        job_id: String,
        name: String,
        /// resume, cover_letter, portfolio, reference, other
        #[arg(short, long, default_value = "other")]
        kind: String,
    },

    /// Flip a checklist item between done and not done
    Toggle {
        job_id: String,
        /// Document ID (or unique prefix)
        doc_id: String,
    },
}

#[derive(Subcommand)]
enum StageCommands {
    /// List stages in pipeline order
    List,
    /// Append a stage
    Add { name: String },
    /// Remove an empty stage
    Remove { name: String },
    /// Rename a stage and move its applications along
    Rename { old: String, new: String },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Save the data API endpoint and credentials
    Configure {
        #[arg(long)]
        url: String,
        #[arg(long)]
        key: String,
        #[arg(long, default_value = RemoteConfig::DEFAULT_CLUSTER)]
        cluster: String,
        #[arg(long, default_value = RemoteConfig::DEFAULT_DATABASE)]
        database: String,
    },
    /// Forget the remote configuration
    Reset,
    /// Show whether the remote is configured
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let db = match cli.db.clone().or_else(|| std::env::var_os("JOBTRACK_DB").map(PathBuf::from)) {
        Some(path) => Database::open_at(&path)?,
        None => Database::open()?,
    };
    let mut tracker = Tracker::open(db).context("Failed to open tracker")?;

    run(&mut tracker, cli.command).await?;

    tracker.flush().await;
    let status = tracker.sync_status();
    for failure in &status.failures {
        eprintln!("warning: not synced ({}): {}", failure.write, failure.error);
    }
    Ok(())
}

async fn run(tracker: &mut Tracker, command: Commands) -> Result<()> {
    match command {
        Commands::Signup { name, email, password } => {
            let p = tracker.signup(&name, &email, &password)?;
            println!("Welcome, {}! Account created for {}.", p.name, p.email);
        }

        Commands::Login { email, password } => {
            let p = tracker.login(&email, &password)?;
            println!("Welcome back, {}!", p.name);
        }

        Commands::Logout => {
            tracker.logout()?;
            println!("Logged out.");
        }

        Commands::Whoami => match tracker.principal() {
            Some(p) => println!("{} <{}>", p.name, p.email),
            None => println!("Not logged in."),
        },

        Commands::Add {
            company,
            title,
            status,
            description,
            link,
            notes,
            no_docs,
        } => {
            let documents = if no_docs { Vec::new() } else { JobDocument::default_checklist() };
            let (job, advisory) = tracker.add_job(NewJob {
                company,
                title,
                status: status.unwrap_or_default(),
                description,
                link,
                notes,
                documents,
            })?;
            println!("Added {} - {} ({}) as {}", job.company, job.title, job.status, short_id(&job.id));
            warn_unsynced(&advisory);
        }

        Commands::List { status } => {
            let jobs = match &status {
                Some(s) => tracker.jobs_by_status(s),
                None => tracker.jobs(),
            };
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<10} {:<14} {:<28} {:<22} {:>6} {:<10}", "ID", "STATUS", "TITLE", "COMPANY", "DOCS", "ADDED");
                println!("{}", "-".repeat(95));
                for job in jobs {
                    let done = job.documents.iter().filter(|d| d.completed).count();
                    println!(
                        "{:<10} {:<14} {:<28} {:<22} {:>6} {:<10}",
                        short_id(&job.id),
                        truncate(&job.status, 14),
                        truncate(&job.title, 28),
                        truncate(&job.company, 22),
                        format!("{}/{}", done, job.documents.len()),
                        job.date_added.format("%Y-%m-%d")
                    );
                }
            }
        }

        Commands::Show { id } => {
            let job = resolve_job(tracker, &id)?;
            println!("{} - {}", job.company, job.title);
            println!("ID: {}", job.id);
            let known = tracker.stages().contains(&job.status);
            println!("Status: {}{}", job.status, if known { "" } else { " (unknown stage)" });
            println!("Added: {}", job.date_added.format("%Y-%m-%d %H:%M"));
            if let Some(link) = &job.link {
                println!("Link: {}", link);
            }
            if let Some(notes) = &job.notes {
                println!("Notes: {}", notes);
            }
            if !job.documents.is_empty() {
                println!("\nDocuments:");
                for doc in &job.documents {
                    let mark = if doc.completed { "x" } else { " " };
                    println!("  [{}] {} ({}) {}", mark, doc.name, doc.kind.label(), short_id(&doc.id));
                }
            }
            if !job.description.trim().is_empty() {
                println!("\n--- Description ---\n{}", textwrap::fill(&job.description, 80));
            }
        }

        Commands::Edit {
            id,
            company,
            title,
            description,
            link,
            notes,
        } => {
            let mut job = resolve_job(tracker, &id)?;
            if let Some(company) = company {
                job.company = company;
            }
            if let Some(title) = title {
                job.title = title;
            }
            if let Some(description) = description {
                job.description = description;
            }
            if let Some(link) = link {
                job.link = Some(link).filter(|l| !l.is_empty());
            }
            if let Some(notes) = notes {
                job.notes = Some(notes).filter(|n| !n.is_empty());
            }
            let outcome = tracker.update_job(job)?;
            print_outcome(&outcome, "Updated.");
        }

        Commands::Move { id, stage } => {
            if !tracker.stages().contains(&stage) {
                bail!("Unknown stage '{}'. Known stages: {}", stage, tracker.stages().join(", "));
            }
            let mut job = resolve_job(tracker, &id)?;
            job.status = stage.clone();
            let outcome = tracker.update_job(job)?;
            print_outcome(&outcome, &format!("Moved to {}.", stage));
        }

        Commands::Delete { id } => {
            let job = resolve_job(tracker, &id)?;
            let outcome = tracker.delete_job(&job.id)?;
            print_outcome(&outcome, &format!("Deleted {} - {}.", job.company, job.title));
        }

        Commands::Doc { command } => match command {
            DocCommands::Add { job_id, name, kind } => {
                let mut job = resolve_job(tracker, &job_id)?;
                job.documents.push(JobDocument::new(&name, DocumentKind::parse(&kind)));
                let outcome = tracker.update_job(job)?;
                print_outcome(&outcome, &format!("Added '{}' to the checklist.", name));
            }
            DocCommands::Toggle { job_id, doc_id } => {
                let job = resolve_job(tracker, &job_id)?;
                let doc = find_by_prefix(&job.documents, &doc_id, |d| &d.id)
                    .ok_or_else(|| anyhow!("Document '{}' not found on job {}", doc_id, short_id(&job.id)))?;
                let now_done = !doc.completed;
                let outcome = tracker.toggle_document(&job.id, &doc.id)?;
                let msg = format!("'{}' marked {}.", doc.name, if now_done { "done" } else { "not done" });
                print_outcome(&outcome, &msg);
            }
        },

        Commands::Stage { command } => match command {
            StageCommands::List => {
                let stats = tracker.stats();
                for count in &stats.by_stage {
                    println!("{:<20} {:>4}", count.stage, count.count);
                }
            }
            StageCommands::Add { name } => {
                let outcome = tracker.add_stage(&name)?;
                print_outcome(&outcome, &format!("Added stage '{}'.", name.trim()));
            }
            StageCommands::Remove { name } => {
                let outcome = tracker.remove_stage(&name)?;
                print_outcome(&outcome, &format!("Removed stage '{}'.", name));
            }
            StageCommands::Rename { old, new } => {
                let outcome = tracker.rename_stage(&old, &new)?;
                print_outcome(&outcome, &format!("Renamed '{}' to '{}'.", old, new.trim()));
            }
        },

        Commands::Stats { json } => {
            let stats = tracker.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Total applications: {}", stats.total);
                for count in &stats.by_stage {
                    println!("  {:<20} {:>4}", count.stage, count.count);
                }
                if stats.unstaged() > 0 {
                    println!("  {:<20} {:>4}", "(unknown stage)", stats.unstaged());
                }
            }
        }

        Commands::Remote { command } => match command {
            RemoteCommands::Configure {
                url,
                key,
                cluster,
                database,
            } => {
                let config = tracker.configure_remote(RemoteConfig {
                    api_url: url,
                    api_key: key,
                    cluster,
                    database,
                })?;
                println!("Remote configured: {} ({}/{})", config.api_url, config.cluster, config.database);
            }
            RemoteCommands::Reset => {
                tracker.reset_remote()?;
                println!("Remote configuration removed.");
            }
            RemoteCommands::Status => match tracker.remote_config() {
                Some(config) => println!("Configured: {} ({}/{})", config.api_url, config.cluster, config.database),
                None => println!("Not configured."),
            },
        },

        Commands::Sync => {
            let report = tracker.pull().await?;
            println!(
                "Imported {} job(s) and {} stage(s); kept {} local job(s).",
                report.jobs.imported, report.stages_added, report.jobs.kept_local
            );
            if report.skipped > 0 {
                println!("Skipped {} unreadable remote document(s).", report.skipped);
            }
            if report.jobs.duplicates > 0 {
                println!("Ignored {} remote document(s) with a repeated id.", report.jobs.duplicates);
            }
        }
    }

    Ok(())
}

fn resolve_job(tracker: &Tracker, id: &str) -> Result<Job> {
    if tracker.principal().is_none() {
        bail!("Not logged in. Run 'jobtrack login' first.");
    }
    let jobs = tracker.jobs();
    find_by_prefix(&jobs, id, |j| &j.id)
        .cloned()
        .ok_or_else(|| anyhow!("Job '{}' not found (or prefix is ambiguous)", id))
}

/// Exact id, or the single item whose id starts with `prefix`.
fn find_by_prefix<'a, T>(items: &'a [T], prefix: &str, id_of: impl Fn(&T) -> &String) -> Option<&'a T> {
    if let Some(exact) = items.iter().find(|item| id_of(item) == prefix) {
        return Some(exact);
    }
    let mut matches = items.iter().filter(|item| id_of(item).starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(only), None) if !prefix.is_empty() => Some(only),
        _ => None,
    }
}

fn print_outcome(outcome: &Outcome, done: &str) {
    match outcome {
        Outcome::Applied(advisory) => {
            println!("{}", done);
            warn_unsynced(advisory);
        }
        Outcome::Unchanged => println!("Nothing changed."),
    }
}

fn warn_unsynced(advisory: &SyncAdvisory) {
    if let SyncAdvisory::Failed(reason) = advisory {
        eprintln!("warning: change saved locally but not synced: {}", reason);
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
