use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use app_services::{AppServices, AppServicesBuilder};
use clap::{Parser, Subcommand};
use core_types::{Note, NoteId, NoteUpdate, ThemePreference};
use tracing::error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "jotter")]
#[command(about = "Local-first note taking with debounced persistence")]
struct Cli {
    /// Override the data directory (defaults to the platform data dir).
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a note.
    Add {
        title: String,
        #[arg(long, default_value = "")]
        content: String,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Create a blank note with the default title and tag.
    New,
    /// List all notes, most recent first.
    List,
    /// Print one note in full.
    Show { id: String },
    /// Search titles and contents (case- and punctuation-insensitive).
    Search { query: String },
    /// Overwrite fields of an existing note.
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Delete a note.
    Delete { id: String },
    /// Toggle the pin flag of a note.
    Pin { id: String },
    /// Delete every note (persists immediately).
    Clear,
    /// Flush the in-memory collection to storage right now.
    Sync,
    /// Show or set the theme preference (light, dark, system).
    Theme { mode: Option<String> },
    /// Sign in with the configured credentials.
    Login { username: String, password: String },
    /// Sign out and discard the session token.
    Logout,
    /// Summarize the local workspace.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => {
            let mut dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
            dir.push("jotter");
            dir
        }
    };
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let services = AppServicesBuilder::new(data_dir)
        .build()
        .await
        .inspect_err(|err| error!(error = %err, "service bootstrap failed"))?;

    run(&services, cli.command).await
}

async fn run(services: &AppServices, command: Command) -> Result<()> {
    match command {
        Command::Add {
            title,
            content,
            tag,
        } => {
            let note = services.add_note(&title, content, tag.as_deref())?;
            println!("created {}", note.id);
        }
        Command::New => {
            let note = services.create_blank_note()?;
            println!("created {}", note.id);
        }
        Command::List => {
            let notes = services.get_all_notes()?;
            if notes.is_empty() {
                println!("no notes yet");
            }
            for note in notes {
                print_note_line(&note);
            }
        }
        Command::Show { id } => {
            let id = parse_note_id(&id)?;
            match services.get_note_by_id(id)? {
                Some(note) => print_note_full(&note),
                None => bail!("no note with id {id}"),
            }
        }
        Command::Search { query } => {
            let hits = services.search_notes(&query)?;
            println!("{} match(es)", hits.len());
            for note in hits {
                print_note_line(&note);
            }
        }
        Command::Edit {
            id,
            title,
            content,
            tag,
        } => {
            let id = parse_note_id(&id)?;
            let update = NoteUpdate {
                title,
                content,
                tag,
                ..NoteUpdate::default()
            };
            if update.is_empty() {
                bail!("nothing to change; pass --title, --content or --tag");
            }
            match services.update_note(id, update)? {
                Some(note) => print_note_line(&note),
                None => bail!("no note with id {id}"),
            }
        }
        Command::Delete { id } => {
            let id = parse_note_id(&id)?;
            if services.delete_note(id)? {
                println!("deleted {id}");
            } else {
                println!("no note with id {id}");
            }
        }
        Command::Pin { id } => {
            let id = parse_note_id(&id)?;
            match services.toggle_pin_note(id)? {
                Some(note) => println!(
                    "{} is now {}",
                    note.id,
                    if note.is_pinned { "pinned" } else { "unpinned" }
                ),
                None => bail!("no note with id {id}"),
            }
        }
        Command::Clear => {
            if !services.clear_all_notes().await {
                bail!("failed to clear notes");
            }
            println!("all notes cleared");
        }
        Command::Sync => {
            if !services.force_sync_storage().await {
                bail!("failed to sync notes to storage");
            }
            println!("synced");
        }
        Command::Theme { mode } => match mode {
            None => println!("{}", services.theme_preference().as_str()),
            Some(raw) => {
                let Some(theme) = ThemePreference::parse(&raw) else {
                    bail!("unknown theme `{raw}`; expected light, dark or system");
                };
                services.set_theme_preference(theme).await?;
                println!("theme set to {}", theme.as_str());
            }
        },
        Command::Login { username, password } => {
            if services.sign_in(&username, &password).await? {
                println!("signed in");
            } else {
                bail!("invalid credentials");
            }
        }
        Command::Logout => {
            services.sign_out().await?;
            println!("signed out");
        }
        Command::Status => {
            let notes = services.get_all_notes()?;
            let pinned = notes.iter().filter(|note| note.is_pinned).count();
            println!(
                "{} note(s), {} pinned, theme {}, signed in: {}",
                notes.len(),
                pinned,
                services.theme_preference().as_str(),
                services.is_signed_in().await?
            );
        }
    }

    Ok(())
}

fn parse_note_id(raw: &str) -> Result<NoteId> {
    Uuid::parse_str(raw).with_context(|| format!("`{raw}` is not a note id"))
}

fn print_note_line(note: &Note) {
    println!(
        "{} {} [{}] {} ({})",
        note.id,
        if note.is_pinned { "*" } else { " " },
        note.tag,
        note.title,
        note.updated_at.format("%Y-%m-%d %H:%M")
    );
}

fn print_note_full(note: &Note) {
    print_note_line(note);
    println!("created {}", note.created_at.format("%Y-%m-%d %H:%M"));
    if !note.content.is_empty() {
        println!("{}", note.content);
    }
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "jotter.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_cli=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}
