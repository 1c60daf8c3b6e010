//! ALFA KDBX - CLI
//!
//! Works on inner XML documents. The inner stream key of each document lives
//! next to it in a key file (`algorithm:hex`) and is replaced on every save.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;

use alfa_kdbx::tree::{NOTES, URL};
use alfa_kdbx::{Database, DatabaseConfig, Group, InnerStreamKey, SecretValue};

#[derive(Parser)]
#[command(name = "alfa-kdbx")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_kdbx::VERSION)]
#[command(about = "ALFA KDBX - KeePass inner document store")]
struct Cli {
    /// Inner XML document
    #[arg(short, long, default_value = "./vault.xml")]
    document: PathBuf,

    /// Inner stream key file (defaults to <document>.key)
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty document
    New {
        /// Database name stored in Meta
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the group tree with entry titles
    List,

    /// Show one entry
    Show {
        title: String,

        #[arg(short, long)]
        user: Option<String>,

        /// Group path below the root, e.g. Email/Work
        #[arg(short, long)]
        group: Option<String>,

        /// Print the password instead of masking it
        #[arg(long)]
        reveal: bool,
    },

    /// Create or update an entry, then save
    Set {
        title: String,

        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        group: Option<String>,

        #[arg(short, long)]
        password: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Save under a fresh inner stream key without other changes
    Rekey,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => DatabaseConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => DatabaseConfig::default(),
    };
    let key_file = cli
        .key_file
        .clone()
        .unwrap_or_else(|| key_path_for(&cli.document));

    match cli.command {
        Commands::New { name } => {
            if cli.document.exists() {
                bail!("{} already exists", cli.document.display());
            }
            let db = Database::with_config(config)?;
            if let Some(name) = name {
                db.set_database_name(&name)?;
            }
            store(&db, &cli.document, &key_file)?;
            println!("✅ Document created at: {}", cli.document.display());
            println!("🔑 Inner stream key: {}", key_file.display());
        }

        Commands::List => {
            let db = open(&cli.document, &key_file, config)?;
            let name = db.database_name();
            if !name.is_empty() {
                println!("📒 {}", name);
            }
            print_group(&db.root_group(), 0)?;
        }

        Commands::Show {
            title,
            user,
            group,
            reveal,
        } => {
            let db = open(&cli.document, &key_file, config)?;
            let group = find_group(&db, group.as_deref())?;
            let Some(entry) = group.find_entry(&title, user.as_deref())? else {
                bail!("no entry '{}' in group '{}'", title, group.name());
            };

            println!("{:-<40}", "");
            println!("Title:     {}", entry.title()?.unwrap_or_default());
            println!("UserName:  {}", entry.user_name()?.unwrap_or_default());
            match entry.get_secret()? {
                Some(secret) if reveal => {
                    println!("Password:  {}", secret.get(false)?.expose_secret());
                }
                Some(_) => println!("Password:  ********"),
                None => println!("Password:  -"),
            }
            for name in [URL, NOTES] {
                if let Ok(Some(value)) = entry.get_plain(name) {
                    println!("{:<10} {}", format!("{}:", name), value);
                }
            }
            let times = entry.times();
            if let Some(modified) = times.modified {
                println!("Modified:  {}", modified.to_rfc3339());
            }
            if times.is_expired() {
                println!("⚠️ Entry has expired");
            }
        }

        Commands::Set {
            title,
            user,
            group,
            password,
            url,
            notes,
        } => {
            let db = open(&cli.document, &key_file, config)?;
            let mut target = db.root_group();
            if let Some(path) = group.as_deref() {
                for name in path.split('/').filter(|s| !s.is_empty()) {
                    target = target.get_or_create_group(name)?;
                }
            }

            let entry = target.get_or_create_entry(&title, user.as_deref())?;
            if let Some(password) = password {
                entry.set_secret(Some(&password))?;
            }
            if let Some(url) = url {
                entry.set_plain(URL, &url)?;
            }
            if let Some(notes) = notes {
                entry.set_plain(NOTES, &notes)?;
            }

            if db.is_dirty() {
                store(&db, &cli.document, &key_file)?;
                println!("✅ Entry '{}' saved", title);
            } else {
                println!("Nothing changed");
            }
        }

        Commands::Rekey => {
            let db = open(&cli.document, &key_file, config)?;
            let saved = store(&db, &cli.document, &key_file)?;
            println!("🔄 Re-keyed {} protected values", saved);
        }
    }

    Ok(())
}

fn key_path_for(document: &Path) -> PathBuf {
    let mut name = document.as_os_str().to_owned();
    name.push(".key");
    PathBuf::from(name)
}

fn open(document: &Path, key_file: &Path, config: DatabaseConfig) -> Result<Database> {
    let xml = std::fs::read(document)
        .with_context(|| format!("reading {}", document.display()))?;
    let encoded = std::fs::read_to_string(key_file)
        .with_context(|| format!("reading key file {}", key_file.display()))?;
    let key: InnerStreamKey = encoded.parse()?;
    Ok(Database::load_with_config(&xml, &key, config)?)
}

/// Save, then write document and key; returns the number of protected values
fn store(db: &Database, document: &Path, key_file: &Path) -> Result<usize> {
    let saved = db.save()?;
    std::fs::write(document, &saved.xml)
        .with_context(|| format!("writing {}", document.display()))?;
    std::fs::write(key_file, saved.stream_key.to_encoded().as_bytes())
        .with_context(|| format!("writing key file {}", key_file.display()))?;
    db.set_dirty(false);
    Ok(saved.protected_fields)
}

fn find_group(db: &Database, path: Option<&str>) -> Result<Group> {
    let mut group = db.root_group();
    for name in path.unwrap_or("").split('/').filter(|s| !s.is_empty()) {
        group = match group.get_group(name) {
            Some(child) => child,
            None => bail!("no group '{}' under '{}'", name, group.name()),
        };
    }
    Ok(group)
}

fn print_group(group: &Group, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    println!("{}📁 {}", indent, group.name());
    for entry in group.entries() {
        let title = entry.title()?.unwrap_or_default();
        match entry.user_name()? {
            Some(user) if !user.is_empty() => println!("{}  🔑 {} ({})", indent, title, user),
            _ => println!("{}  🔑 {}", indent, title),
        }
    }
    for child in group.groups() {
        print_group(&child, depth + 1)?;
    }
    Ok(())
}
