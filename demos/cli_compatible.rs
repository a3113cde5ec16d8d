/*!
Sketch of how an external CLI binary would drive this crate: `clap`
subcommands that call straight through to `Engine`/`registry`/`wait`
rather than reimplementing any of the planning or execution logic.

Run with: `cargo run --example cli_compatible --features d-sqlite -- up`
*/
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use sqlmigrate::driver::DriverConfig;
use sqlmigrate::engine::{self, Engine, EngineConfig, StatusLine};
use sqlmigrate::fs::RealFs;

#[derive(Parser)]
#[command(name = "sqlmigrate", about = "Framework-independent database migrations")]
struct Cli {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, default_value = "db/migrations")]
    migrations_dir: PathBuf,

    #[arg(long, default_value = "schema_migrations")]
    migrations_table: String,

    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply all pending migrations.
    Up,
    /// Roll back the most recently applied migration.
    Down,
    /// Print applied/pending status.
    Status,
    /// Scaffold a new migration file.
    New { name: String },
    /// Wait for the database to accept connections.
    Wait {
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
}

fn run() -> sqlmigrate::errors::Result<()> {
    let cli = Cli::parse();
    sqlmigrate::drivers::register_builtin();

    let config = DriverConfig {
        database_url: cli.database_url.clone(),
        migrations_table: cli.migrations_table.clone(),
    };
    let url = sqlmigrate::dburl::DatabaseUrl::parse(&cli.database_url)?;
    let driver = sqlmigrate::registry::resolve(url.scheme())?(&config)?;

    if let Command::Wait { timeout_secs } = cli.command {
        return sqlmigrate::wait::wait_for(&*driver, Duration::from_secs(timeout_secs));
    }

    let fs = RealFs;
    let mut engine_config = EngineConfig::new().migrations_table(cli.migrations_table.clone()).strict(cli.strict);
    engine_config.migrations_dirs = vec![cli.migrations_dir.clone()];
    let engine = Engine::new(engine_config, &*driver, &fs);
    engine.ensure_migrations_table()?;

    match cli.command {
        Command::Up => {
            let applied = engine.apply()?;
            for version in applied {
                println!("applied {}", version);
            }
        }
        Command::Down => {
            let version = engine.rollback()?;
            println!("rolled back {}", version);
        }
        Command::Status => {
            let report = engine.status()?;
            for line in report.lines {
                match line {
                    StatusLine::Applied(v) => println!("up\t{}", v),
                    StatusLine::AppliedFileMissing(v) => println!("up\t{}\t(file missing)", v),
                    StatusLine::Pending(v) => println!("down\t{}", v),
                }
            }
        }
        Command::New { name } => {
            let filename = engine::new_migration_filename(chrono::Utc::now(), &name);
            let path = engine::write_new_migration(&cli.migrations_dir, &filename)?;
            println!("wrote {:?}", path);
        }
        Command::Wait { .. } => unreachable!("handled above"),
    }
    Ok(())
}

pub fn main() {
    env_logger::init();
    if let Err(e) = run() {
        // Per spec, the single-line user-visible error must never carry an
        // unredacted password, even when the error was built from a raw
        // `--url`/`DATABASE_URL` value (e.g. a connectivity failure whose
        // underlying driver error echoes the connection string back).
        eprintln!("Error: {}", sqlmigrate::dburl::redact(&e.to_string()));
        std::process::exit(1);
    }
}
