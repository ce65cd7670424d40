use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use crossterm::{
    style::{Color, Print, ResetColor, SetForegroundColor},
    ExecutableCommand,
};
use rewind::demo::{move_line, position, CursorState, MoveCommand};
use rewind::{EngineOptions, HistoryRecord, UndoEngine};
use tracing::info;

#[derive(Parser)]
#[command(name = "rewind")]
#[command(about = "Your command history is not just a log. It's a time machine.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Maximum number of cached steps
    #[arg(long)]
    max_cached: Option<usize>,

    /// Prefetch radius around the cursor
    #[arg(long)]
    look_ahead: Option<usize>,

    /// Default user id for steps executed without one
    #[arg(long)]
    user: Option<i32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scripted cursor-move demo
    Demo {
        /// History directory; omit for a memory-only run
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Run the 500-step stress cycle with a save/reload in the middle
    Stress {
        /// History directory
        path: PathBuf,
    },
    /// Load a history directory and display it
    History {
        /// History directory
        path: PathBuf,
    },
    /// Export a history directory as JSON
    Export {
        /// History directory
        path: PathBuf,
        /// Output file path
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut options = EngineOptions::default();
    if let Some(max_cached) = cli.max_cached {
        options.max_cached = max_cached;
    }
    if let Some(look_ahead) = cli.look_ahead {
        options.look_ahead = look_ahead;
    }
    if let Some(user) = cli.user {
        options.default_user = user;
    }

    match cli.command {
        Commands::Demo { path } => run_demo(path.as_deref(), options),
        Commands::Stress { path } => run_stress(&path, options),
        Commands::History { path } => show_history(&path, options),
        Commands::Export { path, output } => export_history(&path, &output, options),
    }
}

fn run_demo(path: Option<&std::path::Path>, options: EngineOptions) -> Result<()> {
    info!("🎬 Starting undo demo...");

    let state = Arc::new(Mutex::new(CursorState::default()));
    let mut engine = UndoEngine::with_options(options);
    MoveCommand::register(&mut engine, Arc::clone(&state));
    engine.init(path, path.is_some())?;

    engine.execute(&move_line(10, 20), 1)?;
    engine.execute(&move_line(20, 30), 2)?;
    engine.execute(&move_line(30, 40), 1)?;
    engine.display_history()?;

    engine.undo();
    println!("After undo: {:?}", position(&state)?);
    engine.display_history()?;

    engine.redo();
    println!("After redo: {:?}", position(&state)?);
    engine.display_history()?;

    println!("Suggestion for User 1: {}", engine.suggest_next(1)?);
    Ok(())
}

fn run_stress(path: &std::path::Path, options: EngineOptions) -> Result<()> {
    info!("🏋️ Running stress cycle at {}...", path.display());

    let state = Arc::new(Mutex::new(CursorState::default()));

    // First instance: no prior history, build initial state.
    {
        let mut engine = UndoEngine::with_options(options.clone());
        MoveCommand::register(&mut engine, Arc::clone(&state));
        engine.init(Some(path), false)?;

        for i in 0..500 {
            engine.execute(&move_line(i, i), -1)?;
        }
        println!("After 500 commands: {:?}", position(&state)?);

        for _ in 0..100 {
            engine.undo();
        }
        println!("After 100 undos: {:?}", position(&state)?);

        engine.save_timestamps(None)?;
    }

    // Second instance: loads prior history, continues work.
    let mut engine = UndoEngine::with_options(options);
    MoveCommand::register(&mut engine, Arc::clone(&state));
    engine.init(Some(path), true)?;
    println!(
        "After reload: {} steps, cursor {}",
        engine.history_len(),
        engine.cursor()
    );

    for i in 0..50 {
        engine.execute(&move_line(1000 + i, 1000 + i), -1)?;
    }
    for _ in 0..20 {
        engine.undo();
    }
    for i in 0..10 {
        engine.execute(&move_line(2000 + i, 2000 + i), -1)?;
    }
    engine.drain_io()?;

    println!(
        "After mid-stack inserts: {} steps, cursor {}, state {:?}",
        engine.history_len(),
        engine.cursor(),
        position(&state)?
    );
    println!("Suggestion for User 1: {}", engine.suggest_next(1)?);
    Ok(())
}

fn show_history(path: &std::path::Path, options: EngineOptions) -> Result<()> {
    let mut engine = UndoEngine::with_options(options);
    engine.init(Some(path), true)?;
    engine.drain_io()?;

    let records = engine.history_records()?;
    println!("🕰️  History at {}:", path.display());
    for record in &records {
        display_record(record)?;
    }
    println!("Current Index: {}", engine.cursor());
    Ok(())
}

fn display_record(record: &HistoryRecord) -> Result<()> {
    let mut stdout = std::io::stdout();

    stdout.execute(SetForegroundColor(Color::Cyan))?;
    stdout.execute(Print(format!("[{:04}] ", record.index)))?;
    stdout.execute(ResetColor)?;

    if record.applied {
        stdout.execute(SetForegroundColor(Color::Green))?;
        stdout.execute(Print("U "))?;
    } else {
        stdout.execute(SetForegroundColor(Color::DarkGrey))?;
        stdout.execute(Print("R "))?;
    }
    stdout.execute(ResetColor)?;

    stdout.execute(SetForegroundColor(Color::Yellow))?;
    stdout.execute(Print(format!("User:{} Time:{} ", record.user_id, record.timestamp)))?;
    stdout.execute(ResetColor)?;

    stdout.execute(Print(&record.command))?;
    if record.cached {
        stdout.execute(SetForegroundColor(Color::DarkGrey))?;
        stdout.execute(Print(" [Cached]"))?;
        stdout.execute(ResetColor)?;
    }
    stdout.execute(Print("\n"))?;
    Ok(())
}

fn export_history(
    path: &std::path::Path,
    output: &std::path::Path,
    options: EngineOptions,
) -> Result<()> {
    let mut engine = UndoEngine::with_options(options);
    engine.init(Some(path), true)?;
    engine.drain_io()?;
    engine.export_history(output)?;
    println!("Exported {} steps to {}", engine.history_len(), output.display());
    Ok(())
}
