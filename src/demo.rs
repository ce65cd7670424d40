use std::sync::{Arc, Mutex};

use crate::command::Command;
use crate::engine::{SharedCommand, UndoEngine};
use crate::entry::BackupCursor;
use crate::UndoError;

pub const MOVE_COMMAND: &str = "-Move";

/// The application state the demo command operates on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
}

// Formats the command line that moves the cursor to (x, y).
pub fn move_line(x: i32, y: i32) -> String {
    format!("{} -T {} {}", MOVE_COMMAND, x, y)
}

pub fn position(state: &Arc<Mutex<CursorState>>) -> crate::Result<CursorState> {
    Ok(*state.lock().map_err(|e| UndoError::Lock(e.to_string()))?)
}

/// Example command: moves the cursor on a 2D plane, backing up the
/// pre-image position.
pub struct MoveCommand {
    state: Arc<Mutex<CursorState>>,
    target: Option<(i32, i32)>,
}

impl MoveCommand {
    pub fn new(state: Arc<Mutex<CursorState>>) -> Self {
        Self {
            state,
            target: None,
        }
    }

    pub fn register(engine: &mut UndoEngine, state: Arc<Mutex<CursorState>>) -> SharedCommand {
        let command: SharedCommand = Arc::new(Mutex::new(Self::new(state)));
        engine.register_command(MOVE_COMMAND, Arc::clone(&command));
        command
    }

    fn state(&self) -> crate::Result<std::sync::MutexGuard<'_, CursorState>> {
        self.state
            .lock()
            .map_err(|e| UndoError::Lock(e.to_string()))
    }
}

impl Command for MoveCommand {
    fn help_text(&self) -> &str {
        "Move the cursor to a new position\n  -T <x> <y>  Translate to X, Y position in abs values"
    }

    fn parse(&mut self, line: &str) -> crate::Result<()> {
        self.target = None;

        let mut tokens = line.split_whitespace();
        tokens.next(); // command name

        while let Some(token) = tokens.next() {
            match token {
                "-h" | "--h" => return Ok(()),
                "-T" => {
                    let x = tokens
                        .next()
                        .ok_or_else(|| UndoError::Parse("-T expects two arguments".to_string()))?
                        .parse::<i32>()
                        .map_err(|e| UndoError::Parse(format!("invalid X argument: {}", e)))?;
                    let y = tokens
                        .next()
                        .ok_or_else(|| UndoError::Parse("-T expects two arguments".to_string()))?
                        .parse::<i32>()
                        .map_err(|e| UndoError::Parse(format!("invalid Y argument: {}", e)))?;
                    self.target = Some((x, y));
                }
                other => {
                    return Err(UndoError::Parse(format!("unknown option: {}", other)));
                }
            }
        }
        Ok(())
    }

    fn redo(&mut self) -> crate::Result<()> {
        let (x, y) = self
            .target
            .ok_or_else(|| UndoError::Command("Expecting -T x y but found nothing".to_string()))?;
        let mut state = self.state()?;
        state.x = x;
        state.y = y;
        Ok(())
    }

    fn backup(&mut self, cursor: &mut BackupCursor<'_>) -> crate::Result<()> {
        let state = self.state()?;
        cursor.write_i32(state.x);
        cursor.write_i32(state.y);
        Ok(())
    }

    fn undo(&mut self, cursor: &mut BackupCursor<'_>) -> crate::Result<()> {
        let x = cursor.read_i32()?;
        let y = cursor.read_i32()?;
        let mut state = self.state()?;
        state.x = x;
        state.y = y;
        Ok(())
    }
}
