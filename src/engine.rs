use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::{LruWindow, DEFAULT_LOOK_AHEAD, DEFAULT_MAX_CACHED};
use crate::codec;
use crate::command::{command_name, wants_help, Command};
use crate::entry::{BackupCursor, HistoryEntry};
use crate::jobs::{spawn_workers, Job, JobQueue, IO_WORKERS};
use crate::UndoError;

pub type SharedCommand = Arc<Mutex<dyn Command>>;

/// Tunables for the history engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    pub max_cached: usize, // must exceed 2 * look_ahead + 1
    pub look_ahead: usize,
    pub default_user: i32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_cached: DEFAULT_MAX_CACHED,
            look_ahead: DEFAULT_LOOK_AHEAD,
            default_user: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub index: usize,
    pub applied: bool,
    pub user_id: i32,
    pub timestamp: u64,
    pub command: String,
    pub cached: bool,
    pub saved: bool,
}

/// Ordered command history with a movable cursor and optional disk
/// persistence. A single foreground actor drives all mutating operations;
/// the engine is not safe for concurrent foreground use.
pub struct UndoEngine {
    history: Vec<Arc<HistoryEntry>>,
    cursor: usize,
    commands: HashMap<String, SharedCommand>,
    path: Option<PathBuf>,
    auto_load_save: bool,
    options: EngineOptions,
    lru: LruWindow,
    command_counter: u64,
    queue: Arc<JobQueue>,
    workers: Vec<JoinHandle<()>>,
    ready: bool,
}

impl UndoEngine {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let lru = LruWindow::new(options.max_cached, options.look_ahead);
        Self {
            history: Vec::new(),
            cursor: 0,
            commands: HashMap::new(),
            path: None,
            auto_load_save: false,
            options,
            lru,
            command_counter: 0,
            queue: Arc::new(JobQueue::new()),
            workers: Vec::new(),
            ready: false,
        }
    }

    // The name must equal the first whitespace-delimited token of every
    // command line executed through this command.
    pub fn register_command(&mut self, name: impl Into<String>, command: SharedCommand) {
        self.commands.insert(name.into(), command);
    }

    // With a history directory the worker pool starts and, when
    // auto_load_save is set, an existing manifest is loaded. Without one
    // the engine is memory-only and auto_load_save must be false.
    pub fn init(&mut self, path: Option<&Path>, auto_load_save: bool) -> crate::Result<()> {
        if self.ready {
            warn!("init called on a ready engine; ignored");
            return Ok(());
        }
        if self.options.max_cached <= self.options.look_ahead * 2 + 1 {
            return Err(UndoError::Configuration(format!(
                "max_cached ({}) must exceed 2 * look_ahead + 1 ({})",
                self.options.max_cached,
                self.options.look_ahead * 2 + 1
            )));
        }

        match path {
            None => {
                if auto_load_save {
                    return Err(UndoError::Configuration(
                        "auto load/save requires a history directory".to_string(),
                    ));
                }
                self.path = None;
            }
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                self.path = Some(dir.to_path_buf());
                self.auto_load_save = auto_load_save;
                self.workers = spawn_workers(&self.queue, dir.to_path_buf())?;
                info!(
                    "undo history at {} ({} I/O workers)",
                    dir.display(),
                    IO_WORKERS
                );
                if auto_load_save && codec::manifest_path(dir).exists() {
                    self.load_timestamps(None)?;
                }
            }
        }

        self.ready = true;
        Ok(())
    }

    /// Parses and runs a command line, recording it as a new history step.
    /// A negative `user_id` selects the engine's default user. On parse or
    /// redo failure nothing is recorded.
    pub fn execute(&mut self, line: &str, user_id: i32) -> crate::Result<()> {
        let name = command_name(line);
        let command = self
            .commands
            .get(name)
            .cloned()
            .ok_or_else(|| UndoError::UnknownCommand(name.to_string()))?;
        self.execute_with(&command, line, user_id)
    }

    pub fn execute_with(
        &mut self,
        command: &SharedCommand,
        line: &str,
        user_id: i32,
    ) -> crate::Result<()> {
        if !self.ready {
            return Err(UndoError::Configuration(
                "engine is not initialized".to_string(),
            ));
        }

        let mut guard = command
            .lock()
            .map_err(|e| UndoError::Lock(e.to_string()))?;
        guard.parse(line)?;

        if wants_help(line) {
            println!("{}", guard.help_text());
            return Ok(());
        }

        let user_id = if user_id < 0 {
            self.options.default_user
        } else {
            user_id
        };
        let timestamp = Utc::now().timestamp_millis() as u64 * 1000 + self.command_counter;
        self.command_counter += 1;

        let entry = Arc::new(HistoryEntry::new(user_id, timestamp, line));
        {
            let mut state = entry.lock()?;
            let mut cursor = BackupCursor::new(&mut state.blob);
            guard.backup(&mut cursor)?;
        }

        guard.redo()?;
        drop(guard);

        self.prune()?;
        self.history.push(Arc::clone(&entry));
        self.cursor += 1;

        if self.path.is_some() {
            self.queue.push(Job::SaveStep(Arc::clone(&entry)))?;
            self.lru.touch(entry);
            self.refresh_lru()?;
        }
        Ok(())
    }

    /// Steps the cursor back one entry and replays its pre-image. A cold
    /// entry is warmed synchronously on the calling thread first.
    pub fn undo(&mut self) -> &mut Self {
        if !self.ready || self.cursor == 0 {
            return self;
        }
        self.cursor -= 1;

        let entry = Arc::clone(&self.history[self.cursor]);
        let line = match entry.command() {
            Ok(line) => line,
            Err(e) => {
                error!("undo skipped: {}", e);
                self.cursor += 1;
                return self;
            }
        };
        let name = command_name(&line);
        let Some(command) = self.commands.get(name).cloned() else {
            error!("no command registered for history entry: {}", name);
            self.cursor += 1;
            return self;
        };

        if let Err(e) = self.replay_undo(&entry, &command) {
            error!("undo of step {} failed: {}", entry.timestamp(), e);
        }

        if self.path.is_some() {
            self.lru.touch(entry);
            if let Err(e) = self.refresh_lru() {
                error!("cache refresh failed: {}", e);
            }
        }
        self
    }

    // Re-executes the entry at the cursor and steps forward. The command
    // already succeeded once, so a failure here is swallowed and the
    // cursor stays put.
    pub fn redo(&mut self) -> &mut Self {
        if !self.ready || self.cursor >= self.history.len() {
            return self;
        }

        let entry = Arc::clone(&self.history[self.cursor]);
        let line = match entry.command() {
            Ok(line) => line,
            Err(e) => {
                error!("redo skipped: {}", e);
                return self;
            }
        };
        let name = command_name(&line);
        let Some(command) = self.commands.get(name).cloned() else {
            error!("no command registered for history entry: {}", name);
            return self;
        };

        if let Err(e) = self.replay_redo(&entry, &command, &line) {
            debug!("redo refused: {}", e);
            return self;
        }

        self.cursor += 1;
        if self.path.is_some() {
            self.lru.touch(entry);
            if let Err(e) = self.refresh_lru() {
                error!("cache refresh failed: {}", e);
            }
        }
        self
    }

    /// Writes the manifest for the applied prefix `history[0..cursor]`.
    /// Entries beyond the cursor are deliberately excluded: the manifest
    /// defines the future's history.
    pub fn save_timestamps(&self, file: Option<&Path>) -> crate::Result<()> {
        let dir = self.path.as_ref().ok_or_else(|| {
            UndoError::Configuration("timestamps require a persistent engine".to_string())
        })?;
        let target = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| codec::manifest_path(dir));

        let stamps: Vec<u64> = self.history[..self.cursor]
            .iter()
            .map(|entry| entry.timestamp())
            .collect();
        codec::write_manifest(&target, &stamps)?;
        debug!("saved {} timestamps to {}", stamps.len(), target.display());
        Ok(())
    }

    // Replaces the in-memory history with the manifest's contents, then
    // pre-warms the most recent steps so the next undos are fast.
    pub fn load_timestamps(&mut self, file: Option<&Path>) -> crate::Result<()> {
        let dir = self.path.clone().ok_or_else(|| {
            UndoError::Configuration("timestamps require a persistent engine".to_string())
        })?;
        let target = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| codec::manifest_path(&dir));

        self.queue.drain()?;
        self.history.clear();
        self.lru.clear();
        self.cursor = 0;

        let stamps = codec::read_manifest(&target)?;
        let mut seen = HashSet::with_capacity(stamps.len());
        for stamp in &stamps {
            if !seen.insert(*stamp) {
                return Err(UndoError::Manifest(format!(
                    "duplicate timestamp {} in manifest",
                    stamp
                )));
            }
        }

        for stamp in stamps {
            let entry = Arc::new(HistoryEntry::placeholder(stamp));
            self.queue.push(Job::LoadStepKey(Arc::clone(&entry)))?;
            self.history.push(entry);
        }
        self.cursor = self.history.len();
        self.queue.drain()?;

        let warm_from = self.cursor.saturating_sub(self.options.max_cached);
        for entry in &self.history[warm_from..self.cursor] {
            self.lru.touch(Arc::clone(entry));
            if !entry.is_cached()? && entry.is_saved()? {
                self.queue.push(Job::WarmStepCache(Arc::clone(entry)))?;
            }
        }

        info!(
            "loaded {} history steps from {}",
            self.cursor,
            target.display()
        );
        Ok(())
    }

    // Diagnostic: synthesizes a next-move suggestion from the most recent
    // step of the given user.
    pub fn suggest_next(&self, user_id: i32) -> crate::Result<String> {
        const FALLBACK: &str = "-Move 0 0";
        if self.cursor == 0 {
            return Ok(FALLBACK.to_string());
        }
        let state = self.history[self.cursor - 1].lock()?;
        if state.user_id != user_id || !state.command.contains("Move") {
            return Ok(FALLBACK.to_string());
        }
        let Some((_, rest)) = state.command.split_once("-T") else {
            return Ok(FALLBACK.to_string());
        };
        let mut args = rest.split_whitespace();
        Ok(match (
            args.next().and_then(|x| x.parse::<i32>().ok()),
            args.next().and_then(|y| y.parse::<i32>().ok()),
        ) {
            (Some(x), Some(y)) => format!("-Move -T {} {}", x + 10, y + 10),
            _ => FALLBACK.to_string(),
        })
    }

    pub fn display_history(&self) -> crate::Result<()> {
        println!("History:");
        for record in self.history_records()? {
            println!(
                "  [{:04}]-[{}] User:{} Time:{} {} {}",
                record.index,
                if record.applied { "U" } else { "R" },
                record.user_id,
                record.timestamp,
                record.command,
                if record.cached { "[Cached]" } else { "" }
            );
        }
        println!("Current Index: {}", self.cursor);
        Ok(())
    }

    pub fn history_records(&self) -> crate::Result<Vec<HistoryRecord>> {
        let mut records = Vec::with_capacity(self.history.len());
        for (index, entry) in self.history.iter().enumerate() {
            let state = entry.lock()?;
            records.push(HistoryRecord {
                index,
                applied: index < self.cursor,
                user_id: state.user_id,
                timestamp: entry.timestamp(),
                command: state.command.clone(),
                cached: !state.blob.is_empty(),
                saved: state.saved,
            });
        }
        Ok(records)
    }

    pub fn export_history(&self, output: &Path) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(&self.history_records()?)?;
        std::fs::write(output, json)?;
        Ok(())
    }

    /// Blocks until all queued I/O has completed.
    pub fn drain_io(&self) -> crate::Result<()> {
        if self.path.is_some() {
            self.queue.drain()?;
        }
        Ok(())
    }

    // Saves the manifest when auto load/save is on, then stops the worker
    // pool. Runs implicitly on drop.
    pub fn shutdown(&mut self) {
        if self.ready && self.auto_load_save && self.path.is_some() {
            if let Err(e) = self.save_timestamps(None) {
                error!("failed to save timestamps on shutdown: {}", e);
            }
        }
        if !self.workers.is_empty() {
            if let Err(e) = self.queue.shutdown() {
                error!("failed to signal I/O workers: {}", e);
            }
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
        self.ready = false;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn replay_undo(
        &self,
        entry: &Arc<HistoryEntry>,
        command: &SharedCommand,
    ) -> crate::Result<()> {
        if !entry.is_cached()? {
            if let Some(dir) = &self.path {
                Job::WarmStepCache(Arc::clone(entry)).run(dir)?;
            }
        }
        let mut guard = command
            .lock()
            .map_err(|e| UndoError::Lock(e.to_string()))?;
        let mut state = entry.lock()?;
        let mut cursor = BackupCursor::new(&mut state.blob);
        guard.undo(&mut cursor)
    }

    // Holds the entry lock across the re-parse and re-execute.
    fn replay_redo(
        &self,
        entry: &Arc<HistoryEntry>,
        command: &SharedCommand,
        line: &str,
    ) -> crate::Result<()> {
        let mut guard = command
            .lock()
            .map_err(|e| UndoError::Lock(e.to_string()))?;
        let _state = entry.lock()?;
        guard.parse(line)?;
        guard.redo()
    }

    fn refresh_lru(&mut self) -> crate::Result<()> {
        self.lru.refresh(&self.history, self.cursor, &self.queue)
    }

    // Truncate-on-branch: drops every entry at or past the cursor. In
    // persistent mode their step files are removed by a queued job; a
    // memory-only engine has no files to remove.
    fn prune(&mut self) -> crate::Result<()> {
        if self.cursor >= self.history.len() {
            return Ok(());
        }
        let stamps: Vec<u64> = self.history[self.cursor..]
            .iter()
            .map(|entry| entry.timestamp())
            .collect();
        if self.path.is_some() {
            self.queue.push(Job::DeleteSteps(stamps))?;
        }
        self.history.truncate(self.cursor);
        Ok(())
    }
}

impl Default for UndoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UndoEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{move_line, CursorState, MoveCommand};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn new_engine(state: &Arc<Mutex<CursorState>>) -> UndoEngine {
        let mut engine = UndoEngine::new();
        MoveCommand::register(&mut engine, Arc::clone(state));
        engine
    }

    fn position(state: &Arc<Mutex<CursorState>>) -> (i32, i32) {
        let state = state.lock().unwrap();
        (state.x, state.y)
    }

    #[test]
    fn test_memory_only_execute_undo_redo() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(None, false).unwrap();

        engine.execute("-Move -T 10 20", 1).unwrap();
        assert_eq!(position(&state), (10, 20));
        assert_eq!(engine.history_len(), 1);
        assert_eq!(engine.cursor(), 1);

        engine.undo();
        assert_eq!(position(&state), (0, 0));
        assert_eq!(engine.cursor(), 0);

        engine.redo();
        assert_eq!(position(&state), (10, 20));
        assert_eq!(engine.cursor(), 1);
    }

    #[test]
    fn test_undo_and_redo_are_noops_at_bounds() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(None, false).unwrap();

        engine.undo().redo();
        assert_eq!(engine.cursor(), 0);

        engine.execute(&move_line(5, 5), -1).unwrap();
        engine.redo();
        assert_eq!(engine.cursor(), 1);
        engine.undo().undo().undo();
        assert_eq!(engine.cursor(), 0);
        assert_eq!(position(&state), (0, 0));
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(None, false).unwrap();

        for i in 0..50 {
            engine.execute(&move_line(i, i), 1).unwrap();
        }
        let records = engine.history_records().unwrap();
        for pair in records.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn test_parse_failure_leaves_history_unchanged() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(None, false).unwrap();

        let err = engine.execute("-Move -T 10", 1).unwrap_err();
        assert!(matches!(err, UndoError::Parse(_)));
        assert_eq!(engine.history_len(), 0);
        assert_eq!(position(&state), (0, 0));

        let err = engine.execute("-Jump -T 1 2", 1).unwrap_err();
        assert!(matches!(err, UndoError::UnknownCommand(_)));
        assert_eq!(engine.history_len(), 0);
    }

    #[test]
    fn test_help_flag_records_no_step() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(None, false).unwrap();

        engine.execute("-Move -h", 1).unwrap();
        assert_eq!(engine.history_len(), 0);
        assert_eq!(position(&state), (0, 0));
    }

    #[test]
    fn test_execute_before_init_is_rejected() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        let err = engine.execute(&move_line(1, 1), 1).unwrap_err();
        assert!(matches!(err, UndoError::Configuration(_)));
    }

    #[test]
    fn test_init_rejects_auto_save_without_path() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        assert!(engine.init(None, true).is_err());
    }

    #[test]
    fn test_init_rejects_undersized_cache() {
        let mut engine = UndoEngine::with_options(EngineOptions {
            max_cached: 5,
            look_ahead: 2,
            ..EngineOptions::default()
        });
        assert!(engine.init(None, false).is_err());
    }

    #[test]
    fn test_truncate_on_branch_memory_only() {
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(None, false).unwrap();

        for i in 0..3 {
            engine.execute(&move_line(i, i), 1).unwrap();
        }
        engine.undo().undo();
        assert_eq!(engine.cursor(), 1);

        engine.execute(&move_line(100, 100), 1).unwrap();
        assert_eq!(engine.history_len(), 2);
        assert_eq!(engine.cursor(), 2);
        assert_eq!(position(&state), (100, 100));
    }

    #[test]
    fn test_persistent_session_with_suggestion() {
        let tmp_dir = TempDir::new().unwrap();
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(Some(tmp_dir.path()), true).unwrap();

        engine.execute(&move_line(10, 20), 1).unwrap();
        engine.execute(&move_line(20, 30), 1).unwrap();
        engine.execute(&move_line(30, 40), 1).unwrap();

        engine.undo();
        assert_eq!(position(&state), (20, 30));
        assert_eq!(engine.cursor(), 2);

        engine.redo();
        assert_eq!(position(&state), (30, 40));
        assert_eq!(engine.cursor(), 3);

        assert_eq!(engine.suggest_next(1).unwrap(), "-Move -T 40 50");
        // A different user gets the fallback.
        assert_eq!(engine.suggest_next(2).unwrap(), "-Move 0 0");
    }

    #[test]
    fn test_manifest_covers_applied_prefix_only() {
        let tmp_dir = TempDir::new().unwrap();
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(Some(tmp_dir.path()), false).unwrap();

        for i in 0..3 {
            engine.execute(&move_line(i, i), 1).unwrap();
        }
        engine.undo();
        engine.save_timestamps(None).unwrap();

        let stamps = codec::read_manifest(&codec::manifest_path(tmp_dir.path())).unwrap();
        assert_eq!(stamps.len(), 2);
        let records = engine.history_records().unwrap();
        assert_eq!(stamps[0], records[0].timestamp);
        assert_eq!(stamps[1], records[1].timestamp);
    }

    #[test]
    fn test_duplicate_manifest_timestamps_are_rejected() {
        let tmp_dir = TempDir::new().unwrap();
        codec::write_manifest(&codec::manifest_path(tmp_dir.path()), &[5, 5]).unwrap();

        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        let err = engine.init(Some(tmp_dir.path()), true).unwrap_err();
        assert!(matches!(err, UndoError::Manifest(_)));
    }

    #[test]
    fn test_missing_manifest_on_init_is_empty_history() {
        let tmp_dir = TempDir::new().unwrap();
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(Some(tmp_dir.path()), true).unwrap();
        assert_eq!(engine.history_len(), 0);
        // An explicit load of the missing manifest is surfaced.
        assert!(engine.load_timestamps(None).is_err());
    }

    #[test]
    fn test_stress_persist_reload_and_branch() {
        let tmp_dir = TempDir::new().unwrap();
        let state = Arc::new(Mutex::new(CursorState::default()));

        // First instance: build initial state, undo into the middle, save.
        {
            let mut engine = new_engine(&state);
            engine.init(Some(tmp_dir.path()), false).unwrap();

            for i in 0..500 {
                engine.execute(&move_line(i, i), -1).unwrap();
            }
            assert_eq!(engine.history_len(), 500);
            assert_eq!(engine.cursor(), 500);
            assert_eq!(position(&state), (499, 499));

            for _ in 0..100 {
                engine.undo();
            }
            assert_eq!(engine.cursor(), 400);
            assert_eq!(position(&state), (399, 399));

            engine.save_timestamps(None).unwrap();
        }

        // Second instance: loads prior history, continues work.
        let mut engine = new_engine(&state);
        engine.init(Some(tmp_dir.path()), true).unwrap();
        assert_eq!(engine.history_len(), 400);
        assert_eq!(engine.cursor(), 400);
        assert_eq!(position(&state), (399, 399));

        for i in 0..50 {
            engine.execute(&move_line(1000 + i, 1000 + i), -1).unwrap();
        }
        assert_eq!(engine.history_len(), 450);
        assert_eq!(engine.cursor(), 450);
        assert_eq!(position(&state), (1049, 1049));

        for _ in 0..20 {
            engine.undo();
        }
        assert_eq!(engine.cursor(), 430);
        assert_eq!(position(&state), (1029, 1029));

        // Make sure the doomed tail is on disk before branching over it.
        engine.drain_io().unwrap();
        let doomed: Vec<u64> = engine.history[430..450]
            .iter()
            .map(|entry| entry.timestamp())
            .collect();
        for stamp in &doomed {
            assert!(codec::step_path(tmp_dir.path(), *stamp).exists());
        }

        for i in 0..10 {
            engine.execute(&move_line(2000 + i, 2000 + i), -1).unwrap();
        }
        assert_eq!(engine.history_len(), 440);
        assert_eq!(engine.cursor(), 440);
        assert_eq!(position(&state), (2009, 2009));

        engine.drain_io().unwrap();
        for stamp in &doomed {
            assert!(!codec::step_path(tmp_dir.path(), *stamp).exists());
        }

        // Applied, saved entries all have their step files.
        for record in engine.history_records().unwrap() {
            if record.saved {
                assert!(codec::step_path(tmp_dir.path(), record.timestamp).exists());
            }
        }
    }

    #[test]
    fn test_reload_restores_commands_and_blobs() {
        let tmp_dir = TempDir::new().unwrap();
        let state = Arc::new(Mutex::new(CursorState::default()));

        let before;
        let blobs_before: Vec<Vec<u8>>;
        {
            let mut engine = new_engine(&state);
            engine.init(Some(tmp_dir.path()), true).unwrap();
            for i in 0..5 {
                engine.execute(&move_line(i * 10, i * 10), 2).unwrap();
            }
            before = engine.history_records().unwrap();
            blobs_before = engine
                .history
                .iter()
                .map(|entry| entry.lock().unwrap().blob.clone())
                .collect();
            // Auto load/save: drop writes the manifest and flushes saves.
        }

        let mut engine = new_engine(&state);
        engine.init(Some(tmp_dir.path()), true).unwrap();
        engine.drain_io().unwrap();

        let after = engine.history_records().unwrap();
        assert_eq!(after.len(), before.len());
        for (a, b) in after.iter().zip(before.iter()) {
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.command, b.command);
            assert_eq!(a.user_id, b.user_id);
        }
        // Warmed blobs match the originals byte for byte.
        for (entry, blob) in engine.history.iter().zip(blobs_before.iter()) {
            assert_eq!(&entry.lock().unwrap().blob, blob);
        }

        // Undo walks back through warmed blobs to the origin.
        for _ in 0..5 {
            engine.undo();
        }
        assert_eq!(engine.cursor(), 0);
        assert_eq!(position(&state), (0, 0));
    }

    #[test]
    fn test_lru_stays_bounded_with_small_cache() {
        let tmp_dir = TempDir::new().unwrap();
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = UndoEngine::with_options(EngineOptions {
            max_cached: 10,
            look_ahead: 3,
            ..EngineOptions::default()
        });
        MoveCommand::register(&mut engine, Arc::clone(&state));
        engine.init(Some(tmp_dir.path()), false).unwrap();

        for i in 0..100 {
            engine.execute(&move_line(i, i), 1).unwrap();
            assert!(engine.lru_len() <= 10);
        }

        engine.drain_io().unwrap();
        // The look-ahead window behind the cursor is resident.
        for entry in &engine.history[97..100] {
            assert!(entry.is_cached().unwrap());
        }

        // An unsaved entry must never lose its blob to eviction.
        for record in engine.history_records().unwrap() {
            if !record.saved {
                assert!(record.cached);
            }
        }
    }

    struct FlakyCommand {
        fail_redo: Arc<AtomicBool>,
        undo_calls: Arc<AtomicUsize>,
    }

    impl Command for FlakyCommand {
        fn help_text(&self) -> &str {
            "Fails on demand"
        }

        fn parse(&mut self, _line: &str) -> crate::Result<()> {
            Ok(())
        }

        fn redo(&mut self) -> crate::Result<()> {
            if self.fail_redo.load(Ordering::SeqCst) {
                return Err(UndoError::Command("refused".to_string()));
            }
            Ok(())
        }

        fn backup(&mut self, cursor: &mut BackupCursor<'_>) -> crate::Result<()> {
            cursor.write_u32(0xC0FFEE);
            Ok(())
        }

        fn undo(&mut self, cursor: &mut BackupCursor<'_>) -> crate::Result<()> {
            assert_eq!(cursor.read_u32()?, 0xC0FFEE);
            self.undo_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_redo_failure_semantics() {
        let fail_redo = Arc::new(AtomicBool::new(false));
        let undo_calls = Arc::new(AtomicUsize::new(0));
        let command: SharedCommand = Arc::new(Mutex::new(FlakyCommand {
            fail_redo: Arc::clone(&fail_redo),
            undo_calls: Arc::clone(&undo_calls),
        }));

        let mut engine = UndoEngine::new();
        engine.register_command("-Flaky", Arc::clone(&command));
        engine.init(None, false).unwrap();

        // Execute: redo failure discards the entry.
        fail_redo.store(true, Ordering::SeqCst);
        assert!(engine.execute("-Flaky", 1).is_err());
        assert_eq!(engine.history_len(), 0);

        fail_redo.store(false, Ordering::SeqCst);
        engine.execute("-Flaky", 1).unwrap();
        engine.undo();
        assert_eq!(undo_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cursor(), 0);

        // Redo: failure is swallowed and the cursor stays put.
        fail_redo.store(true, Ordering::SeqCst);
        engine.redo();
        assert_eq!(engine.cursor(), 0);

        fail_redo.store(false, Ordering::SeqCst);
        engine.redo();
        assert_eq!(engine.cursor(), 1);
    }

    #[test]
    fn test_export_history_writes_json() {
        let tmp_dir = TempDir::new().unwrap();
        let state = Arc::new(Mutex::new(CursorState::default()));
        let mut engine = new_engine(&state);
        engine.init(None, false).unwrap();
        engine.execute(&move_line(1, 2), 1).unwrap();

        let out = tmp_dir.path().join("history.json");
        engine.export_history(&out).unwrap();

        let json = std::fs::read_to_string(&out).unwrap();
        let records: Vec<HistoryRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, move_line(1, 2));
        assert!(records[0].applied);
    }
}
