use std::sync::{Mutex, MutexGuard};

use crate::UndoError;

#[derive(Debug, Default)]
pub struct EntryState {
    pub user_id: i32,
    pub command: String,
    pub blob: Vec<u8>,
    pub saved: bool,
}

/// One recorded command execution with its pre-image backup. The timestamp
/// names the step file on disk and never changes after construction.
#[derive(Debug)]
pub struct HistoryEntry {
    timestamp: u64,
    state: Mutex<EntryState>,
}

impl HistoryEntry {
    pub fn new(user_id: i32, timestamp: u64, command: impl Into<String>) -> Self {
        Self {
            timestamp,
            state: Mutex::new(EntryState {
                user_id,
                command: command.into(),
                blob: Vec::new(),
                saved: false,
            }),
        }
    }

    // Reconstructed from the manifest; key data and the blob arrive later
    // via I/O jobs.
    pub fn placeholder(timestamp: u64) -> Self {
        Self {
            timestamp,
            state: Mutex::new(EntryState {
                saved: true,
                ..EntryState::default()
            }),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn lock(&self) -> crate::Result<MutexGuard<'_, EntryState>> {
        self.state
            .lock()
            .map_err(|e| UndoError::Lock(e.to_string()))
    }

    pub fn command(&self) -> crate::Result<String> {
        Ok(self.lock()?.command.clone())
    }

    pub fn user_id(&self) -> crate::Result<i32> {
        Ok(self.lock()?.user_id)
    }

    pub fn is_cached(&self) -> crate::Result<bool> {
        Ok(!self.lock()?.blob.is_empty())
    }

    pub fn is_saved(&self) -> crate::Result<bool> {
        Ok(self.lock()?.saved)
    }
}

/// Sequential read/write head over a single entry's backup blob. Writes
/// insert at the offset and advance; reads copy out and advance. Undo must
/// read back what backup wrote, in the same order.
pub struct BackupCursor<'a> {
    blob: &'a mut Vec<u8>,
    offset: usize,
}

impl<'a> BackupCursor<'a> {
    pub fn new(blob: &'a mut Vec<u8>) -> Self {
        Self { blob, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.blob
            .splice(self.offset..self.offset, data.iter().copied());
        self.offset += data.len();
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> crate::Result<()> {
        let end = self.offset + out.len();
        if end > self.blob.len() {
            return Err(UndoError::BackupData(format!(
                "read of {} bytes at offset {} exceeds blob of {} bytes",
                out.len(),
                self.offset,
                self.blob.len()
            )));
        }
        out.copy_from_slice(&self.blob[self.offset..end]);
        self.offset = end;
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn read_i32(&mut self) -> crate::Result<i32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> crate::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> crate::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
