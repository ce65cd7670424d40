use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::UndoError;

pub const MANIFEST_FILE: &str = "UndoTimestamps.bin";
const STEP_PREFIX: &str = "UndoStep-";

/// Path of the step file for a given timestamp, e.g. `<dir>/UndoStep-1712345`.
pub fn step_path(dir: &Path, timestamp: u64) -> PathBuf {
    dir.join(format!("{}{}", STEP_PREFIX, timestamp))
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

/// Key fields of a step record: everything but the backup blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepKey {
    pub user_id: i32,
    pub timestamp: u64,
    pub command: String,
}

// Step record layout, little-endian, tightly packed, no version header:
//
//   [data_len: u32][data: bytes]
//   [user_id: i32][timestamp: u64]
//   [command_len: u32][command: bytes]

pub fn write_step(
    dir: &Path,
    timestamp: u64,
    user_id: i32,
    command: &str,
    blob: &[u8],
) -> io::Result<()> {
    let file = File::create(step_path(dir, timestamp))?;
    let mut out = BufWriter::new(file);

    out.write_all(&(blob.len() as u32).to_le_bytes())?;
    out.write_all(blob)?;
    out.write_all(&user_id.to_le_bytes())?;
    out.write_all(&timestamp.to_le_bytes())?;
    out.write_all(&(command.len() as u32).to_le_bytes())?;
    out.write_all(command.as_bytes())?;
    out.flush()
}

/// Key-only decode: seek over the data region and read the trailing fields.
pub fn read_step_key(dir: &Path, timestamp: u64) -> crate::Result<StepKey> {
    let file = File::open(step_path(dir, timestamp))?;
    let mut input = BufReader::new(file);

    let data_len = read_u32(&mut input)?;
    input.seek(SeekFrom::Current(data_len as i64))?;

    let user_id = read_i32(&mut input)?;
    let stamp = read_u64(&mut input)?;
    let command_len = read_u32(&mut input)?;
    let mut command = vec![0u8; command_len as usize];
    input.read_exact(&mut command)?;
    let command = String::from_utf8(command)
        .map_err(|e| UndoError::BackupData(format!("step command is not UTF-8: {}", e)))?;

    Ok(StepKey {
        user_id,
        timestamp: stamp,
        command,
    })
}

/// Cache-only decode: read the data region and ignore the trailing fields.
pub fn read_step_blob(dir: &Path, timestamp: u64) -> io::Result<Vec<u8>> {
    let file = File::open(step_path(dir, timestamp))?;
    let mut input = BufReader::new(file);

    let data_len = read_u32(&mut input)?;
    let mut blob = vec![0u8; data_len as usize];
    input.read_exact(&mut blob)?;
    Ok(blob)
}

/// Removes the step file for a timestamp. Absence is not an error.
pub fn remove_step(dir: &Path, timestamp: u64) -> io::Result<()> {
    match fs::remove_file(step_path(dir, timestamp)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// Manifest layout: [count: u32][timestamps: u64 x count], in history order.

pub fn write_manifest(path: &Path, timestamps: &[u64]) -> crate::Result<()> {
    let mut data = Vec::with_capacity(4 + timestamps.len() * 8);
    data.extend_from_slice(&(timestamps.len() as u32).to_le_bytes());
    for stamp in timestamps {
        data.extend_from_slice(&stamp.to_le_bytes());
    }
    atomic_write(path, &data)
}

pub fn read_manifest(path: &Path) -> crate::Result<Vec<u64>> {
    let file = File::open(path)
        .map_err(|e| UndoError::Manifest(format!("cannot open {}: {}", path.display(), e)))?;
    let mut input = BufReader::new(file);

    let count = read_u32(&mut input)?;
    let mut timestamps = Vec::with_capacity(count as usize);
    for _ in 0..count {
        timestamps.push(read_u64(&mut input)?);
    }
    Ok(timestamps)
}

// Writes to a temporary file in the same directory and renames into place.
fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| UndoError::Manifest(format!("invalid manifest path: {}", path.display())))?;
    let suffix: u64 = rand::rngs::OsRng.next_u64();
    let tmp = parent.join(format!(".tmp_manifest.{}", suffix));

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_u32(input: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(input: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(input: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
