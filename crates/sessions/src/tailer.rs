//! Incremental JSONL tailer with consumer groups.
//!
//! Each tailed file carries an `(inode, byte offset)` pair per consumer
//! group, persisted in a JSON offset store. An inode change means the file
//! was rotated: every group's offset resets to zero and the new file is
//! read from the start. A group's offset only advances when its handler
//! succeeds, so a failing line is retried on the next poll without
//! blocking other groups.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sb_domain::Result;

const CHUNK_SIZE: usize = 64 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Offset store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Serialize, Deserialize)]
struct OffsetFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    files: HashMap<String, FileOffsets>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct FileOffsets {
    inode: u64,
    #[serde(default)]
    groups: HashMap<String, u64>,
}

/// Disk-backed `(inode, offsets per group)` registry, shared by every
/// tailer in the process.
pub struct OffsetStore {
    path: PathBuf,
    state: Mutex<OffsetFile>,
}

impl OffsetStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| OffsetFile {
                version: 1,
                files: HashMap::new(),
            });
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Ephemeral store for tests and one-shot scans.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Mutex::new(OffsetFile {
                version: 1,
                files: HashMap::new(),
            }),
        }
    }

    fn get(&self, file: &Path) -> FileOffsets {
        self.state
            .lock()
            .files
            .get(&file.to_string_lossy().to_string())
            .cloned()
            .unwrap_or_default()
    }

    fn put(&self, file: &Path, offsets: FileOffsets) {
        self.state
            .lock()
            .files
            .insert(file.to_string_lossy().to_string(), offsets);
        self.persist();
    }

    /// Drop tracking for files that no longer exist.
    pub fn prune_missing(&self) {
        self.state
            .lock()
            .files
            .retain(|path, _| Path::new(path).exists());
        self.persist();
    }

    fn persist(&self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        let json = match serde_json::to_string(&*self.state.lock()) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize offset store");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("tmp");
        if std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &self.path)).is_err() {
            tracing::warn!(path = %self.path.display(), "failed to persist offset store");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tailer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type LineHandler = Box<dyn FnMut(&str) -> Result<()> + Send>;

struct TailGroup {
    name: String,
    handler: LineHandler,
}

/// Result of one poll pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollOutcome {
    /// The file was replaced by a new inode; offsets were reset.
    pub rotated: bool,
    /// Complete lines delivered to at least one group.
    pub delivered: usize,
}

pub struct JsonlTailer {
    path: PathBuf,
    store: std::sync::Arc<OffsetStore>,
    groups: Vec<TailGroup>,
}

impl JsonlTailer {
    pub fn new(path: impl Into<PathBuf>, store: std::sync::Arc<OffsetStore>) -> Self {
        Self {
            path: path.into(),
            store,
            groups: Vec::new(),
        }
    }

    pub fn register_group(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(&str) -> Result<()> + Send + 'static,
    ) {
        self.groups.push(TailGroup {
            name: name.into(),
            handler: Box::new(handler),
        });
    }

    /// Read from `min(group offsets)` up to the current size and dispatch
    /// complete lines to each group in file order.
    pub fn poll(&mut self) -> Result<PollOutcome> {
        let meta = std::fs::metadata(&self.path)?;
        let inode = file_inode(&meta);
        let size = meta.len();

        let mut offsets = self.store.get(&self.path);
        let mut outcome = PollOutcome::default();

        if offsets.inode != 0 && offsets.inode != inode {
            tracing::info!(path = %self.path.display(), "transcript rotated, resetting offsets");
            offsets.groups.values_mut().for_each(|o| *o = 0);
            outcome.rotated = true;
        }
        offsets.inode = inode;
        for group in &self.groups {
            offsets.groups.entry(group.name.clone()).or_insert(0);
        }

        let min_offset = offsets.groups.values().copied().min().unwrap_or(0).min(size);
        if min_offset >= size && !outcome.rotated {
            self.store.put(&self.path, offsets);
            return Ok(outcome);
        }

        let lines = read_lines_from(&self.path, min_offset, size)?;

        for group in &mut self.groups {
            let offset = offsets.groups.get_mut(&group.name).expect("seeded above");
            for line in &lines {
                if line.start < *offset {
                    continue;
                }
                match (group.handler)(&line.text) {
                    Ok(()) => {
                        *offset = line.end;
                        outcome.delivered += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            group = %group.name,
                            path = %self.path.display(),
                            error = %e,
                            "line handler failed, will retry next poll"
                        );
                        break;
                    }
                }
            }
        }

        self.store.put(&self.path, offsets);
        Ok(outcome)
    }

    /// True iff every registered group has consumed the whole file.
    /// Performing the rotation is the caller's business.
    pub fn can_rotate(&self) -> bool {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        let offsets = self.store.get(&self.path);
        self.groups
            .iter()
            .all(|g| offsets.groups.get(&g.name).copied().unwrap_or(0) >= size)
    }

    /// Poll on an interval until cancelled.
    pub async fn run(
        &mut self,
        interval: std::time::Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll() {
                        tracing::debug!(path = %self.path.display(), error = %e, "tail poll failed");
                    }
                }
            }
        }
    }
}

struct TailedLine {
    /// Absolute byte offset of the line start.
    start: u64,
    /// Absolute byte offset just past the trailing newline.
    end: u64,
    text: String,
}

/// Read `[from, to)` in ≤64 KiB chunks, split on `\n`, and drop the
/// trailing partial line.
fn read_lines_from(path: &Path, from: u64, to: u64) -> Result<Vec<TailedLine>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(from))?;

    let mut raw = Vec::with_capacity((to.saturating_sub(from)) as usize);
    let mut remaining = to.saturating_sub(from);
    let mut chunk = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let got = file.read(&mut chunk[..want])?;
        if got == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..got]);
        remaining -= got as u64;
    }

    let mut lines = Vec::new();
    let mut line_start = from;
    let mut cursor = 0usize;
    while let Some(newline_at) = raw[cursor..].iter().position(|b| *b == b'\n') {
        let end_index = cursor + newline_at;
        let text = String::from_utf8_lossy(&raw[cursor..end_index]).to_string();
        let end = line_start + (end_index - cursor) as u64 + 1;
        lines.push(TailedLine {
            start: line_start,
            end,
            text,
        });
        cursor = end_index + 1;
        line_start = end;
    }
    // Bytes past the last newline form a partial line; leave them for the
    // next poll.
    Ok(lines)
}

#[cfg(target_family = "unix")]
fn file_inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(target_family = "unix"))]
fn file_inode(_meta: &std::fs::Metadata) -> u64 {
    0
}
