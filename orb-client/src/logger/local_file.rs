//! 本地回退日志文件 - 滚动写入、重新打开、重连后的重放
//!
//! The file being written holds an exclusive advisory lock, so a replay
//! started by another instance of the same process leaves it alone.

use shared::LogEvent;
use shared::frame::{FrameReader, encode_frame};
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::LoggerConfig;
use crate::error::OrbResult;
use crate::rpc::LogCollector;

pub const LOCAL_LOG_EXTENSION: &str = ".LocalLog";

/// Take the exclusive lock on `file`, true if another handle already holds it.
///
/// Filesystems without lock support report false.
fn locked_elsewhere(file: &File, path: &Path) -> bool {
    match file.try_lock() {
        Ok(()) => false,
        Err(TryLockError::WouldBlock) => true,
        Err(TryLockError::Error(e)) => {
            tracing::debug!(file = ?path, "File locking unavailable: {e}");
            false
        }
    }
}

/// Open `path` read-only and check for a writer
fn in_use(path: &Path) -> bool {
    File::open(path).is_ok_and(|file| locked_elsewhere(&file, path))
}

#[derive(Debug)]
struct CurrentFile {
    path: PathBuf,
    file: File,
    seq: u32,
    size: u64,
}

/// Rolling local files named `{process}_{pid}_{seq:05}.LocalLog`.
///
/// Files are opened lazily on the first write and survive restarts; replay
/// picks them up by process name regardless of the pid that wrote them.
#[derive(Debug)]
pub struct LocalLogStore {
    dir: PathBuf,
    process_name: String,
    pid: u32,
    rollover_size: u64,
    reopen_size: u64,
    keep_files: usize,
    current: Option<CurrentFile>,
}

impl LocalLogStore {
    pub fn new(config: &LoggerConfig) -> Self {
        Self {
            dir: config.local_dir.clone(),
            process_name: config.process_name.clone(),
            pid: std::process::id(),
            rollover_size: config.rollover_size,
            reopen_size: config.reopen_size,
            keep_files: config.keep_files,
            current: None,
        }
    }

    /// Write as if we were another process instance
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, seq: u32) -> String {
        format!("{}_{}_{:05}{}", self.process_name, self.pid, seq, LOCAL_LOG_EXTENSION)
    }

    /// Path of the file currently open for writing
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    /// Append one framed event, rolling over past the size threshold.
    pub fn write(&mut self, event: &LogEvent) -> OrbResult<()> {
        let frame = encode_frame(event)?;
        if self.current.is_none() {
            self.open_most_recent()?;
        }
        let Some(current) = self.current.as_mut() else {
            return Err(std::io::Error::other("local log file not open").into());
        };

        current.file.write_all(&frame)?;
        current.size += frame.len() as u64;

        if current.size > self.rollover_size {
            let next = current.seq + 1;
            self.open_new(next)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut current) = self.current.take()
            && let Err(e) = current.file.flush()
        {
            tracing::debug!(file = ?current.path, "Flush on close failed: {e}");
        }
    }

    /// Continue the highest numbered file of this pid if it is still small,
    /// otherwise start the next number.
    fn open_most_recent(&mut self) -> OrbResult<()> {
        fs::create_dir_all(&self.dir)?;

        let highest = self.own_files()?.into_iter().max_by_key(|(seq, _)| *seq);
        match highest {
            Some((seq, path)) => {
                let size = fs::metadata(&path)?.len();
                if size < self.reopen_size {
                    let file = OpenOptions::new().read(true).append(true).open(&path)?;
                    if locked_elsewhere(&file, &path) {
                        return self.open_new(seq + 1);
                    }
                    tracing::debug!(file = ?path, size, "Reopened local log file");
                    self.current = Some(CurrentFile { path, file, seq, size });
                    Ok(())
                } else {
                    self.open_new(seq + 1)
                }
            }
            None => self.open_new(0),
        }
    }

    fn open_new(&mut self, seq: u32) -> OrbResult<()> {
        self.close();
        fs::create_dir_all(&self.dir)?;
        let mut seq = seq;
        loop {
            let path = self.dir.join(self.file_name(seq));
            // 先加锁再截断，不能清空别人正在写的文件
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            if locked_elsewhere(&file, &path) {
                seq += 1;
                continue;
            }
            file.set_len(0)?;
            tracing::debug!(file = ?path, "Opened new local log file");
            self.current = Some(CurrentFile {
                path,
                file,
                seq,
                size: 0,
            });
            return Ok(());
        }
    }

    /// `(seq, path)` of the files written by this pid
    fn own_files(&self) -> OrbResult<Vec<(u32, PathBuf)>> {
        let prefix = format!("{}_{}_", self.process_name, self.pid);
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let seq = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(LOCAL_LOG_EXTENSION))
                .and_then(|seq| seq.parse::<u32>().ok());
            if let Some(seq) = seq {
                files.push((seq, entry.path()));
            }
        }
        Ok(files)
    }

    fn is_backlog_name(&self, name: &str) -> bool {
        let Some(rest) = name
            .strip_prefix(self.process_name.as_str())
            .and_then(|r| r.strip_prefix('_'))
            .and_then(|r| r.strip_suffix(LOCAL_LOG_EXTENSION))
        else {
            return false;
        };
        match rest.split_once('_') {
            Some((pid, seq)) => {
                !pid.is_empty()
                    && !seq.is_empty()
                    && pid.bytes().all(|b| b.is_ascii_digit())
                    && seq.bytes().all(|b| b.is_ascii_digit())
            }
            None => false,
        }
    }

    /// Every local file of this process name, any pid, oldest first
    pub fn backlog(&self) -> OrbResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| self.is_backlog_name(n)) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Replay the backlog to `collector`.
    ///
    /// Only the newest `keep_files` files are replayed, older ones are
    /// deleted unread. Each fully delivered file is deleted. Files another
    /// instance is still writing are skipped. A delivery
    /// failure stops the replay and is returned; the remaining files stay
    /// for the next connection. Returns the number of events sent.
    pub async fn spool(&mut self, collector: &dyn LogCollector) -> OrbResult<u64> {
        self.close();

        let files = self.backlog()?;
        let mut remaining = files.len();
        let mut sent = 0;
        for path in files {
            if remaining > self.keep_files {
                if in_use(&path) {
                    remaining -= 1;
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => tracing::info!(file = ?path, "Discarded old local log file"),
                    Err(e) => tracing::debug!(file = ?path, "Could not delete old local log file: {e}"),
                }
                remaining -= 1;
                continue;
            }
            remaining -= 1;
            sent += spool_file(&path, collector).await?;
        }
        Ok(sent)
    }
}

async fn spool_file(path: &Path, collector: &dyn LogCollector) -> OrbResult<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!(file = ?path, "Skipping local log file: {e}");
            return Ok(0);
        }
    };
    // 另一个仍在运行的实例正在写
    if locked_elsewhere(&file, path) {
        tracing::debug!(file = ?path, "Skipping local log file still in use");
        return Ok(0);
    }

    let mut reader = FrameReader::new(BufReader::new(file));
    let mut sent = 0;
    loop {
        match reader.next_event() {
            Ok(Some(event)) => {
                collector.log_single(&event).await?;
                sent += 1;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(file = ?path, sent, "Unreadable frame in local log file: {e}");
                break;
            }
        }
    }
    drop(reader);

    if let Err(e) = fs::remove_file(path) {
        tracing::debug!(file = ?path, "Could not delete spooled file: {e}");
    }
    Ok(sent)
}
