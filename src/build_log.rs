//! The build log stores a hash of the command line and a restat mtime for
//! every output produced by a previous build.  It has a few uses:
//!
//! 1) command hashes for existing output files, so we know when we need to
//!    rebuild due to the command changing;
//! 2) timing information, perhaps for generating reports;
//! 3) restat information, so clean restat runs stay clean across builds.
//!
//! Each run appends to the log file; loading keeps the newest entry per
//! output.  Once the number of redundant entries exceeds a threshold the
//! file is rewritten.

use crate::disk::{DiskInterface, TimeStamp};
use crate::graph::EdgeId;
use crate::graph::State;
use crate::hash::hash_command;
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const FILE_SIGNATURE: &str = "# ninja log v";
const CURRENT_VERSION: i32 = 5;
const OLDEST_SUPPORTED_VERSION: i32 = 4;

const MIN_COMPACTION_ENTRY_COUNT: usize = 100;
const COMPACTION_RATIO: usize = 3;

/// Can answer questions about the manifest for the BuildLog: whether a given
/// output is no longer part of the build.  Only consulted during compaction.
pub trait BuildLogUser {
    fn is_path_dead(&self, path: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub output: String,
    pub command_hash: u64,
    /// Milliseconds relative to the start of the recording build; purely
    /// informational.
    pub start_time: i32,
    pub end_time: i32,
    /// The restat mtime, in nanoseconds; see the output-dirty rules.
    pub mtime: TimeStamp,
}

#[derive(Default)]
pub struct BuildLog {
    entries: HashMap<String, LogEntry>,
    file: Option<File>,
    needs_recompaction: bool,
}

fn write_entry(f: &mut impl Write, entry: &LogEntry) -> std::io::Result<()> {
    writeln!(
        f,
        "{}\t{}\t{}\t{}\t{:x}",
        entry.start_time, entry.end_time, entry.mtime, entry.output, entry.command_hash
    )
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog::default()
    }

    pub fn lookup(&self, output: &str) -> Option<&LogEntry> {
        self.entries.get(output)
    }

    pub fn entries(&self) -> &HashMap<String, LogEntry> {
        &self.entries
    }

    /// Load the on-disk log.  A missing file loads as empty; so does a log
    /// older than the supported floor, which just causes commands to re-run.
    pub fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => bail!("read {}: {}", path.display(), err),
        };

        let mut log_version = 0;
        let mut unique_entry_count = 0;
        let mut total_entry_count = 0;

        for line in content.split(|&c| c == b'\n') {
            // Safety: tab-separated numeric fields and path bytes, sliced on
            // ASCII delimiters.
            let line = unsafe { std::str::from_utf8_unchecked(line) };
            if log_version == 0 {
                if let Some(v) = line.strip_prefix(FILE_SIGNATURE) {
                    log_version = v.trim().parse().unwrap_or(0);
                }
                if log_version < OLDEST_SUPPORTED_VERSION {
                    // Too old to be usable; start over.  An empty build log
                    // only causes the outputs to be rebuilt.
                    let _ = std::fs::remove_file(path);
                    return Ok(());
                }
                continue;
            }

            let mut fields = line.splitn(5, '\t');
            let (Some(start), Some(end), Some(mtime), Some(output), Some(rest)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                continue;
            };

            let command_hash = if log_version >= 5 {
                u64::from_str_radix(rest, 16).unwrap_or(0)
            } else {
                // v4 recorded the command text itself in the final field.
                hash_command(rest)
            };

            let entry = LogEntry {
                output: output.to_owned(),
                command_hash,
                start_time: start.parse().unwrap_or(0),
                end_time: end.parse().unwrap_or(0),
                mtime: mtime.parse().unwrap_or(0),
            };
            total_entry_count += 1;
            if self.entries.insert(entry.output.clone(), entry).is_none() {
                unique_entry_count += 1;
            }
        }

        // Decide whether it's time to rebuild the log: when upgrading
        // versions, or when it has accumulated too many dead lines.
        if log_version > 0 && log_version < CURRENT_VERSION {
            self.needs_recompaction = true;
        } else if total_entry_count > MIN_COMPACTION_ENTRY_COUNT
            && total_entry_count > unique_entry_count * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }

        Ok(())
    }

    /// Open the log for appending, compacting it first if loading decided
    /// that is due.
    pub fn open_for_write(&mut self, path: &Path, user: &dyn BuildLogUser) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path, user)?;
            self.needs_recompaction = false;
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| anyhow!("open {}: {}", path.display(), err))?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{}{}", FILE_SIGNATURE, CURRENT_VERSION)?;
        }
        self.file = Some(file);
        Ok(())
    }

    /// Record one command completion, upserting an entry per output and
    /// flushing it to disk immediately.
    pub fn record_command(
        &mut self,
        state: &State,
        edge: EdgeId,
        start_time: i32,
        end_time: i32,
        mtime: TimeStamp,
    ) -> anyhow::Result<()> {
        let command = state.evaluate_command(edge, true)?;
        let command_hash = hash_command(&command);
        for &output in &state.edges.get(edge).outputs {
            let output = state.nodes.get(output).path.clone();
            let entry = LogEntry {
                output: output.clone(),
                command_hash,
                start_time,
                end_time,
                mtime,
            };
            if let Some(file) = &mut self.file {
                write_entry(file, &entry)?;
                file.flush()?;
            }
            self.entries.insert(output, entry);
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Rewrite the log keeping only entries for outputs the manifest still
    /// knows, through a temp file swapped over the original.
    pub fn recompact(&mut self, path: &Path, user: &dyn BuildLogUser) -> anyhow::Result<()> {
        self.close();
        let temp_path = swap_path(path, ".recompact");
        let mut f = File::create(&temp_path)
            .map_err(|err| anyhow!("create {}: {}", temp_path.display(), err))?;
        writeln!(f, "{}{}", FILE_SIGNATURE, CURRENT_VERSION)?;

        let mut dead_outputs = Vec::new();
        for (output, entry) in &self.entries {
            if user.is_path_dead(output) {
                dead_outputs.push(output.clone());
                continue;
            }
            write_entry(&mut f, entry)?;
        }
        for output in dead_outputs {
            self.entries.remove(&output);
        }
        drop(f);

        let _ = std::fs::remove_file(path);
        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {}: {}", temp_path.display(), err))?;
        Ok(())
    }

    /// Re-stat recorded outputs (all of them, or just the named subset) and
    /// rewrite the log with fresh mtimes.  Recovers from output files edited
    /// outside the build.
    pub fn restat(
        &mut self,
        path: &Path,
        disk: &dyn DiskInterface,
        outputs: &[&str],
    ) -> anyhow::Result<()> {
        self.close();
        let temp_path = swap_path(path, ".restat");
        let mut f = File::create(&temp_path)
            .map_err(|err| anyhow!("create {}: {}", temp_path.display(), err))?;
        writeln!(f, "{}{}", FILE_SIGNATURE, CURRENT_VERSION)?;

        for entry in self.entries.values_mut() {
            let selected = outputs.is_empty() || outputs.contains(&entry.output.as_str());
            if selected {
                entry.mtime = disk.stat(&entry.output)?.timestamp();
            }
            write_entry(&mut f, entry)?;
        }
        drop(f);

        let _ = std::fs::remove_file(path);
        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {}: {}", temp_path.display(), err))?;
        Ok(())
    }
}

fn swap_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
