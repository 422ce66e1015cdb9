//! A compact binary log of the implicit inputs discovered for each output,
//! so incremental builds don't have to reparse depfiles.
//!
//! Paths are represented as small integers assigned in order of first
//! appearance.  Two record kinds follow a signature line: a path record
//! (u16 big-endian length, high bit clear, then the path bytes) which
//! implicitly assigns the next id, and a deps record (u16 big-endian input
//! count with the high bit set, u24 big-endian output id, i64 little-endian
//! mtime in nanoseconds, then u24 big-endian input ids).  Later deps records
//! for an output supersede earlier ones.

use crate::disk::TimeStamp;
use crate::graph::{NodeId, State};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const FILE_SIGNATURE: &[u8] = b"# kunai deps v1\n";

const MIN_COMPACTION_RECORD_COUNT: usize = 100;
const COMPACTION_RATIO: usize = 3;

const DEPS_RECORD_MASK: u16 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deps {
    /// The output's mtime when the deps were recorded; deps are invalid for
    /// an output newer than this.
    pub mtime: TimeStamp,
    pub nodes: Vec<NodeId>,
}

#[derive(Default)]
pub struct DepsLog {
    /// File id for each node that has appeared in the log.
    ids: HashMap<NodeId, usize>,
    /// Node for each file id, in id order.
    nodes_by_id: Vec<NodeId>,
    deps: HashMap<NodeId, Deps>,
    file: Option<File>,
    needs_recompaction: bool,
}

fn write_path_record(f: &mut impl Write, path: &str) -> std::io::Result<()> {
    let len = path.len();
    if len >= DEPS_RECORD_MASK as usize {
        panic!("deps log path too long");
    }
    f.write_all(&(len as u16).to_be_bytes())?;
    f.write_all(path.as_bytes())
}

fn write_id(f: &mut impl Write, id: usize) -> std::io::Result<()> {
    if id >= 1 << 24 {
        panic!("too many paths in deps log");
    }
    f.write_all(&[(id >> 16) as u8, (id >> 8) as u8, id as u8])
}

fn write_deps_record(
    f: &mut impl Write,
    out_id: usize,
    mtime: TimeStamp,
    dep_ids: &[usize],
) -> std::io::Result<()> {
    f.write_all(&(dep_ids.len() as u16 | DEPS_RECORD_MASK).to_be_bytes())?;
    write_id(f, out_id)?;
    f.write_all(&mtime.to_le_bytes())?;
    for &id in dep_ids {
        write_id(f, id)?;
    }
    Ok(())
}

/// Byte cursor over the loaded log; reads return None at a truncated tail.
struct Reader<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Reader<'a> {
    fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.buf.get(self.ofs..self.ofs + 2)?;
        self.ofs += 2;
        Some(u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u24(&mut self) -> Option<usize> {
        let bytes = self.buf.get(self.ofs..self.ofs + 3)?;
        self.ofs += 3;
        Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
    }

    fn read_i64(&mut self) -> Option<i64> {
        let bytes = self.buf.get(self.ofs..self.ofs + 8)?;
        self.ofs += 8;
        Some(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_str(&mut self, len: usize) -> Option<&'a str> {
        let bytes = self.buf.get(self.ofs..self.ofs + len)?;
        self.ofs += len;
        // Safety: round-trips the path bytes written by write_path_record.
        Some(unsafe { std::str::from_utf8_unchecked(bytes) })
    }

    fn at_end(&self) -> bool {
        self.ofs >= self.buf.len()
    }
}

impl DepsLog {
    pub fn new() -> Self {
        DepsLog::default()
    }

    pub fn get_deps(&self, node: NodeId) -> Option<&Deps> {
        self.deps.get(&node)
    }

    pub fn deps_count(&self) -> usize {
        self.deps.len()
    }

    /// Load the on-disk log, interning every recorded path into the graph.
    /// A missing file loads as empty; an unrecognized signature or a
    /// truncated tail discards what cannot be read, which only causes deps
    /// to be re-extracted.
    pub fn load(&mut self, path: &Path, state: &mut State) -> anyhow::Result<()> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => bail!("read {}: {}", path.display(), err),
        };
        if !content.starts_with(FILE_SIGNATURE) {
            let _ = std::fs::remove_file(path);
            return Ok(());
        }
        let mut reader = Reader {
            buf: &content,
            ofs: FILE_SIGNATURE.len(),
        };

        let mut total_record_count = 0;
        while !reader.at_end() {
            let Some(header) = reader.read_u16() else { break };
            if header & DEPS_RECORD_MASK == 0 {
                let Some(path) = reader.read_str(header as usize) else { break };
                let node = state.node_id(path);
                self.ids.insert(node, self.nodes_by_id.len());
                self.nodes_by_id.push(node);
            } else {
                let count = (header & !DEPS_RECORD_MASK) as usize;
                let Some(out_id) = reader.read_u24() else { break };
                let Some(mtime) = reader.read_i64() else { break };
                let mut nodes = Vec::with_capacity(count);
                let mut truncated = false;
                for _ in 0..count {
                    match reader.read_u24() {
                        Some(id) if id < self.nodes_by_id.len() => {
                            nodes.push(self.nodes_by_id[id])
                        }
                        _ => {
                            truncated = true;
                            break;
                        }
                    }
                }
                if truncated || out_id >= self.nodes_by_id.len() {
                    break;
                }
                total_record_count += 1;
                self.deps.insert(self.nodes_by_id[out_id], Deps { mtime, nodes });
            }
        }

        if total_record_count > MIN_COMPACTION_RECORD_COUNT
            && total_record_count > self.deps.len() * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }

        Ok(())
    }

    pub fn open_for_write(&mut self, path: &Path, state: &State) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path, state)?;
            self.needs_recompaction = false;
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| anyhow!("open {}: {}", path.display(), err))?;
        if file.metadata()?.len() == 0 {
            file.write_all(FILE_SIGNATURE)?;
        }
        self.file = Some(file);
        Ok(())
    }

    fn ensure_id(&mut self, state: &State, node: NodeId) -> std::io::Result<usize> {
        if let Some(&id) = self.ids.get(&node) {
            return Ok(id);
        }
        let id = self.nodes_by_id.len();
        if let Some(file) = &mut self.file {
            write_path_record(file, &state.nodes.get(node).path)?;
        }
        self.ids.insert(node, id);
        self.nodes_by_id.push(node);
        Ok(id)
    }

    /// Record the discovered deps for one output.  Unchanged deps are not
    /// rewritten.
    pub fn record_deps(
        &mut self,
        state: &State,
        output: NodeId,
        mtime: TimeStamp,
        deps: &[NodeId],
    ) -> anyhow::Result<()> {
        if let Some(existing) = self.deps.get(&output) {
            if existing.mtime == mtime && existing.nodes == deps {
                return Ok(());
            }
        }

        let out_id = self.ensure_id(state, output)?;
        let mut dep_ids = Vec::with_capacity(deps.len());
        for &dep in deps {
            dep_ids.push(self.ensure_id(state, dep)?);
        }
        if let Some(file) = &mut self.file {
            write_deps_record(file, out_id, mtime, &dep_ids)?;
            file.flush()?;
        }
        self.deps.insert(
            output,
            Deps {
                mtime,
                nodes: deps.to_vec(),
            },
        );
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Rewrite the log keeping only deps for outputs some edge still
    /// produces, through a temp file swapped over the original.
    pub fn recompact(&mut self, path: &Path, state: &State) -> anyhow::Result<()> {
        self.close();
        let temp_path = swap_path(path, ".recompact");
        let mut fresh = DepsLog::new();
        {
            let mut file = File::create(&temp_path)
                .map_err(|err| anyhow!("create {}: {}", temp_path.display(), err))?;
            file.write_all(FILE_SIGNATURE)?;
            fresh.file = Some(file);
            for (&output, deps) in &self.deps {
                if state.nodes.get(output).in_edge.is_none() {
                    continue;
                }
                fresh.record_deps(state, output, deps.mtime, &deps.nodes)?;
            }
            fresh.close();
        }

        let _ = std::fs::remove_file(path);
        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow!("rename {}: {}", temp_path.display(), err))?;

        self.ids = fresh.ids;
        self.nodes_by_id = fresh.nodes_by_id;
        self.deps = fresh.deps;
        Ok(())
    }
}

fn swap_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
