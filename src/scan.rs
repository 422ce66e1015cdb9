//! The dependency scan: a post-order DFS over in-edges that decides which
//! outputs are dirty, combining filesystem mtimes with the command hashes
//! and restat mtimes recorded in the build log.

use crate::build_log::BuildLog;
use crate::canon::canon_path;
use crate::deps_log::DepsLog;
use crate::disk::DiskInterface;
use crate::dyndep::{self, DyndepFile};
use crate::graph::{EdgeId, NodeId, State, VisitMark};
use crate::scanner::Scanner;
use anyhow::bail;
use std::path::Path;

/// Splices discovered implicit inputs (from a depfile or the deps log) into
/// an edge's implicit region.
pub struct ImplicitDepLoader<'a> {
    pub state: &'a mut State,
    pub deps_log: &'a DepsLog,
    pub disk: &'a mut dyn DiskInterface,
}

impl<'a> ImplicitDepLoader<'a> {
    /// Load discovered deps for an edge.  Ok(false) means the recorded deps
    /// are missing or unusable, which forces the edge dirty so the command
    /// re-runs and regenerates them; Err is a fatal scan error.
    pub fn load_deps(&mut self, edge: EdgeId) -> anyhow::Result<bool> {
        let deps_type = self.state.get_binding(edge, "deps")?;
        if !deps_type.is_empty() {
            return self.load_deps_from_log(edge);
        }

        let depfile = self.state.get_unescaped_binding(edge, "depfile")?;
        if !depfile.is_empty() {
            return self.load_depfile_deps(edge, &depfile);
        }

        // No deps to load.
        Ok(true)
    }

    fn load_depfile_deps(&mut self, edge: EdgeId, path: &str) -> anyhow::Result<bool> {
        let mut content = match self.disk.read_file(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Missing depfile: the edge must rebuild to regenerate it.
                return Ok(false);
            }
            Err(err) => bail!("loading '{}': {}", path, err),
        };
        if content.is_empty() {
            return Ok(false);
        }
        content.push(0);

        let mut scanner = Scanner::new(&content);
        let parsed = match crate::depfile::parse(&mut scanner) {
            Ok(parsed) => parsed,
            Err(err) => bail!("{}", scanner.format_parse_error(Path::new(path), err)),
        };
        if parsed.is_empty() {
            bail!("{}: no outputs declared", path);
        }

        // The primary declared output must be the edge's first output; a
        // mismatch forces a rebuild rather than failing the scan.
        let first_output = self.state.edges.get(edge).outputs[0];
        let first_output_path = self.state.nodes.get(first_output).path.clone();
        let primary = parsed.iter().next().unwrap().0;
        if canon_path(primary) != first_output_path {
            return Ok(false);
        }

        // Every declared output must be an output of the edge.
        for (target, _) in parsed.iter() {
            let target = canon_path(*target);
            let known = self
                .state
                .lookup_node(&target)
                .map(|n| self.state.edges.get(edge).outputs.contains(&n))
                .unwrap_or(false);
            if !known {
                bail!(
                    "{}: depfile mentions '{}' as an output, but no such output was declared",
                    path,
                    target
                );
            }
        }

        let deps: Vec<String> = parsed
            .iter()
            .flat_map(|(_, deps)| deps.iter().map(|d| canon_path(*d)))
            .collect();
        self.splice_implicit_deps(edge, &deps);
        Ok(true)
    }

    fn load_deps_from_log(&mut self, edge: EdgeId) -> anyhow::Result<bool> {
        // Deps from the log only apply to single-output edges.
        let output = self.state.edges.get(edge).outputs[0];
        let Some(deps) = self.deps_log.get_deps(output) else {
            return Ok(false);
        };

        // Deps are invalid if the output is newer than the record; a
        // previous run must have been interrupted between writing the
        // output and the log.
        if self.state.nodes.get(output).mtime().timestamp() > deps.mtime {
            return Ok(false);
        }

        let paths: Vec<String> = deps
            .nodes
            .iter()
            .map(|&n| self.state.nodes.get(n).path.clone())
            .collect();
        self.splice_implicit_deps(edge, &paths);
        Ok(true)
    }

    /// Insert discovered inputs just before the order-only region, growing
    /// the implicit region, and give producer-less inputs a phony in-edge so
    /// the plan has something to wait on.
    fn splice_implicit_deps(&mut self, edge: EdgeId, paths: &[String]) {
        let insert_at = {
            let e = self.state.edges.get(edge);
            e.inputs.len() - e.order_only_ins
        };
        let mut nodes = Vec::with_capacity(paths.len());
        for path in paths {
            let node = self.state.node_id(path.as_str());
            nodes.push(node);
            self.state.nodes.get_mut(node).out_edges.push(edge);
            self.create_phony_in_edge(node);
        }
        let e = self.state.edges.get_mut(edge);
        e.inputs.splice(insert_at..insert_at, nodes);
        e.implicit_ins += paths.len();
    }

    fn create_phony_in_edge(&mut self, node: NodeId) {
        if self.state.nodes.get(node).in_edge.is_some() {
            return;
        }
        let phony = self.state.add_edge(self.state.phony_rule());
        self.state.nodes.get_mut(node).in_edge = Some(phony);
        self.state.edges.get_mut(phony).outputs.push(node);

        // The scan might not visit this edge if an earlier traversal already
        // statted the node while it had no in-edge; those traversals treated
        // the node as ready, so the new edge must agree or the build gets
        // stuck waiting on it.
        self.state.edges.get_mut(phony).outputs_ready = true;
    }
}

pub struct DependencyScan<'a> {
    pub state: &'a mut State,
    pub build_log: &'a BuildLog,
    pub deps_log: &'a DepsLog,
    pub disk: &'a mut dyn DiskInterface,
}

impl<'a> DependencyScan<'a> {
    pub fn new(
        state: &'a mut State,
        build_log: &'a BuildLog,
        deps_log: &'a DepsLog,
        disk: &'a mut dyn DiskInterface,
    ) -> Self {
        DependencyScan {
            state,
            build_log,
            deps_log,
            disk,
        }
    }

    /// Update the dirty state of the given node and everything reachable
    /// from it through in-edges, flagging dependency cycles as errors.
    pub fn recompute_dirty(&mut self, node: NodeId) -> anyhow::Result<()> {
        let mut stack = Vec::new();
        self.recompute_node_dirty(node, &mut stack)
    }

    fn recompute_node_dirty(
        &mut self,
        node: NodeId,
        stack: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let Some(edge) = self.state.nodes.get(node).in_edge else {
            // A leaf node is visited at most once and is dirty if missing.
            if self.state.nodes.get(node).status_known() {
                return Ok(());
            }
            self.stat_node(node)?;
            let n = self.state.nodes.get_mut(node);
            n.dirty = !n.exists();
            return Ok(());
        };

        match self.state.edges.get(edge).mark {
            VisitMark::Done => return Ok(()),
            VisitMark::InStack => return self.report_cycle(node, stack),
            VisitMark::None => {}
        }

        self.state.edges.get_mut(edge).mark = VisitMark::InStack;
        stack.push(node);

        let mut dirty = false;
        {
            let e = self.state.edges.get_mut(edge);
            e.outputs_ready = true;
            e.deps_missing = false;
        }

        if !self.state.edges.get(edge).deps_loaded {
            // First encounter with this edge.  If its dyndep file is pending
            // and already clean, load it now so the extra inputs and outputs
            // exist before their mtimes are read; if the file is not ready,
            // it is an input to this edge and blocks readiness below until
            // the build produces it.
            if let Some(dd) = self.state.edges.get(edge).dyndep {
                if self.state.nodes.get(dd).dyndep_pending {
                    self.recompute_node_dirty(dd, stack)?;
                    let dd_ready = match self.state.nodes.get(dd).in_edge {
                        None => true,
                        Some(in_edge) => self.state.edges.get(in_edge).outputs_ready,
                    };
                    if dd_ready {
                        dyndep::load_dyndeps(self.state, self.disk, dd)?;
                    }
                }
            }
        }

        // Load output mtimes so we can compare them to the most recent
        // input below.
        for out in self.state.edges.get(edge).outputs.clone() {
            self.stat_node_if_necessary(out)?;
        }

        if !self.state.edges.get(edge).deps_loaded {
            self.state.edges.get_mut(edge).deps_loaded = true;
            let mut loader = ImplicitDepLoader {
                state: &mut *self.state,
                deps_log: self.deps_log,
                disk: &mut *self.disk,
            };
            if !loader.load_deps(edge)? {
                // Failed to load dependency info: rebuild to regenerate it.
                dirty = true;
                self.state.edges.get_mut(edge).deps_missing = true;
            }
        }

        // Visit all inputs; we're dirty if any input is dirty.
        let inputs = self.state.edges.get(edge).inputs.clone();
        let dirtying = inputs.len() - self.state.edges.get(edge).order_only_ins;
        let mut most_recent_input: Option<NodeId> = None;
        for (i, &input) in inputs.iter().enumerate() {
            self.recompute_node_dirty(input, stack)?;

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = self.state.nodes.get(input).in_edge {
                if !self.state.edges.get(in_edge).outputs_ready {
                    self.state.edges.get_mut(edge).outputs_ready = false;
                }
            }

            if i < dirtying {
                if self.state.nodes.get(input).dirty {
                    dirty = true;
                } else {
                    let newer = match most_recent_input {
                        None => true,
                        Some(m) => {
                            self.state.nodes.get(input).mtime() > self.state.nodes.get(m).mtime()
                        }
                    };
                    if newer {
                        most_recent_input = Some(input);
                    }
                }
            }
        }

        // We may also be dirty due to output state: missing outputs, output
        // older than input, changed command.
        if !dirty {
            dirty = self.recompute_outputs_dirty(edge, most_recent_input)?;
        }

        if dirty {
            for out in self.state.edges.get(edge).outputs.clone() {
                self.state.nodes.get_mut(out).dirty = true;
            }
        }

        // A dirty edge's outputs are normally not ready, except a phony
        // edge with no inputs, which has nothing to do.
        let is_trivial_phony =
            self.state.edges.get(edge).is_phony() && self.state.edges.get(edge).inputs.is_empty();
        if dirty && !is_trivial_phony {
            self.state.edges.get_mut(edge).outputs_ready = false;
        }

        self.state.edges.get_mut(edge).mark = VisitMark::Done;
        debug_assert_eq!(stack.last(), Some(&node));
        stack.pop();
        Ok(())
    }

    fn report_cycle(&self, node: NodeId, stack: &[NodeId]) -> anyhow::Result<()> {
        let edge = self.state.nodes.get(node).in_edge.expect("cycle through an in-edge");
        let start = stack
            .iter()
            .position(|&n| self.state.nodes.get(n).in_edge == Some(edge))
            .expect("in-stack edge must be on the stack");

        // Report the cycle's start as the node at its end rather than some
        // other output of the starting edge, so `a -> c -> a` is reported
        // instead of `b -> c -> a`.
        let mut names: Vec<&str> = stack[start..]
            .iter()
            .map(|&n| self.state.nodes.get(n).path.as_str())
            .collect();
        names[0] = &self.state.nodes.get(node).path;

        let mut err = "dependency cycle: ".to_string();
        for name in &names {
            err.push_str(name);
            err.push_str(" -> ");
        }
        err.push_str(names[0]);

        if start + 1 == stack.len() && self.state.edges.get(edge).maybe_phonycycle_diagnostic() {
            // Certain legacy generators emit self-referencing phony edges.
            err.push_str(" [-w phonycycle=err]");
        }

        bail!(err)
    }

    /// Check whether any output of the edge is out of date with respect to
    /// the most recent input and the build log.
    pub fn recompute_outputs_dirty(
        &mut self,
        edge: EdgeId,
        most_recent_input: Option<NodeId>,
    ) -> anyhow::Result<bool> {
        let command = self.state.evaluate_command(edge, true)?;
        for out in self.state.edges.get(edge).outputs.clone() {
            if self.recompute_output_dirty(edge, most_recent_input, &command, out)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn recompute_output_dirty(
        &self,
        edge: EdgeId,
        most_recent_input: Option<NodeId>,
        command: &str,
        output: NodeId,
    ) -> anyhow::Result<bool> {
        let e = self.state.edges.get(edge);
        let out = self.state.nodes.get(output);

        if e.is_phony() {
            // Phony edges don't write any output.  Outputs are only dirty
            // if there are no inputs and the output is missing.
            return Ok(e.inputs.is_empty() && !out.exists());
        }

        // Dirty if we're missing the output.
        if !out.exists() {
            return Ok(true);
        }

        let entry = self.build_log.lookup(&out.path);

        // Dirty if the output is older than the input.
        if let Some(input) = most_recent_input {
            let input_mtime = self.state.nodes.get(input).mtime();
            let mut output_mtime = out.mtime();

            // If this is a restat rule, we may have cleaned the output in a
            // previous run and stored the most recent input mtime in the
            // build log.  Use that mtime instead, so that the output is only
            // considered dirty if an input was modified since the previous
            // run.
            if self.state.get_binding_bool(edge, "restat")? {
                if let Some(entry) = entry {
                    output_mtime = crate::disk::MTime::Stamp(entry.mtime);
                }
            }

            if output_mtime < input_mtime {
                return Ok(true);
            }
        }

        let generator = self.state.get_binding_bool(edge, "generator")?;
        if let Some(entry) = entry {
            // Dirty if the command changed since the last build.  Generator
            // rules are exempt: the command that regenerates the manifest
            // changing does not invalidate the manifest.
            if !generator && crate::hash::hash_command(command) != entry.command_hash {
                return Ok(true);
            }
            // Dirty if the recorded mtime is older than the most recent
            // input; a previous run wrote the output but was interrupted
            // before recording completion.
            if let Some(input) = most_recent_input {
                if entry.mtime < self.state.nodes.get(input).mtime().timestamp() {
                    return Ok(true);
                }
            }
        } else if !generator {
            // No record of ever building this output.
            return Ok(true);
        }

        Ok(false)
    }

    /// Parse and integrate a dyndep file, returning the per-edge additions.
    pub fn load_dyndeps(&mut self, node: NodeId) -> anyhow::Result<DyndepFile> {
        dyndep::load_dyndeps(self.state, self.disk, node)
    }

    fn stat_node(&mut self, node: NodeId) -> anyhow::Result<()> {
        let mtime = self.disk.stat(&self.state.nodes.get(node).path)?;
        self.state.nodes.get_mut(node).mtime = Some(mtime);
        Ok(())
    }

    fn stat_node_if_necessary(&mut self, node: NodeId) -> anyhow::Result<()> {
        if self.state.nodes.get(node).status_known() {
            return Ok(());
        }
        self.stat_node(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_log::BuildLog;
    use crate::deps_log::DepsLog;
    use crate::disk::VirtualDisk;
    use crate::graph::NodeId;
    use crate::load::load_state_from;

    fn scan(
        state: &mut State,
        build_log: &BuildLog,
        deps_log: &DepsLog,
        disk: &mut VirtualDisk,
        target: &str,
    ) -> anyhow::Result<NodeId> {
        let node = state.lookup_node(target).expect("known target");
        DependencyScan::new(state, build_log, deps_log, disk).recompute_dirty(node)?;
        Ok(node)
    }

    const CC_MANIFEST: &str = "
rule cc
  command = cc $in -o $out
build a.o: cc a.c
";

    #[test]
    fn missing_output_is_dirty() -> anyhow::Result<()> {
        let mut state = load_state_from(CC_MANIFEST)?;
        let mut disk = VirtualDisk::new();
        disk.add("a.c", "");
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert!(state.nodes.get(out).dirty);
        let edge = state.nodes.get(out).in_edge.unwrap();
        assert!(!state.edges.get(edge).outputs_ready);
        Ok(())
    }

    #[test]
    fn null_build_is_clean() -> anyhow::Result<()> {
        let mut state = load_state_from(CC_MANIFEST)?;
        let mut disk = VirtualDisk::new();
        disk.add("a.c", "");
        disk.add("a.o", "");
        let mut build_log = BuildLog::new();
        let deps_log = DepsLog::new();
        let out = state.lookup_node("a.o").unwrap();
        let edge = state.nodes.get(out).in_edge.unwrap();
        build_log.record_command(&state, edge, 0, 0, disk.mtime_of("a.o").unwrap())?;

        scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert!(!state.nodes.get(out).dirty);
        assert!(state.edges.get(edge).outputs_ready);
        Ok(())
    }

    #[test]
    fn changed_command_invalidates_output() -> anyhow::Result<()> {
        // Record a log entry under the old command, then scan a graph whose
        // rule changed; nothing on disk changed, only the hash.
        let old_state = load_state_from(CC_MANIFEST)?;
        let old_edge = {
            let out = old_state.lookup_node("a.o").unwrap();
            old_state.nodes.get(out).in_edge.unwrap()
        };
        let mut disk = VirtualDisk::new();
        disk.add("a.c", "");
        disk.add("a.o", "");
        let mut build_log = BuildLog::new();
        build_log.record_command(&old_state, old_edge, 0, 0, disk.mtime_of("a.o").unwrap())?;

        let mut state = load_state_from(
            "
rule cc
  command = cc -O2 $in -o $out
build a.o: cc a.c
",
        )?;
        let deps_log = DepsLog::new();
        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert!(state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn no_log_entry_means_dirty() -> anyhow::Result<()> {
        let mut state = load_state_from(CC_MANIFEST)?;
        let mut disk = VirtualDisk::new();
        disk.add("a.c", "");
        disk.add("a.o", "");
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        // Output is newer than the input, but nothing ever recorded
        // building it.
        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert!(state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn generator_rule_ignores_command_change() -> anyhow::Result<()> {
        let manifest_old = "
rule gen
  command = gen.sh
  generator = 1
build build.ninja: gen gen.sh
";
        let manifest_new = "
rule gen
  command = gen.sh --changed
  generator = 1
build build.ninja: gen gen.sh
";
        let old_state = load_state_from(manifest_old)?;
        let old_edge = {
            let out = old_state.lookup_node("build.ninja").unwrap();
            old_state.nodes.get(out).in_edge.unwrap()
        };
        let mut disk = VirtualDisk::new();
        disk.add("gen.sh", "");
        disk.add("build.ninja", "");
        let mut build_log = BuildLog::new();
        build_log.record_command(
            &old_state,
            old_edge,
            0,
            0,
            disk.mtime_of("build.ninja").unwrap(),
        )?;

        let mut state = load_state_from(manifest_new)?;
        let deps_log = DepsLog::new();
        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "build.ninja")?;
        assert!(!state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn restat_mtime_in_log_keeps_output_clean() -> anyhow::Result<()> {
        let manifest = "
rule rs
  command = touch $out
  restat = 1
build m: rs src
";
        let mut state = load_state_from(manifest)?;
        let mut disk = VirtualDisk::new();
        disk.add("m", "");
        disk.add("src", "");
        // On disk the output is older than the input, but a previous restat
        // run recorded that the command saw this input already.
        let mut build_log = BuildLog::new();
        let edge = {
            let out = state.lookup_node("m").unwrap();
            state.nodes.get(out).in_edge.unwrap()
        };
        build_log.record_command(&state, edge, 0, 0, disk.mtime_of("src").unwrap())?;
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "m")?;
        assert!(!state.nodes.get(out).dirty);

        // The same shape without restat is dirty.
        let mut state = load_state_from(
            "
rule rs
  command = touch $out
build m: rs src
",
        )?;
        let mut build_log = BuildLog::new();
        let edge = {
            let out = state.lookup_node("m").unwrap();
            state.nodes.get(out).in_edge.unwrap()
        };
        build_log.record_command(&state, edge, 0, 0, disk.mtime_of("src").unwrap())?;
        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "m")?;
        assert!(state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn stale_log_mtime_forces_rebuild() -> anyhow::Result<()> {
        // The output file is newer than the input, but the log recorded an
        // older mtime: a previous run wrote the output and was interrupted
        // before finishing.
        let mut state = load_state_from(CC_MANIFEST)?;
        let mut disk = VirtualDisk::new();
        disk.add("a.c", "");
        let mut build_log = BuildLog::new();
        let edge = {
            let out = state.lookup_node("a.o").unwrap();
            state.nodes.get(out).in_edge.unwrap()
        };
        build_log.record_command(&state, edge, 0, 0, disk.mtime_of("a.c").unwrap() - 1)?;
        disk.add("a.o", "");
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert!(state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn order_only_inputs_do_not_dirty() -> anyhow::Result<()> {
        let mut state = load_state_from(
            "
rule cc
  command = cc $in -o $out
build a.o: cc a.c || gen
",
        )?;
        let mut disk = VirtualDisk::new();
        disk.add("a.c", "");
        disk.add("a.o", "");
        let mut build_log = BuildLog::new();
        let edge = {
            let out = state.lookup_node("a.o").unwrap();
            state.nodes.get(out).in_edge.unwrap()
        };
        build_log.record_command(&state, edge, 0, 0, disk.mtime_of("a.o").unwrap())?;
        // The order-only input is newer than the output.
        disk.add("gen", "");
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert!(!state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn cycle_is_reported() -> anyhow::Result<()> {
        let mut state = load_state_from(
            "
rule cat
  command = cat $in > $out
build a: cat b
build b: cat a
",
        )?;
        let mut disk = VirtualDisk::new();
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let node = state.lookup_node("a").unwrap();
        let err = DependencyScan::new(&mut state, &build_log, &deps_log, &mut disk)
            .recompute_dirty(node)
            .unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
        Ok(())
    }

    #[test]
    fn phony_self_cycle_gets_diagnostic() -> anyhow::Result<()> {
        let mut state = load_state_from("build a: phony a\n")?;
        let mut disk = VirtualDisk::new();
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let node = state.lookup_node("a").unwrap();
        let err = DependencyScan::new(&mut state, &build_log, &deps_log, &mut disk)
            .recompute_dirty(node)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "dependency cycle: a -> a [-w phonycycle=err]"
        );
        Ok(())
    }

    #[test]
    fn phony_with_no_inputs_is_ready() -> anyhow::Result<()> {
        let mut state = load_state_from("build alias: phony\n")?;
        let mut disk = VirtualDisk::new();
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "alias")?;
        // Missing output of an inputless phony edge is dirty but still
        // ready: there is nothing to run.
        assert!(state.nodes.get(out).dirty);
        let edge = state.nodes.get(out).in_edge.unwrap();
        assert!(state.edges.get(edge).outputs_ready);
        Ok(())
    }

    #[test]
    fn depfile_splices_implicit_inputs() -> anyhow::Result<()> {
        let mut state = load_state_from(
            "
rule cc
  command = cc $in -o $out
  depfile = $out.d
build main.o: cc main.c
",
        )?;
        let mut disk = VirtualDisk::new();
        disk.add("main.c", "");
        disk.add("hdr.h", "");
        disk.add("main.o.d", "main.o: hdr.h\n");
        disk.add("main.o", "");
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "main.o")?;
        let edge = state.nodes.get(out).in_edge.unwrap();
        assert!(!state.edges.get(edge).deps_missing);
        assert_eq!(state.edges.get(edge).implicit_ins, 1);

        let hdr = state.lookup_node("hdr.h").unwrap();
        assert!(state.edges.get(edge).inputs.contains(&hdr));
        // The discovered input gets a phony producer so the plan can wait
        // on it.
        let phony = state.nodes.get(hdr).in_edge.unwrap();
        assert!(state.edges.get(phony).is_phony());
        assert!(state.edges.get(phony).outputs_ready);
        Ok(())
    }

    #[test]
    fn missing_depfile_forces_rebuild() -> anyhow::Result<()> {
        let mut state = load_state_from(
            "
rule cc
  command = cc $in -o $out
  depfile = $out.d
build main.o: cc main.c
",
        )?;
        let mut disk = VirtualDisk::new();
        disk.add("main.c", "");
        disk.add("main.o", "");
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "main.o")?;
        let edge = state.nodes.get(out).in_edge.unwrap();
        assert!(state.edges.get(edge).deps_missing);
        assert!(state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn depfile_with_wrong_primary_output_forces_rebuild() -> anyhow::Result<()> {
        let mut state = load_state_from(
            "
rule cc
  command = cc $in -o $out
  depfile = $out.d
build main.o: cc main.c
",
        )?;
        let mut disk = VirtualDisk::new();
        disk.add("main.c", "");
        disk.add("main.o", "");
        disk.add("main.o.d", "other.o: hdr.h\n");
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "main.o")?;
        let edge = state.nodes.get(out).in_edge.unwrap();
        assert!(state.edges.get(edge).deps_missing);
        assert!(state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn stale_deps_log_entry_is_ignored() -> anyhow::Result<()> {
        let mut state = load_state_from(
            "
rule cc
  command = cc $in -o $out
  deps = gcc
  depfile = $out.d
build main.o: cc main.c
",
        )?;
        let mut disk = VirtualDisk::new();
        disk.add("main.c", "");
        let mut deps_log = DepsLog::new();
        let out = state.lookup_node("main.o").unwrap();
        let hdr = state.node_id("hdr.h");
        // Recorded before the output was last written.
        deps_log.record_deps(&state, out, 1, &[hdr])?;
        disk.add("hdr.h", "");
        disk.add("main.o", "");
        let build_log = BuildLog::new();

        scan(&mut state, &build_log, &deps_log, &mut disk, "main.o")?;
        let edge = state.nodes.get(out).in_edge.unwrap();
        assert!(state.edges.get(edge).deps_missing);
        assert!(state.nodes.get(out).dirty);
        Ok(())
    }

    #[test]
    fn scan_is_idempotent() -> anyhow::Result<()> {
        let mut state = load_state_from(CC_MANIFEST)?;
        let mut disk = VirtualDisk::new();
        disk.add("a.c", "");
        let build_log = BuildLog::new();
        let deps_log = DepsLog::new();

        let out = scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        let first = state.nodes.get(out).dirty;
        scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert_eq!(state.nodes.get(out).dirty, first);

        // A full reset and rescan against unchanged inputs also agrees.
        state.reset();
        scan(&mut state, &build_log, &deps_log, &mut disk, "a.o")?;
        assert_eq!(state.nodes.get(out).dirty, first);
        Ok(())
    }
}
