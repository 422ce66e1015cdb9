//! The build plan and the executor that drives it: tracking which edges are
//! wanted, which are ready, dispatching ready commands to the runner, and
//! reacting to completions (including dyndep files discovered mid-build).

use crate::build_log::{BuildLog, BuildLogUser};
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, TimeStamp};
use crate::dyndep::DyndepFile;
use crate::graph::{EdgeId, NodeId, State};
use crate::scan::DependencyScan;
use crate::scanner::Scanner;
use crate::status::Status;
use crate::task::{CommandResult, CommandRunner, DryRunCommandRunner, ExitStatus, RealCommandRunner};
use anyhow::{anyhow, bail};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Per-edge want state: nothing to do, needs scheduling, or scheduled and
/// awaiting completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Want {
    Nothing,
    ToStart,
    ToFinish,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EdgeResult {
    Failed,
    Succeeded,
}

/// Tracks which edges the build wants, which are ready to run, and the
/// counts that decide when the build is done.
#[derive(Default)]
pub struct Plan {
    want: HashMap<EdgeId, Want>,
    /// Edges whose inputs are all ready and which their pool has admitted.
    ready: BTreeSet<EdgeId>,
    wanted_edges: usize,
    command_edges: usize,
}

impl Plan {
    pub fn new() -> Self {
        Plan::default()
    }

    /// Number of non-phony edges the plan intends to run.
    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn want_for(&self, edge: EdgeId) -> Option<Want> {
        self.want.get(&edge).copied()
    }

    /// Add a target and its dirty transitive inputs to the plan.
    pub fn add_target(&mut self, state: &mut State, node: NodeId) -> anyhow::Result<()> {
        self.add_sub_target(state, node, None, None)
    }

    fn add_sub_target(
        &mut self,
        state: &mut State,
        node: NodeId,
        dependent: Option<NodeId>,
        mut dyndep_walk: Option<&mut HashSet<EdgeId>>,
    ) -> anyhow::Result<()> {
        let Some(edge) = state.nodes.get(node).in_edge else {
            // Leaf node: only a problem if it's missing and something needed
            // it.
            if state.nodes.get(node).dirty {
                let path = &state.nodes.get(node).path;
                match dependent {
                    Some(dependent) => bail!(
                        "'{}', needed by '{}', missing and no known rule to make it",
                        path,
                        state.nodes.get(dependent).path
                    ),
                    None => bail!("'{}' missing and no known rule to make it", path),
                }
            }
            return Ok(());
        };

        if state.edges.get(edge).outputs_ready {
            return Ok(()); // Don't need to do anything.
        }

        // If an entry in want does not already exist for the edge, create
        // one mapping to Nothing, indicating we do not yet want to build it.
        let newly_inserted = !self.want.contains_key(&edge);
        if newly_inserted {
            self.want.insert(edge, Want::Nothing);
        }
        let want = *self.want.get(&edge).expect("just inserted");

        if dyndep_walk.is_some() && want == Want::ToFinish {
            return Ok(()); // Already scheduled; nothing a dyndep walk adds.
        }

        if state.nodes.get(node).dirty && want == Want::Nothing {
            *self.want.get_mut(&edge).expect("present") = Want::ToStart;
            self.edge_wanted(state, edge);
            if dyndep_walk.is_none() && state.all_inputs_ready(edge) {
                self.schedule_work(state, edge);
            }
        }

        if let Some(walk) = dyndep_walk.as_deref_mut() {
            walk.insert(edge);
        }

        if !newly_inserted {
            return Ok(()); // We've already processed the inputs.
        }

        for input in state.edges.get(edge).inputs.clone() {
            self.add_sub_target(state, input, Some(node), dyndep_walk.as_deref_mut())?;
        }
        Ok(())
    }

    fn edge_wanted(&mut self, state: &State, edge: EdgeId) {
        self.wanted_edges += 1;
        if !state.edges.get(edge).is_phony() {
            self.command_edges += 1;
        }
    }

    /// Take an arbitrary ready edge to run next.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        let edge = self.ready.iter().next().copied()?;
        self.ready.remove(&edge);
        Some(edge)
    }

    fn schedule_work(&mut self, state: &mut State, edge: EdgeId) {
        let want = self.want.get_mut(&edge).expect("scheduled edge must be wanted");
        if *want == Want::ToFinish {
            // This edge was already scheduled.  We can get here again when
            // an edge and one of its dependencies share an order-only input,
            // or when a node duplicates an out edge.
            return;
        }
        debug_assert_eq!(*want, Want::ToStart);
        *want = Want::ToFinish;

        let weight = state.edges.get(edge).weight();
        let pool_id = state.edges.get(edge).pool;
        let pool = state.pools.get_mut(pool_id);
        if pool.should_delay_edge(weight) {
            pool.delay_edge(weight, edge);
            pool.retrieve_ready_edges(&mut self.ready);
        } else {
            pool.edge_scheduled(weight);
            self.ready.insert(edge);
        }
    }

    /// Account for a finished edge.  On success, mark its outputs ready and
    /// surface newly-ready dependents; nodes that carry pending dyndep info
    /// are appended to `dyndeps_out` for the builder to load.
    pub fn edge_finished(
        &mut self,
        state: &mut State,
        edge: EdgeId,
        result: EdgeResult,
        dyndeps_out: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let directly_wanted =
            *self.want.get(&edge).expect("finished edge must be wanted") != Want::Nothing;

        // See if this job frees up any delayed jobs in its pool.
        {
            let weight = state.edges.get(edge).weight();
            let pool = state.pools.get_mut(state.edges.get(edge).pool);
            if directly_wanted {
                pool.edge_finished(weight);
            }
            pool.retrieve_ready_edges(&mut self.ready);
        }

        // The rest only applies to successful commands.
        if result == EdgeResult::Failed {
            return Ok(());
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        self.want.remove(&edge);
        state.edges.get_mut(edge).outputs_ready = true;

        // Check off any nodes we were waiting for with this edge.
        for output in state.edges.get(edge).outputs.clone() {
            self.node_finished(state, output, dyndeps_out)?;
        }
        Ok(())
    }

    fn node_finished(
        &mut self,
        state: &mut State,
        node: NodeId,
        dyndeps_out: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        // If this node provides dyndep info, it must be loaded before any
        // dependent readiness can be decided.
        if state.nodes.get(node).dyndep_pending {
            dyndeps_out.push(node);
            return Ok(());
        }

        for out_edge in state.nodes.get(node).out_edges.clone() {
            if self.want.contains_key(&out_edge) {
                self.edge_maybe_ready(state, out_edge, dyndeps_out)?;
            }
        }
        Ok(())
    }

    fn edge_maybe_ready(
        &mut self,
        state: &mut State,
        edge: EdgeId,
        dyndeps_out: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        if !state.all_inputs_ready(edge) {
            return Ok(());
        }
        if *self.want.get(&edge).expect("edge in want") != Want::Nothing {
            self.schedule_work(state, edge);
        } else {
            // We don't need to build this edge, but we might need to build
            // one of its dependents.
            self.edge_finished(state, edge, EdgeResult::Succeeded, dyndeps_out)?;
        }
        Ok(())
    }

    /// A restat rule left `node` untouched: mark it clean and propagate
    /// through dependents whose remaining inputs are all clean, demoting
    /// edges whose outputs turn out clean too.
    pub fn clean_node(&mut self, scan: &mut DependencyScan, node: NodeId) -> anyhow::Result<()> {
        scan.state.nodes.get_mut(node).dirty = false;

        for out_edge in scan.state.nodes.get(node).out_edges.clone() {
            // Don't process edges we don't actually want.
            match self.want.get(&out_edge) {
                None | Some(Want::Nothing) => continue,
                Some(_) => {}
            }
            // Don't attempt to clean an edge that failed to load deps.
            if scan.state.edges.get(out_edge).deps_missing {
                continue;
            }

            let dirtying = scan.state.edges.get(out_edge).dirtying_ins().to_vec();
            if dirtying
                .iter()
                .any(|&input| scan.state.nodes.get(input).dirty)
            {
                continue;
            }

            let most_recent_input = dirtying.iter().copied().max_by_key(|&input| {
                scan.state.nodes.get(input).mtime()
            });

            // This edge is dirty only if any output is.  If not, clean the
            // outputs and mark the edge as not wanted.
            if scan.recompute_outputs_dirty(out_edge, most_recent_input)? {
                continue;
            }
            for output in scan.state.edges.get(out_edge).outputs.clone() {
                self.clean_node(scan, output)?;
            }

            *self.want.get_mut(&out_edge).expect("wanted edge") = Want::Nothing;
            self.wanted_edges -= 1;
            if !scan.state.edges.get(out_edge).is_phony() {
                self.command_edges -= 1;
            }
        }
        Ok(())
    }

    /// Integrate freshly loaded dyndep info: the graph below `node` has
    /// grown, so dependents' dirtiness must be refreshed, newly reachable
    /// inputs added, and affected edges re-checked for readiness.
    pub fn dyndeps_loaded(
        &mut self,
        scan: &mut DependencyScan,
        node: NodeId,
        ddf: &DyndepFile,
        dyndeps_out: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        self.refresh_dyndep_dependents(scan, node)?;

        // Walk the newly reachable portion of the graph, starting from the
        // edges in the plan for which we have new dyndep info.
        let mut dyndep_walk: HashSet<EdgeId> = HashSet::new();
        for &(edge, ref dyndeps) in ddf.iter() {
            if scan.state.edges.get(edge).outputs_ready {
                continue;
            }
            if !self.want.contains_key(&edge) {
                // Nothing in the plan depends on this edge yet.
                continue;
            }
            let dependent = scan.state.edges.get(edge).outputs[0];
            for &input in &dyndeps.implicit_inputs {
                self.add_sub_target(scan.state, input, Some(dependent), Some(&mut dyndep_walk))?;
            }
        }

        // Add out edges of the dyndep node that are in the plan, just as
        // node_finished would have without the dyndep path.
        for out_edge in scan.state.nodes.get(node).out_edges.clone() {
            if self.want.contains_key(&out_edge) {
                dyndep_walk.insert(out_edge);
            }
        }

        // See if any encountered edges are now ready, in id order for
        // reproducibility.
        let mut walk: Vec<EdgeId> = dyndep_walk.into_iter().collect();
        walk.sort();
        for edge in walk {
            if self.want.contains_key(&edge) {
                self.edge_maybe_ready(scan.state, edge, dyndeps_out)?;
            }
        }
        Ok(())
    }

    fn refresh_dyndep_dependents(
        &mut self,
        scan: &mut DependencyScan,
        node: NodeId,
    ) -> anyhow::Result<()> {
        // Collect the transitive closure of dependents and mark their edges
        // as not yet visited so the scan re-runs over the grown graph.
        let mut dependents: HashSet<NodeId> = HashSet::new();
        unmark_dependents(self, scan.state, node, &mut dependents);

        let mut ordered: Vec<NodeId> = dependents.into_iter().collect();
        ordered.sort();
        for dependent in ordered {
            scan.recompute_dirty(dependent)?;
            if !scan.state.nodes.get(dependent).dirty {
                continue;
            }

            // The edge was encountered before but may not have been wanted
            // when its outputs weren't known to be dirty.  With dyndep info
            // loaded the output is now dirty, so we want the edge.
            let edge = scan
                .state
                .nodes
                .get(dependent)
                .in_edge
                .expect("dyndep dependent has a producer");
            debug_assert!(!scan.state.edges.get(edge).outputs_ready);
            let want = self.want.get_mut(&edge).expect("dependent edge in plan");
            if *want == Want::Nothing {
                *want = Want::ToStart;
                self.edge_wanted(scan.state, edge);
            }
        }
        Ok(())
    }
}

fn unmark_dependents(
    plan: &Plan,
    state: &mut State,
    node: NodeId,
    dependents: &mut HashSet<NodeId>,
) {
    for edge in state.nodes.get(node).out_edges.clone() {
        if !plan.want.contains_key(&edge) {
            continue;
        }
        if state.edges.get(edge).mark == crate::graph::VisitMark::None {
            continue;
        }
        state.edges.get_mut(edge).mark = crate::graph::VisitMark::None;
        for output in state.edges.get(edge).outputs.clone() {
            if dependents.insert(output) {
                unmark_dependents(plan, state, output, dependents);
            }
        }
    }
}

/// Knobs for one build.
pub struct BuildConfig {
    pub parallelism: usize,
    /// Number of command failures tolerated before the build stops.
    pub failures_allowed: usize,
    /// When positive, don't start new commands while the 1-minute load
    /// average is at or above this.
    pub max_load_average: f64,
    pub dry_run: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            parallelism: 1,
            failures_allowed: 1,
            max_load_average: 0.0,
            dry_run: false,
        }
    }
}

/// Glue: owns the state, logs, and plan, and runs the scan → plan → runner
/// pipeline for one build.
pub struct Builder {
    pub state: State,
    pub config: BuildConfig,
    pub plan: Plan,
    pub disk: Box<dyn DiskInterface>,
    pub build_log: BuildLog,
    pub deps_log: DepsLog,
    pub status: Box<dyn Status>,
    pub runner: Option<Box<dyn CommandRunner>>,
}

impl Builder {
    pub fn new(
        state: State,
        config: BuildConfig,
        disk: Box<dyn DiskInterface>,
        build_log: BuildLog,
        deps_log: DepsLog,
        status: Box<dyn Status>,
    ) -> Self {
        Builder {
            state,
            config,
            plan: Plan::new(),
            disk,
            build_log,
            deps_log,
            status,
            runner: None,
        }
    }

    /// Open both logs for appending, compacting as needed.  Entries for
    /// outputs the manifest no longer produces are dead.
    pub fn open_logs(&mut self, log_path: &Path, deps_path: &Path) -> anyhow::Result<()> {
        struct ManifestUser<'a>(&'a State);
        impl BuildLogUser for ManifestUser<'_> {
            fn is_path_dead(&self, path: &str) -> bool {
                match self.0.lookup_node(path) {
                    Some(node) => self.0.nodes.get(node).in_edge.is_none(),
                    None => true,
                }
            }
        }
        self.build_log
            .open_for_write(log_path, &ManifestUser(&self.state))?;
        self.deps_log.open_for_write(deps_path, &self.state)?;
        Ok(())
    }

    pub fn add_target_by_name(&mut self, name: &str) -> anyhow::Result<NodeId> {
        let path = crate::canon::canon_path(name);
        let node = self
            .state
            .lookup_node(&path)
            .ok_or_else(|| anyhow!("unknown target: '{}'", name))?;
        self.add_target(node)?;
        Ok(node)
    }

    /// Scan the target for dirtiness and enlist the dirty parts in the plan.
    pub fn add_target(&mut self, node: NodeId) -> anyhow::Result<()> {
        {
            let mut scan = DependencyScan::new(
                &mut self.state,
                &self.build_log,
                &self.deps_log,
                self.disk.as_mut(),
            );
            scan.recompute_dirty(node)?;
        }

        if let Some(in_edge) = self.state.nodes.get(node).in_edge {
            if self.state.edges.get(in_edge).outputs_ready {
                return Ok(()); // Nothing to do.
            }
        }

        self.plan.add_target(&mut self.state, node)
    }

    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the plan to completion, returning the number of commands
    /// executed.
    pub fn build(&mut self) -> anyhow::Result<usize> {
        debug_assert!(!self.already_up_to_date());

        self.status.plan_has_total_edges(self.plan.command_edge_count());
        let mut pending_commands: usize = 0;
        let mut failures_allowed = self.config.failures_allowed;
        let mut tasks_ran: usize = 0;

        if self.runner.is_none() {
            self.runner = Some(if self.config.dry_run {
                Box::new(DryRunCommandRunner::default())
            } else {
                Box::new(RealCommandRunner::new(
                    self.config.parallelism,
                    self.config.max_load_average,
                ))
            });
        }

        self.status.build_started();

        // First start as many commands as the runner allows, then wait for
        // a completion, until the plan is exhausted or failures stop us.
        while self.plan.more_to_do() {
            if failures_allowed > 0 && self.runner.as_ref().expect("runner set").can_run_more() {
                if let Some(edge) = self.plan.find_work() {
                    if let Err(err) = self.run_edge(edge, &mut pending_commands, &mut tasks_ran) {
                        self.cleanup();
                        self.status.build_finished();
                        return Err(err);
                    }
                    continue;
                }
            }

            if pending_commands > 0 {
                let result = self.runner.as_mut().expect("runner set").wait_for_command();
                let interrupted = match &result {
                    None => true,
                    Some(result) => result.status == ExitStatus::Interrupted,
                };
                if interrupted {
                    self.cleanup();
                    self.status.build_finished();
                    bail!("interrupted by user");
                }
                let result = result.expect("checked above");
                pending_commands -= 1;
                let success = result.status == ExitStatus::Success;
                if let Err(err) = self.finish_command(result) {
                    self.cleanup();
                    self.status.build_finished();
                    return Err(err);
                }
                if !success {
                    failures_allowed = failures_allowed.saturating_sub(1);
                }
                continue;
            }

            // No progress possible.
            self.status.build_finished();
            if failures_allowed == 0 {
                if self.config.failures_allowed > 1 {
                    bail!("subcommands failed");
                }
                bail!("subcommand failed");
            } else if failures_allowed < self.config.failures_allowed {
                bail!("cannot make progress due to previous errors");
            } else {
                bail!("stuck [this is a bug]");
            }
        }

        self.status.build_finished();
        Ok(tasks_ran)
    }

    fn run_edge(
        &mut self,
        edge: EdgeId,
        pending_commands: &mut usize,
        tasks_ran: &mut usize,
    ) -> anyhow::Result<()> {
        self.start_edge(edge)?;
        if self.state.edges.get(edge).is_phony() {
            let mut dyndeps = Vec::new();
            self.plan
                .edge_finished(&mut self.state, edge, EdgeResult::Succeeded, &mut dyndeps)?;
            self.load_pending_dyndeps(dyndeps)?;
        } else {
            *pending_commands += 1;
            *tasks_ran += 1;
        }
        Ok(())
    }

    fn start_edge(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        if self.state.edges.get(edge).is_phony() {
            return Ok(());
        }
        self.status.build_edge_started(&self.state, edge);

        // Create directories necessary for outputs.
        for output in self.state.edges.get(edge).outputs.clone() {
            let path = self.state.nodes.get(output).path.clone();
            self.disk.make_dirs(&path)?;
        }

        // Create the response file, if needed.
        let rspfile = self.state.get_unescaped_binding(edge, "rspfile")?;
        if !rspfile.is_empty() {
            let content = self.state.get_binding(edge, "rspfile_content")?;
            self.disk.make_dirs(&rspfile)?;
            self.disk.write_file(&rspfile, &content)?;
        }

        let command = self.state.evaluate_command(edge, false)?;
        let use_console = self.state.edges.get(edge).use_console();
        self.runner
            .as_mut()
            .expect("runner set")
            .start_command(edge, command, use_console);
        Ok(())
    }

    fn finish_command(&mut self, mut result: CommandResult) -> anyhow::Result<()> {
        let edge = result.edge;

        // First try to extract dependencies from the result, if any.  This
        // must happen before reporting failure because it filters the
        // command output (deps=msvc include lines are consumed even when
        // the compile failed), and extraction failure itself fails the
        // command.
        let deps_type = self.state.get_binding(edge, "deps")?;
        let mut deps_nodes: Vec<NodeId> = Vec::new();
        if !deps_type.is_empty() {
            match self.extract_deps(&mut result, &deps_type) {
                Ok(nodes) => deps_nodes = nodes,
                Err(err) => {
                    if result.status == ExitStatus::Success {
                        if !result.output.is_empty() {
                            result.output.push(b'\n');
                        }
                        result.output.extend_from_slice(err.to_string().as_bytes());
                        result.status = ExitStatus::Failure;
                    }
                }
            }
        }

        let success = result.status == ExitStatus::Success;
        let (start_time, end_time) =
            self.status
                .build_edge_finished(&self.state, edge, success, &result.output);

        if !success {
            let mut dyndeps = Vec::new();
            return self
                .plan
                .edge_finished(&mut self.state, edge, EdgeResult::Failed, &mut dyndeps);
        }

        // Restat the edge outputs.  When a restat rule left an output's
        // mtime untouched, propagate cleanliness through the graph, and
        // record the most recent input mtime so the next run can tell
        // whether anything changed since this command last wrote the same
        // output.
        let mut output_mtime: TimeStamp = 0;
        let restat = self.state.get_binding_bool(edge, "restat")?;
        if !self.config.dry_run {
            let mut node_cleaned = false;
            for output in self.state.edges.get(edge).outputs.clone() {
                let path = self.state.nodes.get(output).path.clone();
                let new_mtime = self.disk.stat(&path)?;
                output_mtime = output_mtime.max(new_mtime.timestamp());
                if restat && self.state.nodes.get(output).mtime() == new_mtime {
                    // The command did not change the output.  This also
                    // covers still-nonexistent outputs.
                    let mut scan = DependencyScan::new(
                        &mut self.state,
                        &self.build_log,
                        &self.deps_log,
                        self.disk.as_mut(),
                    );
                    self.plan.clean_node(&mut scan, output)?;
                    node_cleaned = true;
                }
            }

            if node_cleaned {
                let mut restat_mtime: TimeStamp = 0;
                let dirtying = self.state.edges.get(edge).dirtying_ins().to_vec();
                for input in dirtying {
                    let path = self.state.nodes.get(input).path.clone();
                    restat_mtime = restat_mtime.max(self.disk.stat(&path)?.timestamp());
                }
                let depfile = self.state.get_unescaped_binding(edge, "depfile")?;
                if restat_mtime != 0 && deps_type.is_empty() && !depfile.is_empty() {
                    restat_mtime = restat_mtime.max(self.disk.stat(&depfile)?.timestamp());
                }

                // The total number of edges in the plan may have shrunk as a
                // result of the restat.
                self.status.plan_has_total_edges(self.plan.command_edge_count());

                output_mtime = restat_mtime;
            }
        }

        let mut dyndeps = Vec::new();
        self.plan
            .edge_finished(&mut self.state, edge, EdgeResult::Succeeded, &mut dyndeps)?;

        // Delete any leftover response file.
        let rspfile = self.state.get_unescaped_binding(edge, "rspfile")?;
        if !rspfile.is_empty() {
            let _ = self.disk.remove_file(&rspfile);
        }

        if let Err(err) =
            self.build_log
                .record_command(&self.state, edge, start_time, end_time, output_mtime)
        {
            bail!("Error writing to build log: {}", err);
        }

        if !deps_type.is_empty() && !self.config.dry_run {
            for output in self.state.edges.get(edge).outputs.clone() {
                let path = self.state.nodes.get(output).path.clone();
                let deps_mtime = self.disk.stat(&path)?.timestamp();
                if let Err(err) =
                    self.deps_log
                        .record_deps(&self.state, output, deps_mtime, &deps_nodes)
                {
                    bail!("Error writing to deps log: {}", err);
                }
            }
        }

        self.load_pending_dyndeps(dyndeps)
    }

    fn extract_deps(
        &mut self,
        result: &mut CommandResult,
        deps_type: &str,
    ) -> anyhow::Result<Vec<NodeId>> {
        match deps_type {
            "msvc" => {
                let prefix = {
                    let p = self.state.get_binding(result.edge, "msvc_deps_prefix")?;
                    if p.is_empty() {
                        "Note: including file:".to_owned()
                    } else {
                        p
                    }
                };
                let output = std::mem::take(&mut result.output);
                let mut filtered = Vec::with_capacity(output.len());
                let mut deps = Vec::new();
                let mut seen = HashSet::new();
                for line in output.split_inclusive(|&c| c == b'\n') {
                    let text = String::from_utf8_lossy(line);
                    if let Some(include) = text.trim_end().strip_prefix(&prefix) {
                        let path = crate::canon::canon_path(include.trim());
                        if seen.insert(path.clone()) {
                            deps.push(self.state.node_id(path.as_str()));
                        }
                    } else {
                        filtered.extend_from_slice(line);
                    }
                }
                result.output = filtered;
                Ok(deps)
            }
            "gcc" => {
                let depfile = self.state.get_unescaped_binding(result.edge, "depfile")?;
                if depfile.is_empty() {
                    bail!("edge with deps=gcc but no depfile makes no sense");
                }

                // Read the depfile content; a missing depfile reads as empty.
                let mut content = match self.disk.read_file(&depfile) {
                    Ok(content) => content,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                    Err(err) => bail!("loading '{}': {}", depfile, err),
                };
                if content.is_empty() {
                    return Ok(Vec::new());
                }
                content.push(0);

                let mut scanner = Scanner::new(&content);
                let parsed = match crate::depfile::parse(&mut scanner) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        bail!("{}", scanner.format_parse_error(Path::new(&depfile), err))
                    }
                };
                let mut deps = Vec::new();
                for (_, ins) in parsed.iter() {
                    for &input in ins {
                        let path = crate::canon::canon_path(input);
                        deps.push(self.state.node_id(path.as_str()));
                    }
                }

                if let Err(err) = self.disk.remove_file(&depfile) {
                    bail!("deleting depfile: {}", err);
                }
                Ok(deps)
            }
            _ => bail!("unknown deps type '{}'", deps_type),
        }
    }

    /// Load dyndep files surfaced by finished nodes; loading may surface
    /// more of them, so drain a queue.
    fn load_pending_dyndeps(&mut self, mut pending: Vec<NodeId>) -> anyhow::Result<()> {
        while let Some(node) = pending.pop() {
            self.status.build_load_dyndeps();
            let mut scan = DependencyScan::new(
                &mut self.state,
                &self.build_log,
                &self.deps_log,
                self.disk.as_mut(),
            );
            let ddf = scan.load_dyndeps(node)?;
            self.plan.dyndeps_loaded(&mut scan, node, &ddf, &mut pending)?;
            self.status.plan_has_total_edges(self.plan.command_edge_count());
        }
        Ok(())
    }

    /// On failure or interrupt: abort running commands and delete outputs
    /// that can no longer be trusted, so stale partial products don't appear
    /// up to date on the next run.
    pub fn cleanup(&mut self) {
        let Some(runner) = self.runner.as_mut() else {
            return;
        };
        let active = runner.active_edges();
        runner.abort();

        for edge in active {
            let depfile = self
                .state
                .get_unescaped_binding(edge, "depfile")
                .unwrap_or_default();
            for output in self.state.edges.get(edge).outputs.clone() {
                // Only delete an output that was actually modified; the
                // manifest of a generator rule should survive when it can.
                // But when the rule uses a depfile, always delete: the
                // command may have touched the depfile but been interrupted
                // before touching the output.
                let path = self.state.nodes.get(output).path.clone();
                match self.disk.stat(&path) {
                    Ok(new_mtime) => {
                        if !depfile.is_empty() || self.state.nodes.get(output).mtime() != new_mtime
                        {
                            let _ = self.disk.remove_file(&path);
                        }
                    }
                    Err(err) => eprintln!("{}", err),
                }
            }
            if !depfile.is_empty() {
                let _ = self.disk.remove_file(&depfile);
            }
        }
    }
}
