//! The build graph: nodes (files), edges (commands), rules, pools, and the
//! State container that owns them all.
//!
//! Nodes and edges reference each other in both directions, so both sides
//! are represented as dense ids into State's arenas; the "back" side of each
//! relation is a plain lookup, never an owning reference.

use crate::arena::{Arena, Id};
use crate::disk::MTime;
use crate::eval::{shell_escape, EvalPart, EvalString, Vars};
use crate::smallmap::SmallMap;
use anyhow::bail;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);
impl Id for NodeId {
    fn from_index(index: usize) -> NodeId {
        NodeId(index)
    }
    fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(usize);
impl Id for EdgeId {
    fn from_index(index: usize) -> EdgeId {
        EdgeId(index)
    }
    fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(usize);
impl Id for PoolId {
    fn from_index(index: usize) -> PoolId {
        PoolId(index)
    }
    fn index(self) -> usize {
        self.0
    }
}

/// A file tracked by the build: at most one edge produces it, any number
/// consume it.
#[derive(Debug)]
pub struct Node {
    pub path: String,
    /// Which slashes in `path` were backslashes in the manifest, so command
    /// lines can round-trip the original spelling on Windows.
    pub slash_bits: u64,
    /// None until the node has been statted for the current build.
    pub mtime: Option<MTime>,
    pub dirty: bool,
    /// The edge that produces this node, if any.
    pub in_edge: Option<EdgeId>,
    /// All edges that consume this node as an input.
    pub out_edges: Vec<EdgeId>,
    /// True when this node names a dyndep file that has not been loaded yet.
    pub dyndep_pending: bool,
}

impl Node {
    fn new(path: String) -> Self {
        Node {
            path,
            slash_bits: 0,
            mtime: None,
            dirty: false,
            in_edge: None,
            out_edges: Vec::new(),
            dyndep_pending: false,
        }
    }

    pub fn status_known(&self) -> bool {
        self.mtime.is_some()
    }

    pub fn exists(&self) -> bool {
        matches!(self.mtime, Some(MTime::Stamp(_)))
    }

    /// The node's mtime as of the last stat; unknown reads as missing.
    pub fn mtime(&self) -> MTime {
        self.mtime.unwrap_or(MTime::Missing)
    }

    /// The path as spelled in the manifest.
    pub fn path_decanonicalized(&self) -> String {
        if cfg!(windows) && self.slash_bits != 0 {
            let mut mask = 1u64;
            let mut out = String::with_capacity(self.path.len());
            for c in self.path.chars() {
                if c == '/' {
                    out.push(if self.slash_bits & mask != 0 { '\\' } else { '/' });
                    mask <<= 1;
                } else {
                    out.push(c);
                }
            }
            out
        } else {
            self.path.clone()
        }
    }

    fn reset(&mut self) {
        self.mtime = None;
        self.dirty = false;
    }
}

/// Per-edge traversal mark used by the dirtiness DFS for cycle detection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VisitMark {
    None,
    InStack,
    Done,
}

/// One build command: a rule applied to concrete inputs and outputs.
#[derive(Debug)]
pub struct Edge {
    pub rule: Rc<Rule>,
    pub pool: PoolId,
    /// Inputs in three contiguous regions: explicit, implicit, order-only.
    pub inputs: Vec<NodeId>,
    pub implicit_ins: usize,
    pub order_only_ins: usize,
    /// Outputs in two contiguous regions: explicit, implicit.
    pub outputs: Vec<NodeId>,
    pub implicit_outs: usize,
    /// Edge-scope variable bindings, evaluated at parse time.
    pub bindings: SmallMap<String, String>,
    /// The dyndep file node declared by this edge, if any.
    pub dyndep: Option<NodeId>,
    pub mark: VisitMark,
    pub outputs_ready: bool,
    pub deps_loaded: bool,
    pub deps_missing: bool,
}

impl Edge {
    /// Scheduling cost of this edge against its pool's depth.
    pub fn weight(&self) -> usize {
        1
    }

    pub fn is_phony(&self) -> bool {
        self.rule.name == PHONY_RULE
    }

    pub fn use_console(&self) -> bool {
        self.pool == State::CONSOLE_POOL
    }

    pub fn explicit_ins(&self) -> usize {
        self.inputs.len() - self.implicit_ins - self.order_only_ins
    }

    pub fn explicit_outs(&self) -> usize {
        self.outputs.len() - self.implicit_outs
    }

    /// Whether the input at the given index only constrains ordering.
    pub fn is_order_only(&self, index: usize) -> bool {
        index >= self.inputs.len() - self.order_only_ins
    }

    /// The inputs whose mtimes drive dirtiness.
    pub fn dirtying_ins(&self) -> &[NodeId] {
        &self.inputs[..self.inputs.len() - self.order_only_ins]
    }

    /// Certain legacy generators emit `build a: phony ... a ...`; cycle
    /// errors through such edges carry an extra diagnostic.
    pub fn maybe_phonycycle_diagnostic(&self) -> bool {
        self.is_phony() && self.outputs.len() == 1 && self.implicit_outs == 0 && self.implicit_ins == 0
    }
}

/// A named command template.  Bindings are stored unevaluated and expanded
/// lazily against each edge's environment.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    bindings: SmallMap<String, EvalString<String>>,
}

pub const PHONY_RULE: &str = "phony";

impl Rule {
    pub fn new(name: String) -> Self {
        Rule {
            name,
            bindings: SmallMap::default(),
        }
    }

    pub fn add_binding(&mut self, key: String, val: EvalString<String>) {
        self.bindings.insert(key, val);
    }

    pub fn get_binding(&self, key: &str) -> Option<&EvalString<String>> {
        self.bindings.get(key)
    }

    pub fn is_reserved_binding(var: &str) -> bool {
        matches!(
            var,
            "command"
                | "depfile"
                | "dyndep"
                | "description"
                | "deps"
                | "generator"
                | "pool"
                | "restat"
                | "rspfile"
                | "rspfile_content"
                | "msvc_deps_prefix"
        )
    }
}

/// A named admission controller limiting the concurrently scheduled weight
/// of the edges assigned to it.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    /// 0 means unlimited.
    pub depth: usize,
    current_use: usize,
    /// Edges awaiting admission, in (weight, id) order so admission is FIFO
    /// with a stable tiebreak.
    delayed: BTreeSet<(usize, EdgeId)>,
}

impl Pool {
    pub fn new(name: String, depth: usize) -> Self {
        Pool {
            name,
            depth,
            current_use: 0,
            delayed: BTreeSet::new(),
        }
    }

    pub fn current_use(&self) -> usize {
        self.current_use
    }

    pub fn delayed_count(&self) -> usize {
        self.delayed.len()
    }

    /// True if admitting an edge of the given weight now would exceed depth.
    pub fn should_delay_edge(&self, weight: usize) -> bool {
        self.depth > 0 && self.current_use + weight > self.depth
    }

    pub fn edge_scheduled(&mut self, weight: usize) {
        if self.depth > 0 {
            self.current_use += weight;
        }
    }

    pub fn edge_finished(&mut self, weight: usize) {
        if self.depth > 0 {
            self.current_use -= weight;
        }
    }

    pub fn delay_edge(&mut self, weight: usize, edge: EdgeId) {
        assert!(self.depth > 0);
        self.delayed.insert((weight, edge));
    }

    /// Move delayed edges whose weight still fits into the ready set,
    /// stopping at the first one that does not fit to preserve ordering.
    pub fn retrieve_ready_edges(&mut self, ready: &mut BTreeSet<EdgeId>) {
        while let Some(&(weight, edge)) = self.delayed.iter().next() {
            if self.current_use + weight > self.depth {
                break;
            }
            self.delayed.remove(&(weight, edge));
            ready.insert(edge);
            self.edge_scheduled(weight);
        }
    }
}

/// How to quote expanded $in/$out paths.
#[derive(Copy, Clone, PartialEq, Eq)]
enum EscapeKind {
    ShellEscape,
    DoNotEscape,
}

/// Variable lookup scope for one edge, providing the $in/$out intrinsics and
/// lazy expansion of rule bindings, with cycle detection.
struct EdgeEnv<'a> {
    state: &'a State,
    edge: &'a Edge,
    escape: EscapeKind,
    /// Rule variables currently being expanded, for cycle detection.
    lookups: Vec<String>,
}

impl<'a> EdgeEnv<'a> {
    fn new(state: &'a State, edge: &'a Edge, escape: EscapeKind) -> Self {
        EdgeEnv {
            state,
            edge,
            escape,
            lookups: Vec::new(),
        }
    }

    fn make_path_list(&self, ids: &[NodeId], sep: char) -> String {
        let mut result = String::new();
        for &id in ids {
            if !result.is_empty() {
                result.push(sep);
            }
            let path = self.state.nodes.get(id).path_decanonicalized();
            match self.escape {
                EscapeKind::ShellEscape => shell_escape(&path, &mut result),
                EscapeKind::DoNotEscape => result.push_str(&path),
            }
        }
        result
    }

    fn lookup_variable(&mut self, var: &str) -> anyhow::Result<String> {
        if var == "in" || var == "in_newline" {
            let explicit = self.edge.explicit_ins();
            let sep = if var == "in" { ' ' } else { '\n' };
            return Ok(self.make_path_list(&self.edge.inputs[..explicit], sep));
        }
        if var == "out" {
            let explicit = self.edge.explicit_outs();
            return Ok(self.make_path_list(&self.edge.outputs[..explicit], ' '));
        }

        // Edge-scope bindings shadow rule bindings.
        if let Some(val) = self.edge.bindings.get(var) {
            return Ok(val.clone());
        }

        if let Some(eval) = self.edge.rule.get_binding(var) {
            if let Some(pos) = self.lookups.iter().position(|l| l == var) {
                let mut cycle = String::new();
                for name in &self.lookups[pos..] {
                    cycle.push_str(name);
                    cycle.push_str(" -> ");
                }
                cycle.push_str(var);
                bail!("cycle in rule variables: {}", cycle);
            }
            self.lookups.push(var.to_owned());
            let result = self.evaluate(eval);
            self.lookups.pop();
            return result;
        }

        // Fall back to file-scope bindings.
        Ok(self
            .state
            .bindings
            .get(var)
            .cloned()
            .unwrap_or_default())
    }

    fn evaluate(&mut self, eval: &EvalString<String>) -> anyhow::Result<String> {
        let mut result = String::new();
        for part in eval.parts() {
            match part {
                EvalPart::Literal(s) => result.push_str(s),
                EvalPart::VarRef(v) => result.push_str(&self.lookup_variable(v)?),
            }
        }
        Ok(result)
    }
}

/// The top-level container: all nodes, edges, pools, rules, and defaults.
#[derive(Debug)]
pub struct State {
    pub nodes: Arena<NodeId, Node>,
    pub edges: Arena<EdgeId, Edge>,
    pub pools: Arena<PoolId, Pool>,
    paths: HashMap<String, NodeId>,
    pool_names: HashMap<String, PoolId>,
    pub rules: HashMap<String, Rc<Rule>>,
    /// File-scope variable bindings.
    pub bindings: Vars,
    pub defaults: Vec<NodeId>,
    phony_rule: Rc<Rule>,
}

impl State {
    pub const DEFAULT_POOL: PoolId = PoolId(0);
    pub const CONSOLE_POOL: PoolId = PoolId(1);

    pub fn new() -> Self {
        let phony_rule = Rc::new(Rule::new(PHONY_RULE.to_owned()));
        let mut rules = HashMap::new();
        rules.insert(PHONY_RULE.to_owned(), phony_rule.clone());
        let mut state = State {
            nodes: Arena::new(),
            edges: Arena::new(),
            pools: Arena::new(),
            paths: HashMap::new(),
            pool_names: HashMap::new(),
            rules,
            bindings: Vars::default(),
            defaults: Vec::new(),
            phony_rule,
        };
        let default = state.pools.add(Pool::new(String::new(), 0));
        debug_assert_eq!(default, State::DEFAULT_POOL);
        let console = state.pools.add(Pool::new("console".to_owned(), 1));
        debug_assert_eq!(console, State::CONSOLE_POOL);
        state.pool_names.insert("console".to_owned(), console);
        state
    }

    pub fn phony_rule(&self) -> Rc<Rule> {
        self.phony_rule.clone()
    }

    /// Intern a path, canonicalizing it first.  A second lookup of the same
    /// canonical path yields the same id.
    pub fn node_id(&mut self, path: impl Into<String>) -> NodeId {
        let path = crate::canon::canon_path(path);
        match self.paths.get(&path) {
            Some(&id) => id,
            None => {
                let id = self.nodes.add(Node::new(path.clone()));
                self.paths.insert(path, id);
                id
            }
        }
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        self.paths.get(path).copied()
    }

    pub fn add_rule(&mut self, rule: Rc<Rule>) -> anyhow::Result<()> {
        if self.rules.contains_key(&rule.name) {
            bail!("duplicate rule '{}'", rule.name);
        }
        self.rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    pub fn add_pool(&mut self, name: String, depth: usize) -> anyhow::Result<()> {
        if name == "console" || self.pool_names.contains_key(&name) {
            bail!("duplicate pool '{}'", name);
        }
        let id = self.pools.add(Pool::new(name.clone(), depth));
        self.pool_names.insert(name, id);
        Ok(())
    }

    pub fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.pool_names.get(name).copied()
    }

    pub fn add_edge(&mut self, rule: Rc<Rule>) -> EdgeId {
        self.edges.add(Edge {
            rule,
            pool: State::DEFAULT_POOL,
            inputs: Vec::new(),
            implicit_ins: 0,
            order_only_ins: 0,
            outputs: Vec::new(),
            implicit_outs: 0,
            bindings: SmallMap::default(),
            dyndep: None,
            mark: VisitMark::None,
            outputs_ready: false,
            deps_loaded: false,
            deps_missing: false,
        })
    }

    pub fn add_in(&mut self, edge: EdgeId, path: &str) {
        let node = self.node_id(path);
        self.edges.get_mut(edge).inputs.push(node);
        self.nodes.get_mut(node).out_edges.push(edge);
    }

    /// Attach an output node to an edge; false if another edge already
    /// produces it.
    pub fn add_out(&mut self, edge: EdgeId, path: &str) -> bool {
        let node = self.node_id(path);
        if self.nodes.get(node).in_edge.is_some() {
            return false;
        }
        self.edges.get_mut(edge).outputs.push(node);
        self.nodes.get_mut(node).in_edge = Some(edge);
        true
    }

    pub fn add_default(&mut self, path: &str) -> anyhow::Result<()> {
        match self.lookup_node(path) {
            Some(node) => {
                self.defaults.push(node);
                Ok(())
            }
            None => bail!("unknown target '{}'", path),
        }
    }

    /// True once every input's producing edge (if any) has its outputs ready.
    pub fn all_inputs_ready(&self, id: EdgeId) -> bool {
        self.edges.get(id).inputs.iter().all(|&input| {
            match self.nodes.get(input).in_edge {
                Some(in_edge) => self.edges.get(in_edge).outputs_ready,
                None => true,
            }
        })
    }

    /// Outputs that no edge consumes; the build targets when no defaults are
    /// declared.
    pub fn root_nodes(&self) -> Vec<NodeId> {
        let mut roots = Vec::new();
        for edge in self.edges.iter() {
            for &out in &edge.outputs {
                if self.nodes.get(out).out_edges.is_empty() {
                    roots.push(out);
                }
            }
        }
        roots
    }

    pub fn default_nodes(&self) -> anyhow::Result<Vec<NodeId>> {
        if !self.defaults.is_empty() {
            return Ok(self.defaults.clone());
        }
        let roots = self.root_nodes();
        if self.edges.len() > 0 && roots.is_empty() {
            bail!("could not determine root nodes of build graph");
        }
        Ok(roots)
    }

    /// Clear per-build node and edge status so the same graph can be scanned
    /// again.
    pub fn reset(&mut self) {
        for node in self.nodes.iter_mut() {
            node.reset();
        }
        for edge in self.edges.iter_mut() {
            edge.outputs_ready = false;
            edge.deps_loaded = false;
            edge.mark = VisitMark::None;
        }
    }

    /// Expand a binding on an edge, with $in/$out shell-escaped.
    pub fn get_binding(&self, id: EdgeId, key: &str) -> anyhow::Result<String> {
        EdgeEnv::new(self, self.edges.get(id), EscapeKind::ShellEscape).lookup_variable(key)
    }

    /// True when the binding expands non-empty.
    pub fn get_binding_bool(&self, id: EdgeId, key: &str) -> anyhow::Result<bool> {
        Ok(!self.get_binding(id, key)?.is_empty())
    }

    /// Expand a binding that names a path (depfile, rspfile, dyndep), where
    /// shell quoting would corrupt the name.
    pub fn get_unescaped_binding(&self, id: EdgeId, key: &str) -> anyhow::Result<String> {
        EdgeEnv::new(self, self.edges.get(id), EscapeKind::DoNotEscape).lookup_variable(key)
    }

    /// The full command for an edge.  When incl_rsp_file is set the response
    /// file content is appended so it participates in command hashing.
    pub fn evaluate_command(&self, id: EdgeId, incl_rsp_file: bool) -> anyhow::Result<String> {
        let mut command = self.get_binding(id, "command")?;
        if incl_rsp_file {
            let rspfile_content = self.get_binding(id, "rspfile_content")?;
            if !rspfile_content.is_empty() {
                command.push_str(";rspfile=");
                command.push_str(&rspfile_content);
            }
        }
        Ok(command)
    }

    /// A human-oriented description of the edge for status display.
    pub fn edge_description(&self, id: EdgeId) -> String {
        match self.get_binding(id, "description") {
            Ok(desc) if !desc.is_empty() => desc,
            _ => self.get_binding(id, "command").unwrap_or_default(),
        }
    }
}
