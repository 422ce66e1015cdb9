//! Dynamic dependency files: produced during the build, they announce
//! additional implicit inputs and outputs for edges that declared them with
//! a `dyndep` binding.
//!
//! Format:
//!   ninja_dyndep_version = 1
//!   build out | extra_out : dyndep | extra_in
//!     restat = 1

use crate::disk::DiskInterface;
use crate::graph::{EdgeId, NodeId, State};
use crate::scanner::{ParseResult, Scanner};
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::path::Path;

/// What one dyndep statement adds to its edge.
#[derive(Debug, Default, Clone)]
pub struct Dyndeps {
    pub restat: bool,
    pub implicit_inputs: Vec<NodeId>,
    pub implicit_outputs: Vec<NodeId>,
}

/// The parsed content of one dyndep file, keyed by the edge each statement
/// applies to, in file order.
pub type DyndepFile = SmallMap<EdgeId, Dyndeps>;

struct Statement {
    output: String,
    implicit_outputs: Vec<String>,
    implicit_inputs: Vec<String>,
    restat: bool,
}

/// Load the dyndep file named by `node` and graft its contents onto the
/// edges bound to it.  Returns the per-edge additions so the plan can walk
/// the newly reachable graph.
pub fn load_dyndeps(
    state: &mut State,
    disk: &dyn DiskInterface,
    node: NodeId,
) -> anyhow::Result<DyndepFile> {
    let path = state.nodes.get(node).path.clone();
    let mut content = disk
        .read_file(&path)
        .map_err(|err| anyhow!("loading '{}': {}", path, err))?;
    content.push(0);

    let mut scanner = Scanner::new(&content);
    let statements = match parse_with(&mut scanner) {
        Ok(statements) => statements,
        Err(err) => bail!("{}", scanner.format_parse_error(Path::new(&path), err)),
    };

    let mut ddf = DyndepFile::default();
    for stmt in statements {
        let out = state
            .lookup_node(&crate::canon::canon_path(stmt.output.as_str()))
            .and_then(|n| state.nodes.get(n).in_edge.map(|e| (n, e)));
        let Some((_, edge)) = out else {
            bail!("{}: no build statement exists for '{}'", path, stmt.output);
        };
        if state.edges.get(edge).dyndep != Some(node) {
            bail!(
                "{}: build statement for '{}' does not have a dyndep binding for this file",
                path,
                stmt.output
            );
        }
        if ddf.get(&edge).is_some() {
            bail!("{}: multiple statements for '{}'", path, stmt.output);
        }

        let mut dyndeps = Dyndeps {
            restat: stmt.restat,
            ..Dyndeps::default()
        };
        for out_path in &stmt.implicit_outputs {
            let out_node = state.node_id(out_path.as_str());
            if state.nodes.get(out_node).in_edge.is_some() {
                bail!("multiple rules generate {}", out_path);
            }
            state.nodes.get_mut(out_node).in_edge = Some(edge);
            state.edges.get_mut(edge).outputs.push(out_node);
            state.edges.get_mut(edge).implicit_outs += 1;
            dyndeps.implicit_outputs.push(out_node);
        }
        for in_path in &stmt.implicit_inputs {
            let in_node = state.node_id(in_path.as_str());
            ensure_phony_in_edge(state, in_node);
            let insert_at = {
                let e = state.edges.get(edge);
                e.inputs.len() - e.order_only_ins
            };
            state.edges.get_mut(edge).inputs.insert(insert_at, in_node);
            state.edges.get_mut(edge).implicit_ins += 1;
            state.nodes.get_mut(in_node).out_edges.push(edge);
            dyndeps.implicit_inputs.push(in_node);
        }
        if stmt.restat {
            state
                .edges
                .get_mut(edge)
                .bindings
                .insert("restat".to_owned(), "1".to_owned());
        }
        ddf.insert(edge, dyndeps);
    }

    // Every edge bound to this dyndep file must have been given a statement.
    for edge in state.edges.ids() {
        if state.edges.get(edge).dyndep != Some(node) {
            continue;
        }
        if ddf.get(&edge).is_none() {
            let out = state.edges.get(edge).outputs[0];
            bail!(
                "'{}' not mentioned in its dyndep file '{}'",
                state.nodes.get(out).path,
                path
            );
        }
    }

    state.nodes.get_mut(node).dyndep_pending = false;
    Ok(ddf)
}

/// A discovered input with no producer gets a phony in-edge, the same as
/// depfile-discovered inputs get, so the plan walk treats it as a plain
/// source rather than a leaf nothing can make.
fn ensure_phony_in_edge(state: &mut State, node: NodeId) {
    if state.nodes.get(node).in_edge.is_some() {
        return;
    }
    let phony = state.add_edge(state.phony_rule());
    state.nodes.get_mut(node).in_edge = Some(phony);
    state.edges.get_mut(phony).outputs.push(node);

    // Traversals that statted this node before the edge existed treated it
    // as ready; the new edge must agree or the build gets stuck waiting on
    // it.
    state.edges.get_mut(phony).outputs_ready = true;
}

fn parse_with(scanner: &mut Scanner) -> ParseResult<Vec<Statement>> {
    let mut statements = Vec::new();
    let mut version_seen = false;
    loop {
        match scanner.peek() {
            '\0' => break,
            '\n' | '\r' => scanner.next(),
            '#' => loop {
                match scanner.read() {
                    '\0' => {
                        scanner.back();
                        break;
                    }
                    '\n' => break,
                    _ => {}
                }
            },
            _ => {
                let ident = read_ident(scanner)?;
                if !version_seen {
                    if ident != "ninja_dyndep_version" {
                        return scanner
                            .parse_error("expected 'ninja_dyndep_version = ...' first");
                    }
                    scanner.skip_spaces();
                    scanner.expect('=')?;
                    scanner.skip_spaces();
                    let version = read_path(scanner)?
                        .ok_or(())
                        .or_else(|_| scanner.parse_error("expected version"))?;
                    let major = version.split('.').next().unwrap_or("");
                    if major != "1" {
                        return scanner
                            .parse_error(format!("unsupported dyndep version '{}'", version));
                    }
                    skip_eol(scanner)?;
                    version_seen = true;
                    continue;
                }
                if ident != "build" {
                    return scanner.parse_error(format!("unexpected '{}'", ident));
                }
                statements.push(read_build(scanner)?);
            }
        }
    }
    if !version_seen {
        return scanner.parse_error("expected 'ninja_dyndep_version = ...'");
    }
    Ok(statements)
}

fn read_build(scanner: &mut Scanner) -> ParseResult<Statement> {
    scanner.skip_spaces();
    let output = read_path(scanner)?
        .ok_or(())
        .or_else(|_| scanner.parse_error("expected output path"))?;

    let mut implicit_outputs = Vec::new();
    scanner.skip_spaces();
    if scanner.skip('|') {
        scanner.skip_spaces();
        while let Some(p) = read_path(scanner)? {
            implicit_outputs.push(p);
            scanner.skip_spaces();
        }
    }

    scanner.expect(':')?;
    scanner.skip_spaces();
    let rule = read_ident(scanner)?;
    if rule != "dyndep" {
        return scanner.parse_error(format!("expected rule 'dyndep', got '{}'", rule));
    }

    let mut implicit_inputs = Vec::new();
    scanner.skip_spaces();
    if scanner.skip('|') {
        scanner.skip_spaces();
        while let Some(p) = read_path(scanner)? {
            implicit_inputs.push(p);
            scanner.skip_spaces();
        }
    }
    skip_eol(scanner)?;

    // Optional indented bindings; only restat is understood.
    let mut restat = false;
    while scanner.peek() == ' ' {
        scanner.skip_spaces();
        let name = read_ident(scanner)?;
        if name != "restat" {
            return scanner.parse_error(format!("unexpected variable '{}'", name));
        }
        scanner.skip_spaces();
        scanner.expect('=')?;
        scanner.skip_spaces();
        let val = read_path(scanner)?.unwrap_or_default();
        restat = !val.is_empty() && val != "0";
        skip_eol(scanner)?;
    }

    Ok(Statement {
        output,
        implicit_outputs,
        implicit_inputs,
        restat,
    })
}

fn skip_eol(scanner: &mut Scanner) -> ParseResult<()> {
    scanner.skip('\r');
    if scanner.peek() == '\0' {
        return Ok(());
    }
    scanner.expect('\n')
}

fn read_ident<'a>(scanner: &mut Scanner<'a>) -> ParseResult<&'a str> {
    let start = scanner.ofs;
    while matches!(
        scanner.read(),
        'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.'
    ) {}
    scanner.back();
    if scanner.ofs == start {
        return scanner.parse_error("failed to scan ident");
    }
    Ok(scanner.slice(start, scanner.ofs))
}

/// Read one path, handling `$ `, `$$`, `$:` escapes and `$\n` continuations.
fn read_path(scanner: &mut Scanner) -> ParseResult<Option<String>> {
    let mut path = String::new();
    loop {
        match scanner.read() {
            '\0' | ' ' | ':' | '|' | '\n' => {
                scanner.back();
                break;
            }
            '\r' if scanner.peek() == '\n' => {
                scanner.back();
                break;
            }
            '$' => match scanner.read() {
                ' ' => path.push(' '),
                '$' => path.push('$'),
                ':' => path.push(':'),
                '\n' => scanner.skip_spaces(),
                _ => return scanner.parse_error("bad $-escape"),
            },
            c => path.push(c),
        }
    }
    if path.is_empty() {
        return Ok(None);
    }
    Ok(Some(path))
}
