//! Graph loading: runs the manifest parser over input files and populates
//! the State with rules, pools, edges, and defaults.

use crate::eval::Env;
use crate::graph::{EdgeId, State};
use crate::parse::Statement;
use crate::{canon, parse, version};
use anyhow::{anyhow, bail};
use std::path::Path;
use std::rc::Rc;

/// Read the manifest at the given path into a fresh State.
pub fn read(build_filename: &str) -> anyhow::Result<State> {
    let mut state = State::new();
    load_file(build_filename, &mut state)?;
    Ok(state)
}

fn load_file(path: &str, state: &mut State) -> anyhow::Result<()> {
    let mut bytes =
        std::fs::read(path).map_err(|err| anyhow!("read {}: {}", path, err))?;
    bytes.push(0);
    load_manifest(state, path, &bytes)
}

/// Parse one manifest buffer (NUL-terminated) into the state.  Exposed
/// separately so tests can load from memory.
pub fn load_manifest(state: &mut State, filename: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let mut parser = parse::Parser::new(bytes);
    loop {
        let stmt = match parser.read() {
            Ok(None) => break,
            Ok(Some(stmt)) => stmt,
            Err(err) => bail!("{}", parser.format_parse_error(Path::new(filename), err)),
        };
        match stmt {
            Statement::VarDef(name, value) => {
                let value = value.evaluate(&[&state.bindings]);
                if name == "ninja_required_version" {
                    version::check_version(&value)?;
                }
                state.bindings.insert(name.to_owned(), value);
            }
            Statement::Rule(rule) => {
                let mut graph_rule = crate::graph::Rule::new(rule.name.to_owned());
                for (name, value) in rule.vars.into_iter() {
                    graph_rule.add_binding(name.to_owned(), value.into_owned());
                }
                state.add_rule(Rc::new(graph_rule))?;
            }
            Statement::Pool(pool) => {
                state.add_pool(pool.name.to_owned(), pool.depth)?;
            }
            Statement::Build(build) => {
                add_build(state, build)?;
            }
            Statement::Default(paths) => {
                for path in paths {
                    let path = canon::canon_path(path.evaluate(&[&state.bindings]));
                    state.add_default(&path)?;
                }
            }
            Statement::Include(file) => {
                let file = file.evaluate(&[&state.bindings]);
                load_file(&file, state)?;
            }
            Statement::Subninja(file) => {
                let file = file.evaluate(&[&state.bindings]);
                // A subninja gets its own variable scope; bindings it makes
                // are not visible to the including file.
                let saved = state.bindings.clone();
                load_file(&file, state)?;
                state.bindings = saved;
            }
        }
    }
    Ok(())
}

fn add_build(state: &mut State, build: parse::Build) -> anyhow::Result<EdgeId> {
    let rule = state
        .rules
        .get(build.rule)
        .cloned()
        .ok_or_else(|| anyhow!("unknown rule '{}'", build.rule))?;

    // Edge-scope bindings are evaluated eagerly, in order, with earlier
    // bindings and the file scope visible.
    let mut bindings = crate::smallmap::SmallMap::default();
    for (name, value) in build.vars.into_iter() {
        let value = {
            let envs: [&dyn Env; 2] = [&bindings, &state.bindings];
            value.evaluate(&envs)
        };
        bindings.insert(name.to_owned(), value);
    }

    let (outs, ins) = {
        let envs: [&dyn Env; 2] = [&bindings, &state.bindings];
        let outs: Vec<String> = build
            .outs
            .iter()
            .map(|path| canon::canon_path(path.evaluate(&envs)))
            .collect();
        let ins: Vec<String> = build
            .ins
            .iter()
            .map(|path| canon::canon_path(path.evaluate(&envs)))
            .collect();
        (outs, ins)
    };

    let edge = state.add_edge(rule);
    state.edges.get_mut(edge).bindings = bindings;
    state.edges.get_mut(edge).implicit_ins = build.implicit_ins;
    state.edges.get_mut(edge).order_only_ins = build.order_only_ins;
    state.edges.get_mut(edge).implicit_outs = outs.len() - build.explicit_outs;

    for out in &outs {
        if !state.add_out(edge, out) {
            bail!("multiple rules generate {}", out);
        }
    }
    for input in &ins {
        state.add_in(edge, input);
    }

    // The deps log keys discovered inputs by a single output.
    let deps = state.get_binding(edge, "deps")?;
    if !deps.is_empty() && state.edges.get(edge).explicit_outs() != 1 {
        bail!(
            "rule '{}' uses deps with multiple outputs, which the deps log does not support",
            state.edges.get(edge).rule.name
        );
    }

    let dyndep = state.get_unescaped_binding(edge, "dyndep")?;
    if !dyndep.is_empty() {
        let dyndep = canon::canon_path(dyndep);
        let node = state.node_id(dyndep.as_str());
        if !state.edges.get(edge).inputs.contains(&node) {
            bail!(
                "dyndep '{}' is not specified in the build statement's inputs",
                dyndep
            );
        }
        state.edges.get_mut(edge).dyndep = Some(node);
        state.nodes.get_mut(node).dyndep_pending = true;
    }

    let pool_name = state.get_binding(edge, "pool")?;
    if !pool_name.is_empty() {
        let pool = state
            .lookup_pool(&pool_name)
            .ok_or_else(|| anyhow!("unknown pool name '{}'", pool_name))?;
        state.edges.get_mut(edge).pool = pool;
    }

    Ok(edge)
}

#[cfg(test)]
pub fn load_state_from(manifest: &str) -> anyhow::Result<State> {
    let mut state = State::new();
    let mut bytes = manifest.as_bytes().to_vec();
    bytes.push(0);
    load_manifest(&mut state, "build.ninja", &bytes)?;
    Ok(state)
}
