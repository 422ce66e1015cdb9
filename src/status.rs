//! Build progress reporting: the `NINJA_STATUS`-driven status line and the
//! console printer behind it.

use crate::graph::{EdgeId, State};
use crate::terminal;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write;
use std::time::Instant;

/// Hooks the builder calls as edges progress, so builds are testable without
/// a terminal.
pub trait Status {
    /// Called whenever the planned number of commands changes.
    fn plan_has_total_edges(&mut self, total: usize);

    /// Called when a command starts.
    fn build_edge_started(&mut self, state: &State, edge: EdgeId);

    /// Called when a command completes; returns its (start, end) times in
    /// milliseconds since the build started, for the build log.
    fn build_edge_finished(
        &mut self,
        state: &State,
        edge: EdgeId,
        success: bool,
        output: &[u8],
    ) -> (i32, i32);

    /// Called just before dyndep loading mutates the plan mid-build.
    fn build_load_dyndeps(&mut self) {}

    fn build_started(&mut self);

    fn build_finished(&mut self);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Which end of an edge's execution a status line describes; finishing
/// counts the edge as still running for the `%r` placeholder.
#[derive(Copy, Clone, PartialEq, Eq)]
enum EdgeStatus {
    Started,
    Finished,
}

/// Prints lines to the console, overprinting the previous line when the
/// terminal supports it, and buffering output while the console is held by
/// an edge in the `console` pool.
struct LinePrinter {
    smart_terminal: bool,
    /// Whether the last line printed was elided (no trailing newline).
    have_blank_line: bool,
    console_locked: bool,
    buffered: Vec<String>,
}

impl LinePrinter {
    fn new(smart_terminal: bool) -> Self {
        LinePrinter {
            smart_terminal,
            have_blank_line: true,
            buffered: Vec::new(),
            console_locked: false,
        }
    }

    /// Overprintable status line; elided to the terminal width.
    fn print_elided(&mut self, line: &str) {
        if self.console_locked {
            self.buffered.push(line.to_owned());
            return;
        }
        if self.smart_terminal {
            let max_cols = terminal::get_cols().unwrap_or(80);
            print!("\r\x1b[K{}", truncate_line(line, max_cols));
            std::io::stdout().flush().unwrap();
            self.have_blank_line = false;
        } else {
            println!("{}", line);
        }
    }

    /// Permanent output; survives later status updates.
    fn print_line(&mut self, line: &str) {
        if self.console_locked {
            self.buffered.push(line.to_owned());
            return;
        }
        if !self.have_blank_line {
            print!("\r\x1b[K");
        }
        println!("{}", line);
        self.have_blank_line = true;
    }

    fn set_console_locked(&mut self, locked: bool) {
        if locked == self.console_locked {
            return;
        }
        if locked && !self.have_blank_line {
            print!("\r\x1b[K");
            std::io::stdout().flush().unwrap();
            self.have_blank_line = true;
        }
        self.console_locked = locked;
        if !locked {
            for line in std::mem::take(&mut self.buffered) {
                println!("{}", line);
            }
        }
    }

    fn finish(&mut self) {
        self.set_console_locked(false);
        if !self.have_blank_line {
            println!();
            self.have_blank_line = true;
        }
    }
}

/// Cut a status line to the terminal width.  Descriptions and paths may
/// contain multi-byte characters, so the cut lands on a character boundary.
fn truncate_line(line: &str, max_cols: usize) -> &str {
    match line.char_indices().nth(max_cols) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

/// Finish times of the most recent jobs, for the `%c` current-rate
/// placeholder; the window size is the build parallelism.
struct SlidingRateInfo {
    times: VecDeque<Instant>,
    max: usize,
}

impl SlidingRateInfo {
    fn new(max: usize) -> Self {
        SlidingRateInfo {
            times: VecDeque::new(),
            max: max.max(1),
        }
    }

    fn update(&mut self, now: Instant) {
        if self.times.len() == self.max {
            self.times.pop_front();
        }
        self.times.push_back(now);
    }

    fn rate(&self, now: Instant) -> Option<f64> {
        let &oldest = self.times.front()?;
        let elapsed = now.duration_since(oldest).as_secs_f64();
        if self.times.len() < 2 || elapsed <= 0.0 {
            return None;
        }
        Some((self.times.len() - 1) as f64 / elapsed)
    }
}

/// Status implementation that tracks counts and renders the progress format
/// from `$NINJA_STATUS` (default `[%f/%t] `).
pub struct ConsoleStatus {
    verbosity: Verbosity,
    printer: LinePrinter,
    progress_status_format: String,
    start_time: Instant,
    started_edges: usize,
    finished_edges: usize,
    total_edges: usize,
    /// Start time in ms for each running edge.
    running_edges: HashMap<EdgeId, i32>,
    current_rate: SlidingRateInfo,
}

impl ConsoleStatus {
    pub fn new(verbosity: Verbosity, parallelism: usize) -> Self {
        let smart_terminal = verbosity == Verbosity::Normal && terminal::use_fancy();
        let progress_status_format =
            std::env::var("NINJA_STATUS").unwrap_or_else(|_| "[%f/%t] ".to_owned());
        ConsoleStatus {
            verbosity,
            printer: LinePrinter::new(smart_terminal),
            progress_status_format,
            start_time: Instant::now(),
            started_edges: 0,
            finished_edges: 0,
            total_edges: 0,
            running_edges: HashMap::new(),
            current_rate: SlidingRateInfo::new(parallelism),
        }
    }

    fn elapsed_millis(&self) -> i32 {
        self.start_time.elapsed().as_millis() as i32
    }

    fn format_progress_status(&self, format: &str, status: EdgeStatus) -> String {
        let mut out = String::new();
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                // Started edges.
                Some('s') => out.push_str(&self.started_edges.to_string()),
                // Total edges.
                Some('t') => out.push_str(&self.total_edges.to_string()),
                // Running edges; count the just-finished edge as running.
                Some('r') => {
                    let mut running = self.started_edges - self.finished_edges;
                    if status == EdgeStatus::Finished {
                        running += 1;
                    }
                    out.push_str(&running.to_string());
                }
                // Unstarted edges.  A restat can shrink the plan below the
                // started count mid-build.
                Some('u') => {
                    out.push_str(&self.total_edges.saturating_sub(self.started_edges).to_string())
                }
                // Finished edges.
                Some('f') => out.push_str(&self.finished_edges.to_string()),
                // Overall finished edges per second.
                Some('o') => {
                    let elapsed = self.start_time.elapsed().as_secs_f64();
                    if self.finished_edges > 0 && elapsed > 0.0 {
                        out.push_str(&format!("{:.1}", self.finished_edges as f64 / elapsed));
                    } else {
                        out.push('?');
                    }
                }
                // Current rate, averaged over the last parallelism jobs.
                Some('c') => match self.current_rate.rate(Instant::now()) {
                    Some(rate) => out.push_str(&format!("{:.1}", rate)),
                    None => out.push('?'),
                },
                // Percentage of finished edges.
                Some('p') => {
                    let percent = 100 * self.finished_edges / self.total_edges.max(1);
                    out.push_str(&format!("{:3}%", percent));
                }
                // Elapsed seconds.
                Some('e') => {
                    out.push_str(&format!("{:.3}", self.start_time.elapsed().as_secs_f64()));
                }
                // Unknown placeholders pass through untouched.
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }

    fn print_status(&mut self, state: &State, edge: EdgeId, status: EdgeStatus) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        let mut to_print = if self.verbosity == Verbosity::Verbose {
            state.get_binding(edge, "command").unwrap_or_default()
        } else {
            state.edge_description(edge)
        };
        to_print = format!(
            "{}{}",
            self.format_progress_status(&self.progress_status_format, status),
            to_print
        );
        if self.verbosity == Verbosity::Verbose {
            self.printer.print_line(&to_print);
        } else {
            self.printer.print_elided(&to_print);
        }
    }
}

impl Status for ConsoleStatus {
    fn plan_has_total_edges(&mut self, total: usize) {
        self.total_edges = total;
    }

    fn build_edge_started(&mut self, state: &State, edge: EdgeId) {
        let start_time = self.elapsed_millis();
        self.running_edges.insert(edge, start_time);
        self.started_edges += 1;

        let use_console = state.edges.get(edge).use_console();
        if use_console || self.printer.smart_terminal {
            self.print_status(state, edge, EdgeStatus::Started);
        }
        if use_console {
            self.printer.set_console_locked(true);
        }
    }

    fn build_edge_finished(
        &mut self,
        state: &State,
        edge: EdgeId,
        success: bool,
        output: &[u8],
    ) -> (i32, i32) {
        let end_time = self.elapsed_millis();
        self.finished_edges += 1;
        self.current_rate.update(Instant::now());
        let start_time = self.running_edges.remove(&edge).unwrap_or(0);

        let use_console = state.edges.get(edge).use_console();
        if use_console {
            self.printer.set_console_locked(false);
        }

        if self.verbosity == Verbosity::Quiet {
            return (start_time, end_time);
        }

        if !use_console {
            self.print_status(state, edge, EdgeStatus::Finished);
        }

        // Print the command that is spewing before printing its output.
        if !success {
            let outputs: Vec<&str> = state
                .edges
                .get(edge)
                .outputs
                .iter()
                .map(|&o| state.nodes.get(o).path.as_str())
                .collect();
            self.printer
                .print_line(&format!("FAILED: {}", outputs.join(" ")));
            self.printer
                .print_line(&state.get_binding(edge, "command").unwrap_or_default());
        }

        if !output.is_empty() {
            if self.printer.smart_terminal && !self.printer.have_blank_line {
                print!("\r\x1b[K");
                self.printer.have_blank_line = true;
            }
            std::io::stdout().write_all(output).unwrap();
            if !output.ends_with(b"\n") {
                println!();
            }
        }

        (start_time, end_time)
    }

    fn build_started(&mut self) {
        self.start_time = Instant::now();
    }

    fn build_finished(&mut self) {
        self.printer.finish();
    }
}
