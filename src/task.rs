//! Runs build commands, potentially in parallel.
//! Unaware of the build graph or pools; just bounded command execution.

use crate::graph::EdgeId;
use crate::signal;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Exit status taxonomy for one command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    Interrupted,
}

/// The result of executing one edge's command.
pub struct CommandResult {
    pub edge: EdgeId,
    pub status: ExitStatus,
    /// Combined console output.
    pub output: Vec<u8>,
}

/// Bounded-concurrency command execution, abstract so the builder can be
/// driven by a scripted runner in tests and by `-n` dry runs.
pub trait CommandRunner {
    fn can_run_more(&self) -> bool;

    /// Begin running a command; completion is reported by wait_for_command.
    /// Spawn failures surface as a failed CommandResult.
    fn start_command(&mut self, edge: EdgeId, cmdline: String, use_console: bool);

    /// Block until some started command completes.  Returns None when the
    /// wait was interrupted and the build should abort.
    fn wait_for_command(&mut self) -> Option<CommandResult>;

    fn active_edges(&self) -> Vec<EdgeId>;

    /// Forcibly stop all running commands.
    fn abort(&mut self);
}

/// A CommandRunner that completes every started edge successfully without
/// running anything.
#[derive(Default)]
pub struct DryRunCommandRunner {
    finished: std::collections::VecDeque<EdgeId>,
}

impl CommandRunner for DryRunCommandRunner {
    fn can_run_more(&self) -> bool {
        true
    }

    fn start_command(&mut self, edge: EdgeId, _cmdline: String, _use_console: bool) {
        self.finished.push_back(edge);
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        let edge = self.finished.pop_front()?;
        Some(CommandResult {
            edge,
            status: ExitStatus::Success,
            output: Vec::new(),
        })
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        self.finished.iter().copied().collect()
    }

    fn abort(&mut self) {
        self.finished.clear();
    }
}

/// Child process ids of running commands, shared with the worker threads so
/// abort can signal them.
type PidTable = Arc<Mutex<HashMap<EdgeId, i32>>>;

/// Runs commands as subprocesses, one waiter thread per running command
/// feeding a channel of results.
pub struct RealCommandRunner {
    parallelism: usize,
    max_load_average: f64,
    finished_send: mpsc::Sender<CommandResult>,
    finished_recv: mpsc::Receiver<CommandResult>,
    running: HashSet<EdgeId>,
    pids: PidTable,
}

impl RealCommandRunner {
    pub fn new(parallelism: usize, max_load_average: f64) -> Self {
        let (finished_send, finished_recv) = mpsc::channel();
        RealCommandRunner {
            parallelism,
            max_load_average,
            finished_send,
            finished_recv,
            running: HashSet::new(),
            pids: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[cfg(unix)]
fn load_average() -> Option<f64> {
    let mut avg: [f64; 1] = [0.0];
    let rc = unsafe { libc::getloadavg(avg.as_mut_ptr(), 1) };
    if rc < 1 {
        return None;
    }
    Some(avg[0])
}

#[cfg(not(unix))]
fn load_average() -> Option<f64> {
    None
}

impl CommandRunner for RealCommandRunner {
    fn can_run_more(&self) -> bool {
        if self.running.len() >= self.parallelism {
            return false;
        }
        if !self.running.is_empty() && self.max_load_average > 0.0 {
            if let Some(load) = load_average() {
                if load >= self.max_load_average {
                    return false;
                }
            }
        }
        true
    }

    fn start_command(&mut self, edge: EdgeId, cmdline: String, _use_console: bool) {
        self.running.insert(edge);
        let tx = self.finished_send.clone();
        let pids = self.pids.clone();
        std::thread::spawn(move || {
            let (status, output) = match run_command(&cmdline, |pid| {
                pids.lock().unwrap().insert(edge, pid);
            }) {
                Ok(result) => result,
                Err(err) => (ExitStatus::Failure, err.to_string().into_bytes()),
            };
            pids.lock().unwrap().remove(&edge);
            // The send only fails if the receiver disappeared during
            // shutdown.
            let _ = tx.send(CommandResult {
                edge,
                status,
                output,
            });
        });
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        loop {
            if signal::was_interrupted() {
                return None;
            }
            match self.finished_recv.recv_timeout(Duration::from_millis(100)) {
                Ok(result) => {
                    self.running.remove(&result.edge);
                    return Some(result);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn active_edges(&self) -> Vec<EdgeId> {
        let mut edges: Vec<EdgeId> = self.running.iter().copied().collect();
        edges.sort();
        edges
    }

    fn abort(&mut self) {
        #[cfg(unix)]
        {
            let pids = self.pids.lock().unwrap();
            for &pid in pids.values() {
                unsafe {
                    libc::kill(pid, libc::SIGINT);
                }
            }
        }
        self.running.clear();
    }
}

/// Execute one command under the shell, with stdout and stderr merged into
/// a single pipe.  Returns Err only when we failed outside of the process
/// itself.
#[cfg(unix)]
fn run_command(
    cmdline: &str,
    on_spawn: impl FnOnce(i32),
) -> anyhow::Result<(ExitStatus, Vec<u8>)> {
    use anyhow::bail;
    use std::io::Read;
    use std::io::Write;
    use std::os::unix::process::ExitStatusExt;

    fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
        if ret < 0 {
            bail!("{}: {}", func, std::io::Error::last_os_error());
        }
        Ok(())
    }

    // Spawn through posix_spawn rather than std::process so both stdout and
    // stderr feed the same pipe, keeping interleaved output in order.
    let (pid, mut pipe) = unsafe {
        use std::os::fd::FromRawFd;

        let mut pipe: [libc::c_int; 2] = [0; 2];
        check_posix("pipe", libc::pipe(pipe.as_mut_ptr()))?;

        let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
        check_posix(
            "posix_spawn_file_actions_init",
            libc::posix_spawn_file_actions_init(&mut actions),
        )?;
        // stdout/stderr => pipe
        check_posix(
            "posix_spawn_file_actions_adddup2",
            libc::posix_spawn_file_actions_adddup2(&mut actions, pipe[1], 1),
        )?;
        check_posix(
            "posix_spawn_file_actions_adddup2",
            libc::posix_spawn_file_actions_adddup2(&mut actions, pipe[1], 2),
        )?;
        // close pipe in child
        check_posix(
            "posix_spawn_file_actions_addclose",
            libc::posix_spawn_file_actions_addclose(&mut actions, pipe[0]),
        )?;
        check_posix(
            "posix_spawn_file_actions_addclose",
            libc::posix_spawn_file_actions_addclose(&mut actions, pipe[1]),
        )?;

        let shell = b"/bin/sh\0".as_ptr() as *const libc::c_char;
        let dash_c = b"-c\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] =
            [shell, dash_c, cmdline_nul.as_ptr(), std::ptr::null()];

        let mut pid: libc::pid_t = 0;
        let spawn_result = libc::posix_spawn(
            &mut pid,
            shell,
            &actions,
            std::ptr::null(),
            argv.as_ptr() as *const *mut libc::c_char,
            std::ptr::null(),
        );
        libc::posix_spawn_file_actions_destroy(&mut actions);
        check_posix("posix_spawn", spawn_result)?;

        check_posix("close", libc::close(pipe[1]))?;

        (pid, std::fs::File::from_raw_fd(pipe[0]))
    };

    on_spawn(pid);

    let mut output = Vec::new();
    pipe.read_to_end(&mut output)?;

    let status = unsafe {
        let mut status: libc::c_int = 0;
        check_posix("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };

    let mut termination = ExitStatus::Success;
    if !status.success() {
        termination = ExitStatus::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    write!(output, "interrupted")?;
                    termination = ExitStatus::Interrupted;
                }
                _ => write!(output, "signal {}", sig)?,
            }
        }
    }

    Ok((termination, output))
}

#[cfg(not(unix))]
fn run_command(
    cmdline: &str,
    on_spawn: impl FnOnce(i32),
) -> anyhow::Result<(ExitStatus, Vec<u8>)> {
    let out = std::process::Command::new("cmd")
        .arg("/c")
        .arg(cmdline)
        .output()?;
    on_spawn(0);
    let mut output = out.stdout;
    output.extend_from_slice(&out.stderr);
    let status = if out.status.success() {
        ExitStatus::Success
    } else {
        ExitStatus::Failure
    };
    Ok((status, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Id;

    #[test]
    fn dry_run_completes_in_order() {
        let mut runner = DryRunCommandRunner::default();
        runner.start_command(EdgeId::from_index(1), "a".to_owned(), false);
        runner.start_command(EdgeId::from_index(2), "b".to_owned(), false);
        assert_eq!(runner.active_edges().len(), 2);

        let first = runner.wait_for_command().unwrap();
        assert_eq!(first.edge, EdgeId::from_index(1));
        assert_eq!(first.status, ExitStatus::Success);
        let second = runner.wait_for_command().unwrap();
        assert_eq!(second.edge, EdgeId::from_index(2));
        assert!(runner.wait_for_command().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn runs_real_commands() {
        let mut runner = RealCommandRunner::new(2, 0.0);
        assert!(runner.can_run_more());
        runner.start_command(EdgeId::from_index(0), "echo hello && echo err >&2".to_owned(), false);
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.edge, EdgeId::from_index(0));
        assert_eq!(result.status, ExitStatus::Success);
        let text = String::from_utf8_lossy(&result.output).into_owned();
        assert!(text.contains("hello"));
        assert!(text.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn reports_failure_status() {
        let mut runner = RealCommandRunner::new(1, 0.0);
        runner.start_command(EdgeId::from_index(0), "exit 3".to_owned(), false);
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.status, ExitStatus::Failure);
    }
}
