//! Support code for e2e tests, which run kunai as a binary against a
//! temporary directory.

mod basic;
mod cycles;
mod deps;
mod dyndep;
mod pools;
mod restat;

pub fn kunai_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("kunai")
}

pub fn kunai_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(kunai_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so the Rust test
    // framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

fn combined_output(out: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    text
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let combined = combined_output(out);
    if !combined.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, combined
        );
    }
}

pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let combined = combined_output(out);
    if combined.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, combined
        );
    }
}

/// Manages a temporary directory for invoking the binary.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn metadata(&self, path: &str) -> std::io::Result<std::fs::Metadata> {
        std::fs::metadata(self.dir.path().join(path))
    }

    /// Bump a file's mtime the way an editor save would.
    pub fn touch(&self, path: &str) -> anyhow::Result<()> {
        // Rewriting the content updates the mtime; sleep long enough that
        // coarse filesystem timestamps still move.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let content = self.read(path)?;
        std::fs::write(
            self.dir.path().join(path),
            String::from_utf8_lossy(&content).as_bytes(),
        )?;
        Ok(())
    }

    /// Invoke kunai, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but print output and fail if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}

// Ensure TOUCH_RULE has the same description and number of lines of text on
// Windows/non-Windows to make tests agnostic to platform.

#[cfg(unix)]
pub const TOUCH_RULE: &str = "
rule touch
  command = touch $out
  description = touch $out
";

#[cfg(windows)]
pub const TOUCH_RULE: &str = "
rule touch
  command = cmd /c type nul > $out
  description = touch $out
";
