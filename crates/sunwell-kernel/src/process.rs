//! Timeout-bounded subprocess execution. Ported from the teacher's
//! `process.rs`: a polling loop with a kill-on-deadline, used both for git
//! plumbing and for COMMAND/EXECUTE-mode tool invocations.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Duration,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let deadline = start + timeout;
    let mut timed_out = false;

    loop {
        match child.try_wait().context("failed to poll child process")? {
            Some(_status) => break,
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    timed_out = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    let exit_code = if timed_out {
        None
    } else {
        child.wait().ok().and_then(|s| s.code())
    };

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    let mut stderr = String::new();
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_of_successful_command() {
        let out = run_command_with_timeout("echo", &["hello"], Path::new("."), Duration::from_secs(5)).unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[test]
    fn reports_nonzero_exit_code() {
        let out = run_command_with_timeout("sh", &["-c", "exit 3"], Path::new("."), Duration::from_secs(5)).unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[test]
    fn kills_process_exceeding_timeout() {
        let out = run_command_with_timeout("sleep", &["5"], Path::new("."), Duration::from_millis(200)).unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }
}
