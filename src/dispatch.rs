//! Submission of jobs to an execution backend.
//!
//! Every submission is synchronous: the calling worker blocks until the
//! external process exits, with its output streams redirected to log files.

use std::fs::File;
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;

use crate::error::DispatchError;

/// One unit of work for an execution backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Human readable name, used for logging.
    pub name: String,
    /// Program and its arguments.
    pub command: Vec<String>,
    pub work_dir: Utf8PathBuf,
    pub log_out: Utf8PathBuf,
    pub log_err: Utf8PathBuf,
    /// Number of CPUs to request, backends may ignore it.
    pub cpus: u32,
}

pub trait Backend: Send + Sync {
    /// Runs the job to completion and returns its exit code.
    ///
    /// Both log files are closed by the time this returns. A process killed
    /// by a signal reports `-1`.
    fn submit(&self, job: &JobSpec) -> Result<i32, DispatchError>;
}

/// Runs the command directly on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl Backend for LocalBackend {
    fn submit(&self, job: &JobSpec) -> Result<i32, DispatchError> {
        run(&job.command, job)
    }
}

/// Runs the command through a cluster launcher, e.g. `run_lsf -c 5 <command>`.
#[derive(Debug, Clone)]
pub struct LauncherBackend {
    launcher: Vec<String>,
}

impl LauncherBackend {
    pub fn new(launcher: Vec<String>) -> Self {
        Self { launcher }
    }

    /// Full command line as handed to the operating system.
    pub fn command_line(&self, job: &JobSpec) -> Vec<String> {
        let mut line = self.launcher.clone();
        line.push("-c".into());
        line.push(job.cpus.to_string());
        line.extend(job.command.iter().cloned());
        line
    }
}

impl Default for LauncherBackend {
    fn default() -> Self {
        Self::new(vec!["run_lsf".into()])
    }
}

impl Backend for LauncherBackend {
    fn submit(&self, job: &JobSpec) -> Result<i32, DispatchError> {
        run(&self.command_line(job), job)
    }
}

fn run(line: &[String], job: &JobSpec) -> Result<i32, DispatchError> {
    let (program, args) = line.split_first().ok_or(DispatchError::EmptyCommand)?;

    let out = File::create(&job.log_out).map_err(|e| DispatchError::Log(job.log_out.clone(), e))?;
    let err = File::create(&job.log_err).map_err(|e| DispatchError::Log(job.log_err.clone(), e))?;

    tracing::debug!(job = %job.name, command = ?line, "submitting");

    let status = Command::new(program)
        .args(args)
        .current_dir(&job.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .status()
        .map_err(|e| DispatchError::Spawn(program.clone(), e))?;

    Ok(status.code().unwrap_or(-1))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn job(dir: &camino::Utf8Path, command: &[&str]) -> JobSpec {
        JobSpec {
            name: "test".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            work_dir: dir.to_owned(),
            log_out: dir.join("job.out"),
            log_err: dir.join("job.err"),
            cpus: 5,
        }
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_local_captures_streams() {
        let (_guard, dir) = tempdir();
        let job = job(&dir, &["sh", "-c", "echo out; echo err >&2; pwd"]);

        let code = LocalBackend.submit(&job).unwrap();
        assert_eq!(code, 0);

        let out = fs::read_to_string(&job.log_out).unwrap();
        assert!(out.starts_with("out\n"));
        assert_eq!(fs::read_to_string(&job.log_err).unwrap(), "err\n");
    }

    #[test]
    fn test_local_exit_code() {
        let (_guard, dir) = tempdir();
        let code = LocalBackend.submit(&job(&dir, &["sh", "-c", "exit 3"])).unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_empty_and_missing_program() {
        let (_guard, dir) = tempdir();

        assert!(matches!(
            LocalBackend.submit(&job(&dir, &[])),
            Err(DispatchError::EmptyCommand)
        ));
        assert!(matches!(
            LocalBackend.submit(&job(&dir, &["./definitely-not-a-program"])),
            Err(DispatchError::Spawn(..))
        ));
    }

    #[test]
    fn test_launcher_prefix() {
        let (_guard, dir) = tempdir();
        let job = job(&dir, &["python", "track.py", "config.json"]);

        let backend = LauncherBackend::default();
        assert_eq!(
            backend.command_line(&job),
            vec!["run_lsf", "-c", "5", "python", "track.py", "config.json"]
        );

        let backend = LauncherBackend::new(vec![
            "sh".into(),
            "-c".into(),
            r#"printf '%s %s %s\n' "$0" "$1" "$2""#.into(),
        ]);
        let job = JobSpec {
            command: vec!["x".into()],
            ..job
        };
        assert_eq!(backend.submit(&job).unwrap(), 0);
        assert_eq!(fs::read_to_string(&job.log_out).unwrap(), "-c 5 x\n");
    }
}
