mod tree;

use log::{info, warn};
use nix::sys::prctl;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Once;
use std::thread::sleep;
use std::time::{Duration, Instant};

use self::tree::{user_task_count, ProcessTree};
use super::{read_output, ExecuteRequest, RunResult, Sandbox, SandboxError};

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const OUTPUT_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

static SUBREAPER: Once = Once::new();

/// Runs the program as a local process confined to its working directory.
///
/// The process leads its own process group, and every descendant is tracked
/// through `/proc` even after `setsid()`, so a timeout, a cancellation or a
/// plain exit leaves nothing running. Memory, CPU time, process count and
/// written file size are capped with rlimits. There is no network or
/// filesystem namespace: use [`IsolateSandbox`](super::IsolateSandbox) for
/// untrusted code in production.
#[derive(Debug, Default)]
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        ProcessSandbox
    }
}

/// Kills whatever is left of the process group when dropped.
struct ProcessGroup(Pid);

impl ProcessGroup {
    fn kill(&self) {
        match killpg(self.0, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!("Couldn't kill process group {}: {}", self.0, e),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn wait_killed(
    child: &mut Child,
    group: &ProcessGroup,
    tree: &mut ProcessTree,
) -> Result<ExitStatus, SandboxError> {
    tree.kill_all(true);
    group.kill();
    child.wait().map_err(SandboxError::Io)
}

impl Sandbox for ProcessSandbox {
    fn execute(&self, request: &ExecuteRequest) -> Result<RunResult, SandboxError> {
        SUBREAPER.call_once(|| {
            if let Err(e) = prctl::set_child_subreaper(true) {
                warn!("Couldn't become a child subreaper: {}", e);
            }
        });

        let stdout_path = request.workdir.join("stdout");
        let stderr_path = request.workdir.join("stderr");

        let stdin = match request.stdin_path {
            Some(path) => Stdio::from(File::open(path).map_err(SandboxError::Io)?),
            None => Stdio::null(),
        };
        let stdout = File::create(&stdout_path).map_err(SandboxError::Io)?;
        let stderr = File::create(&stderr_path).map_err(SandboxError::Io)?;

        let memory_limit_bytes = if request.limit_address_space {
            request.memory_limit_kib * 1024
        } else {
            0
        };
        let cpu_limit_seconds = request.time_limit.as_secs() + 1;
        // RLIMIT_NPROC counts every task of the user, so the run's share is
        // added on top of what the user already has.
        let (_, process_hard_limit) =
            getrlimit(Resource::RLIMIT_NPROC).map_err(|e| SandboxError::Io(e.into()))?;
        let process_limit =
            (user_task_count() + u64::from(request.process_limit)).min(process_hard_limit);

        let mut command = Command::new(&request.command.binary_path);
        command
            .args(&request.command.args)
            .current_dir(request.workdir)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .stdin(stdin)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);
        unsafe {
            command.pre_exec(move || {
                prctl::set_child_subreaper(true).map_err(io::Error::from)?;
                if memory_limit_bytes > 0 {
                    setrlimit(Resource::RLIMIT_AS, memory_limit_bytes, memory_limit_bytes)
                        .map_err(io::Error::from)?;
                }
                setrlimit(Resource::RLIMIT_CPU, cpu_limit_seconds, cpu_limit_seconds)
                    .map_err(io::Error::from)?;
                setrlimit(Resource::RLIMIT_FSIZE, OUTPUT_LIMIT_BYTES, OUTPUT_LIMIT_BYTES)
                    .map_err(io::Error::from)?;
                setrlimit(Resource::RLIMIT_NPROC, process_limit, process_limit)
                    .map_err(io::Error::from)?;
                Ok(())
            });
        }

        info!("Executing {:?} in {:?}", request.command, request.workdir);
        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            binary_path: request.command.binary_path.clone(),
            source,
        })?;
        let group = ProcessGroup(Pid::from_raw(child.id() as i32));
        let mut tree = ProcessTree::new(group.0);
        let deadline = start + request.time_limit;

        let mut timed_out = false;
        let status = loop {
            tree.refresh(true);
            if let Some(status) = child.try_wait().map_err(SandboxError::Io)? {
                // Background processes don't outlive the program either.
                tree.kill_all(false);
                break status;
            }
            if request.cancellation.is_cancelled() {
                wait_killed(&mut child, &group, &mut tree)?;
                tree.reap();
                return Err(SandboxError::Cancelled);
            }
            if Instant::now() >= deadline {
                timed_out = true;
                break wait_killed(&mut child, &group, &mut tree)?;
            }
            sleep(POLL_INTERVAL);
        };
        let time_wall_ms = start.elapsed().as_millis() as u64;
        drop(group);
        tree.reap();

        Ok(RunResult {
            stdout: read_output(&stdout_path)?,
            stderr: read_output(&stderr_path)?,
            exit_code: status.code(),
            exit_signal: status.signal(),
            timed_out,
            time_wall_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Cancellation, CommandTuple};
    use std::path::Path;
    use std::thread;

    fn sh(script: &str) -> CommandTuple {
        CommandTuple {
            binary_path: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn execute(
        workdir: &Path,
        command: &CommandTuple,
        stdin_path: Option<&Path>,
        time_limit: Duration,
        cancellation: &Cancellation,
    ) -> Result<RunResult, SandboxError> {
        ProcessSandbox::new().execute(&ExecuteRequest {
            workdir,
            command,
            stdin_path,
            time_limit,
            memory_limit_kib: 256 * 1024,
            limit_address_space: true,
            process_limit: 64,
            cancellation,
        })
    }

    #[test]
    fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        std::fs::write(&input, "3\n").unwrap();

        let result = execute(
            dir.path(),
            &sh("read x; echo $((x * 2)); echo oops >&2; exit 3"),
            Some(input.as_path()),
            Duration::from_secs(5),
            &Cancellation::new(),
        )
        .unwrap();

        assert_eq!(result.stdout, b"6\n");
        assert_eq!(result.stderr, b"oops\n");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");

        let result = execute(
            dir.path(),
            &sh("(sleep 1; touch marker) & sleep 5"),
            None,
            Duration::from_millis(300),
            &Cancellation::new(),
        )
        .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_signal, Some(9));
        assert!(!result.success());

        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "background child outlived the timeout");
    }

    fn python(script: &str) -> Option<CommandTuple> {
        let binary_path = which::which("python3").ok()?;
        Some(CommandTuple {
            binary_path,
            args: vec!["-c".into(), script.into()],
        })
    }

    // The child leaves the process group, so only the descendant tracking
    // can find it.
    const DETACHED_CHILD: &str = "\
import os, time
if os.fork() == 0:
    os.setsid()
    time.sleep(1)
    open('marker', 'w').close()
    os._exit(0)
time.sleep(PARENT_SECONDS)
";

    #[test]
    fn timeout_kills_children_that_left_the_group() {
        let command = match python(&DETACHED_CHILD.replace("PARENT_SECONDS", "5")) {
            Some(command) => command,
            None => {
                eprintln!("python3 not found, skipping");
                return;
            }
        };
        let dir = tempfile::tempdir().unwrap();

        let result = execute(
            dir.path(),
            &command,
            None,
            Duration::from_millis(500),
            &Cancellation::new(),
        )
        .unwrap();
        assert!(result.timed_out);

        thread::sleep(Duration::from_millis(1500));
        assert!(
            !dir.path().join("marker").exists(),
            "setsid child outlived the timeout"
        );
    }

    #[test]
    fn exiting_program_takes_detached_children_along() {
        let command = match python(&DETACHED_CHILD.replace("PARENT_SECONDS", "0.3")) {
            Some(command) => command,
            None => {
                eprintln!("python3 not found, skipping");
                return;
            }
        };
        let dir = tempfile::tempdir().unwrap();

        let result = execute(
            dir.path(),
            &command,
            None,
            Duration::from_secs(5),
            &Cancellation::new(),
        )
        .unwrap();
        assert!(result.success());

        thread::sleep(Duration::from_millis(1500));
        assert!(
            !dir.path().join("marker").exists(),
            "setsid child outlived the program"
        );
    }

    #[test]
    fn cancellation_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let cancellation = Cancellation::new();

        let handle = cancellation.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            handle.cancel();
        });

        let result = execute(
            dir.path(),
            &sh("sleep 5"),
            None,
            Duration::from_secs(10),
            &cancellation,
        );
        canceller.join().unwrap();

        assert!(matches!(result, Err(SandboxError::Cancelled)));
    }

    #[test]
    fn missing_binary_is_a_sandbox_fault() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute(
            dir.path(),
            &CommandTuple {
                binary_path: "/nonexistent/interpreter".into(),
                args: vec![],
            },
            None,
            Duration::from_secs(1),
            &Cancellation::new(),
        );
        assert!(matches!(result, Err(SandboxError::Spawn { .. })));
    }
}
