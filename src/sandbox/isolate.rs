use fs_extra::dir::CopyOptions;
use log::{info, warn};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};
use which::which;

use super::{read_output, ExecuteRequest, RunResult, Sandbox, SandboxError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs programs inside boxes of the `isolate` tool (cgroup limits, private
/// network, mount and pid namespaces).
///
/// The staged working directory is copied into a freshly initialised box for
/// every execution and the box contents are copied back afterwards, so
/// compiled artifacts survive between the compile and the run step.
pub struct IsolateSandbox {
    isolate_executable_path: PathBuf,
    free_boxes: Mutex<Vec<i32>>,
}

impl IsolateSandbox {
    pub fn new(isolate_executable_path: PathBuf, box_count: i32) -> Self {
        IsolateSandbox {
            isolate_executable_path,
            free_boxes: Mutex::new((0..box_count).rev().collect()),
        }
    }

    pub fn locate(box_count: i32) -> Result<Self, which::Error> {
        Ok(Self::new(which("isolate")?, box_count))
    }

    fn lease(&self) -> Result<BoxLease<'_>, SandboxError> {
        let id = self
            .free_boxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .ok_or(SandboxError::NoFreeBox)?;
        let mut lease = BoxLease {
            sandbox: self,
            id,
            path: PathBuf::new(),
        };
        lease.path = self.init_box(id)?;
        Ok(lease)
    }

    fn init_box(&self, id: i32) -> Result<PathBuf, SandboxError> {
        self.cleanup_box(id);

        let output = Command::new(&self.isolate_executable_path)
            .arg("--init")
            .arg("--cg")
            .arg(format!("--box-id={}", id))
            .output()
            .map_err(SandboxError::Io)?;

        if !output.status.success() {
            return Err(SandboxError::IsolateCommandFailed(
                String::from_utf8_lossy(&output.stderr).into(),
            ));
        }

        Ok(PathBuf::from(String::from_utf8_lossy(&output.stdout).trim_end()).join("box"))
    }

    fn cleanup_box(&self, id: i32) -> bool {
        match Command::new(&self.isolate_executable_path)
            .arg("--cleanup")
            .arg("--cg")
            .arg(format!("--box-id={}", id))
            .output()
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!("Couldn't clean up isolate box {}: {}", id, e);
                false
            }
        }
    }
}

/// An initialised box, cleaned up and handed back to the pool on drop.
struct BoxLease<'a> {
    sandbox: &'a IsolateSandbox,
    id: i32,
    path: PathBuf,
}

impl Drop for BoxLease<'_> {
    fn drop(&mut self) {
        self.sandbox.cleanup_box(self.id);
        self.sandbox
            .free_boxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.id);
    }
}

fn copy_contents(from: &Path, to: &Path) -> Result<(), SandboxError> {
    let mut options = CopyOptions::new();
    options.overwrite = true;
    options.content_only = true;
    fs_extra::dir::copy(from, to, &options)
        .map(|_| ())
        .map_err(|e| SandboxError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
}

fn format_seconds(duration: Duration) -> String {
    format!("{}.{:03}", duration.as_secs(), duration.subsec_millis())
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct Meta {
    pub time_wall_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub timed_out: bool,
    pub message: Option<String>,
}

fn parse_ms(input: &str) -> Option<u64> {
    f64::from_str(input).ok().map(|seconds| (seconds * 1000.0).round() as u64)
}

/// Parses the `key:value` lines isolate writes with `--meta`.
pub(crate) fn parse_meta(meta: &str) -> Meta {
    let mut parsed = Meta::default();
    let mut status = None;
    for line in meta.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key {
                "time-wall" => parsed.time_wall_ms = parse_ms(value),
                "exitcode" => parsed.exit_code = i32::from_str(value).ok(),
                "exitsig" => parsed.exit_signal = i32::from_str(value).ok(),
                "message" => parsed.message = Some(value.into()),
                "status" => {
                    parsed.timed_out = value == "TO";
                    status = Some(value);
                }
                _ => {}
            }
        }
    }
    // a clean exit carries no status line
    if status.is_none() && parsed.exit_code.is_none() && parsed.exit_signal.is_none() {
        parsed.exit_code = Some(0);
    }
    parsed
}

impl Sandbox for IsolateSandbox {
    fn execute(&self, request: &ExecuteRequest) -> Result<RunResult, SandboxError> {
        let isolate_box = self.lease()?;
        copy_contents(request.workdir, &isolate_box.path)?;

        let stdin_arg = match request.stdin_path {
            Some(path) => {
                let file_name = path.file_name().ok_or_else(|| {
                    SandboxError::IsolateCommandFailed(format!("bad stdin path {:?}", path))
                })?;
                if !isolate_box.path.join(file_name).exists() {
                    std::fs::copy(path, isolate_box.path.join(file_name))
                        .map_err(SandboxError::Io)?;
                }
                vec![format!("--stdin={}", file_name.to_string_lossy())]
            }
            None => vec![],
        };

        info!(
            "Executing {:?} in isolate box {}",
            request.command, isolate_box.id
        );
        let start = Instant::now();
        let mut child = Command::new(&self.isolate_executable_path)
            .arg("--run")
            .arg("--cg")
            .arg(format!("--box-id={}", isolate_box.id))
            .arg(format!("--wall-time={}", format_seconds(request.time_limit)))
            .arg(format!("--time={}", format_seconds(request.time_limit)))
            .arg(format!("--cg-mem={}", /* input is in KiB */ request.memory_limit_kib))
            .arg(format!("--processes={}", request.process_limit))
            .args(stdin_arg)
            .arg("--stdout=stdout")
            .arg("--stderr=stderr")
            .arg("--meta=-")
            .arg("--env=PATH=/usr/local/bin:/usr/bin:/bin")
            .arg("--")
            .arg(&request.command.binary_path)
            .args(&request.command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                binary_path: self.isolate_executable_path.clone(),
                source,
            })?;

        let status = loop {
            if let Some(status) = child.try_wait().map_err(SandboxError::Io)? {
                break status;
            }
            if request.cancellation.is_cancelled() {
                // the lease cleanup tears down whatever is left in the box
                let _ = child.kill();
                let _ = child.wait();
                return Err(SandboxError::Cancelled);
            }
            sleep(POLL_INTERVAL);
        };

        let mut meta = String::new();
        let mut isolate_stderr = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut meta).map_err(SandboxError::Io)?;
        }
        if let Some(mut stderr) = child.stderr.take() {
            stderr
                .read_to_string(&mut isolate_stderr)
                .map_err(SandboxError::Io)?;
        }

        if match status.code() {
            // Ended by signal
            None => true,
            Some(c) => c > 1,
        } {
            return Err(SandboxError::IsolateCommandFailed(isolate_stderr));
        }

        let meta = parse_meta(&meta);
        let result = RunResult {
            stdout: read_output(&isolate_box.path.join("stdout"))?,
            stderr: read_output(&isolate_box.path.join("stderr"))?,
            exit_code: meta.exit_code,
            exit_signal: meta.exit_signal,
            timed_out: meta.timed_out,
            time_wall_ms: meta
                .time_wall_ms
                .unwrap_or_else(|| start.elapsed().as_millis() as u64),
        };

        copy_contents(&isolate_box.path, request.workdir)?;
        Ok(result)
    }
}
