// Copyright (c) 2020 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! A syscall-tracing process monitor for unix.
//!
//! The process runs under `strace -f`, which follows every descendant. The
//! trace output goes to a scratch file; after the process tree exits, the
//! file-manipulating syscalls are parsed into an access report. Open flags
//! decide the classification: `O_WRONLY`/`O_RDWR`/`O_TRUNC`/`O_CREAT`
//! count as writes, everything else as reads; `unlink`/`unlinkat` count as
//! deletes; a rename is a delete of the old path and a write of the new.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tempfile::TempDir;

use crate::error::{Error, ResultExt};

use super::{AccessReport, MonitorOutcome, MonitorRequest, ProcessMonitor};

pub struct StraceMonitor {
    strace_program: PathBuf,
}

impl StraceMonitor {
    pub fn new() -> StraceMonitor {
        StraceMonitor {
            strace_program: PathBuf::from("strace"),
        }
    }
}

impl Default for StraceMonitor {
    fn default() -> StraceMonitor {
        StraceMonitor::new()
    }
}

const TRACED_SYSCALLS: &str =
    "open,openat,creat,unlink,unlinkat,rename,renameat,renameat2";

impl ProcessMonitor for StraceMonitor {
    fn run(&self, request: MonitorRequest) -> Result<MonitorOutcome, Error> {
        let scratch = TempDir::new()
            .context("could not create monitor scratch directory")?;
        let trace_path = scratch.path().join("trace");

        let (stdout_reader, stdout_writer) =
            os_pipe::pipe().context("could not create stdout pipe")?;
        let (stderr_reader, stderr_writer) =
            os_pipe::pipe().context("could not create stderr pipe")?;

        let mut command = Command::new(&self.strace_program);
        command
            .arg("-f")
            .arg("-qq")
            .arg("-e")
            .arg(format!("trace={}", TRACED_SYSCALLS))
            .arg("-o")
            .arg(&trace_path)
            .arg("--")
            .arg(&request.program)
            .args(&request.args)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(stdout_writer)
            .stderr(stderr_writer);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Each monitored command gets its own process group so that
            // cancellation can kill the whole tree at once.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setpgid(
                        nix::unistd::Pid::from_raw(0),
                        nix::unistd::Pid::from_raw(0),
                    )
                    .map_err(|e| {
                        std::io::Error::new(
                            std::io::ErrorKind::Other,
                            e.to_string(),
                        )
                    })
                });
            }
        }

        let mut child = command.spawn().with_context(|_| {
            format!(
                "failed to launch {:?} under {:?}",
                request.program, self.strace_program
            )
        })?;

        // The write ends were duplicated into the child; drop our copies so
        // the readers see EOF when the process tree exits.
        drop(command);

        request.cancel.register_pgid(child.id() as i32);

        let stdout_thread = thread::spawn(move || read_all(stdout_reader));
        let stderr_thread = thread::spawn(move || read_all(stderr_reader));

        let status = wait_with_timeout(
            &mut child,
            request.timeout,
            &request.cancel,
        )?;

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        let mut report =
            parse_trace_file(&trace_path, &request.working_dir)?;
        report.observe_write_times();
        report.filter(scratch.path());
        report.filter(&std::env::temp_dir());

        Ok(MonitorOutcome {
            exit_code: status,
            stdout,
            stderr,
            report,
        })
    }
}

fn read_all(mut reader: os_pipe::PipeReader) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Waits for the child, polling so that cancellation and the timeout are
/// honored. Returns the exit code, or -1 for a signal death.
fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Option<Duration>,
    cancel: &super::CancelToken,
) -> Result<i32, Error> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if let Some(status) = child
            .try_wait()
            .context("failed waiting for monitored process")?
        {
            return Ok(status.code().unwrap_or(-1));
        }

        if cancel.canceled() {
            let _ = child.kill();
            let status = child
                .wait()
                .context("failed reaping canceled process")?;
            return Ok(status.code().unwrap_or(-1));
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                failure::bail!("monitored process timed out");
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}

/// Parses an strace output file into an access report.
pub fn parse_trace(content: &str, working_dir: &Path) -> AccessReport {
    // 1234  openat(AT_FDCWD, "src/piet.cpp", O_RDONLY) = 3
    let open_re = Regex::new(
        r#"(?:open|openat|creat)\((?:[^,]*,\s*)?"([^"]+)"(?:,\s*([A-Z_|]+))?[^)]*\)\s*=\s*(-?\d+)"#,
    )
    .expect("static regex compiles");
    let unlink_re = Regex::new(
        r#"(?:unlink|unlinkat)\((?:[^,]*,\s*)?"([^"]+)"[^)]*\)\s*=\s*(-?\d+)"#,
    )
    .expect("static regex compiles");
    let rename_re = Regex::new(
        r#"(?:rename|renameat2?)\((?:[^,]*,\s*)?"([^"]+)",\s*(?:[^,]*,\s*)?"([^"]+)"[^)]*\)\s*=\s*(-?\d+)"#,
    )
    .expect("static regex compiles");

    let mut report = AccessReport::new();

    for line in content.lines() {
        if let Some(caps) = rename_re.captures(line) {
            if caps[3].parse::<i64>().unwrap_or(-1) >= 0 {
                let old = absolutize(&caps[1], working_dir);
                let new = absolutize(&caps[2], working_dir);
                report.record_delete(old);
                report.record_write(new);
            }
            continue;
        }
        if let Some(caps) = unlink_re.captures(line) {
            if caps[2].parse::<i64>().unwrap_or(-1) >= 0 {
                report.record_delete(absolutize(&caps[1], working_dir));
            }
            continue;
        }
        if let Some(caps) = open_re.captures(line) {
            if caps[3].parse::<i64>().unwrap_or(-1) < 0 {
                continue;
            }
            let path = absolutize(&caps[1], working_dir);
            let flags = caps.get(2).map(|m| m.as_str()).unwrap_or("");

            let writes = flags.contains("O_WRONLY")
                || flags.contains("O_RDWR")
                || flags.contains("O_CREAT")
                || flags.contains("O_TRUNC")
                || flags.contains("O_APPEND")
                || line.contains("creat(");
            let reads = !writes || flags.contains("O_RDWR");

            if reads {
                report.record_read(path.clone());
            }
            if writes {
                report.record_write(path);
            }
        }
    }

    report
}

fn parse_trace_file(
    path: &Path,
    working_dir: &Path,
) -> Result<AccessReport, Error> {
    let content = std::fs::read_to_string(path).with_context(|_| {
        format!("could not read trace output {:?}", path)
    })?;
    Ok(parse_trace(&content, working_dir))
}

fn absolutize(path: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(path);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    };
    normalize(&absolute)
}

/// Lexically resolves `.` and `..` components. The monitored process may
/// have produced paths like `src/../generated/a.obj`.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            c => result.push(c.as_os_str()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reads_and_writes() {
        let trace = r#"1234  openat(AT_FDCWD, "src/piet.cpp", O_RDONLY) = 3
1234  openat(AT_FDCWD, "generated/piet.obj", O_WRONLY|O_CREAT|O_TRUNC, 0666) = 4
1234  openat(AT_FDCWD, "/etc/ld.so.cache", O_RDONLY|O_CLOEXEC) = 5
1234  openat(AT_FDCWD, "missing.h", O_RDONLY) = -1 ENOENT (No such file)
"#;

        let report = parse_trace(trace, Path::new("/repo"));

        assert!(report.reads().contains(Path::new("/repo/src/piet.cpp")));
        assert!(report.reads().contains(Path::new("/etc/ld.so.cache")));
        assert!(report
            .writes()
            .contains(Path::new("/repo/generated/piet.obj")));
        assert!(!report.reads().contains(Path::new("/repo/missing.h")));
    }

    #[test]
    fn rename_is_delete_plus_write() {
        let trace =
            "99  rename(\"a.tmp\", \"a.txt\") = 0\n";
        let report = parse_trace(trace, Path::new("/w"));
        assert!(report.writes().contains(Path::new("/w/a.txt")));
        assert!(!report.writes().contains(Path::new("/w/a.tmp")));
    }

    #[test]
    fn unlink_is_delete() {
        let trace = "7  unlink(\"scratch.log\") = 0\n";
        let report = parse_trace(trace, Path::new("/w"));
        assert!(report.writes().is_empty());
        assert!(report.reads().is_empty());
    }

    #[test]
    fn relative_paths_are_normalized() {
        let trace =
            "1  openat(AT_FDCWD, \"src/../gen/out.o\", O_WRONLY|O_CREAT) = 3\n";
        let report = parse_trace(trace, Path::new("/repo"));
        assert!(report.writes().contains(Path::new("/repo/gen/out.o")));
    }
}
