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

//! The access-monitored command executor.
//!
//! The core consumes an abstract monitored process: launch a program, wait
//! for it and all descendants, and get back the exit code, the captured
//! output, and a report of every file-system access classified as read,
//! write or delete, keyed by canonical absolute path. Any viable monitoring
//! strategy may sit behind the trait; the unix implementation traces file
//! syscalls (see `strace.rs`).

#[cfg(unix)]
pub mod strace;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::error::Error;

/// One observed access to a path.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FileAccess {
    pub read: bool,
    pub write: bool,
    pub delete: bool,

    /// The path's write time observed at the time of access.
    pub last_write_time: Option<SystemTime>,
}

/// All accesses made by a monitored process and its descendants.
#[derive(Debug, Clone, Default)]
pub struct AccessReport {
    accesses: BTreeMap<PathBuf, FileAccess>,
}

impl AccessReport {
    pub fn new() -> AccessReport {
        AccessReport::default()
    }

    pub fn record_read(&mut self, path: PathBuf) {
        self.accesses.entry(path).or_default().read = true;
    }

    pub fn record_write(&mut self, path: PathBuf) {
        self.accesses.entry(path).or_default().write = true;
    }

    pub fn record_delete(&mut self, path: PathBuf) {
        let access = self.accesses.entry(path).or_default();
        access.delete = true;
        // A deleted path no longer counts as written output.
        access.write = false;
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    pub fn accesses(&self) -> impl Iterator<Item = (&PathBuf, &FileAccess)> {
        self.accesses.iter()
    }

    /// Absolute paths read by the process.
    pub fn reads(&self) -> BTreeSet<PathBuf> {
        self.accesses
            .iter()
            .filter(|(_, a)| a.read)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Absolute paths written by the process.
    pub fn writes(&self) -> BTreeSet<PathBuf> {
        self.accesses
            .iter()
            .filter(|(_, a)| a.write)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Read minus written.
    pub fn read_only(&self) -> BTreeSet<PathBuf> {
        self.accesses
            .iter()
            .filter(|(_, a)| a.read && !a.write)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn last_write_time(&self, path: &Path) -> Option<SystemTime> {
        self.accesses.get(path).and_then(|a| a.last_write_time)
    }

    /// Stamps each access with the path's current write time.
    pub fn observe_write_times(&mut self) {
        for (path, access) in self.accesses.iter_mut() {
            access.last_write_time =
                fs::metadata(path).and_then(|m| m.modified()).ok();
        }
    }

    /// Drops accesses the dependency graph must not see: paths inside the
    /// process's temp directory, glob patterns produced by directory
    /// iteration APIs, and paths that are not regular files.
    pub fn filter(&mut self, temp_dir: &Path) {
        self.accesses.retain(|path, access| {
            if path.starts_with(temp_dir) {
                return false;
            }
            let s = path.to_string_lossy();
            if s.contains('*') || s.contains('?') {
                return false;
            }
            match fs::metadata(path) {
                Ok(metadata) => metadata.is_file(),
                // A deleted path has no metadata; keep delete records so
                // output policing can see them.
                Err(_) => access.delete,
            }
        });
    }
}

/// Cooperative cancellation of a monitored process. The monitor registers
/// the process-group id; `cancel` kills the whole group.
#[derive(Default)]
pub struct CancelToken {
    canceled: AtomicBool,
    pgid: Mutex<Option<i32>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn register_pgid(&self, pgid: i32) {
        *self.pgid.lock().unwrap() = Some(pgid);
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);

        #[cfg(unix)]
        {
            if let Some(pgid) = *self.pgid.lock().unwrap() {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
            }
        }
    }
}

/// What to launch under monitoring.
pub struct MonitorRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancel: std::sync::Arc<CancelToken>,
}

/// The result of a monitored run.
pub struct MonitorOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub report: AccessReport,
}

/// The monitoring contract. Implementations must observe the process and
/// all descendants until exit.
pub trait ProcessMonitor: Send + Sync {
    fn run(&self, request: MonitorRequest) -> Result<MonitorOutcome, Error>;
}

/// The default monitor for this platform.
#[cfg(unix)]
pub fn default_monitor() -> std::sync::Arc<dyn ProcessMonitor> {
    std::sync::Arc::new(strace::StraceMonitor::new())
}

#[cfg(not(unix))]
pub fn default_monitor() -> std::sync::Arc<dyn ProcessMonitor> {
    panic!("no process monitor is available for this platform");
}

#[cfg(test)]
pub mod testing {
    //! A scripted monitor for tests: it really runs the command (so that
    //! declared outputs exist on disk afterwards) but reports the accesses
    //! a test declares for the script instead of tracing the process.

    use super::*;
    use std::collections::HashMap;
    use std::process::Command;

    #[derive(Default, Clone)]
    pub struct ScriptedAccesses {
        pub reads: Vec<PathBuf>,
        pub writes: Vec<PathBuf>,
    }

    #[derive(Default)]
    pub struct ScriptedMonitor {
        table: Mutex<HashMap<String, ScriptedAccesses>>,
    }

    impl ScriptedMonitor {
        pub fn new() -> ScriptedMonitor {
            ScriptedMonitor::default()
        }

        /// Declares the accesses to report for a script. The key is matched
        /// against the last program argument (the `sh -c` script text).
        pub fn declare(
            &self,
            script: &str,
            reads: Vec<PathBuf>,
            writes: Vec<PathBuf>,
        ) {
            self.table.lock().unwrap().insert(
                script.to_string(),
                ScriptedAccesses { reads, writes },
            );
        }
    }

    impl ProcessMonitor for ScriptedMonitor {
        fn run(
            &self,
            request: MonitorRequest,
        ) -> Result<MonitorOutcome, Error> {
            use crate::error::ResultExt;
            use std::io::Read;
            use std::process::Stdio;

            let mut child = Command::new(&request.program)
                .args(&request.args)
                .current_dir(&request.working_dir)
                .envs(&request.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|_| {
                    format!("failed to launch {:?}", request.program)
                })?;

            // Poll so cancellation can kill the child, as a real monitor
            // would kill the whole process group.
            let status = loop {
                if let Some(status) = child
                    .try_wait()
                    .context("failed waiting for scripted process")?
                {
                    break status;
                }
                if request.cancel.canceled() {
                    let _ = child.kill();
                    break child
                        .wait()
                        .context("failed reaping canceled process")?;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            };

            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_string(&mut stdout);
            }
            if let Some(mut err) = child.stderr.take() {
                let _ = err.read_to_string(&mut stderr);
            }

            let output = ScriptedOutput {
                code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            };

            let script = request.args.last().cloned().unwrap_or_default();
            let scripted = self
                .table
                .lock()
                .unwrap()
                .get(&script)
                .cloned()
                .unwrap_or_default();

            let mut report = AccessReport::new();
            for path in scripted.reads {
                report.record_read(path);
            }
            for path in scripted.writes {
                report.record_write(path);
            }
            report.observe_write_times();

            Ok(MonitorOutcome {
                exit_code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
                report,
            })
        }
    }

    struct ScriptedOutput {
        code: i32,
        stdout: String,
        stderr: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_classifies_accesses() {
        let mut report = AccessReport::new();
        report.record_read(PathBuf::from("/a"));
        report.record_read(PathBuf::from("/b"));
        report.record_write(PathBuf::from("/b"));
        report.record_write(PathBuf::from("/c"));

        assert_eq!(
            report.reads(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
                .into_iter()
                .collect()
        );
        assert_eq!(
            report.writes(),
            vec![PathBuf::from("/b"), PathBuf::from("/c")]
                .into_iter()
                .collect()
        );
        assert_eq!(
            report.read_only(),
            vec![PathBuf::from("/a")].into_iter().collect()
        );
    }

    #[test]
    fn delete_cancels_write() {
        let mut report = AccessReport::new();
        report.record_write(PathBuf::from("/scratch"));
        report.record_delete(PathBuf::from("/scratch"));
        assert!(report.writes().is_empty());
    }

    #[test]
    fn filter_drops_temp_glob_and_nonregular() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("tmp");
        fs::create_dir(&temp).unwrap();

        let real = dir.path().join("real.txt");
        fs::write(&real, b"x").unwrap();

        let subdir = dir.path().join("sub");
        fs::create_dir(&subdir).unwrap();

        let mut report = AccessReport::new();
        report.record_read(real.clone());
        report.record_read(temp.join("scratch.txt"));
        report.record_read(dir.path().join("*.obj"));
        report.record_read(subdir.clone());
        report.record_read(dir.path().join("missing.txt"));

        report.filter(&temp);

        assert_eq!(
            report.reads(),
            vec![real].into_iter().collect()
        );
    }
}
