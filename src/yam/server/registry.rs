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

//! The service port registry: `.yam/.servicePort` holds `<pid> <port>` so
//! a client can find (and liveness-check) the running service.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, ResultExt};
use crate::repo;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ServicePortRegistry {
    pub pid: u32,
    pub port: u16,
}

impl ServicePortRegistry {
    /// Records this process as the service for the given home directory.
    pub fn write(home_dir: &Path, port: u16) -> Result<(), Error> {
        let registry = ServicePortRegistry {
            pid: std::process::id(),
            port,
        };
        let path = Self::path(home_dir);
        fs::write(&path, format!("{} {}\n", registry.pid, registry.port))
            .with_context(|_| {
                format!("could not write service port registry {:?}", path)
            })?;
        Ok(())
    }

    /// Reads the registry, if present and well-formed.
    pub fn read(home_dir: &Path) -> Option<ServicePortRegistry> {
        let content = fs::read_to_string(Self::path(home_dir)).ok()?;
        let mut parts = content.split_whitespace();
        let pid: u32 = parts.next()?.parse().ok()?;
        let port: u16 = parts.next()?.parse().ok()?;
        Some(ServicePortRegistry { pid, port })
    }

    pub fn remove(home_dir: &Path) {
        let _ = fs::remove_file(Self::path(home_dir));
    }

    pub fn path(home_dir: &Path) -> PathBuf {
        repo::service_port_path(home_dir)
    }

    /// Whether the recorded service process is still alive.
    pub fn service_running(&self) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            kill(Pid::from_raw(self.pid as i32), None).is_ok()
        }

        #[cfg(not(unix))]
        {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(repo::DOT_YAM)).unwrap();

        ServicePortRegistry::write(dir.path(), 12345).unwrap();
        let registry = ServicePortRegistry::read(dir.path()).unwrap();
        assert_eq!(registry.port, 12345);
        assert_eq!(registry.pid, std::process::id());

        // This very process is alive.
        assert!(registry.service_running());

        ServicePortRegistry::remove(dir.path());
        assert!(ServicePortRegistry::read(dir.path()).is_none());
    }

    #[test]
    fn malformed_registry_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(repo::DOT_YAM)).unwrap();
        fs::write(ServicePortRegistry::path(dir.path()), "garbage").unwrap();
        assert!(ServicePortRegistry::read(dir.path()).is_none());
    }
}
