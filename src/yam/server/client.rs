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

//! The build client: connects to the service recorded in the port
//! registry, sends one request, and streams the log records back until the
//! terminal result arrives.

use std::net::TcpStream;
use std::path::Path;

use crate::builder::{BuildRequest, BuildResult};
use crate::error::{Error, ProtocolError, ResultExt};
use crate::logbook::LogRecord;

use super::protocol::{
    read_message, write_message, ClientMessage, ServiceMessage,
};
use super::registry::ServicePortRegistry;

pub struct BuildClient {
    stream: TcpStream,
}

impl BuildClient {
    /// Connects to the service registered for `home_dir`. Fails when no
    /// live service is registered.
    pub fn connect(home_dir: &Path) -> Result<BuildClient, Error> {
        let registry = ServicePortRegistry::read(home_dir).ok_or_else(
            || {
                failure::format_err!(
                    "no build service is registered for {:?}",
                    home_dir
                )
            },
        )?;

        if !registry.service_running() {
            return Err(failure::format_err!(
                "the registered build service (pid {}) is not running",
                registry.pid
            ));
        }

        let stream = TcpStream::connect(("127.0.0.1", registry.port))
            .with_context(|_| {
                format!(
                    "could not connect to the build service on port {}",
                    registry.port
                )
            })?;
        stream.set_nodelay(true).ok();

        Ok(BuildClient { stream })
    }

    /// Sends a build request and streams records to `on_log` until the
    /// terminal result arrives.
    pub fn build<F>(
        &mut self,
        request: BuildRequest,
        mut on_log: F,
    ) -> Result<BuildResult, Error>
    where
        F: FnMut(LogRecord),
    {
        write_message(
            &mut self.stream,
            &ClientMessage::BuildRequest(request),
        )?;

        loop {
            match read_message::<_, ServiceMessage>(&mut self.stream)? {
                Some(ServiceMessage::LogRecord(record)) => on_log(record),
                Some(ServiceMessage::BuildResult(result)) => {
                    return Ok(result);
                }
                Some(ServiceMessage::ShutdownAck) => {
                    return Err(ProtocolError::UnexpectedMessage(
                        "shutdown ack during a build".to_string(),
                    )
                    .into());
                }
                None => return Err(ProtocolError::Disconnected.into()),
            }
        }
    }

    /// Asks the service to stop the build in flight.
    pub fn stop_build(&mut self) -> Result<(), Error> {
        write_message(&mut self.stream, &ClientMessage::StopBuildRequest)
    }

    /// Asks the service to exit; waits for the acknowledgement.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        write_message(&mut self.stream, &ClientMessage::ShutdownRequest)?;
        loop {
            match read_message::<_, ServiceMessage>(&mut self.stream)? {
                Some(ServiceMessage::ShutdownAck) | None => return Ok(()),
                Some(ServiceMessage::LogRecord(_)) => {}
                Some(ServiceMessage::BuildResult(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RequestKind;
    use crate::server::BuildService;
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    /// End-to-end over a real socket: init request, log streaming, result,
    /// shutdown.
    #[test]
    fn client_talks_to_service() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("proj");
        fs::create_dir_all(home.join("src")).unwrap();
        fs::write(home.join("src/a.txt"), b"hello").unwrap();

        let mut service = BuildService::new(&home).unwrap();
        let home2 = home.clone();
        let service_thread = thread::spawn(move || {
            let _ = service.run();
            home2
        });

        // The registry exists as soon as `new` returned.
        let registry = ServicePortRegistry::read(&home).unwrap();
        assert!(registry.service_running());

        let mut client = BuildClient::connect(&home).unwrap();
        let mut records = Vec::new();
        let result = client
            .build(
                BuildRequest::new(RequestKind::Build, home.clone()),
                |record| records.push(record),
            )
            .unwrap();

        // An empty repository builds successfully and mirrors the source
        // tree.
        assert!(result.succeeded());
        assert!(result.n_started > 0);

        client.shutdown().unwrap();
        // The service joins its reader thread, which runs until this
        // connection closes.
        drop(client);
        let home = service_thread.join().unwrap();
        assert!(ServicePortRegistry::read(&home).is_none());
    }

    #[test]
    fn connect_fails_without_registry() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(crate::repo::DOT_YAM)).unwrap();
        assert!(BuildClient::connect(dir.path()).is_err());
    }

    #[test]
    fn request_paths_are_plain_data() {
        let request =
            BuildRequest::new(RequestKind::Clean, PathBuf::from("/x"));
        let bytes = bincode::serialize(&request).unwrap();
        let back: BuildRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.kind, RequestKind::Clean);
        assert_eq!(back.directory, PathBuf::from("/x"));
    }
}
