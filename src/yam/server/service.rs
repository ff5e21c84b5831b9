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

//! The build service.
//!
//! One service per home repository, serving a single client at a time over
//! a local TCP stream. The service thread doubles as the build's main
//! thread: the client's reader runs on its own thread and only ever pushes
//! cancellation actions; log records stream back to the client through a
//! channel-backed log book while the build progresses.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crossbeam::channel;

use crate::builder::{Builder, CancelHandle};
use crate::error::{Error, ResultExt};
use crate::logbook::{LogBook, LogRecord, MultiwayLogBook};
use crate::repo;

use super::protocol::{
    read_message, write_message, ClientMessage, ServiceMessage,
};
use super::registry::ServicePortRegistry;

/// Forwards every record to the connected client.
struct ChannelLogBook {
    sender: channel::Sender<ServiceMessage>,
}

impl LogBook for ChannelLogBook {
    fn add(&self, record: LogRecord) {
        let _ = self.sender.send(ServiceMessage::LogRecord(record));
    }
}

pub struct BuildService {
    home_dir: PathBuf,
    listener: TcpListener,
    builder: Builder,
}

impl BuildService {
    /// Binds the service socket and registers `<pid> <port>` for clients.
    pub fn new(home_dir: &Path) -> Result<BuildService, Error> {
        if !home_dir.join(repo::DOT_YAM).is_dir() {
            std::fs::create_dir_all(home_dir.join(repo::DOT_YAM))
                .with_context(|_| {
                    format!("could not initialize {:?}", home_dir)
                })?;
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .context("could not bind service socket")?;
        let port = listener
            .local_addr()
            .context("could not read service socket address")?
            .port();

        ServicePortRegistry::write(home_dir, port)?;

        Ok(BuildService {
            home_dir: home_dir.to_path_buf(),
            listener,
            builder: Builder::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    /// Accepts clients until one requests a shutdown.
    pub fn run(&mut self) -> Result<(), Error> {
        log::info!(
            "yam service listening on port {} for {:?}",
            self.port(),
            self.home_dir
        );

        loop {
            let (stream, _addr) = self
                .listener
                .accept()
                .context("could not accept client connection")?;
            stream.set_nodelay(true).ok();

            match self.serve_client(stream) {
                Ok(shutdown) => {
                    if shutdown {
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("client connection failed: {}", err);
                }
            }
        }

        ServicePortRegistry::remove(&self.home_dir);
        Ok(())
    }

    /// Serves one client connection. Returns whether a shutdown was
    /// requested.
    fn serve_client(&mut self, stream: TcpStream) -> Result<bool, Error> {
        let read_half =
            stream.try_clone().context("could not clone stream")?;
        let mut write_half = stream;

        // Outgoing messages funnel through one channel so worker threads
        // can log while the writer owns the stream.
        let (out_tx, out_rx) = channel::unbounded::<ServiceMessage>();
        let writer = thread::Builder::new()
            .name("yam-service-writer".to_string())
            .spawn(move || {
                for message in out_rx {
                    if write_message(&mut write_half, &message).is_err() {
                        break;
                    }
                }
            })
            .context("could not spawn writer thread")?;

        // The reader forwards requests to this (main) thread. Stops and
        // disconnects must interrupt a running build, so the reader applies
        // them directly through the cancel handle.
        let cancel = self.builder.cancel_handle();
        let (req_tx, req_rx) = mpsc::channel::<ClientMessage>();
        let reader = thread::Builder::new()
            .name("yam-service-reader".to_string())
            .spawn(move || read_loop(read_half, req_tx, cancel))
            .context("could not spawn reader thread")?;

        let previous_log_book = self.builder.context().log_book_arc();
        let mut multiway = MultiwayLogBook::new();
        multiway.add_book(previous_log_book.clone());
        multiway.add_book(Arc::new(ChannelLogBook {
            sender: out_tx.clone(),
        }));
        self.builder.context_mut().set_log_book(Arc::new(multiway));

        let mut shutdown = false;
        for message in req_rx {
            match message {
                ClientMessage::BuildRequest(request) => {
                    let result = self.builder.handle(request);
                    let _ =
                        out_tx.send(ServiceMessage::BuildResult(result));
                }
                ClientMessage::StopBuildRequest => {
                    // Already applied by the reader through the cancel
                    // handle; nothing to answer.
                }
                ClientMessage::ShutdownRequest => {
                    let _ = out_tx.send(ServiceMessage::ShutdownAck);
                    shutdown = true;
                    break;
                }
            }
        }

        self.builder.context_mut().set_log_book(previous_log_book);

        drop(out_tx);
        let _ = writer.join();
        let _ = reader.join();

        Ok(shutdown)
    }
}

/// Parses client messages until the connection closes. A disconnect while
/// a build may be in flight cancels it server-side.
fn read_loop(
    mut stream: TcpStream,
    requests: mpsc::Sender<ClientMessage>,
    cancel: CancelHandle,
) {
    loop {
        match read_message::<_, ClientMessage>(&mut stream) {
            Ok(Some(ClientMessage::StopBuildRequest)) => {
                cancel.cancel();
                let _ = requests.send(ClientMessage::StopBuildRequest);
            }
            Ok(Some(message)) => {
                if requests.send(message).is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => {
                // Disconnect (clean or not): stop any build in flight.
                cancel.cancel();
                break;
            }
        }
    }
}
