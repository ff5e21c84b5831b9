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

//! The message contract between client and service.
//!
//! The lifecycle is: connect → `Build` → (`Log`)* → `Result` → disconnect.
//! A disconnect while a build is in flight stops the build server-side.
//! `Shutdown` is acknowledged before the service exits. Messages travel as
//! length-prefixed bincode frames; the framing is not part of the core
//! contract and may change freely.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::builder::{BuildRequest, BuildResult};
use crate::error::{Error, ResultExt};
use crate::logbook::LogRecord;

/// Client → service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ClientMessage {
    BuildRequest(BuildRequest),
    StopBuildRequest,
    ShutdownRequest,
}

/// Service → client.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ServiceMessage {
    LogRecord(LogRecord),
    BuildResult(BuildResult),
    ShutdownAck,
}

const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Writes one length-prefixed message frame.
pub fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), Error>
where
    W: Write,
    T: Serialize,
{
    let bytes = bincode::serialize(message)
        .context("could not serialize message")?;
    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .context("could not write message length")?;
    writer
        .write_all(&bytes)
        .context("could not write message body")?;
    writer.flush().context("could not flush message")?;
    Ok(())
}

/// Reads one message frame. `Ok(None)` on a clean end of stream.
pub fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, Error>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) => {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(Error::from(err)
                .context("could not read message length")
                .into());
        }
    }

    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(crate::error::ProtocolError::UnexpectedMessage(
            format!("oversized message frame ({} bytes)", len),
        )
        .into());
    }

    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .context("could not read message body")?;

    let message = bincode::deserialize(&bytes)
        .context("could not deserialize message")?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RequestKind;
    use std::io::Cursor;
    use std::path::PathBuf;

    #[test]
    fn frames_roundtrip() {
        let mut buffer = Vec::new();
        let request = ClientMessage::BuildRequest(BuildRequest::new(
            RequestKind::Build,
            PathBuf::from("/repo"),
        ));
        write_message(&mut buffer, &request).unwrap();
        write_message(&mut buffer, &ClientMessage::ShutdownRequest).unwrap();

        let mut cursor = Cursor::new(buffer);
        let first: ClientMessage =
            read_message(&mut cursor).unwrap().unwrap();
        match first {
            ClientMessage::BuildRequest(r) => {
                assert_eq!(r.kind, RequestKind::Build);
                assert_eq!(r.directory, PathBuf::from("/repo"));
            }
            _ => panic!("expected a build request"),
        }

        let second: ClientMessage =
            read_message(&mut cursor).unwrap().unwrap();
        assert!(matches!(second, ClientMessage::ShutdownRequest));

        // Clean end of stream.
        let done: Option<ClientMessage> =
            read_message(&mut cursor).unwrap();
        assert!(done.is_none());
    }
}
