// Copyright (c) 2019 Jason White
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

//! The log book: the sink through which every build event is reported.
//!
//! Records carry an aspect so that front-ends can filter what they show. The
//! service forwards records to the connected client; the console book prints
//! them; the memory book retains them for tests and for attaching to a
//! failed `BuildResult`.

use std::fmt;
use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use termcolor as tc;
use termcolor::WriteColor;

/// What a log record is about.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash,
)]
pub enum LogAspect {
    /// Error in a build file, command execution, storage, etc.
    Error,
    Warning,
    /// Successful completion of a unit of work.
    Progress,
    /// Output captured from a command script.
    ScriptOutput,
    /// The text of a command script about to run.
    Script,
    /// Build scope information.
    Scope,
    /// Time and memory usage.
    Performance,
    /// Input files detected for a command.
    InputFiles,
    /// The build order depends on prerequisites that were never declared.
    SuspectBuildOrdering,
    /// Files changed since the previous build.
    FileChanges,
    /// Directory re-enumeration.
    DirectoryChanges,
    /// Estimated remaining build time.
    BuildTimePrediction,
}

impl fmt::Display for LogAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogAspect::Error => "error",
            LogAspect::Warning => "warning",
            LogAspect::Progress => "progress",
            LogAspect::ScriptOutput => "script output",
            LogAspect::Script => "script",
            LogAspect::Scope => "scope",
            LogAspect::Performance => "performance",
            LogAspect::InputFiles => "input files",
            LogAspect::SuspectBuildOrdering => "suspect build ordering",
            LogAspect::FileChanges => "file changes",
            LogAspect::DirectoryChanges => "directory changes",
            LogAspect::BuildTimePrediction => "build time prediction",
        };
        write!(f, "{}", s)
    }
}

/// One build event.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct LogRecord {
    pub aspect: LogAspect,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl LogRecord {
    pub fn new<M: Into<String>>(aspect: LogAspect, message: M) -> LogRecord {
        LogRecord {
            aspect,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn error<M: Into<String>>(message: M) -> LogRecord {
        LogRecord::new(LogAspect::Error, message)
    }

    pub fn warning<M: Into<String>>(message: M) -> LogRecord {
        LogRecord::new(LogAspect::Warning, message)
    }

    pub fn progress<M: Into<String>>(message: M) -> LogRecord {
        LogRecord::new(LogAspect::Progress, message)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.aspect, self.message)
    }
}

/// A sink for log records.
///
/// Implementations must tolerate records arriving from worker threads.
pub trait LogBook: Send + Sync {
    fn add(&self, record: LogRecord);

    /// Whether records of the given aspect are worth producing at all.
    /// Callers may skip building expensive messages when this is false.
    fn must_log_aspect(&self, _aspect: LogAspect) -> bool {
        true
    }

    /// Whether the build should keep executing unrelated work after a
    /// failure. Consulted by the node execution protocol.
    fn keep_working(&self) -> bool {
        false
    }
}

/// Retains all records in memory.
#[derive(Default)]
pub struct MemoryLogBook {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogBook {
    pub fn new() -> MemoryLogBook {
        MemoryLogBook::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn contains_aspect(&self, aspect: LogAspect) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.aspect == aspect)
    }
}

impl LogBook for MemoryLogBook {
    fn add(&self, record: LogRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// Prints records to the console, coloring errors and warnings.
pub struct ConsoleLogBook {
    writer: Mutex<tc::StandardStream>,
}

impl ConsoleLogBook {
    pub fn new() -> ConsoleLogBook {
        let color = if atty::is(atty::Stream::Stdout) {
            tc::ColorChoice::Auto
        } else {
            tc::ColorChoice::Never
        };

        ConsoleLogBook {
            writer: Mutex::new(tc::StandardStream::stdout(color)),
        }
    }

    fn color_for(aspect: LogAspect) -> Option<tc::Color> {
        match aspect {
            LogAspect::Error => Some(tc::Color::Red),
            LogAspect::Warning => Some(tc::Color::Yellow),
            LogAspect::Progress => Some(tc::Color::Green),
            _ => None,
        }
    }
}

impl Default for ConsoleLogBook {
    fn default() -> ConsoleLogBook {
        ConsoleLogBook::new()
    }
}

impl LogBook for ConsoleLogBook {
    fn add(&self, record: LogRecord) {
        let mut writer = self.writer.lock().unwrap();

        let result = (|| -> std::io::Result<()> {
            if let Some(color) = Self::color_for(record.aspect) {
                writer.set_color(
                    tc::ColorSpec::new().set_fg(Some(color)).set_bold(true),
                )?;
                write!(writer, "{}", record.aspect)?;
                writer.reset()?;
                writeln!(writer, ": {}", record.message)?;
            } else {
                writeln!(writer, "{}", record.message)?;
            }
            Ok(())
        })();

        // Console write failures are not worth failing a build over.
        let _ = result;
    }

    fn must_log_aspect(&self, aspect: LogAspect) -> bool {
        match aspect {
            LogAspect::Script | LogAspect::InputFiles => {
                log::log_enabled!(log::Level::Debug)
            }
            _ => true,
        }
    }
}

/// Fans records out to several books.
#[derive(Default)]
pub struct MultiwayLogBook {
    books: Vec<std::sync::Arc<dyn LogBook>>,
}

impl MultiwayLogBook {
    pub fn new() -> MultiwayLogBook {
        MultiwayLogBook::default()
    }

    pub fn add_book(&mut self, book: std::sync::Arc<dyn LogBook>) {
        self.books.push(book);
    }
}

impl LogBook for MultiwayLogBook {
    fn add(&self, record: LogRecord) {
        for book in &self.books {
            book.add(record.clone());
        }
    }

    fn must_log_aspect(&self, aspect: LogAspect) -> bool {
        self.books.iter().any(|b| b.must_log_aspect(aspect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_book_retains_records() {
        let book = MemoryLogBook::new();
        book.add(LogRecord::error("boom"));
        book.add(LogRecord::progress("done"));

        let records = book.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].aspect, LogAspect::Error);
        assert!(book.contains_aspect(LogAspect::Progress));
        assert!(!book.contains_aspect(LogAspect::Warning));
    }

    #[test]
    fn multiway_fans_out() {
        use std::sync::Arc;

        let a = Arc::new(MemoryLogBook::new());
        let b = Arc::new(MemoryLogBook::new());

        let mut multi = MultiwayLogBook::new();
        multi.add_book(a.clone());
        multi.add_book(b.clone());

        multi.add(LogRecord::warning("careful"));

        assert_eq!(a.records().len(), 1);
        assert_eq!(b.records().len(), 1);
    }
}
