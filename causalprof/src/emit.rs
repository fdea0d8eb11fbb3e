//! Experiment record output.
//!
//! Each completed experiment becomes four lines of text:
//!
//! ```text
//! # main::parse src/parse.rs:42
//! # speedup 35%
//! # 1873ns/op
//! 0x55d0c1a4b2f0 35 1873
//! ```
//!
//! The three comment lines are for humans. The last line is the record itself
//! and is all that [`crate::report`] reads back.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// One completed experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExperimentRecord {
    /// Call site the delay was armed at.
    pub pc: u64,
    /// Slowdown applied, in percent of the sampling interval.
    pub percent: i32,
    /// Mean adjusted duration of a progress unit during the window.
    pub nanos_per_unit: i64,
}

/// A resolved source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.function, self.file, self.line)
    }
}

/// Maps a program counter to a source location for the record header.
pub trait SymbolResolver: Send + Sync {
    /// Returns the location of `pc`, or `None` if it cannot be resolved.
    fn resolve(&self, pc: usize) -> Option<Location>;
}

impl<F> SymbolResolver for F
where
    F: Fn(usize) -> Option<Location> + Send + Sync,
{
    fn resolve(&self, pc: usize) -> Option<Location> {
        self(pc)
    }
}

/// Resolves addresses in the running process through the `backtrace` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceResolver;

impl SymbolResolver for BacktraceResolver {
    fn resolve(&self, pc: usize) -> Option<Location> {
        if pc == 0 {
            return None;
        }

        let mut location = None;
        backtrace::resolve(pc as *mut std::ffi::c_void, |symbol| {
            // Inlined frames are reported innermost first; keep the first one
            // that carries a name.
            if location.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            location = Some(Location {
                function: format!("{name:#}"),
                file: symbol
                    .filename()
                    .map_or_else(|| "??".to_string(), |p| p.display().to_string()),
                line: symbol.lineno().unwrap_or(0),
            });
        });
        location
    }
}

/// Writes experiment records to a sink.
pub struct Emitter<W: Write> {
    writer: W,
    resolver: Arc<dyn SymbolResolver>,
}

impl<W: Write> fmt::Debug for Emitter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

impl<W: Write> Emitter<W> {
    /// Creates an emitter writing to `writer`.
    pub fn new(writer: W, resolver: Arc<dyn SymbolResolver>) -> Self {
        Self { writer, resolver }
    }

    /// Writes one record and flushes the sink.
    ///
    /// # Errors
    ///
    /// Returns the sink's I/O error.
    pub fn emit(&mut self, record: &ExperimentRecord) -> io::Result<()> {
        let location = usize::try_from(record.pc)
            .ok()
            .and_then(|pc| self.resolver.resolve(pc));
        match location {
            Some(location) => writeln!(self.writer, "# {location}")?,
            None => writeln!(self.writer, "# <unknown> ??:0")?,
        }
        writeln!(self.writer, "# speedup {}%", record.percent)?;
        writeln!(self.writer, "# {}ns/op", record.nanos_per_unit)?;
        writeln!(
            self.writer,
            "{:#x} {} {}",
            record.pc, record.percent, record.nanos_per_unit
        )?;
        self.writer.flush()
    }

    /// Consumes the emitter, returning the sink.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
