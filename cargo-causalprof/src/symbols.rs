//! Offline symbolization of sampled program counters.
//!
//! Resolves addresses against the DWARF debug info of the profiled binary.
//! Only works for addresses that match the binary's link-time layout, i.e.
//! non-PIE executables; for PIE binaries the report falls back to the
//! locations the profiled process wrote into the record file.

use anyhow::{Context, Result};
use causalprof::Location;
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;

type Reader = gimli::EndianRcSlice<gimli::RunTimeEndian>;

/// DWARF line and function lookup for one binary.
pub struct DwarfResolver {
    context: addr2line::Context<Reader>,
}

impl DwarfResolver {
    /// Loads the debug info of `binary_path`.
    pub fn load(binary_path: &Path) -> Result<Self> {
        let file = File::open(binary_path)
            .with_context(|| format!("Failed to open binary: {}", binary_path.display()))?;
        // SAFETY: the binary is not expected to change while the report runs.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.context("Failed to memory-map binary")?;
        let object = object::File::parse(&*mmap).context("Failed to parse binary")?;

        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
            let data = object
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[]));
            let bytes: Rc<[u8]> = Rc::from(data.into_owned());
            Ok(gimli::EndianRcSlice::new(bytes, endian))
        };

        let dwarf = gimli::Dwarf::load(&load_section).context(
            "Failed to load DWARF sections; build the binary with debug info (-C debuginfo=2)",
        )?;
        let context =
            addr2line::Context::from_dwarf(dwarf).context("Failed to create DWARF context")?;

        Ok(Self { context })
    }

    /// Resolves `pc` to the innermost (possibly inlined) function containing
    /// it and its source line.
    pub fn lookup(&self, pc: u64) -> Option<Location> {
        let function = self.function_name(pc);
        let (file, line) = match self.context.find_location(pc) {
            Ok(Some(loc)) => (loc.file.map(str::to_string), loc.line),
            _ => (None, None),
        };

        if function.is_none() && file.is_none() {
            return None;
        }

        Some(Location {
            function: function.unwrap_or_else(|| "<unknown>".to_string()),
            file: file.unwrap_or_else(|| "??".to_string()),
            line: line.unwrap_or(0),
        })
    }

    fn function_name(&self, pc: u64) -> Option<String> {
        let mut frames = self.context.find_frames(pc).skip_all_loads().ok()?;
        let frame = frames.next().ok()??;
        let function = frame.function?;
        let name = function.demangle().ok()?;
        Some(name.into_owned())
    }
}
