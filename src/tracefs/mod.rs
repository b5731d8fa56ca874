//! Access to the tracing virtual filesystem.
//!
//! The mount point moved over time, so every operation tries
//! `/sys/kernel/tracing` first and falls back to
//! `/sys/kernel/debug/tracing`.

use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::path::Path;

use log::warn;

use crate::probe::MAX_SAMPLE_IDS;

const ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

fn open(rel: &str, opts: &OpenOptions) -> Result<File> {
    if rel.starts_with('/') {
        return Err(ErrorKind::InvalidInput.into());
    }

    let mut saved: Option<Error> = None;
    for root in ROOTS {
        match opts.open(Path::new(root).join(rel)) {
            Ok(file) => return Ok(file),
            Err(e) => {
                if saved.is_none() && e.kind() != ErrorKind::NotFound {
                    saved = Some(e);
                }
            }
        }
    }

    Err(saved.unwrap_or_else(|| ErrorKind::NotFound.into()))
}

pub(crate) fn read_to_string(rel: &str) -> Result<String> {
    let mut file = open(rel, OpenOptions::new().read(true))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    Ok(buf)
}

/// Overwrites `rel` with `line`, the install form of `kprobe_events`.
pub(crate) fn write_line(rel: &str, line: &str) -> Result<()> {
    let mut file = open(rel, OpenOptions::new().write(true))?;
    file.write_all(line.as_bytes())
}

/// Appends `line` to `rel`, the uninstall form of `kprobe_events`.
pub(crate) fn append_line(rel: &str, line: &str) -> Result<()> {
    let mut file = open(rel, OpenOptions::new().write(true).append(true))?;
    file.write_all(line.as_bytes())
}

/// Reads `events/<subsystem>/<name>/id` and returns the numeric
/// tracepoint id, bounded so it can index the sample-kind map.
pub(crate) fn tracepoint_id(rel: &str) -> Result<u16> {
    let buf = read_to_string(rel)?;
    let id = buf
        .trim_end()
        .parse::<usize>()
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
    if id < 1 || id >= MAX_SAMPLE_IDS {
        warn!("tracepoint id {} of {} out of range", id, rel);
        return Err(ErrorKind::InvalidData.into());
    }
    Ok(id as u16)
}

/// Parses the byte offset of a probe body out of a tracefs `format`
/// file: the `offset:` of the first field after the common area,
/// i.e. the first `offset:<N>;` past the first blank line. It is 8
/// on mainline kernels but differs on some vendor kernels.
pub(crate) fn parse_body_offset(format: &str) -> Option<usize> {
    let mut past_common = false;
    for line in format.lines() {
        if !past_common {
            past_common = line.is_empty();
            continue;
        }
        let rest = line.split_once("offset:")?.1;
        let num = rest.split_once(';')?.0;
        return num.trim().parse().ok();
    }
    None
}

/// The probe body offset, read from the exec tracepoint since that
/// one exists on every kernel we can run on.
pub(crate) fn probe_body_offset() -> Result<usize> {
    let format = read_to_string("events/sched/sched_process_exec/format")?;
    parse_body_offset(&format).ok_or_else(|| ErrorKind::InvalidData.into())
}

#[cfg(test)]
mod test;
