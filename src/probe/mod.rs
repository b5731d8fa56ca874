//! Kprobe declarations and their process-wide installation state.
//!
//! Installed probe names live in the host-global `kprobe_events`
//! namespace, so the whole process shares one installation no matter
//! how many queues are open: a refcount tracks live queues, and
//! every probe name carries a `_<pid>` suffix so concurrent
//! processes cannot collide.

use std::process;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::btf::BtfTable;
use crate::error::{Error, Result};
use crate::tracefs;

pub(crate) mod dsl;
mod table;

pub(crate) use table::{ARGV_SLOTS, MAX_PWD};

/// Size of the sample-id → kind map; covers any tracefs event id.
pub(crate) const MAX_SAMPLE_IDS: usize = 4096;

/// What a decoded sample body means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SampleKind {
    Exec = 1,
    WakeUpNewTask = 2,
    ExitThread = 3,
    ExecConnector = 4,
}

// Process-wide: ids are host-global tracefs ids, identical for every
// queue sharing the installation. Written while a queue opens, read
// lock-free while any queue populates.
static ID_TO_KIND: [AtomicU8; MAX_SAMPLE_IDS] = [const { AtomicU8::new(0) }; MAX_SAMPLE_IDS];

pub(crate) fn set_sample_kind(id: u16, kind: SampleKind) {
    ID_TO_KIND[id as usize].store(kind as u8, Ordering::Relaxed);
}

pub(crate) fn sample_kind_of(id: u16) -> Option<SampleKind> {
    if id as usize >= MAX_SAMPLE_IDS {
        return None;
    }
    match ID_TO_KIND[id as usize].load(Ordering::Relaxed) {
        1 => Some(SampleKind::Exec),
        2 => Some(SampleKind::WakeUpNewTask),
        3 => Some(SampleKind::ExitThread),
        4 => Some(SampleKind::ExecConnector),
        _ => None,
    }
}

/// One declared probe: where it attaches and what it records.
pub(crate) struct Kprobe {
    pub name: &'static str,
    pub target: &'static str,
    pub kind: SampleKind,
    pub is_kret: bool,
    pub args: Vec<KprobeArg>,
}

/// One recorded argument of a probe.
pub(crate) struct KprobeArg {
    pub name: String,
    pub reg: &'static str,
    pub typ: &'static str,
    pub dsl: String,
}

struct NamedProbe {
    /// Declared name plus the `_<pid>` suffix.
    name: String,
    index: usize,
}

struct Registry {
    refs: u32,
    probes: Vec<NamedProbe>,
    body_offset: Option<usize>,
    btf: Option<Arc<BtfTable>>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    refs: 0,
    probes: Vec::new(),
    body_offset: None,
    btf: None,
});

/// Everything a queue needs from the shared installation.
pub(crate) struct Installed {
    pub body_offset: usize,
    /// Renamed tracefs probe names with their sample kinds, in
    /// declaration order.
    pub probes: Vec<(String, SampleKind)>,
}

fn uninstall(name: &str) -> std::io::Result<()> {
    tracefs::append_line("kprobe_events", &format!("-:{}", name))
}

fn install(btf: &BtfTable, name: &str, probe: &Kprobe) -> Result<()> {
    // A stale entry from a dead process with our pid blocks the
    // install; clear it first.
    if let Err(e) = uninstall(name) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("kprobe uninstall {}: {}", name, e);
        }
    }
    let line = dsl::build_probe_line(btf, name, probe)?;
    debug!("installing {}", line);
    tracefs::write_line("kprobe_events", &line)?;
    Ok(())
}

/// Takes a reference on the shared installation, installing all
/// declared probes on the first one. A partial install rolls back
/// the probes already written.
pub(crate) fn acquire() -> Result<Installed> {
    let mut reg = REGISTRY.lock().unwrap();

    if reg.refs == 0 {
        let body_offset = match reg.body_offset {
            Some(off) => off,
            None => tracefs::probe_body_offset()
                .map_err(|_| Error::MissingFeature("probe body offset"))?,
        };
        let btf = match reg.btf.clone() {
            Some(btf) => btf,
            None => Arc::new(BtfTable::load().map_err(Error::Btf)?),
        };
        if reg.probes.is_empty() {
            let pid = process::id();
            reg.probes = table::all_kprobes()
                .iter()
                .enumerate()
                .map(|(index, k)| NamedProbe {
                    name: format!("{}_{}", k.name, pid),
                    index,
                })
                .collect();
        }

        for i in 0..reg.probes.len() {
            let np = &reg.probes[i];
            let probe = &table::all_kprobes()[np.index];
            if let Err(e) = install(&btf, &np.name, probe) {
                warn!("kprobe {} failed: {}", np.name, e);
                for done in &reg.probes[..i] {
                    let _ = uninstall(&done.name);
                }
                // A failed open leaves nothing behind; the next one
                // rebuilds the list from the declarations.
                reg.probes = Vec::new();
                return Err(e);
            }
        }

        reg.body_offset = Some(body_offset);
        reg.btf = Some(btf);
    }
    reg.refs += 1;

    Ok(Installed {
        body_offset: reg.body_offset.unwrap(),
        probes: reg
            .probes
            .iter()
            .map(|np| (np.name.clone(), table::all_kprobes()[np.index].kind))
            .collect(),
    })
}

/// Drops a reference; the last one uninstalls every probe and drops
/// the BTF cache.
pub(crate) fn release() {
    let mut reg = REGISTRY.lock().unwrap();
    reg.refs -= 1;
    if reg.refs == 0 {
        for np in &reg.probes {
            let _ = uninstall(&np.name);
        }
        reg.btf = None;
    }
}
