//! Field offsets out of kernel BTF.
//!
//! Probe argument expressions name kernel struct fields by dotted
//! path (`cred.uid`, `fs_struct.pwd.dentry`). The running kernel
//! describes its own layout in `/sys/kernel/btf/vmlinux`; this
//! module resolves the fixed registry of paths the probe table uses
//! into byte offsets, once, at first queue open.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use btf::btf::{Btf, Struct, Type};
use log::{debug, warn};

const KERNEL_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

/// Every dotted path the probe table can mention. An unresolved
/// entry is tolerated (some fields moved across kernel releases);
/// compiling a probe that needs it fails instead.
const TARGETS: &[&str] = &[
    "cred.cap_ambient",
    "cred.cap_bset",
    "cred.cap_effective",
    "cred.cap_inheritable",
    "cred.cap_permitted",
    "cred.egid",
    "cred.euid",
    "cred.gid",
    "cred.sgid",
    "cred.suid",
    "cred.uid",
    "cred.user",
    "dentry.d_name.name",
    "dentry.d_parent",
    "fs_struct.pwd.dentry",
    "fs_struct.pwd.mnt",
    "fs_struct.root.dentry",
    "linux_binprm.filename",
    "mm_struct.arg_start",
    "mm_struct.start_stack",
    "mount.mnt",
    "mount.mnt_mountpoint",
    "task_struct.comm",
    "task_struct.cred",
    "task_struct.exit_code",
    "task_struct.fs",
    "task_struct.mm",
    "task_struct.pid",
    "task_struct.start_boottime",
    "task_struct.start_time",
    "task_struct.tgid",
    "vfsmount.mnt_root",
];

/// The resolved registry. Lookup is a plain hash probe so the DSL
/// compiler can fold expressions without touching BTF again.
pub(crate) struct BtfTable {
    offsets: HashMap<&'static str, u32>,
}

impl BtfTable {
    pub(crate) fn load() -> Result<Self> {
        let btf = Btf::from_file(KERNEL_BTF_PATH.to_string())
            .context("failed to load kernel BTF metadata")?;

        let mut offsets = HashMap::new();
        for &dotname in TARGETS {
            match dotted_offset(&btf, dotname) {
                Ok(off) => {
                    debug!("btf: {} at byte {}", dotname, off);
                    offsets.insert(dotname, off);
                }
                Err(e) => warn!("btf: {} unresolved: {:#}", dotname, e),
            }
        }
        if offsets.is_empty() {
            return Err(anyhow!("no BTF target resolved"));
        }

        Ok(Self { offsets })
    }

    /// Byte offset of a previously resolved dotted path.
    pub(crate) fn offset(&self, dotname: &str) -> Option<u32> {
        self.offsets.get(dotname).copied()
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: &[(&'static str, u32)]) -> Self {
        Self {
            offsets: entries.iter().copied().collect(),
        }
    }
}

/// Walks `Struct.field[.field…]`, accumulating member bit offsets.
/// Intermediate fields must be embedded aggregates; the final
/// accumulated offset must land on a byte boundary (this also
/// rejects bitfield members).
fn dotted_offset(btf: &Btf, dotname: &str) -> Result<u32> {
    let mut parts = dotname.split('.');
    let root = parts.next().context("empty dotted name")?;
    let fields: Vec<&str> = parts.collect();
    if fields.is_empty() {
        return Err(anyhow!("{dotname}: missing field part"));
    }

    let ty = btf
        .get_type_by_name(root)
        .with_context(|| format!("type {root} not found in BTF"))?;
    let mut st = match &ty.base_type {
        Type::Struct(st) => st,
        other => return Err(anyhow!("type {root} is not a struct (found {other:?})")),
    };

    let mut bits: u32 = 0;
    for (i, field) in fields.iter().enumerate() {
        let member = st
            .members
            .iter()
            .find(|m| m.name.as_deref() == Some(*field))
            .with_context(|| format!("member {field} not found in {dotname}"))?;
        bits += member.offset;
        if i + 1 < fields.len() {
            st = embedded_struct(btf, member.type_id)
                .with_context(|| format!("{dotname}: {field} is not an embedded struct"))?;
        }
    }

    if bits % 8 != 0 {
        return Err(anyhow!("{dotname}: bit offset {bits} is not byte aligned"));
    }
    Ok(bits / 8)
}

/// Resolves a member type to the struct it embeds, skipping type
/// modifiers. Pointers stop the walk: an offset cannot accumulate
/// across an indirection, that is what the probe DSL derefs are for.
fn embedded_struct(btf: &Btf, mut type_id: u32) -> Result<&Struct> {
    for _ in 0..32 {
        let ty = btf
            .get_type_by_id(type_id)
            .with_context(|| format!("failed to resolve type id {type_id}"))?;
        match &ty.base_type {
            Type::Struct(st) => return Ok(st),
            Type::Const(map)
            | Type::Volatile(map)
            | Type::Restrict(map)
            | Type::Typedef(map)
            | Type::TypeTag(map) => {
                type_id = map.type_id;
            }
            other => {
                return Err(anyhow!(
                    "type id {type_id} does not resolve to a struct ({other:?})"
                ))
            }
        }
    }

    Err(anyhow!(
        "type resolution exceeded while resolving struct for type id {type_id}"
    ))
}

#[cfg(test)]
mod test;
