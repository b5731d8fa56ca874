//! Working-directory reconstruction.
//!
//! The task probe records up to [`MAX_PWD`] `(name, dentry key)`
//! pairs walking from the cwd leaf towards the root, plus the keys
//! of the filesystem root and of the pwd mount's root, and the name
//! of that mount's mountpoint. Rebuilding the path walks the pairs
//! until a key matches one of the anchors.

use arrayvec::ArrayVec;

use crate::error::{Error, Result};
use crate::probe::MAX_PWD;

// PATH_MAX, including the terminator the wire format carries.
const MAXPATHLEN: usize = 4096;

pub(crate) struct PwdEntry<'a> {
    pub name: &'a str,
    pub key: u64,
}

pub(crate) struct PathCtx<'a> {
    pub root_k: u64,
    pub mnt_root_k: u64,
    pub mnt_mountpoint: &'a str,
    pub pwd: ArrayVec<PwdEntry<'a>, MAX_PWD>,
}

/// Rebuilds the path, leaf to root: a component whose key is the
/// filesystem root ends the walk; one whose key is the mount root is
/// replaced by the mountpoint name and ends it too. An empty walk is
/// the root itself.
pub(crate) fn build_path(ctx: &PathCtx) -> Result<String> {
    let mut components = ArrayVec::<&str, MAX_PWD>::new();
    for entry in &ctx.pwd {
        if entry.key == ctx.root_k {
            break;
        }
        if entry.key == ctx.mnt_root_k {
            components.push(ctx.mnt_mountpoint);
            break;
        }
        components.push(entry.name);
    }

    let mut path = String::new();
    for name in components.iter().rev() {
        if !name.starts_with('/') {
            path.push('/');
        }
        path.push_str(name);
        if path.len() >= MAXPATHLEN {
            return Err(Error::NameTooLong);
        }
    }
    if path.is_empty() {
        path.push('/');
    }

    Ok(path)
}
