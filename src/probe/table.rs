//! The declared probe set.
//!
//! `wake_up_new_task` and `exit_thread` record the same argument
//! list over `%di` (the `task_struct` in both), which keeps one
//! decoder for both sample bodies. `proc_exec_connector` records
//! argc, the first argv bytes and comm of the task that just
//! exec'ed.
//!
//! Argument order is wire order: 64-bit values first, then the
//! string data-locs, then the 32-bit tail, so the record packs
//! without padding holes.

use std::sync::LazyLock;

use super::{Kprobe, KprobeArg, SampleKind};

/// Recorded working-directory components, leaf upwards.
pub(crate) const MAX_PWD: usize = 7;

/// Recorded 8-byte slots of argv bytes.
pub(crate) const ARGV_SLOTS: usize = 100;

static ALL: LazyLock<Vec<Kprobe>> = LazyLock::new(|| {
    vec![
        Kprobe {
            name: "procwatch_wake_up_new_task",
            target: "wake_up_new_task",
            kind: SampleKind::WakeUpNewTask,
            is_kret: false,
            args: task_args(),
        },
        Kprobe {
            name: "procwatch_exit_thread",
            target: "exit_thread",
            kind: SampleKind::ExitThread,
            is_kret: false,
            args: task_args(),
        },
        Kprobe {
            name: "procwatch_exec_connector",
            target: "proc_exec_connector",
            kind: SampleKind::ExecConnector,
            is_kret: false,
            args: exec_connector_args(),
        },
    ]
});

pub(crate) fn all_kprobes() -> &'static [Kprobe] {
    &ALL
}

fn arg(name: &str, typ: &'static str, dsl: String) -> KprobeArg {
    KprobeArg {
        name: name.to_string(),
        reg: "di",
        typ,
        dsl,
    }
}

/// Walks `pwd.dentry` up `depth` parents; with `name` set it lands
/// on the entry's name bytes instead of the dentry pointer itself.
fn pwd_dsl(depth: usize, name: bool) -> String {
    let mut dsl = String::from("task_struct.fs fs_struct.pwd.dentry");
    for _ in 0..depth {
        dsl.push_str(" dentry.d_parent");
    }
    if name {
        dsl.push_str(" dentry.d_name.name 0");
    }
    dsl
}

fn task_args() -> Vec<KprobeArg> {
    let mut args = Vec::new();

    for cap in [
        "cap_inheritable",
        "cap_permitted",
        "cap_effective",
        "cap_bset",
        "cap_ambient",
    ] {
        args.push(arg(cap, "u64", format!("task_struct.cred cred.{}", cap)));
    }
    args.push(arg("start_time", "u64", "task_struct.start_time".into()));
    args.push(arg(
        "start_boottime",
        "u64",
        "task_struct.start_boottime".into(),
    ));

    // Dentry keys for rebuilding cwd: the task root, the mount root
    // and mountpoint of the pwd mount, then the pwd chain itself.
    // The mountpoint sits in the enclosing `mount`, reached from the
    // `vfsmount` member by a container-of fold.
    args.push(arg(
        "root_k",
        "u64",
        "task_struct.fs fs_struct.root.dentry".into(),
    ));
    args.push(arg(
        "mnt_root_k",
        "u64",
        "task_struct.fs fs_struct.pwd.mnt vfsmount.mnt_root".into(),
    ));
    args.push(arg(
        "mnt_mountpoint_k",
        "u64",
        "task_struct.fs fs_struct.pwd.mnt (mount.mnt_mountpoint-mount.mnt)".into(),
    ));
    for i in 0..MAX_PWD {
        args.push(arg(&format!("pwd{}_k", i), "u64", pwd_dsl(i, false)));
    }

    args.push(arg(
        "root_s",
        "string",
        "task_struct.fs fs_struct.root.dentry dentry.d_name.name 0".into(),
    ));
    args.push(arg(
        "mnt_root_s",
        "string",
        "task_struct.fs fs_struct.pwd.mnt vfsmount.mnt_root dentry.d_name.name 0".into(),
    ));
    args.push(arg(
        "mnt_mountpoint_s",
        "string",
        "task_struct.fs fs_struct.pwd.mnt (mount.mnt_mountpoint-mount.mnt) dentry.d_name.name 0"
            .into(),
    ));
    for i in 0..MAX_PWD {
        args.push(arg(&format!("pwd{}_s", i), "string", pwd_dsl(i, true)));
    }

    for id in ["uid", "gid", "suid", "sgid", "euid", "egid"] {
        args.push(arg(id, "u32", format!("task_struct.cred cred.{}", id)));
    }
    args.push(arg("pid", "u32", "task_struct.tgid".into()));
    args.push(arg("tid", "u32", "task_struct.pid".into()));
    args.push(arg("exit_code", "s32", "task_struct.exit_code".into()));

    args
}

fn exec_connector_args() -> Vec<KprobeArg> {
    let mut args = Vec::new();

    // At exec time the word at the start of the new stack is argc,
    // and the argv strings sit back to back at arg_start.
    args.push(arg(
        "argc",
        "u64",
        "task_struct.mm mm_struct.start_stack 0".into(),
    ));
    for i in 0..ARGV_SLOTS {
        args.push(arg(
            &format!("argv{}", i),
            "u64",
            format!("task_struct.mm mm_struct.arg_start {}", i * 8),
        ));
    }
    args.push(arg("comm", "string", "task_struct.comm".into()));

    args
}
