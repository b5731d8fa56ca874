//! Raw events and the record decoder.
//!
//! Every perf record a ring hands us is turned into one [`RawEvent`]
//! or dropped. Decoding never fails the populate loop: a record we
//! cannot make sense of is logged and skipped, only the ring layer
//! can report fatal conditions.

use arrayvec::ArrayVec;
use log::warn;

use crate::ffi::{bindings as b, deref_offset};
use crate::probe::{self, SampleKind, ARGV_SLOTS, MAX_PWD};

pub(crate) mod path;

use path::{build_path, PathCtx, PwdEntry};

/// Process lifecycle event in its on-wire granularity, before any
/// cross-event assembly.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawEvent {
    /// Process id the event is about.
    pub pid: u32,
    /// Thread id from the sample id, i.e. of the task that produced
    /// the record.
    pub tid: u32,
    /// Process id from the sample id; for task wake-ups this is the
    /// parent, not `pid`.
    pub opid: u32,
    /// CPU the record was produced on.
    pub cpu: u32,
    /// Nanoseconds since boot, `CLOCK_MONOTONIC`.
    pub time: u64,
    pub kind: RawEventKind,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RawEventKind {
    Exec(RawExec),
    WakeUpNewTask(Box<RawTask>),
    ExitThread(Box<RawTask>),
    Comm(RawComm),
    ExecConnector(RawExecConnector),
}

/// Body of the exec tracepoint.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawExec {
    pub filename: String,
    pub pid: i32,
    pub old_pid: i32,
}

/// Body shared by task wake-up and exit: a snapshot of the task's
/// credentials and start times. Fields that only one of the two can
/// know are optional.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawTask {
    pub cap_inheritable: u64,
    pub cap_permitted: u64,
    pub cap_effective: u64,
    pub cap_bset: u64,
    pub cap_ambient: u64,
    pub start_time: u64,
    pub start_boottime: u64,
    pub uid: u32,
    pub gid: u32,
    pub suid: u32,
    pub sgid: u32,
    pub euid: u32,
    pub egid: u32,
    /// Parent pid; only a wake-up knows it.
    pub ppid: Option<u32>,
    /// Working directory; only rebuilt for wake-ups.
    pub cwd: Option<String>,
    /// Exit status; only an exit carries one.
    pub exit_code: Option<i32>,
    /// Event time of the exit, from the sample id.
    pub exit_time_event: Option<u64>,
}

/// A comm rename that did not come from exec.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawComm {
    pub comm: String,
}

/// Body of the exec-connector probe.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawExecConnector {
    /// The leading argv bytes, NUL separated, NUL terminated.
    pub args: Vec<u8>,
    pub comm: String,
}

impl RawExecConnector {
    /// The recorded argv strings.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        self.args
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| std::str::from_utf8(s).unwrap_or(""))
    }
}

pub(crate) struct DecodeCtx {
    pub thread_events: bool,
    /// Offset from the start of a sample's data to the probe body.
    pub body_offset: usize,
}

// The sample id layout for our attr template:
// TID | TIME | CPU with sample_id_all.
// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L859
#[derive(Clone, Copy)]
struct SampleId {
    pid: u32,
    tid: u32,
    time: u64,
    cpu: u32,
}

const SAMPLE_ID_BYTES: usize = 24;

unsafe fn sample_id(mut ptr: *const u8) -> SampleId {
    let pid = deref_offset(&mut ptr);
    let tid = deref_offset(&mut ptr);
    let time = deref_offset(&mut ptr);
    let cpu = deref_offset(&mut ptr);
    let _res: u32 = deref_offset(&mut ptr);
    SampleId {
        pid,
        tid,
        time,
        cpu,
    }
}

// Tracefs `__data_loc`: where a variable-length field landed inside
// the sample data.
#[derive(Clone, Copy)]
#[repr(C)]
struct DataLoc {
    offset: u16,
    size: u16,
}

impl DataLoc {
    fn bytes<'d>(&self, data: &'d [u8]) -> &'d [u8] {
        let start = self.offset as usize;
        let end = start + self.size as usize;
        if end > data.len() {
            warn!("data-loc {}+{} outside sample data", self.offset, self.size);
            return &[];
        }
        &data[start..end]
    }
}

fn cstr_lossy(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Decodes one record into a raw event. `lost` is bumped for
/// kernel-reported drops. `None` means the record produced no event,
/// by design or because it was undecodable.
pub(crate) fn decode(buf: &[u8], ctx: &DecodeCtx, lost: &mut u64) -> Option<RawEvent> {
    if buf.len() < size_of::<b::perf_event_header>() {
        warn!("record shorter than its header ({} bytes)", buf.len());
        return None;
    }
    let header = unsafe { (buf.as_ptr() as *const b::perf_event_header).read_unaligned() };

    let (mut raw, sid) = match header.type_ {
        b::PERF_RECORD_SAMPLE => decode_sample(buf, ctx)?,
        b::PERF_RECORD_COMM => decode_comm(buf, header.misc, ctx)?,
        // The kernel implies fork/exit as soon as comm is enabled on
        // the leader; the probes carry the richer versions.
        b::PERF_RECORD_FORK | b::PERF_RECORD_EXIT => return None,
        b::PERF_RECORD_LOST => {
            // { u64 id; u64 lost; }
            if buf.len() >= 24 {
                let mut ptr = unsafe { buf.as_ptr().add(8) };
                let _id: u64 = unsafe { deref_offset(&mut ptr) };
                let n: u64 = unsafe { deref_offset(&mut ptr) };
                *lost += n;
            }
            return None;
        }
        other => {
            warn!("unhandled record type {}", other);
            return None;
        }
    };

    // Fork and wake-up overload pid and tid with the child's; fill
    // the rest from the sample id. The sample id's tid always wins
    // over any tid the body carried.
    if raw.pid == 0 {
        raw.pid = sid.pid;
    }
    if raw.tid == 0 {
        raw.tid = sid.tid;
    }
    raw.opid = sid.pid;
    raw.tid = sid.tid;
    raw.time = sid.time;
    raw.cpu = sid.cpu;

    Some(raw)
}

fn decode_sample(buf: &[u8], ctx: &DecodeCtx) -> Option<(RawEvent, SampleId)> {
    // struct {
    //     struct perf_event_header header;
    //     { u32 pid, tid; u64 time; u32 cpu, res; }
    //     u32 size;
    //     char data[size];
    // };
    if buf.len() < 8 + SAMPLE_ID_BYTES + 4 {
        warn!("short sample record ({} bytes)", buf.len());
        return None;
    }
    let sid = unsafe { sample_id(buf.as_ptr().add(8)) };
    let data_size =
        u32::from_ne_bytes(buf[32..36].try_into().unwrap()) as usize;
    let data = buf.get(36..36 + data_size).or_else(|| {
        warn!("sample data of {} bytes overruns the record", data_size);
        None
    })?;

    if data.len() < 2 || data.len() < ctx.body_offset {
        warn!("sample data too short for the probe body");
        return None;
    }
    let id = u16::from_ne_bytes(data[..2].try_into().unwrap());
    let kind = probe::sample_kind_of(id).or_else(|| {
        warn!("unknown or invalid sample id={}", id);
        None
    })?;
    let body = &data[ctx.body_offset..];

    let raw = match kind {
        SampleKind::Exec => decode_exec(data, body)?,
        SampleKind::WakeUpNewTask | SampleKind::ExitThread => {
            decode_task(kind, data, body, &sid, ctx)?
        }
        SampleKind::ExecConnector => decode_exec_connector(data, body)?,
    };

    Some((raw, sid))
}

fn blank(kind: RawEventKind) -> RawEvent {
    RawEvent {
        pid: 0,
        tid: 0,
        opid: 0,
        cpu: 0,
        time: 0,
        kind,
    }
}

fn decode_exec(data: &[u8], body: &[u8]) -> Option<RawEvent> {
    // { __data_loc char[] filename; pid_t pid; pid_t old_pid; }
    if body.len() < 12 {
        warn!("short exec sample ({} bytes)", body.len());
        return None;
    }
    let mut ptr = body.as_ptr();
    let filename_loc: DataLoc = unsafe { deref_offset(&mut ptr) };
    let pid: i32 = unsafe { deref_offset(&mut ptr) };
    let old_pid: i32 = unsafe { deref_offset(&mut ptr) };

    let filename = cstr_lossy(filename_loc.bytes(data));
    Some(blank(RawEventKind::Exec(RawExec {
        filename,
        pid,
        old_pid,
    })))
}

// Wire size of the task probe body, in declaration order: probe ip,
// the 64-bit values, the string data-locs, the 32-bit tail.
const TASK_SAMPLE_BYTES: usize = (11 + MAX_PWD) * 8 + (3 + MAX_PWD) * 4 + 9 * 4;

fn decode_task(
    kind: SampleKind,
    data: &[u8],
    body: &[u8],
    sid: &SampleId,
    ctx: &DecodeCtx,
) -> Option<RawEvent> {
    if body.len() < TASK_SAMPLE_BYTES {
        warn!("short task sample ({} bytes)", body.len());
        return None;
    }

    let mut ptr = body.as_ptr();
    let _probe_ip: u64 = unsafe { deref_offset(&mut ptr) };
    let cap_inheritable: u64 = unsafe { deref_offset(&mut ptr) };
    let cap_permitted: u64 = unsafe { deref_offset(&mut ptr) };
    let cap_effective: u64 = unsafe { deref_offset(&mut ptr) };
    let cap_bset: u64 = unsafe { deref_offset(&mut ptr) };
    let cap_ambient: u64 = unsafe { deref_offset(&mut ptr) };
    let start_time: u64 = unsafe { deref_offset(&mut ptr) };
    let start_boottime: u64 = unsafe { deref_offset(&mut ptr) };
    let root_k: u64 = unsafe { deref_offset(&mut ptr) };
    let mnt_root_k: u64 = unsafe { deref_offset(&mut ptr) };
    let _mnt_mountpoint_k: u64 = unsafe { deref_offset(&mut ptr) };
    let pwd_k: [u64; MAX_PWD] = unsafe { deref_offset(&mut ptr) };
    let _root_s: DataLoc = unsafe { deref_offset(&mut ptr) };
    let _mnt_root_s: DataLoc = unsafe { deref_offset(&mut ptr) };
    let mnt_mountpoint_s: DataLoc = unsafe { deref_offset(&mut ptr) };
    let pwd_s: [DataLoc; MAX_PWD] = unsafe { deref_offset(&mut ptr) };
    let uid: u32 = unsafe { deref_offset(&mut ptr) };
    let gid: u32 = unsafe { deref_offset(&mut ptr) };
    let suid: u32 = unsafe { deref_offset(&mut ptr) };
    let sgid: u32 = unsafe { deref_offset(&mut ptr) };
    let euid: u32 = unsafe { deref_offset(&mut ptr) };
    let egid: u32 = unsafe { deref_offset(&mut ptr) };
    let pid: u32 = unsafe { deref_offset(&mut ptr) };
    let tid: u32 = unsafe { deref_offset(&mut ptr) };
    let exit_code: i32 = unsafe { deref_offset(&mut ptr) };

    // A task whose pid differs from its tid is a thread.
    if !ctx.thread_events && pid != tid {
        return None;
    }

    let mut task = RawTask {
        cap_inheritable,
        cap_permitted,
        cap_effective,
        cap_bset,
        cap_ambient,
        start_time,
        start_boottime,
        uid,
        gid,
        suid,
        sgid,
        euid,
        egid,
        ppid: None,
        cwd: None,
        exit_code: None,
        exit_time_event: None,
    };

    let raw = if kind == SampleKind::WakeUpNewTask {
        // The record fires in the parent; make this look like an
        // event of the child and take ppid from the sample id.
        task.ppid = Some(sid.pid);

        let mountpoint = cstr_lossy(mnt_mountpoint_s.bytes(data));
        let names: Vec<String> = pwd_s
            .iter()
            .map(|loc| cstr_lossy(loc.bytes(data)))
            .collect();
        let mut pctx = PathCtx {
            root_k,
            mnt_root_k,
            mnt_mountpoint: &mountpoint,
            pwd: ArrayVec::new(),
        };
        for (name, &key) in names.iter().zip(pwd_k.iter()) {
            pctx.pwd.push(PwdEntry {
                name: name.as_str(),
                key,
            });
        }
        match build_path(&pctx) {
            Ok(cwd) => task.cwd = Some(cwd),
            Err(e) => warn!("can't build path: {}", e),
        }

        let mut raw = blank(RawEventKind::WakeUpNewTask(Box::new(task)));
        raw.pid = pid;
        raw.tid = tid;
        raw
    } else {
        // Exit is an event of the dying task itself; there is no
        // parent to read here.
        task.exit_code = Some((exit_code >> 8) & 0xff);
        task.exit_time_event = Some(sid.time);
        blank(RawEventKind::ExitThread(Box::new(task)))
    };

    Some(raw)
}

const EXEC_CONNECTOR_BYTES: usize = 16 + ARGV_SLOTS * 8 + 4;

fn decode_exec_connector(data: &[u8], body: &[u8]) -> Option<RawEvent> {
    // { u64 probe_ip; u64 argc; u64 argv[ARGV_SLOTS]; __data_loc comm; }
    if body.len() < EXEC_CONNECTOR_BYTES {
        warn!("short exec-connector sample ({} bytes)", body.len());
        return None;
    }

    let mut ptr = body.as_ptr();
    let _probe_ip: u64 = unsafe { deref_offset(&mut ptr) };
    let argc: u64 = unsafe { deref_offset(&mut ptr) };
    let stack = &body[16..16 + ARGV_SLOTS * 8];
    let mut ptr = unsafe { body.as_ptr().add(16 + ARGV_SLOTS * 8) };
    let comm_loc: DataLoc = unsafe { deref_offset(&mut ptr) };

    // End of the argc'th NUL-terminated string bounds the argv
    // bytes; a runaway argc is clamped to the recorded window.
    let mut p = 0;
    let mut i = 0;
    while i < argc && p < stack.len() {
        let rem = &stack[p..];
        let n = rem.iter().position(|&c| c == 0).unwrap_or(rem.len());
        p += n + 1;
        i += 1;
    }
    let args_len = p.min(stack.len());

    let mut args = stack[..args_len].to_vec();
    if let Some(last) = args.last_mut() {
        *last = 0;
    }
    let comm = cstr_lossy(comm_loc.bytes(data));

    Some(blank(RawEventKind::ExecConnector(RawExecConnector {
        args,
        comm,
    })))
}

fn decode_comm(buf: &[u8], misc: u16, ctx: &DecodeCtx) -> Option<(RawEvent, SampleId)> {
    // struct {
    //     struct perf_event_header header;
    //     u32 pid, tid;
    //     char comm[];
    //     struct sample_id sample_id;
    // };
    // https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L901

    // Comm changes due to exec are suppressed, the exec path carries
    // the name already.
    if misc & b::PERF_RECORD_MISC_COMM_EXEC != 0 {
        return None;
    }
    if buf.len() < 16 {
        warn!("short comm record ({} bytes)", buf.len());
        return None;
    }
    let mut ptr = unsafe { buf.as_ptr().add(8) };
    let pid: u32 = unsafe { deref_offset(&mut ptr) };
    let tid: u32 = unsafe { deref_offset(&mut ptr) };
    if !ctx.thread_events && pid != tid {
        return None;
    }

    let tail = &buf[16..];
    let n = tail.iter().position(|&c| c == 0).unwrap_or(tail.len());
    let comm = String::from_utf8_lossy(&tail[..n]).into_owned();

    // comm is variable length; the kernel aligns the trailing
    // sample id to the next 8-byte boundary past the terminator.
    // https://github.com/torvalds/linux/blob/v6.13/kernel/events/core.c#L8540
    let sid_off = align_up(16 + n + 1, 8);
    if buf.len() < sid_off + SAMPLE_ID_BYTES {
        warn!("comm record too short for its sample id");
        return None;
    }
    let sid = unsafe { sample_id(buf.as_ptr().add(sid_off)) };

    Some((blank(RawEventKind::Comm(RawComm { comm })), sid))
}
