//! The event queue: per-CPU rings, probe attachment, and the
//! ordered event store.
//!
//! One group leader per CPU sits on the `sched_process_exec`
//! tracepoint; every kprobe opens per CPU as a group member with its
//! output redirected into the leader's ring, so each CPU drains
//! through a single mapping. Decoded events land in two ordered
//! structures, keyed by time and by pid and time, until the embedder
//! drains them.

use std::collections::BTreeMap;
use std::fs::File;
use std::mem::zeroed;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::rc::Rc;

use bitflags::bitflags;
use log::warn;

use crate::error::{Error, Result};
use crate::ffi::syscall::{epoll_add, epoll_create1, epoll_wait, ioctl_arg, perf_event_open};
use crate::ffi::{bindings as b, Attr};
use crate::probe::{self, SampleKind};
use crate::raw::{decode, DecodeCtx, RawEvent};
use crate::ring::PerfMmap;
use crate::tracefs;

bitflags! {
    /// Queue behavior flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct QueueFlags: u32 {
        /// Use the kprobe backend. The only backend there is, but
        /// it has to be asked for.
        const KPROBE = 1 << 0;
        /// Keep thread-granularity events instead of dropping
        /// everything with `tid != pid`.
        const THREAD_EVENTS = 1 << 1;
    }
}

/// Knobs for [`Queue::open`].
#[derive(Clone, Debug)]
pub struct QueueOpts {
    pub flags: QueueFlags,
    /// Stop populating once this many events are queued.
    pub max_length: usize,
}

impl Default for QueueOpts {
    fn default() -> Self {
        Self {
            flags: QueueFlags::KPROBE,
            max_length: 10_000,
        }
    }
}

/// Counters over the queue's lifetime.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStats {
    pub insertions: u64,
    pub removals: u64,
    /// Events the kernel reported dropped for lack of ring space.
    pub lost: u64,
}

struct GroupLeader {
    file: File,
    cpu: u32,
    ring: PerfMmap,
}

// Both orderings share one node. The sequence number breaks ties
// between equal timestamps, preserving insertion order.
#[derive(Default)]
struct EventStore {
    by_time: BTreeMap<(u64, u64), Rc<RawEvent>>,
    by_pid_time: BTreeMap<(u32, u64, u64), Rc<RawEvent>>,
    seq: u64,
}

impl EventStore {
    fn insert(&mut self, raw: RawEvent) {
        let seq = self.seq;
        self.seq += 1;
        let ev = Rc::new(raw);
        self.by_time.insert((ev.time, seq), Rc::clone(&ev));
        self.by_pid_time.insert((ev.pid, ev.time, seq), ev);
    }

    fn pop_oldest(&mut self) -> Option<RawEvent> {
        let (&(time, seq), _) = self.by_time.first_key_value()?;
        let ev = self.by_time.remove(&(time, seq)).unwrap();
        self.by_pid_time.remove(&(ev.pid, time, seq));
        Some(Rc::try_unwrap(ev).unwrap_or_else(|rc| (*rc).clone()))
    }

    fn len(&self) -> usize {
        self.by_time.len()
    }
}

/// A process-event queue over the kprobe backend.
pub struct Queue {
    flags: QueueFlags,
    max_length: usize,
    body_offset: usize,
    leaders: Vec<GroupLeader>,
    kprobe_fds: Vec<File>,
    epoll: File,
    store: EventStore,
    stats: QueueStats,
}

fn tracepoint_attr(id: u64) -> Attr {
    let mut attr: Attr = unsafe { zeroed() };
    attr.type_ = b::PERF_TYPE_TRACEPOINT;
    attr.size = size_of::<Attr>() as u32;
    attr.config = id;
    attr.sample_period = 1; // every event
    attr.sample_type =
        b::PERF_SAMPLE_TID | b::PERF_SAMPLE_TIME | b::PERF_SAMPLE_CPU | b::PERF_SAMPLE_RAW;
    attr.flags = b::ATTR_BIT_DISABLED | b::ATTR_BIT_USE_CLOCKID;
    attr.clockid = libc::CLOCK_MONOTONIC;
    attr
}

fn open_group_leader(cpu: u32, exec_id: u16) -> Result<GroupLeader> {
    // Exec rides on the leader, saving one fd per CPU. comm on the
    // leader also implies fork/exit records; the decoder swallows
    // those in favor of the probe versions.
    let mut attr = tracepoint_attr(exec_id as u64);
    attr.flags |= b::ATTR_BIT_COMM
        | b::ATTR_BIT_COMM_EXEC
        | b::ATTR_BIT_SAMPLE_ID_ALL
        | b::ATTR_BIT_WATERMARK;
    attr.wakeup_watermark = (PerfMmap::data_size() / 10) as u32;

    let file = perf_event_open(&attr, -1, cpu as i32, -1, b::PERF_FLAG_FD_CLOEXEC)?;
    let ring = PerfMmap::new(&file)?;
    Ok(GroupLeader { file, cpu, ring })
}

fn open_kprobe(id: u16, leader: &GroupLeader) -> Result<File> {
    let attr = tracepoint_attr(id as u64);
    let file = perf_event_open(
        &attr,
        -1,
        leader.cpu as i32,
        leader.file.as_raw_fd(),
        b::PERF_FLAG_FD_CLOEXEC,
    )?;
    // Records land in the leader's ring.
    ioctl_arg(
        &file,
        b::PERF_EVENT_IOC_SET_OUTPUT,
        leader.file.as_raw_fd() as u64,
    )?;
    Ok(file)
}

impl Queue {
    /// Installs the probe set (first queue only), opens one ring per
    /// CPU, attaches every probe to every ring and enables the
    /// groups. A failure on any step releases everything acquired.
    pub fn open(opts: QueueOpts) -> Result<Self> {
        if !opts.flags.contains(QueueFlags::KPROBE) {
            return Err(Error::Unsupported);
        }

        let installed = probe::acquire()?;
        match Self::open_rings(opts, installed) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                probe::release();
                Err(e)
            }
        }
    }

    fn open_rings(opts: QueueOpts, installed: probe::Installed) -> Result<Self> {
        let exec_id = tracefs::tracepoint_id("events/sched/sched_process_exec/id")?;

        let ncpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        if ncpus < 1 {
            return Err(std::io::Error::last_os_error().into());
        }

        let mut leaders = Vec::with_capacity(ncpus as usize);
        for cpu in 0..ncpus as u32 {
            leaders.push(open_group_leader(cpu, exec_id)?);
        }
        probe::set_sample_kind(exec_id, SampleKind::Exec);

        let mut kprobe_fds = Vec::new();
        for (name, kind) in &installed.probes {
            let id = tracefs::tracepoint_id(&format!("events/kprobes/{}/id", name))?;
            for leader in &leaders {
                kprobe_fds.push(open_kprobe(id, leader)?);
            }
            probe::set_sample_kind(id, *kind);
        }

        for leader in &leaders {
            ioctl_arg(&leader.file, b::PERF_EVENT_IOC_RESET, b::PERF_IOC_FLAG_GROUP)?;
            ioctl_arg(&leader.file, b::PERF_EVENT_IOC_ENABLE, b::PERF_IOC_FLAG_GROUP)?;
        }

        let epoll = epoll_create1(libc::EPOLL_CLOEXEC)?;
        for leader in &leaders {
            epoll_add(&epoll, &leader.file)?;
        }

        Ok(Queue {
            flags: opts.flags,
            max_length: opts.max_length,
            body_offset: installed.body_offset,
            leaders,
            kprobe_fds,
            epoll,
            store: EventStore::default(),
            stats: QueueStats::default(),
        })
    }

    /// Drains the rings round-robin into the ordered store, without
    /// blocking. Stops when the store holds `max_length` events or a
    /// full pass saw every ring empty. Returns the number of events
    /// queued by this call.
    pub fn populate(&mut self) -> Result<usize> {
        let ctx = DecodeCtx {
            thread_events: self.flags.contains(QueueFlags::THREAD_EVENTS),
            body_offset: self.body_offset,
        };
        let num_rings = self.leaders.len();
        let mut npop = 0;

        while self.store.len() < self.max_length {
            let mut empty_rings = 0;
            for i in 0..num_rings {
                let raw = {
                    let mut rb = self.leaders[i].ring.rb();
                    let Some(bytes) = rb.read()? else {
                        empty_rings += 1;
                        continue;
                    };
                    empty_rings = 0;
                    let raw = decode(bytes, &ctx, &mut self.stats.lost);
                    rb.consume();
                    raw
                };
                if let Some(raw) = raw {
                    self.store.insert(raw);
                    self.stats.insertions += 1;
                    npop += 1;
                }
            }
            if empty_rings == num_rings {
                break;
            }
        }

        Ok(npop)
    }

    /// Hands out up to `max` queued events, oldest first.
    pub fn get_events(&mut self, max: usize) -> Vec<RawEvent> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.store.pop_oldest() {
                Some(ev) => {
                    self.stats.removals += 1;
                    out.push(ev);
                }
                None => break,
            }
        }
        out
    }

    /// Waits until at least one ring is readable.
    pub fn block(&self) -> Result<()> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }];
        epoll_wait(&self.epoll, &mut events, -1)?;
        Ok(())
    }

    /// Per-ring descriptors, for callers running their own poll
    /// loop.
    pub fn get_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.leaders.iter().map(|l| l.file.as_fd()).collect()
    }

    /// The descriptor [`block`][Self::block] waits on; readable
    /// whenever any ring is.
    pub fn readiness_fd(&self) -> BorrowedFd<'_> {
        self.epoll.as_fd()
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Releases every resource. Dropping the queue does the same.
    pub fn close(self) {}
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Stop the groups before the rings unmap; fds close with the
        // Files, probes uninstall with the last queue.
        for leader in &self.leaders {
            if let Err(e) = ioctl_arg(&leader.file, b::PERF_EVENT_IOC_DISABLE, b::PERF_IOC_FLAG_GROUP)
            {
                warn!("ioctl PERF_EVENT_IOC_DISABLE: {}", e);
            }
        }
        self.leaders.clear();
        self.kprobe_fds.clear();
        probe::release();
    }
}
