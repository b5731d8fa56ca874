//! Hand-maintained subset of the perf ABI.
//!
//! Only what this crate touches is declared here. Layouts and values
//! follow `include/uapi/linux/perf_event.h`; the kernel guarantees
//! their stability.

#![allow(non_camel_case_types, dead_code)]

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L32
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L124
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L847
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L681
pub const PERF_RECORD_MISC_COMM_EXEC: u16 = 1 << 13;

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L1070
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;
pub const PERF_EVENT_IOC_SET_OUTPUT: u64 = 0x2405;

// Applies the ioctl to every member of the event group.
pub const PERF_IOC_FLAG_GROUP: u64 = 1;

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L1163
pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// Bits of `perf_event_attr::flags`. The kernel declares these as a
// u64 bitfield; the bit positions are ABI.
pub const ATTR_BIT_DISABLED: u64 = 1 << 0;
pub const ATTR_BIT_COMM: u64 = 1 << 9;
pub const ATTR_BIT_WATERMARK: u64 = 1 << 14;
pub const ATTR_BIT_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const ATTR_BIT_COMM_EXEC: u64 = 1 << 24;
pub const ATTR_BIT_USE_CLOCKID: u64 = 1 << 25;

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L385
//
// Unions are flattened to the member this crate uses:
// `sample_period` (not `sample_freq`), `wakeup_watermark` (not
// `wakeup_events`), and the option bitfield as a plain `flags` word.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub aux_action: u32,
    pub sig_data: u64,
    pub config3: u64,
}

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L824
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct perf_event_header {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

// https://github.com/torvalds/linux/blob/v6.13/include/uapi/linux/perf_event.h#L580
//
// `__reserved` pads `data_head` to the 1 KiB boundary.
#[repr(C)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 116 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

#[cfg(test)]
mod test {
    use std::mem::{offset_of, size_of};

    use super::*;

    #[test]
    fn attr_layout() {
        assert_eq!(size_of::<perf_event_attr>(), 136);
        assert_eq!(offset_of!(perf_event_attr, flags), 40);
        assert_eq!(offset_of!(perf_event_attr, clockid), 92);
        assert_eq!(offset_of!(perf_event_attr, config3), 128);
    }

    #[test]
    fn mmap_page_layout() {
        assert_eq!(offset_of!(perf_event_mmap_page, data_head), 1024);
        assert_eq!(offset_of!(perf_event_mmap_page, data_tail), 1032);
    }
}
