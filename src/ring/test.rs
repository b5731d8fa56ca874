use std::sync::atomic::{AtomicU64, Ordering};

use super::{Rb, Scratch};
use crate::error::Error;

// A ring over plain memory, playing the kernel producer.
struct TestRing {
    data: Vec<u8>,
    head: AtomicU64,
    tail: AtomicU64,
    tmp_tail: u64,
    scratch: Box<Scratch>,
}

impl TestRing {
    fn new(size: usize) -> Self {
        assert!(size.is_power_of_two());
        Self {
            data: vec![0; size],
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            tmp_tail: 0,
            scratch: Scratch::new(),
        }
    }

    fn rb(&mut self) -> Rb<'_> {
        Rb::new(
            &self.data,
            &self.head,
            &self.tail,
            &mut self.tmp_tail,
            &mut self.scratch,
        )
    }

    // Pretends everything up to `pos` was produced and consumed.
    fn seek(&mut self, pos: u64) {
        self.head.store(pos, Ordering::Relaxed);
        self.tail.store(pos, Ordering::Relaxed);
        self.tmp_tail = pos;
    }

    fn produce(&mut self, bytes: &[u8]) {
        let mask = self.data.len() as u64 - 1;
        let mut head = self.head.load(Ordering::Relaxed);
        for &b in bytes {
            self.data[(head & mask) as usize] = b;
            head += 1;
        }
        self.head.store(head, Ordering::Release);
    }

    fn mapping_range(&self) -> (usize, usize) {
        let start = self.data.as_ptr() as usize;
        (start, start + self.data.len())
    }
}

fn record(type_: u32, payload: &[u8]) -> Vec<u8> {
    let size = (8 + payload.len()) as u16;
    let mut buf = Vec::with_capacity(size as usize);
    buf.extend_from_slice(&type_.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&size.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn empty_ring_has_no_record() {
    let mut ring = TestRing::new(4096);
    assert!(ring.rb().read().unwrap().is_none());
}

#[test]
fn drains_in_production_order() {
    let mut ring = TestRing::new(4096);
    let records: Vec<_> = (0u8..5).map(|i| record(9, &[i; 16])).collect();
    for r in &records {
        ring.produce(r);
    }

    let mut rb = ring.rb();
    for expect in &records {
        let got = rb.read().unwrap().expect("record available");
        assert_eq!(got, &expect[..]);
        rb.consume();
    }
    assert!(rb.read().unwrap().is_none());

    // Fully drained: the published tail caught up with the head.
    assert_eq!(
        ring.tail.load(Ordering::Relaxed),
        ring.head.load(Ordering::Relaxed)
    );
}

#[test]
fn record_filling_the_contiguous_span_is_borrowed() {
    let mut ring = TestRing::new(4096);
    ring.seek(4096 - 64);
    let rec = record(9, &[0xab; 56]); // exactly the 64 bytes left
    ring.produce(&rec);

    let mut rb = ring.rb();
    let got = rb.read().unwrap().unwrap();
    assert_eq!(got, &rec[..]);
    let addr = got.as_ptr() as usize;

    let (start, end) = ring.mapping_range();
    assert!(addr >= start && addr < end, "no wrap copy expected");
    assert_eq!(ring.tmp_tail, 4096);
}

#[test]
fn wrapped_record_is_linearized() {
    let size = 64 * 1024;
    let mut ring = TestRing::new(size);
    ring.seek(size as u64 - 16);
    // 40 bytes: 16 land at the end of the region, 24 wrap around.
    let rec = record(9, &(0u8..32).collect::<Vec<_>>());
    assert_eq!(rec.len(), 40);
    ring.produce(&rec);

    let mut rb = ring.rb();
    let got = rb.read().unwrap().unwrap();
    assert_eq!(got, &rec[..]);
    let addr = got.as_ptr() as usize;

    let (start, end) = ring.mapping_range();
    assert!(addr < start || addr >= end, "wrapped record must be copied out");
    assert!(ring.rb().read().unwrap().is_none());
}

#[test]
fn header_spanning_the_wrap_is_reassembled() {
    let mut ring = TestRing::new(4096);
    ring.seek(4096 - 4);
    let rec = record(9, &[0x5a; 24]);
    ring.produce(&rec);

    let got = ring.rb().read().unwrap().unwrap().to_vec();
    assert_eq!(got, rec);
}

#[test]
fn incomplete_record_is_not_returned() {
    let mut ring = TestRing::new(4096);
    let rec = record(9, &[1; 32]);
    // Header published, payload not yet.
    ring.produce(&rec[..8]);
    assert!(ring.rb().read().unwrap().is_none());

    ring.produce(&rec[8..]);
    assert_eq!(ring.rb().read().unwrap().unwrap(), &rec[..]);
}

#[test]
fn oversize_record_is_fatal() {
    let mut ring = TestRing::new(64 * 1024);
    let mut header = Vec::new();
    header.extend_from_slice(&9u32.to_ne_bytes());
    header.extend_from_slice(&0u16.to_ne_bytes());
    header.extend_from_slice(&8192u16.to_ne_bytes());
    ring.produce(&header);
    ring.head.store(8192, Ordering::Release);

    match ring.rb().read().unwrap_err() {
        Error::RecordTooBig { size } => assert_eq!(size, 8192),
        other => panic!("expected RecordTooBig, got {}", other),
    }
}

#[test]
fn record_smaller_than_header_is_fatal() {
    let mut ring = TestRing::new(4096);
    let mut header = Vec::new();
    header.extend_from_slice(&9u32.to_ne_bytes());
    header.extend_from_slice(&0u16.to_ne_bytes());
    header.extend_from_slice(&4u16.to_ne_bytes());
    ring.produce(&header);

    match ring.rb().read().unwrap_err() {
        Error::RecordTruncated { size } => assert_eq!(size, 4),
        other => panic!("expected RecordTruncated, got {}", other),
    }
}

#[test]
fn shadow_tail_is_published_only_on_consume() {
    let mut ring = TestRing::new(4096);
    for i in 0..3u8 {
        let rec = record(9, &[i; 8]);
        ring.produce(&rec);
    }

    let mut rb = ring.rb();
    rb.read().unwrap().unwrap();
    rb.read().unwrap().unwrap();

    let head = ring.head.load(Ordering::Relaxed);
    let published = ring.tail.load(Ordering::Relaxed);
    assert_eq!(published, 0);
    assert_eq!(ring.tmp_tail, 32);
    assert!(published <= ring.tmp_tail && ring.tmp_tail <= head);

    ring.rb().consume();
    assert_eq!(ring.tail.load(Ordering::Relaxed), 32);
}
