//! Fixed-capacity request pool and the batched `io_uring` submit/poll queue.
//!
//! The original driver threaded requests through singly-linked lists with
//! raw `next` pointers. Here every request lives in a flat arena and is
//! addressed by `(index, epoch)`; lists become head/tail indices threaded
//! through each slot's own `next` field. A stale `(index, epoch)` pair is
//! rejected rather than silently reused once a slot is freed and recycled.

use std::os::unix::io::RawFd;

use io_uring::{cqueue, opcode, squeue, types, IoUring};
use log::{debug, warn};

use crate::error::VhdError;

/// Kind of asynchronous operation a pool slot represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    DataRead,
    DataWrite,
    BitmapRead,
    BitmapWrite,
    ZeroBmWrite,
    BatWrite,
}

pub mod flags {
    pub const UPDATE_BAT: u32 = 1 << 0;
    pub const UPDATE_BITMAP: u32 = 1 << 1;
    pub const QUEUED: u32 = 1 << 2;
    pub const FINISHED: u32 = 1 << 3;
}

/// Weak, epoch-checked reference from a request back to the bitmap
/// transaction it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRef {
    pub bitmap_idx: u32,
    pub epoch: u32,
}

/// A caller callback: outcome, starting sector, sector count, opaque id.
pub type Callback = Box<dyn FnMut(Result<(), VhdError>, u64, u32, u64)>;

const DIRECT_IO_ALIGN: usize = 512;

/// Allocate a zeroed buffer aligned to `DIRECT_IO_ALIGN`, as O_DIRECT
/// requires for every read/write buffer. `len` must already be a multiple
/// of the sector size, which every call site here guarantees.
fn alloc_aligned(len: usize) -> Box<[u8]> {
    if len == 0 {
        return Box::new([]);
    }
    unsafe {
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let rc = libc::posix_memalign(&mut ptr, DIRECT_IO_ALIGN, len);
        if rc != 0 || ptr.is_null() {
            return vec![0u8; len].into_boxed_slice();
        }
        std::ptr::write_bytes(ptr as *mut u8, 0, len);
        Vec::from_raw_parts(ptr as *mut u8, len, len).into_boxed_slice()
    }
}

/// A single pooled request. `buf` is owned by the slot for the duration
/// of the operation and handed back to the caller's callback on completion.
pub struct Request {
    pub op: Op,
    pub sector: u64,
    pub nr_sectors: u32,
    pub buf: Box<[u8]>,
    pub flags: u32,
    pub error: Option<VhdError>,
    pub tx_ref: Option<TxRef>,
    pub private: u64,
    pub callback: Option<Callback>,
    pub blk: u32,
    /// Threads this slot through a bitmap's `waiting`/`queue` list, or the
    /// pool's own free list. `None` terminates the list.
    pub next: Option<u32>,
    in_use: bool,
    epoch: u32,
}

impl Request {
    fn empty() -> Self {
        Request {
            op: Op::DataRead,
            sector: 0,
            nr_sectors: 0,
            buf: Box::new([]),
            flags: 0,
            error: None,
            tx_ref: None,
            private: 0,
            callback: None,
            blk: 0,
            next: None,
            in_use: false,
            epoch: 0,
        }
    }
}

/// Head/tail indices for an intrusive list of pooled requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqList {
    pub head: Option<u32>,
    pub tail: Option<u32>,
}

impl ReqList {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, pool: &mut RequestPool, idx: u32) {
        pool.slots[idx as usize].req.next = None;
        match self.tail {
            Some(t) => pool.slots[t as usize].req.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    pub fn drain(&mut self, pool: &RequestPool) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(i) = cur {
            out.push(i);
            cur = pool.slots[i as usize].req.next;
        }
        self.head = None;
        self.tail = None;
        out
    }
}

struct Slot {
    req: Request,
}

/// A completed operation, ready for dispatch to the matching finisher.
pub struct Completion {
    pub idx: u32,
    pub epoch: u32,
    pub result: i32,
}

pub struct RequestPool {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    fd: RawFd,
    ring: IoUring,
    pending: Vec<(squeue::Entry, u32)>,
}

impl RequestPool {
    pub fn new(fd: RawFd, capacity: usize) -> std::io::Result<Self> {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut req = Request::empty();
            req.next = if i + 1 < capacity { Some((i + 1) as u32) } else { None };
            slots.push(Slot { req });
        }
        let ring = IoUring::new(capacity.max(8) as u32)?;
        Ok(RequestPool {
            slots,
            free_head: if capacity > 0 { Some(0) } else { None },
            fd,
            ring,
            pending: Vec::new(),
        })
    }

    pub fn alloc(&mut self) -> Result<(u32, u32), VhdError> {
        let idx = self.free_head.ok_or(VhdError::OutOfMemory)?;
        let slot = &mut self.slots[idx as usize];
        self.free_head = slot.req.next;
        slot.req.next = None;
        slot.req.in_use = true;
        slot.req.epoch = slot.req.epoch.wrapping_add(1);
        Ok((idx, slot.req.epoch))
    }

    pub fn free(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.req.in_use = false;
        slot.req.buf = Box::new([]);
        slot.req.tx_ref = None;
        slot.req.error = None;
        slot.req.flags = 0;
        slot.req.callback = None;
        slot.req.next = self.free_head;
        self.free_head = Some(idx);
    }

    pub fn get(&self, idx: u32) -> &Request {
        &self.slots[idx as usize].req
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut Request {
        &mut self.slots[idx as usize].req
    }

    pub fn epoch_of(&self, idx: u32) -> u32 {
        self.slots[idx as usize].req.epoch
    }

    fn file_offset(&self, sector: u64) -> u64 {
        sector * crate::format::SECTOR_SIZE
    }

    /// Stage a read at `sector` for `idx`, writing into the request's buffer.
    pub fn enqueue_read(&mut self, idx: u32, sector: u64, nr_sectors: u32) {
        let offset = self.file_offset(sector);
        let slot = &mut self.slots[idx as usize];
        slot.req.sector = sector;
        slot.req.nr_sectors = nr_sectors;
        let len = (nr_sectors as u64 * crate::format::SECTOR_SIZE) as usize;
        slot.req.buf = alloc_aligned(len);
        let entry = opcode::Read::new(types::Fd(self.fd), slot.req.buf.as_mut_ptr(), len as u32)
            .offset(offset)
            .build()
            .user_data(idx as u64);
        self.pending.push((entry, idx));
    }

    /// Stage a write at `sector` for `idx`. `data` is copied into a
    /// sector-aligned buffer owned by the slot and handed back to the
    /// caller on completion.
    pub fn enqueue_write(&mut self, idx: u32, sector: u64, data: &[u8]) {
        let offset = self.file_offset(sector);
        let nr_sectors = (data.len() as u64 / crate::format::SECTOR_SIZE) as u32;
        let mut buf = alloc_aligned(data.len());
        buf.copy_from_slice(data);
        let slot = &mut self.slots[idx as usize];
        slot.req.sector = sector;
        slot.req.nr_sectors = nr_sectors;
        slot.req.buf = buf;
        let len = slot.req.buf.len();
        let entry = opcode::Write::new(types::Fd(self.fd), slot.req.buf.as_ptr(), len as u32)
            .offset(offset)
            .build()
            .user_data(idx as u64);
        self.pending.push((entry, idx));
    }

    /// Submit every pending entry in one batched call. On partial submission
    /// failure the unsubmitted tail is failed synchronously and its indices
    /// are returned so the caller can run the matching finishers inline.
    pub fn submit(&mut self) -> std::io::Result<Vec<u32>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut submitted = 0usize;
        {
            let mut sq = self.ring.submission();
            for (entry, _idx) in self.pending.iter() {
                if unsafe { sq.push(entry) }.is_err() {
                    break;
                }
                submitted += 1;
            }
        }
        let n = self.ring.submit()?;
        debug!("submitted {} of {} queued ops", n, self.pending.len());

        let failed: Vec<u32> = self.pending[submitted..].iter().map(|(_, idx)| *idx).collect();
        if !failed.is_empty() {
            warn!("{} ops failed to submit, queue full", failed.len());
        }
        self.pending.clear();
        Ok(failed)
    }

    /// Drain all currently-available completions without blocking.
    pub fn poll(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        let cq = self.ring.completion();
        for cqe in cq {
            let idx = cqe.user_data() as u32;
            if (idx as usize) >= self.slots.len() {
                continue;
            }
            let epoch = self.slots[idx as usize].req.epoch;
            out.push(Completion {
                idx,
                epoch,
                result: cqe.result(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycles_epoch() {
        let mut pool = RequestPool::new(-1, 4).unwrap();
        let (idx0, e0) = pool.alloc().unwrap();
        pool.free(idx0);
        let (idx1, e1) = pool.alloc().unwrap();
        assert_eq!(idx0, idx1);
        assert_ne!(e0, e1);
    }

    #[test]
    fn pool_exhaustion_reports_out_of_memory() {
        let mut pool = RequestPool::new(-1, 2).unwrap();
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(matches!(pool.alloc(), Err(VhdError::OutOfMemory)));
    }

    #[test]
    fn req_list_push_and_drain_preserves_order() {
        let mut pool = RequestPool::new(-1, 4).unwrap();
        let (a, _) = pool.alloc().unwrap();
        let (b, _) = pool.alloc().unwrap();
        let mut list = ReqList::default();
        list.push_back(&mut pool, a);
        list.push_back(&mut pool, b);
        assert_eq!(list.drain(&pool), vec![a, b]);
        assert!(list.is_empty());
    }
}
