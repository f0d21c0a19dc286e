//! Translates a (sector, length) span into a per-segment I/O plan using
//! bitmap-cache state, without ever crossing a block boundary.

use log::debug;

use crate::bitmap::status as bm_status;
use crate::error::VhdError;
use crate::format::{DISK_TYPE_DIFFERENCING, DISK_TYPE_DYNAMIC, DISK_TYPE_FIXED};
use crate::pool::{flags as reqflags, Callback, Op};
use crate::transaction::Transaction;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Span {
    Fixed,
    BatClear,
    BatLocked,
    BitClear,
    BitSet,
    NotCached,
    ReadPending,
}

impl Volume {
    fn classify(&self, blk: u32, sector_in_block: u32, is_write: bool) -> Span {
        if self.disk_type() == DISK_TYPE_FIXED {
            return Span::Fixed;
        }
        let bat = self.bat.as_ref().unwrap();
        if bat.is_locked() && bat.pending_offset(blk).is_none() && bat.entry(blk).is_none() {
            return Span::BatLocked;
        }
        match bat.entry(blk).or_else(|| bat.pending_offset(blk)) {
            None => Span::BatClear,
            Some(_) => {
                let idx = match self.bitmap_cache.find(blk) {
                    Some(i) => i,
                    None => return Span::NotCached,
                };
                let bm = self.bitmap_cache.get(idx);
                if bm.status & bm_status::READ_PENDING != 0 {
                    return Span::ReadPending;
                }
                if self.disk_type() != DISK_TYPE_DIFFERENCING {
                    return Span::BitSet;
                }
                let set = bm.bit(&bm.map, sector_in_block);
                let _ = is_write;
                if set {
                    Span::BitSet
                } else {
                    Span::BitClear
                }
            }
        }
    }

    fn block_data_offset(&self, blk: u32) -> Option<u64> {
        let bat = self.bat.as_ref()?;
        let base = bat.entry(blk).or_else(|| bat.pending_offset(blk))?;
        Some(base + self.bm_secs as u64)
    }

    /// Queue an asynchronous read of `nr_sectors` starting at `sector`.
    pub fn queue_read(
        &mut self,
        sector: u64,
        nr_sectors: u32,
        private: u64,
        mut callback: impl FnMut(Result<(), VhdError>, u64, u32, u64) + 'static,
    ) {
        self.queue(sector, nr_sectors, private, Box::new(move |r, s, n, p| callback(r, s, n, p)), false)
    }

    /// Queue an asynchronous write of `nr_sectors` starting at `sector`.
    pub fn queue_write(
        &mut self,
        sector: u64,
        nr_sectors: u32,
        data: &[u8],
        private: u64,
        callback: impl FnMut(Result<(), VhdError>, u64, u32, u64) + 'static,
    ) {
        self.queue_write_impl(sector, nr_sectors, data, private, Box::new(callback))
    }

    fn queue(&mut self, sector: u64, nr_sectors: u32, private: u64, callback: Callback, _is_write: bool) {
        let mut remaining = nr_sectors;
        let mut cur = sector;
        let callback = std::rc::Rc::new(std::cell::RefCell::new(callback));

        while remaining > 0 {
            let spb = if self.spb == 0 { u32::MAX } else { self.spb };
            let blk = (cur / spb as u64) as u32;
            let sector_in_block = (cur % spb as u64) as u32;
            let span_cap = (spb - sector_in_block).min(remaining);

            match self.classify(blk, sector_in_block, false) {
                Span::Fixed => {
                    let n = remaining;
                    self.issue_data_read(cur, n, private, callback.clone());
                    cur += n as u64;
                    remaining -= n;
                }
                Span::BatClear => {
                    debug!("router: read hole at sector {}", cur);
                    (callback.borrow_mut())(Err(VhdError::NotAllocated), cur, span_cap, private);
                    cur += span_cap as u64;
                    remaining -= span_cap;
                }
                Span::BatLocked => {
                    (callback.borrow_mut())(Err(VhdError::Busy), cur, remaining, private);
                    return;
                }
                Span::BitClear => {
                    let bm = self.bitmap_cache.get(self.bitmap_cache.find(blk).unwrap());
                    let run = bm.run_len(sector_in_block, span_cap, false);
                    (callback.borrow_mut())(Err(VhdError::NotAllocated), cur, run, private);
                    cur += run as u64;
                    remaining -= run;
                }
                Span::BitSet => {
                    let run = if self.disk_type() == DISK_TYPE_DIFFERENCING {
                        let bm = self.bitmap_cache.get(self.bitmap_cache.find(blk).unwrap());
                        bm.run_len(sector_in_block, span_cap, true)
                    } else {
                        span_cap
                    };
                    self.issue_data_read(cur, run, private, callback.clone());
                    cur += run as u64;
                    remaining -= run;
                }
                Span::NotCached => {
                    self.load_bitmap_then_retry(blk, cur, span_cap, private, callback.clone(), None);
                    cur += span_cap as u64;
                    remaining -= span_cap;
                }
                Span::ReadPending => {
                    self.enqueue_waiting(blk, cur, span_cap, private, callback.clone(), None);
                    cur += span_cap as u64;
                    remaining -= span_cap;
                }
            }
        }
    }

    fn issue_data_read(&mut self, sector: u64, n: u32, private: u64, callback: std::rc::Rc<std::cell::RefCell<Callback>>) {
        let blk = (sector / self.spb.max(1) as u64) as u32;
        let file_sector = if self.disk_type() == DISK_TYPE_FIXED {
            sector
        } else {
            let sector_in_block = sector % self.spb as u64;
            self.block_data_offset(blk).unwrap() + sector_in_block
        };
        let Ok((idx, epoch)) = self.pool.alloc() else {
            (callback.borrow_mut())(Err(VhdError::OutOfMemory), sector, n, private);
            return;
        };
        let _ = epoch;
        self.pool.enqueue_read(idx, file_sector, n);
        let req = self.pool.get_mut(idx);
        req.op = Op::DataRead;
        req.private = private;
        req.blk = blk;
        let cb = callback.clone();
        req.callback = Some(Box::new(move |r, s, n, p| (cb.borrow_mut())(r, s, n, p)));
    }

    fn load_bitmap_then_retry(
        &mut self,
        blk: u32,
        sector: u64,
        n: u32,
        private: u64,
        callback: std::rc::Rc<std::cell::RefCell<Callback>>,
        data: Option<&[u8]>,
    ) {
        let idx = match self.bitmap_cache.install(blk) {
            Ok(i) => i,
            Err(e) => {
                (callback.borrow_mut())(Err(e), sector, n, private);
                return;
            }
        };
        self.enqueue_waiting(blk, sector, n, private, callback, data);

        let Ok((req_idx, _epoch)) = self.pool.alloc() else {
            (self.bitmap_cache.get_mut(idx)).status &= !bm_status::READ_PENDING;
            return;
        };
        let offset = self.block_data_offset_for_bitmap(blk);
        let bm_secs = self.bm_secs;
        self.pool.enqueue_read(req_idx, offset, bm_secs);
        let req = self.pool.get_mut(req_idx);
        req.op = Op::BitmapRead;
        req.blk = blk;
    }

    fn block_data_offset_for_bitmap(&self, blk: u32) -> u64 {
        let bat = self.bat.as_ref().unwrap();
        bat.entry(blk).or_else(|| bat.pending_offset(blk)).unwrap_or(0)
    }

    /// Park a request behind a bitmap that is being loaded or is already
    /// mid-transaction. `data` carries the write payload for a parked write;
    /// `None` marks a parked read. The slot's own `buf` is reused as the
    /// read/write discriminator when the waiter is drained and replayed.
    fn enqueue_waiting(
        &mut self,
        blk: u32,
        sector: u64,
        n: u32,
        private: u64,
        callback: std::rc::Rc<std::cell::RefCell<Callback>>,
        data: Option<&[u8]>,
    ) {
        let Ok((idx, _epoch)) = self.pool.alloc() else {
            (callback.borrow_mut())(Err(VhdError::OutOfMemory), sector, n, private);
            return;
        };
        let req = self.pool.get_mut(idx);
        req.sector = sector;
        req.nr_sectors = n;
        req.private = private;
        req.blk = blk;
        req.buf = data.map(|d| d.to_vec().into_boxed_slice()).unwrap_or_default();
        let cb = callback.clone();
        req.callback = Some(Box::new(move |r, s, n, p| (cb.borrow_mut())(r, s, n, p)));

        let bm_idx = self.bitmap_cache.find(blk).unwrap();
        let bm = self.bitmap_cache.get_mut(bm_idx);
        bm.waiting.push_back(&mut self.pool, idx);
    }

    fn queue_write_impl(&mut self, sector: u64, nr_sectors: u32, data: &[u8], private: u64, callback: Callback) {
        let mut remaining = nr_sectors;
        let mut cur = sector;
        let mut data_off = 0usize;
        let callback = std::rc::Rc::new(std::cell::RefCell::new(callback));

        while remaining > 0 {
            let spb = if self.spb == 0 { u32::MAX } else { self.spb };
            let blk = (cur / spb as u64) as u32;
            let sector_in_block = (cur % spb as u64) as u32;
            let span_cap = (spb - sector_in_block).min(remaining);

            match self.classify(blk, sector_in_block, true) {
                Span::Fixed => {
                    let n = remaining;
                    let chunk = &data[data_off..data_off + (n as usize * 512)];
                    self.issue_data_write(cur, chunk, 0, private, callback.clone());
                    cur += n as u64;
                    data_off += n as usize * 512;
                    remaining -= n;
                }
                Span::BatClear => {
                    self.allocate_and_write(blk, cur, span_cap, &data[data_off..data_off + span_cap as usize * 512], private, callback.clone());
                    cur += span_cap as u64;
                    data_off += span_cap as usize * 512;
                    remaining -= span_cap;
                }
                Span::BatLocked => {
                    (callback.borrow_mut())(Err(VhdError::Busy), cur, remaining, private);
                    return;
                }
                Span::BitClear => {
                    let bm = self.bitmap_cache.get(self.bitmap_cache.find(blk).unwrap());
                    let run = bm.run_len(sector_in_block, span_cap, false);
                    let chunk = &data[data_off..data_off + run as usize * 512];
                    self.issue_data_write(cur, chunk, reqflags::UPDATE_BITMAP, private, callback.clone());
                    cur += run as u64;
                    data_off += run as usize * 512;
                    remaining -= run;
                }
                Span::BitSet => {
                    let run = if self.disk_type() == DISK_TYPE_DIFFERENCING {
                        let bm = self.bitmap_cache.get(self.bitmap_cache.find(blk).unwrap());
                        bm.run_len(sector_in_block, span_cap, true)
                    } else {
                        span_cap
                    };
                    let chunk = &data[data_off..data_off + run as usize * 512];
                    self.issue_data_write(cur, chunk, 0, private, callback.clone());
                    cur += run as u64;
                    data_off += run as usize * 512;
                    remaining -= run;
                }
                Span::NotCached => {
                    // A write into an allocated-but-uncached block behaves
                    // like a read-triggering miss: load the bitmap, then
                    // let the retry re-enter this same span.
                    let chunk = &data[data_off..data_off + span_cap as usize * 512];
                    self.load_bitmap_then_retry(blk, cur, span_cap, private, callback.clone(), Some(chunk));
                    cur += span_cap as u64;
                    data_off += span_cap as usize * 512;
                    remaining -= span_cap;
                }
                Span::ReadPending => {
                    let chunk = &data[data_off..data_off + span_cap as usize * 512];
                    self.enqueue_waiting(blk, cur, span_cap, private, callback.clone(), Some(chunk));
                    cur += span_cap as u64;
                    data_off += span_cap as usize * 512;
                    remaining -= span_cap;
                }
            }
        }
    }

    fn issue_data_write(
        &mut self,
        sector: u64,
        data: &[u8],
        extra_flags: u32,
        private: u64,
        callback: std::rc::Rc<std::cell::RefCell<Callback>>,
    ) {
        let blk = (sector / self.spb.max(1) as u64) as u32;
        let sector_in_block = sector % self.spb.max(1) as u64;
        let file_sector = if self.disk_type() == DISK_TYPE_FIXED {
            sector
        } else {
            self.block_data_offset(blk).unwrap() + sector_in_block
        };
        let Ok((idx, _epoch)) = self.pool.alloc() else {
            (callback.borrow_mut())(Err(VhdError::OutOfMemory), sector, (data.len() / 512) as u32, private);
            return;
        };
        self.pool.enqueue_write(idx, file_sector, data);
        let req = self.pool.get_mut(idx);
        req.op = Op::DataWrite;
        req.private = private;
        req.blk = blk;
        req.flags = extra_flags;
        let cb = callback.clone();
        req.callback = Some(Box::new(move |r, s, n, p| (cb.borrow_mut())(r, s, n, p)));

        if req.flags & reqflags::UPDATE_BITMAP != 0 {
            self.attach_to_transaction(blk, idx, sector_in_block as u32, data.len() as u32 / 512);
        }
    }

    fn allocate_and_write(
        &mut self,
        blk: u32,
        sector: u64,
        n: u32,
        data: &[u8],
        private: u64,
        callback: std::rc::Rc<std::cell::RefCell<Callback>>,
    ) {
        let bat = self.bat.as_mut().unwrap();
        let reserved = match bat.reserve(blk) {
            Ok(off) => off,
            Err(e) => {
                (callback.borrow_mut())(Err(e), sector, n, private);
                return;
            }
        };
        let _ = reserved;

        let bm_idx = match self.bitmap_cache.install(blk) {
            Ok(i) => i,
            Err(e) => {
                self.bat.as_mut().unwrap().on_write_complete(false);
                (callback.borrow_mut())(Err(e), sector, n, private);
                return;
            }
        };
        {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            bm.status &= !crate::bitmap::status::READ_PENDING;
            bm.tx = Some(Transaction::new());
            bm.tx.as_mut().unwrap().set_update_bat();
        }

        let bm_secs = self.bm_secs;
        let zero_buf = vec![0u8; bm_secs as usize * 512];
        let Ok((zidx, _e)) = self.pool.alloc() else {
            (callback.borrow_mut())(Err(VhdError::OutOfMemory), sector, n, private);
            return;
        };
        let off = self.bat.as_ref().unwrap().pending_offset(blk).unwrap();
        self.pool.enqueue_write(zidx, off, &zero_buf);
        let req = self.pool.get_mut(zidx);
        req.op = Op::ZeroBmWrite;
        req.blk = blk;
        req.tx_ref = Some(crate::pool::TxRef { bitmap_idx: bm_idx as u32, epoch: self.bitmap_cache.get(bm_idx).epoch });
        {
            let tx = self.bitmap_cache.get_mut(bm_idx).tx.as_mut().unwrap();
            tx.start_member();
            tx.members.push_back(&mut self.pool, zidx);
        }

        let sector_in_block = sector % self.spb as u64;
        self.issue_data_write(sector, data, reqflags::UPDATE_BAT | reqflags::UPDATE_BITMAP, private, callback);
        let _ = sector_in_block;
    }

    fn attach_to_transaction(&mut self, blk: u32, req_idx: u32, sector_in_block: u32, n: u32) {
        let bm_idx = self.bitmap_cache.find(blk).unwrap();
        let epoch = self.bitmap_cache.get(bm_idx).epoch;
        self.pool.get_mut(req_idx).tx_ref = Some(crate::pool::TxRef { bitmap_idx: bm_idx as u32, epoch });

        {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            bm.status |= crate::bitmap::status::LOCKED;
            for s in sector_in_block..sector_in_block + n {
                bm.set_bit(s);
            }
        }

        let open_for_members = matches!(
            self.bitmap_cache.get(bm_idx).tx,
            Some(ref tx) if !tx.closed
        );

        if open_for_members {
            self.bitmap_cache.get_mut(bm_idx).tx.as_mut().unwrap().start_member();
            let tx_members = &mut self.bitmap_cache.get_mut(bm_idx).tx.as_mut().unwrap().members;
            tx_members.push_back(&mut self.pool, req_idx);
        } else {
            let queue = &mut self.bitmap_cache.get_mut(bm_idx).queue;
            queue.push_back(&mut self.pool, req_idx);
        }
    }
}
