//! One finisher per operation kind, invoked from the poll loop. Each
//! advances the bitmap/transaction/BAT state machines and releases its
//! request back to the pool once the caller callback has run.

use log::{debug, error};

use crate::bitmap::status as bm_status;
use crate::error::VhdError;
use crate::pool::{flags as reqflags, Op};
use crate::transaction::State;
use crate::volume::Volume;

impl Volume {
    /// Drive every currently-available completion to its finisher, then
    /// return the number of caller callbacks invoked.
    pub fn poll(&mut self) -> usize {
        let completions = self.pool.poll();
        let mut fired = 0;
        for c in completions {
            if self.pool.epoch_of(c.idx) != c.epoch {
                debug!("stale completion for slot {}, ignoring", c.idx);
                continue;
            }
            fired += self.dispatch_completion(c.idx, c.result);
        }
        fired
    }

    fn dispatch_completion(&mut self, idx: u32, result: i32) -> usize {
        let op = self.pool.get(idx).op;
        let expected = self.pool.get(idx).nr_sectors as i64 * 512;
        let ok = result as i64 == expected;
        if !ok {
            error!("op {:?} on slot {} failed: result={}", op, idx, result);
        }
        self.pool.get_mut(idx).error = if ok {
            None
        } else {
            Some(VhdError::Io(std::io::Error::from_raw_os_error(if result < 0 { -result } else { libc::EIO })))
        };

        match op {
            Op::DataRead => self.finish_data_read(idx, ok),
            Op::DataWrite => self.finish_data_write(idx, ok),
            Op::BitmapRead => self.finish_bitmap_read(idx, ok),
            Op::BitmapWrite => self.finish_bitmap_write(idx, ok),
            Op::ZeroBmWrite => self.finish_zero_bm_write(idx, ok),
            Op::BatWrite => self.finish_bat_write(idx, ok),
        }
    }

    fn signal_completion(&mut self, idx: u32) -> usize {
        let error = self.pool.get_mut(idx).error.take();
        let sector = self.pool.get(idx).sector;
        let n = self.pool.get(idx).nr_sectors;
        let private = self.pool.get(idx).private;
        let mut callback = self.pool.get_mut(idx).callback.take();
        self.returned += 1;
        if let Some(cb) = callback.as_mut() {
            cb(error.map_or(Ok(()), Err), sector, n, private);
        }
        self.pool.free(idx);
        1
    }

    fn finish_data_read(&mut self, idx: u32, _ok: bool) -> usize {
        self.signal_completion(idx)
    }

    /// A bitmap load has landed: publish it into `map`/`shadow`, then drain
    /// and replay every request that parked behind it while it was loading.
    fn finish_bitmap_read(&mut self, idx: u32, ok: bool) -> usize {
        let blk = self.pool.get(idx).blk;
        let bm_idx = self.bitmap_cache.find(blk);

        if ok {
            let data = self.pool.get(idx).buf.to_vec();
            if let Some(bm_idx) = bm_idx {
                let bm = self.bitmap_cache.get_mut(bm_idx);
                bm.map.copy_from_slice(&data);
                bm.shadow.copy_from_slice(&data);
                bm.status &= !bm_status::READ_PENDING;
            }
        } else if let Some(bm_idx) = bm_idx {
            self.bitmap_cache.get_mut(bm_idx).status &= !(bm_status::READ_PENDING | bm_status::LOCKED);
        }
        self.pool.free(idx);

        let waiting = match bm_idx {
            Some(bm_idx) => self.bitmap_cache.get_mut(bm_idx).waiting.drain(&self.pool),
            None => Vec::new(),
        };

        let mut fired = 0;
        for w in waiting {
            if ok {
                fired += self.replay_waiting(w);
            } else {
                self.pool.get_mut(w).error =
                    Some(VhdError::Io(std::io::Error::new(std::io::ErrorKind::Other, "bitmap read failed")));
                fired += self.signal_completion(w);
            }
        }
        fired
    }

    /// Re-enter the router with a request that was parked behind a bitmap
    /// load. `buf` being non-empty marks it as a write holding its payload.
    fn replay_waiting(&mut self, w: u32) -> usize {
        let sector = self.pool.get(w).sector;
        let n = self.pool.get(w).nr_sectors;
        let private = self.pool.get(w).private;
        let is_write = !self.pool.get(w).buf.is_empty();
        let data = self.pool.get(w).buf.to_vec();
        let callback = self.pool.get_mut(w).callback.take();
        self.pool.free(w);

        let Some(cb) = callback else { return 0 };
        if is_write {
            self.queue_write(sector, n, &data, private, cb);
        } else {
            self.queue_read(sector, n, private, cb);
        }
        0
    }

    fn finish_data_write(&mut self, idx: u32, ok: bool) -> usize {
        let flags = self.pool.get(idx).flags;
        if flags & (reqflags::UPDATE_BAT | reqflags::UPDATE_BITMAP) == 0 {
            return self.signal_completion(idx);
        }

        let tx_ref = self.pool.get(idx).tx_ref;
        let Some(tx_ref) = tx_ref else {
            return self.signal_completion(idx);
        };
        let Some(bm_idx) = self.bitmap_cache.resolve(tx_ref) else {
            debug!("stale tx_ref on data write completion, dropping");
            return self.signal_completion(idx);
        };

        // Mark the slot finished regardless of which transaction currently
        // owns `bm_idx`: a write attached to an already-closed transaction
        // sits in `queue` until the next transaction promotes it, and its
        // own completion may land before that promotion happens.
        self.pool.get_mut(idx).flags |= reqflags::FINISHED;
        {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            if let Some(tx) = bm.tx.as_mut() {
                tx.finish_member(ok);
            }
        }
        self.maybe_close_and_finish(bm_idx)
    }

    /// Called after every data-write completion that belongs to a
    /// transaction; closes the transaction once all members have reported
    /// and, for differencing disks, schedules the bitmap write.
    fn maybe_close_and_finish(&mut self, bm_idx: usize) -> usize {
        let (closed_now, is_diff, has_error, update_bat) = {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            let Some(tx) = bm.tx.as_mut() else { return 0 };
            if !tx.data_complete() {
                return 0;
            }
            tx.close();
            (
                tx.state == State::Closed,
                self.footer.disk_type == crate::format::DISK_TYPE_DIFFERENCING,
                tx.error,
                tx.is_update_bat(),
            )
        };

        if !closed_now {
            return 0;
        }

        if update_bat && self.bat.as_ref().unwrap().is_locked() {
            // BAT write for this block hasn't landed yet; its finisher will
            // re-invoke us once it does.
            return 0;
        }

        if is_diff && !has_error {
            self.schedule_bitmap_write(bm_idx);
            0
        } else {
            self.finish_bitmap_transaction(bm_idx)
        }
    }

    fn schedule_bitmap_write(&mut self, bm_idx: usize) {
        let blk = self.bitmap_cache.get(bm_idx).blk;
        let Some(off) = self.bat.as_ref().unwrap().entry(blk).or_else(|| self.bat.as_ref().unwrap().pending_offset(blk)) else {
            self.finish_bitmap_transaction(bm_idx);
            return;
        };
        let shadow = self.bitmap_cache.get(bm_idx).shadow.clone();
        let Ok((idx, _e)) = self.pool.alloc() else {
            self.finish_bitmap_transaction(bm_idx);
            return;
        };
        self.pool.enqueue_write(idx, off, &shadow);
        let req = self.pool.get_mut(idx);
        req.op = Op::BitmapWrite;
        req.blk = blk;
        req.tx_ref = Some(crate::pool::TxRef { bitmap_idx: bm_idx as u32, epoch: self.bitmap_cache.get(bm_idx).epoch });
        self.bitmap_cache.get_mut(bm_idx).status |= bm_status::WRITE_PENDING;
    }

    fn finish_bitmap_write(&mut self, idx: u32, ok: bool) -> usize {
        let tx_ref = self.pool.get(idx).tx_ref;
        self.pool.free(idx);
        let Some(tx_ref) = tx_ref else { return 0 };
        let Some(bm_idx) = self.bitmap_cache.resolve(tx_ref) else {
            return 0;
        };
        {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            bm.status &= !bm_status::WRITE_PENDING;
            if ok {
                bm.map.copy_from_slice(&bm.shadow.clone());
            } else {
                bm.shadow.copy_from_slice(&bm.map.clone());
            }
            if let Some(tx) = bm.tx.as_mut() {
                if !ok {
                    tx.error = true;
                }
            }
        }
        self.finish_bitmap_transaction(bm_idx)
    }

    fn finish_zero_bm_write(&mut self, idx: u32, ok: bool) -> usize {
        let blk = self.pool.get(idx).blk;
        let tx_ref = self.pool.get(idx).tx_ref;
        self.pool.free(idx);

        if !ok {
            self.bat.as_mut().unwrap().on_write_complete(false);
            if let Some(tx_ref) = tx_ref {
                if let Some(bm_idx) = self.bitmap_cache.resolve(tx_ref) {
                    if let Some(tx) = self.bitmap_cache.get_mut(bm_idx).tx.as_mut() {
                        tx.error = true;
                        tx.finish_member(false);
                    }
                    return self.maybe_close_and_finish(bm_idx);
                }
            }
            return 0;
        }

        self.schedule_bat_write(blk);
        if let Some(tx_ref) = tx_ref {
            if let Some(bm_idx) = self.bitmap_cache.resolve(tx_ref) {
                if let Some(tx) = self.bitmap_cache.get_mut(bm_idx).tx.as_mut() {
                    tx.finish_member(true);
                }
                return self.maybe_close_and_finish(bm_idx);
            }
        }
        0
    }

    fn schedule_bat_write(&mut self, blk: u32) {
        let (file_offset_sectors, buf) = self.bat.as_ref().unwrap().write_window(blk);
        let Ok((idx, _e)) = self.pool.alloc() else {
            self.bat.as_mut().unwrap().on_write_complete(false);
            return;
        };
        self.pool.enqueue_write(idx, file_offset_sectors, &buf);
        let req = self.pool.get_mut(idx);
        req.op = Op::BatWrite;
        req.blk = blk;
        let bm_idx = self.bitmap_cache.find(blk);
        if let Some(bm_idx) = bm_idx {
            req.tx_ref = Some(crate::pool::TxRef { bitmap_idx: bm_idx as u32, epoch: self.bitmap_cache.get(bm_idx).epoch });
        }
    }

    fn finish_bat_write(&mut self, idx: u32, ok: bool) -> usize {
        let tx_ref = self.pool.get(idx).tx_ref;
        self.pool.free(idx);
        self.bat.as_mut().unwrap().on_write_complete(ok);
        if ok {
            if let Err(e) = self.relocate_trailing_footer() {
                error!("failed to relocate trailing footer: {}", e);
            }
        }

        let Some(tx_ref) = tx_ref else { return 0 };
        let Some(bm_idx) = self.bitmap_cache.resolve(tx_ref) else {
            return 0;
        };
        self.maybe_close_and_finish(bm_idx)
    }

    /// Fire every member's callback once both the data sectors and any
    /// metadata writes are durable, then reopen the bitmap's transaction
    /// from whatever queued up while this one was closed.
    fn finish_bitmap_transaction(&mut self, bm_idx: usize) -> usize {
        let members = {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            let Some(mut tx) = bm.tx.take() else { return 0 };
            tx.mark_finished();
            tx.members.drain(&self.pool)
        };

        let mut fired = 0;
        for m in members {
            fired += self.signal_completion(m);
        }

        let requeued = {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            bm.queue.drain(&self.pool)
        };

        if requeued.is_empty() {
            let bm = self.bitmap_cache.get_mut(bm_idx);
            if bm.waiting.is_empty() {
                bm.status &= !bm_status::LOCKED;
            }
            return fired;
        }

        let mut new_tx = crate::transaction::Transaction::new();
        for &r in &requeued {
            new_tx.start_member();
            if self.pool.get(r).flags & reqflags::FINISHED != 0 {
                new_tx.finish_member(self.pool.get(r).error.is_none());
            }
        }
        self.bitmap_cache.get_mut(bm_idx).tx = Some(new_tx);
        for &r in &requeued {
            let tx = self.bitmap_cache.get_mut(bm_idx).tx.as_mut().unwrap();
            tx.members.push_back(&mut self.pool, r);
        }

        fired + self.maybe_close_and_finish(bm_idx)
    }
}
