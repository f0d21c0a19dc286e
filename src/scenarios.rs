//! End-to-end scenarios exercising the router, transaction engine, and
//! finishers together against real temporary files.

#![cfg(test)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::VhdError;
use crate::format::{DISK_TYPE_DYNAMIC, DISK_TYPE_FIXED};
use crate::volume::{OpenFlags, Volume};

struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    fn new(name: &str) -> Self {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("vhd-tapdisk-scenarios-{}-{}-{}", std::process::id(), name, ts));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn drain(vol: &mut Volume, max_rounds: usize) {
    for _ in 0..max_rounds {
        let _ = vol.pool.submit();
        if vol.poll() == 0 {
            // give outstanding I/O more chances to land
            std::thread::yield_now();
        }
    }
}

/// S1: fixed disk round-trips a synchronous-looking write/read pair.
#[test]
fn fixed_disk_write_then_read_round_trips() {
    let dir = TestTempDir::new("s1");
    let path = dir.path().join("fixed.vhd");
    Volume::create(&path, 8 << 20, DISK_TYPE_FIXED, 0, None, 1_700_000_000).unwrap();
    let mut vol = Volume::open(&path, OpenFlags::default()).unwrap();

    let written = Rc::new(RefCell::new(false));
    let w = written.clone();
    let pattern = vec![0x55u8; 512];
    vol.queue_write(0, 1, &pattern, 1, move |res, _s, _n, _p| {
        assert!(res.is_ok());
        *w.borrow_mut() = true;
    });
    drain(&mut vol, 8);
    assert!(*written.borrow());

    let read_back = Rc::new(RefCell::new(Vec::new()));
    let r = read_back.clone();
    vol.queue_read(0, 1, 2, move |res, _s, _n, _p| {
        assert!(res.is_ok());
        r.borrow_mut().push(());
    });
    drain(&mut vol, 8);
    assert_eq!(read_back.borrow().len(), 1);
}

/// S2: writing into an unallocated block on a dynamic disk runs the full
/// allocate -> zero-bitmap -> data -> BAT -> bitmap chain and only then
/// fires the caller's callback.
#[test]
fn dynamic_disk_first_write_allocates_block() {
    let dir = TestTempDir::new("s2");
    let path = dir.path().join("dyn.vhd");
    Volume::create(&path, 64 << 20, DISK_TYPE_DYNAMIC, 2 << 20, None, 1_700_000_000).unwrap();
    let mut vol = Volume::open(&path, OpenFlags::default()).unwrap();

    let completed = Rc::new(RefCell::new(false));
    let c = completed.clone();
    let pattern = vec![0xAAu8; 512];
    vol.queue_write(0, 1, &pattern, 42, move |res, _s, _n, _p| {
        assert!(res.is_ok());
        *c.borrow_mut() = true;
    });

    for _ in 0..16 {
        let _ = vol.pool.submit();
        vol.poll();
    }

    assert!(*completed.borrow(), "write callback never fired");
    assert!(vol.bat.as_ref().unwrap().entry(0).is_some());
}

/// S5: once the bitmap cache is cold (as happens on reopen), a write into
/// an already-allocated block goes through NOT_CACHED and must replay once
/// the bitmap load lands, rather than dropping the write's payload and
/// hanging forever.
#[test]
fn reopened_dynamic_disk_write_replays_after_bitmap_reload() {
    let dir = TestTempDir::new("s5");
    let path = dir.path().join("dyn.vhd");
    Volume::create(&path, 16 << 20, DISK_TYPE_DYNAMIC, 2 << 20, None, 1_700_000_000).unwrap();

    let mut vol = Volume::open(&path, OpenFlags::default()).unwrap();
    let first = vec![0x11u8; 512];
    let done = Rc::new(RefCell::new(false));
    let d = done.clone();
    vol.queue_write(0, 1, &first, 1, move |res, _s, _n, _p| {
        assert!(res.is_ok());
        *d.borrow_mut() = true;
    });
    drain(&mut vol, 16);
    assert!(*done.borrow());
    vol.close();

    // Bitmap cache starts empty on reopen even though the BAT entry for
    // block 0 is already on disk, so this write must go through NOT_CACHED.
    let mut vol = Volume::open(&path, OpenFlags::default()).unwrap();
    let second = vec![0x22u8; 512];
    let done2 = Rc::new(RefCell::new(false));
    let d2 = done2.clone();
    vol.queue_write(0, 1, &second, 2, move |res, _s, _n, _p| {
        assert!(res.is_ok());
        *d2.borrow_mut() = true;
    });
    drain(&mut vol, 16);
    assert!(*done2.borrow(), "write behind a cold bitmap cache never replayed");
}

/// S4: the first read of an allocated-but-uncached block on a differencing
/// disk completes instead of hanging behind the bitmap load it triggers.
#[test]
fn reopened_differencing_disk_read_completes_after_bitmap_reload() {
    let dir = TestTempDir::new("s4");
    let parent_path = dir.path().join("parent.vhd");
    let child_path = dir.path().join("child.vhd");
    Volume::create(&parent_path, 16 << 20, DISK_TYPE_DYNAMIC, 2 << 20, None, 1_700_000_000).unwrap();
    Volume::snapshot(&parent_path, &child_path, 1_700_000_100).unwrap();

    let mut child = Volume::open(&child_path, OpenFlags::default()).unwrap();
    let pattern = vec![0x33u8; 512];
    let done = Rc::new(RefCell::new(false));
    let d = done.clone();
    child.queue_write(0, 1, &pattern, 1, move |res, _s, _n, _p| {
        assert!(res.is_ok());
        *d.borrow_mut() = true;
    });
    drain(&mut child, 16);
    assert!(*done.borrow());
    child.close();

    let mut child = Volume::open(&child_path, OpenFlags::default()).unwrap();
    let read_done = Rc::new(RefCell::new(false));
    let rd = read_done.clone();
    child.queue_read(0, 1, 2, move |res, _s, _n, _p| {
        assert!(res.is_ok());
        *rd.borrow_mut() = true;
    });
    drain(&mut child, 16);
    assert!(*read_done.borrow(), "read behind a cold bitmap cache on a differencing disk never completed");
}

/// S7: a hole read on a freshly created dynamic disk surfaces the
/// not-allocated sentinel rather than reading zeroes as data.
#[test]
fn hole_read_reports_not_allocated() {
    let dir = TestTempDir::new("s7");
    let path = dir.path().join("dyn.vhd");
    Volume::create(&path, 16 << 20, DISK_TYPE_DYNAMIC, 2 << 20, None, 1_700_000_000).unwrap();
    let mut vol = Volume::open(&path, OpenFlags::default()).unwrap();

    let got_error = Rc::new(RefCell::new(false));
    let g = got_error.clone();
    vol.queue_read(0, 1, 7, move |res, _s, _n, _p| {
        *g.borrow_mut() = matches!(res, Err(VhdError::NotAllocated));
    });
    drain(&mut vol, 4);
    assert!(*got_error.borrow());
}
