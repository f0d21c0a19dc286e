//! Per-image driver state: the host-facing `Volume` type that owns the
//! footer/header/BAT, the bitmap cache, and the request pool.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::bat::Bat;
use crate::bitmap::BitmapCache;
use crate::error::{FormatError, VhdError};
use crate::format::{
    self, DynamicHeader, Footer, ParentLocator, DISK_TYPE_DIFFERENCING, DISK_TYPE_DYNAMIC,
    DISK_TYPE_FIXED, PLATFORM_CODE_MACX, SECTOR_SIZE,
};
use crate::pool::RequestPool;

/// Sectors per host page; blocks are padded so their data region always
/// starts on a page boundary.
const SECTORS_PER_PAGE: u32 = 8;

const DEFAULT_BITMAP_CACHE_CAPACITY: usize = 32;
const DEFAULT_REQUEST_POOL_CAPACITY: usize = 256;
const DEFAULT_BLOCK_SIZE: u32 = 2 << 20;

pub struct OpenFlags {
    pub read_only: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags { read_only: false }
    }
}

pub struct Volume {
    file: File,
    path: PathBuf,
    pub(crate) footer: Footer,
    pub(crate) header: Option<DynamicHeader>,
    pub(crate) bat: Option<Bat>,
    pub(crate) bitmap_cache: BitmapCache,
    pub(crate) pool: RequestPool,
    pub(crate) spb: u32,
    pub(crate) bm_secs: u32,
    pub(crate) returned: u64,
}

impl Volume {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disk_type(&self) -> u32 {
        self.footer.disk_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.footer.current_size
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.footer.uuid
    }

    fn read_footer(file: &mut File) -> Result<Footer, FormatError> {
        let len = file.metadata()?.len();

        // Primary: last 512 bytes.
        if len >= 512 {
            file.seek(SeekFrom::End(-512))?;
            let mut buf = [0u8; 512];
            file.read_exact(&mut buf)?;
            if let Ok(f) = Footer::from_bytes(&buf) {
                return Ok(f);
            }
        }
        // Fallback: pre-2004 511-byte footer at end of file.
        if len >= 511 {
            file.seek(SeekFrom::End(-511))?;
            let mut short = [0u8; 511];
            file.read_exact(&mut short)?;
            let mut buf = [0u8; 512];
            buf[..511].copy_from_slice(&short);
            if let Ok(f) = Footer::from_bytes(&buf) {
                return Ok(f);
            }
        }
        // Fallback: backup copy at the start of the file.
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 512];
        file.read_exact(&mut buf)?;
        Footer::from_bytes(&buf)
    }

    /// Open an existing VHD image.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self, FormatError> {
        let path = path.as_ref().to_path_buf();
        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(!flags.read_only);
        open_opts.custom_flags(libc::O_DIRECT);

        let mut file = match open_opts.open(&path) {
            Ok(f) => f,
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                warn!("O_DIRECT rejected for {}, falling back to cached I/O", path.display());
                OpenOptions::new()
                    .read(true)
                    .write(!flags.read_only)
                    .open(&path)?
            }
            Err(e) => return Err(e.into()),
        };

        let footer = Self::read_footer(&mut file)?;
        debug!("opened {}: disk_type={}", path.display(), footer.disk_type);

        let (header, bat, spb, bm_secs) = match footer.disk_type {
            DISK_TYPE_FIXED => (None, None, 0, 0),
            DISK_TYPE_DYNAMIC | DISK_TYPE_DIFFERENCING => {
                let mut hbuf = [0u8; 1024];
                file.seek(SeekFrom::Start(footer.data_offset))?;
                file.read_exact(&mut hbuf)?;
                let header = DynamicHeader::from_bytes(&hbuf)?;

                let bat_secs = header.bat_size_sectors();
                let mut bat_buf = vec![0u8; (bat_secs * SECTOR_SIZE) as usize];
                file.seek(SeekFrom::Start(header.table_offset * SECTOR_SIZE))?;
                file.read_exact(&mut bat_buf)?;
                let entries = format::read_bat(&bat_buf)[..header.max_table_entries as usize].to_vec();

                let spb = header.block_size / SECTOR_SIZE as u32;
                let bm_secs = (spb as u64).div_ceil(8).div_ceil(SECTOR_SIZE) as u32;

                let table_offset_sectors = header.table_offset;
                let mut next_db = table_offset_sectors + bat_secs;
                let rem = next_db % SECTORS_PER_PAGE as u64;
                if rem != 0 {
                    next_db += SECTORS_PER_PAGE as u64 - rem;
                }
                for &e in entries.iter() {
                    if e != format::BAT_UNUSED {
                        let end = e as u64 + spb as u64 + bm_secs as u64;
                        let rounded = end.div_ceil(SECTORS_PER_PAGE as u64) * SECTORS_PER_PAGE as u64;
                        next_db = next_db.max(rounded);
                    }
                }

                let bat = Bat::new(
                    entries,
                    table_offset_sectors,
                    bat_secs,
                    spb,
                    bm_secs,
                    SECTORS_PER_PAGE,
                    next_db,
                );
                (Some(header), Some(bat), spb, bm_secs)
            }
            other => return Err(FormatError::UnsupportedDiskType(other)),
        };

        let fd: RawFd = file.as_raw_fd();
        let pool = RequestPool::new(fd, DEFAULT_REQUEST_POOL_CAPACITY)
            .map_err(FormatError::Io)?;
        let bitmap_cache = BitmapCache::new(DEFAULT_BITMAP_CACHE_CAPACITY, bm_secs as usize * SECTOR_SIZE as usize);

        Ok(Volume {
            file,
            path,
            footer,
            header,
            bat,
            bitmap_cache,
            pool,
            spb,
            bm_secs,
            returned: 0,
        })
    }

    pub fn close(self) {
        debug!("closing {}", self.path.display());
        drop(self.file);
    }

    /// Create a new fixed, dynamic, or differencing disk.
    pub fn create(
        path: impl AsRef<Path>,
        size: u64,
        disk_type: u32,
        block_size: u32,
        parent: Option<&Path>,
        now_unix: i64,
    ) -> Result<(), FormatError> {
        let path = path.as_ref();
        let block_size = if block_size == 0 { DEFAULT_BLOCK_SIZE } else { block_size };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        match disk_type {
            DISK_TYPE_FIXED => {
                file.set_len(size)?;
                let footer = Footer::new(DISK_TYPE_FIXED, size, 512, now_unix);
                file.seek(SeekFrom::End(0))?;
                file.write_all(&footer.to_bytes())?;
            }
            DISK_TYPE_DYNAMIC | DISK_TYPE_DIFFERENCING => {
                let spb = block_size / SECTOR_SIZE as u32;
                let bm_secs = (spb as u64).div_ceil(8).div_ceil(SECTOR_SIZE) as u32;
                let max_entries = size.div_ceil(block_size as u64) as u32;

                let table_offset = 3u64; // footer (1) + header (2 sectors) live before it
                let mut header = DynamicHeader::new(table_offset, max_entries, block_size);

                if disk_type == DISK_TYPE_DIFFERENCING {
                    let parent = parent.ok_or(FormatError::NoParentLocator)?;
                    let parent_footer = {
                        let mut pf = File::open(parent)?;
                        Self::read_footer(&mut pf)?
                    };
                    let parent_mtime = std::fs::metadata(parent)?.mtime();
                    header.parent_uuid = parent_footer.uuid;
                    header.parent_timestamp = format::unix_to_vhd_time(parent_mtime);

                    let abs = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
                    let url = format!("file://{}", abs.display());
                    let name: Vec<u16> = abs
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default()
                        .encode_utf16()
                        .collect();
                    for (i, unit) in name.iter().take(256).enumerate() {
                        header.parent_unicode_name[i] = *unit;
                    }

                    let locator_data = url.into_bytes();
                    let locator_offset_sectors = table_offset + header.bat_size_sectors();
                    header.parent_locators[0] = ParentLocator {
                        platform_code: PLATFORM_CODE_MACX,
                        platform_data_space: 1,
                        platform_data_length: locator_data.len() as u32,
                        platform_data_offset: locator_offset_sectors * SECTOR_SIZE,
                    };

                    file.seek(SeekFrom::Start(locator_offset_sectors * SECTOR_SIZE))?;
                    file.write_all(&locator_data)?;
                }

                let bat_secs = header.bat_size_sectors();
                let bat_bytes = format::write_bat(&vec![format::BAT_UNUSED; max_entries as usize], (bat_secs * SECTOR_SIZE) as usize);
                file.seek(SeekFrom::Start(table_offset * SECTOR_SIZE))?;
                file.write_all(&bat_bytes)?;

                file.seek(SeekFrom::Start(512))?;
                file.write_all(&header.to_bytes())?;

                let footer = Footer::new(disk_type, size, 512, now_unix);
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&footer.to_bytes())?;
                // The trailing footer copy sits at the same page-rounded
                // sector that the first block allocation will target; it is
                // relocated to the new end of file as blocks are allocated.
                let mut data_start = table_offset + bat_secs;
                let rem = data_start % SECTORS_PER_PAGE as u64;
                if rem != 0 {
                    data_start += SECTORS_PER_PAGE as u64 - rem;
                }
                let end = data_start * SECTOR_SIZE;
                file.set_len(end)?;
                file.seek(SeekFrom::Start(end))?;
                file.write_all(&footer.to_bytes())?;
            }
            other => return Err(FormatError::UnsupportedDiskType(other)),
        }

        info!("created {} ({} bytes, type {})", path.display(), size, disk_type);
        Ok(())
    }

    /// Create a differencing disk backed by `parent`.
    pub fn snapshot(parent: impl AsRef<Path>, child: impl AsRef<Path>, now_unix: i64) -> Result<(), FormatError> {
        let parent = parent.as_ref();
        let parent_size = std::fs::metadata(parent)?.len();
        Volume::create(
            child,
            parent_size,
            DISK_TYPE_DIFFERENCING,
            DEFAULT_BLOCK_SIZE,
            Some(parent),
            now_unix,
        )
    }

    /// Decode this differencing disk's parent locator into a host path.
    pub fn get_parent_id(&mut self) -> Result<String, FormatError> {
        let header = self.header.as_ref().ok_or(FormatError::NoParentLocator)?;
        let loc = header
            .parent_locators
            .iter()
            .find(|l| l.platform_code == PLATFORM_CODE_MACX || l.platform_code != format::PLATFORM_CODE_NONE)
            .cloned()
            .ok_or(FormatError::NoParentLocator)?;

        let mut raw = vec![0u8; loc.platform_data_length as usize];
        self.file.seek(SeekFrom::Start(loc.platform_data_offset))?;
        self.file.read_exact(&mut raw)?;
        format::decode_parent_locator(&loc, &raw)
    }

    /// Verify this differencing disk's captured parent identity still
    /// matches the file at `parent_path`.
    pub fn validate_parent(&self, parent_path: impl AsRef<Path>) -> Result<(), FormatError> {
        let header = self.header.as_ref().ok_or(FormatError::NoParentLocator)?;
        let parent_path = parent_path.as_ref();

        let mut pf = File::open(parent_path)?;
        let parent_footer = Self::read_footer(&mut pf)?;
        if parent_footer.uuid != header.parent_uuid {
            return Err(FormatError::ParentMismatch("uuid mismatch".into()));
        }

        let parent_mtime = std::fs::metadata(parent_path)?.mtime();
        let captured = format::vhd_to_unix_time(header.parent_timestamp);
        if (parent_mtime - captured).abs() > 2 {
            return Err(FormatError::ParentMismatch("parent modified since snapshot".into()));
        }
        Ok(())
    }

    pub fn returned(&self) -> u64 {
        self.returned
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Rewrite the trailing footer copy at the current allocation frontier.
    /// Dynamic and differencing disks keep the footer as the last 512 bytes
    /// of the file, so every block allocation that advances the frontier
    /// must re-emit it at the new end of file.
    pub(crate) fn relocate_trailing_footer(&mut self) -> std::io::Result<()> {
        let Some(bat) = self.bat.as_ref() else { return Ok(()) };
        let end = bat.next_db() * SECTOR_SIZE;
        let footer_bytes = self.footer.to_bytes();
        self.file.set_len(end + SECTOR_SIZE)?;
        self.file.seek(SeekFrom::Start(end))?;
        self.file.write_all(&footer_bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TestTempDir {
        path: PathBuf,
    }

    impl TestTempDir {
        fn new(name: &str) -> Self {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            let path = std::env::temp_dir().join(format!("vhd-tapdisk-{}-{}-{}", std::process::id(), name, ts));
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

    #[test]
    fn create_and_open_fixed_disk() {
        let dir = TestTempDir::new("fixed");
        let path = dir.path().join("disk.vhd");
        Volume::create(&path, 8 << 20, DISK_TYPE_FIXED, 0, None, 1_700_000_000).unwrap();
        let vol = Volume::open(&path, OpenFlags::default()).unwrap();
        assert_eq!(vol.disk_type(), DISK_TYPE_FIXED);
        assert_eq!(vol.size_bytes(), 8 << 20);
    }

    #[test]
    fn create_and_open_dynamic_disk() {
        let dir = TestTempDir::new("dynamic");
        let path = dir.path().join("disk.vhd");
        Volume::create(&path, 64 << 20, DISK_TYPE_DYNAMIC, 2 << 20, None, 1_700_000_000).unwrap();
        let vol = Volume::open(&path, OpenFlags::default()).unwrap();
        assert_eq!(vol.disk_type(), DISK_TYPE_DYNAMIC);
        assert!(vol.bat.is_some());
        assert_eq!(vol.bat.as_ref().unwrap().len(), 32);
    }

    #[test]
    fn snapshot_validates_against_parent() {
        let dir = TestTempDir::new("diff");
        let parent_path = dir.path().join("parent.vhd");
        let child_path = dir.path().join("child.vhd");
        Volume::create(&parent_path, 16 << 20, DISK_TYPE_DYNAMIC, 2 << 20, None, 1_700_000_000).unwrap();
        Volume::snapshot(&parent_path, &child_path, 1_700_000_100).unwrap();

        let mut child = Volume::open(&child_path, OpenFlags::default()).unwrap();
        assert_eq!(child.disk_type(), DISK_TYPE_DIFFERENCING);
        let decoded = child.get_parent_id().unwrap();
        let canon = std::fs::canonicalize(&parent_path).unwrap();
        assert_eq!(decoded, canon.display().to_string());
        assert!(child.validate_parent(&parent_path).is_ok());
    }
}
