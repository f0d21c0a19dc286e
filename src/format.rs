//! On-disk VHD structures: footer, dynamic disk header, BAT, geometry,
//! parent locators, checksums.
//!
//! All multi-byte fields are big-endian on disk; this module is the only
//! place that knows that. Everything above it works in host-endian values.

use std::io;

use crate::error::FormatError;

pub const SECTOR_SIZE: u64 = 512;

pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
pub const DD_HEADER_COOKIE: &[u8; 8] = b"cxsparse";
pub const DD_HEADER_VERSION: u32 = 0x0001_0000;

pub const BAT_UNUSED: u32 = 0xFFFF_FFFF;

pub const DISK_TYPE_FIXED: u32 = 2;
pub const DISK_TYPE_DYNAMIC: u32 = 3;
pub const DISK_TYPE_DIFFERENCING: u32 = 4;

pub const PLATFORM_CODE_NONE: [u8; 4] = *b"\0\0\0\0";
pub const PLATFORM_CODE_MACX: [u8; 4] = *b"MacX";
pub const PLATFORM_CODE_W2KU: [u8; 4] = *b"W2ku";

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01T00:00:00Z).
const VHD_EPOCH_OFFSET: i64 = 946_684_800;

pub fn unix_to_vhd_time(unix_secs: i64) -> u32 {
    (unix_secs - VHD_EPOCH_OFFSET).max(0) as u32
}

pub fn vhd_to_unix_time(vhd_secs: u32) -> i64 {
    vhd_secs as i64 + VHD_EPOCH_OFFSET
}

/// Compute the CHS geometry triple used in the footer for a disk whose
/// usable size is `total_sectors`, following the standard VHD algorithm.
pub fn chs_geometry(total_sectors: u64) -> (u16, u8, u8) {
    let total_sectors = total_sectors.min(65535 * 16 * 255);

    let (sectors_per_track, heads, cth) = if total_sectors >= 65535 * 16 * 63 {
        let spt = 255u64;
        let heads = 16u64;
        (spt, heads, total_sectors / spt)
    } else {
        let spt = 17u64;
        let cth = total_sectors / spt;
        let mut heads = (cth + 1023) / 1024;
        if heads < 4 {
            heads = 4;
        }
        if cth >= heads * 1024 || heads > 16 {
            let spt = 31u64;
            let heads = 16u64;
            let cth = total_sectors / spt;
            if cth >= heads * 1024 {
                let spt = 63u64;
                let cth = total_sectors / spt;
                (spt, heads, cth)
            } else {
                (spt, heads, cth)
            }
        } else {
            (spt, heads, cth)
        }
    };

    let cylinders = (cth / heads).min(65535);
    (cylinders as u16, heads as u8, sectors_per_track as u8)
}

fn checksum(buf: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in buf.iter().enumerate() {
        if i >= checksum_offset && i < checksum_offset + 4 {
            continue;
        }
        sum = sum.wrapping_add(b as u32);
    }
    !sum
}

#[derive(Debug, Clone)]
pub struct Footer {
    pub features: u32,
    pub file_format_version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub disk_geometry: (u16, u8, u8),
    pub disk_type: u32,
    pub uuid: [u8; 16],
    pub saved_state: u8,
}

impl Footer {
    pub fn new(disk_type: u32, size: u64, data_offset: u64, now_unix: i64) -> Self {
        Footer {
            features: 2,
            file_format_version: 0x0001_0000,
            data_offset,
            timestamp: unix_to_vhd_time(now_unix),
            creator_app: *b"tap ",
            creator_version: 0x0001_0000,
            creator_os: u32::from_be_bytes(*b"Wi2k"),
            original_size: size,
            current_size: size,
            disk_geometry: chs_geometry(size / SECTOR_SIZE),
            disk_type,
            uuid: *uuid::Uuid::new_v4().as_bytes(),
            saved_state: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 512] {
        let mut buf = [0u8; 512];
        buf[0..8].copy_from_slice(FOOTER_COOKIE);
        buf[8..12].copy_from_slice(&self.features.to_be_bytes());
        buf[12..16].copy_from_slice(&self.file_format_version.to_be_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[28..32].copy_from_slice(&self.creator_app);
        buf[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        buf[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        buf[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..58].copy_from_slice(&self.disk_geometry.0.to_be_bytes());
        buf[58] = self.disk_geometry.1;
        buf[59] = self.disk_geometry.2;
        buf[60..64].copy_from_slice(&self.disk_type.to_be_bytes());
        // checksum filled below
        buf[68..84].copy_from_slice(&self.uuid);
        buf[84] = self.saved_state;

        let sum = checksum(&buf, 64);
        buf[64..68].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; 512]) -> Result<Self, FormatError> {
        if &buf[0..8] != FOOTER_COOKIE {
            return Err(FormatError::BadFooterCookie);
        }
        let on_disk_checksum = u32::from_be_bytes(buf[64..68].try_into().unwrap());
        if checksum(buf, 64) != on_disk_checksum {
            return Err(FormatError::FooterChecksum);
        }
        Ok(Footer {
            features: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            file_format_version: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            data_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            timestamp: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            creator_app: buf[28..32].try_into().unwrap(),
            creator_version: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            creator_os: u32::from_be_bytes(buf[36..40].try_into().unwrap()),
            original_size: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
            current_size: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            disk_geometry: (
                u16::from_be_bytes(buf[56..58].try_into().unwrap()),
                buf[58],
                buf[59],
            ),
            disk_type: u32::from_be_bytes(buf[60..64].try_into().unwrap()),
            uuid: buf[68..84].try_into().unwrap(),
            saved_state: buf[84],
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParentLocator {
    pub platform_code: [u8; 4],
    pub platform_data_space: u32,
    pub platform_data_length: u32,
    pub platform_data_offset: u64,
}

impl ParentLocator {
    fn empty() -> Self {
        ParentLocator {
            platform_code: PLATFORM_CODE_NONE,
            platform_data_space: 0,
            platform_data_length: 0,
            platform_data_offset: 0,
        }
    }

    fn is_present(&self) -> bool {
        self.platform_code != PLATFORM_CODE_NONE
    }
}

#[derive(Debug, Clone)]
pub struct DynamicHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_uuid: [u8; 16],
    pub parent_timestamp: u32,
    pub parent_unicode_name: [u16; 256],
    pub parent_locators: [ParentLocator; 8],
}

impl DynamicHeader {
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        DynamicHeader {
            table_offset,
            max_table_entries,
            block_size,
            parent_uuid: [0; 16],
            parent_timestamp: 0,
            parent_unicode_name: [0; 256],
            parent_locators: std::array::from_fn(|_| ParentLocator::empty()),
        }
    }

    pub fn to_bytes(&self) -> [u8; 1024] {
        let mut buf = [0u8; 1024];
        buf[0..8].copy_from_slice(DD_HEADER_COOKIE);
        buf[8..16].copy_from_slice(&0xFFFF_FFFF_FFFF_FFFFu64.to_be_bytes());
        buf[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&DD_HEADER_VERSION.to_be_bytes());
        buf[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        buf[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        // checksum at 36..40, filled below
        buf[40..56].copy_from_slice(&self.parent_uuid);
        buf[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        for (i, unit) in self.parent_unicode_name.iter().enumerate() {
            buf[64 + i * 2..64 + i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        let locators_base = 64 + 512;
        for (i, loc) in self.parent_locators.iter().enumerate() {
            let base = locators_base + i * 24;
            buf[base..base + 4].copy_from_slice(&loc.platform_code);
            buf[base + 4..base + 8].copy_from_slice(&loc.platform_data_space.to_be_bytes());
            buf[base + 8..base + 12].copy_from_slice(&loc.platform_data_length.to_be_bytes());
            buf[base + 16..base + 24].copy_from_slice(&loc.platform_data_offset.to_be_bytes());
        }

        let sum = checksum(&buf, 36);
        buf[36..40].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; 1024]) -> Result<Self, FormatError> {
        if &buf[0..8] != DD_HEADER_COOKIE {
            return Err(FormatError::BadHeaderCookie);
        }
        let on_disk_checksum = u32::from_be_bytes(buf[36..40].try_into().unwrap());
        if checksum(buf, 36) != on_disk_checksum {
            return Err(FormatError::HeaderChecksum);
        }
        let version = u32::from_be_bytes(buf[24..28].try_into().unwrap());
        if version != DD_HEADER_VERSION {
            return Err(FormatError::UnsupportedHeaderVersion(version));
        }

        let mut parent_unicode_name = [0u16; 256];
        for i in 0..256 {
            parent_unicode_name[i] =
                u16::from_be_bytes(buf[64 + i * 2..64 + i * 2 + 2].try_into().unwrap());
        }

        let locators_base = 64 + 512;
        let parent_locators = std::array::from_fn(|i| {
            let base = locators_base + i * 24;
            ParentLocator {
                platform_code: buf[base..base + 4].try_into().unwrap(),
                platform_data_space: u32::from_be_bytes(buf[base + 4..base + 8].try_into().unwrap()),
                platform_data_length: u32::from_be_bytes(
                    buf[base + 8..base + 12].try_into().unwrap(),
                ),
                platform_data_offset: u64::from_be_bytes(
                    buf[base + 16..base + 24].try_into().unwrap(),
                ),
            }
        });

        Ok(DynamicHeader {
            table_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            max_table_entries: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            block_size: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            parent_uuid: buf[40..56].try_into().unwrap(),
            parent_timestamp: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
            parent_unicode_name,
            parent_locators,
        })
    }

    pub fn bat_size_sectors(&self) -> u64 {
        (self.max_table_entries as u64 * 4).div_ceil(SECTOR_SIZE)
    }
}

/// Decode a parent locator's raw platform data into a host path, following
/// the two encodings dynamic/differencing disks actually use in practice:
/// UTF-8 file:// URLs (MacX) and UTF-16LE file:// URLs with an optional
/// drive letter (W2ku).
pub fn decode_parent_locator(loc: &ParentLocator, raw: &[u8]) -> Result<String, FormatError> {
    if !loc.is_present() {
        return Err(FormatError::NoParentLocator);
    }
    if loc.platform_code == PLATFORM_CODE_MACX {
        let s = std::str::from_utf8(raw).map_err(|_| {
            FormatError::UnsupportedLocatorEncoding(u32::from_be_bytes(loc.platform_code))
        })?;
        Ok(strip_file_uri(s))
    } else if loc.platform_code == PLATFORM_CODE_W2KU {
        if raw.len() % 2 != 0 {
            return Err(FormatError::UnsupportedLocatorEncoding(u32::from_be_bytes(
                loc.platform_code,
            )));
        }
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let s = String::from_utf16(&units).map_err(|_| {
            FormatError::UnsupportedLocatorEncoding(u32::from_be_bytes(loc.platform_code))
        })?;
        Ok(strip_drive_letter(&strip_file_uri(&s).replace('\\', "/")))
    } else {
        Err(FormatError::UnsupportedLocatorEncoding(u32::from_be_bytes(
            loc.platform_code,
        )))
    }
}

fn strip_file_uri(s: &str) -> String {
    s.strip_prefix("file://").unwrap_or(s).to_string()
}

fn strip_drive_letter(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        s[2..].to_string()
    } else {
        s.to_string()
    }
}

pub fn read_bat(buf: &[u8]) -> Vec<u32> {
    buf.chunks_exact(4)
        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn write_bat(bat: &[u32], sector_aligned_len: usize) -> Vec<u8> {
    let mut out = vec![0xFFu8; sector_aligned_len];
    for (i, &entry) in bat.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&entry.to_be_bytes());
    }
    out
}

pub fn io_err(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_round_trips() {
        let f = Footer::new(DISK_TYPE_DYNAMIC, 64 << 20, 512, 1_700_000_000);
        let bytes = f.to_bytes();
        let back = Footer::from_bytes(&bytes).unwrap();
        assert_eq!(back.disk_type, DISK_TYPE_DYNAMIC);
        assert_eq!(back.current_size, 64 << 20);
        assert_eq!(back.uuid, f.uuid);
    }

    #[test]
    fn footer_rejects_bad_cookie() {
        let buf = [0u8; 512];
        assert!(matches!(
            Footer::from_bytes(&buf),
            Err(FormatError::BadFooterCookie)
        ));
    }

    #[test]
    fn dynamic_header_round_trips() {
        let h = DynamicHeader::new(1536, 4096, 2 << 20);
        let bytes = h.to_bytes();
        let back = DynamicHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.table_offset, 1536);
        assert_eq!(back.max_table_entries, 4096);
        assert_eq!(back.block_size, 2 << 20);
    }

    #[test]
    fn chs_geometry_is_bounded() {
        let (c, h, s) = chs_geometry(64 << 11); // 64MiB in sectors
        assert!(h >= 4 && h <= 16);
        assert!(s >= 17);
        assert!((c as u64) * (h as u64) * (s as u64) <= 64 << 11);
    }

    #[test]
    fn decode_macx_strips_uri() {
        let loc = ParentLocator {
            platform_code: PLATFORM_CODE_MACX,
            platform_data_space: 0,
            platform_data_length: 0,
            platform_data_offset: 0,
        };
        let raw = b"file:///var/lib/vhd/parent.vhd";
        let path = decode_parent_locator(&loc, raw).unwrap();
        assert_eq!(path, "/var/lib/vhd/parent.vhd");
    }

    #[test]
    fn decode_w2ku_strips_drive_letter() {
        let loc = ParentLocator {
            platform_code: PLATFORM_CODE_W2KU,
            platform_data_space: 0,
            platform_data_length: 0,
            platform_data_offset: 0,
        };
        let s = "file://c:\\vhd\\parent.vhd";
        let units: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let path = decode_parent_locator(&loc, &units).unwrap();
        assert_eq!(path, "/vhd/parent.vhd");
    }

    #[test]
    fn bat_round_trips() {
        let bat = vec![BAT_UNUSED, 128, BAT_UNUSED, 4096];
        let bytes = write_bat(&bat, 512);
        let back = read_bat(&bytes[..16]);
        assert_eq!(back, bat);
    }

    #[test]
    fn vhd_epoch_offset_is_y2k() {
        assert_eq!(unix_to_vhd_time(946_684_800), 0);
        assert_eq!(vhd_to_unix_time(0), 946_684_800);
    }
}
