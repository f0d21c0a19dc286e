//! Small formatting helpers shared by the CLI commands.

pub fn fmt_sectors_human(sectors: u64) -> String {
    fmt_bytes_human(sectors << 9)
}

pub fn fmt_bytes_human(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "K", "M", "G", "T", "P"];
    if bytes == 0 {
        return "0B".to_string();
    }
    let mut val = bytes as f64;
    for unit in UNITS {
        if val < 1024.0 || *unit == "P" {
            return if val >= 100.0 {
                format!("{:.0}{}", val, unit)
            } else if val >= 10.0 {
                format!("{:.1}{}", val, unit)
            } else {
                format!("{:.2}{}", val, unit)
            };
        }
        val /= 1024.0;
    }
    format!("{}B", bytes)
}

/// Parse a human size string ("512M", "2G", "1024") into bytes.
pub fn parse_human_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let (num, mult): (&str, u64) = match s.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&s[..s.len() - 1], 1024),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&s[..s.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'t') => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = num.trim().parse().map_err(|_| anyhow::anyhow!("invalid size: {}", s))?;
    Ok(n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_round_units() {
        assert_eq!(fmt_bytes_human(0), "0B");
        assert_eq!(fmt_bytes_human(1024), "1.00K");
        assert_eq!(fmt_bytes_human(10 * 1024 * 1024), "10.0M");
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_human_size("512").unwrap(), 512);
        assert_eq!(parse_human_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_human_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_human_size("nope").is_err());
    }
}
