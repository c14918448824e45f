//! Human-readable byte sizes for log output

const UNITS: [&str; 4] = ["bytes", "KB", "MB", "GB"];

/// Format a byte count with binary (1024) steps, one decimal place.
pub fn format_size(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in UNITS {
        if num < 1024.0 {
            return format!("{:.1}{}", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1}TB", num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.0bytes");
        assert_eq!(format_size(512), "512.0bytes");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0GB");
        assert_eq!(format_size(2 * 1024 * 1024 * 1024 * 1024), "2.0TB");
    }
}
