pub mod format_utils {
    use std::time::Duration;

    // Convert bytes to human-readable format
    pub fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }

    // Format a byte rate in bytes per second
    pub fn format_rate(rate: f64) -> String {
        const KB: f64 = 1024.0;
        const MB: f64 = KB * 1024.0;

        if rate >= MB {
            format!("{:.2} MB/s", rate / MB)
        } else if rate >= KB {
            format!("{:.2} KB/s", rate / KB)
        } else {
            format!("{:.0} B/s", rate)
        }
    }

    pub fn format_duration(d: Duration) -> String {
        let ms = d.as_secs_f64() * 1000.0;
        if ms >= 1000.0 {
            format!("{:.2}s", ms / 1000.0)
        } else {
            format!("{:.2}ms", ms)
        }
    }
}

pub mod network_utils {
    use std::net::IpAddr;

    pub fn is_ip(s: &str) -> bool {
        s.parse::<IpAddr>().is_ok()
    }

    /// Split `host:port`, tolerating bracketed IPv6 literals.
    pub fn split_host_port(s: &str) -> Option<(String, u16)> {
        if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']')?;
            let port = rest.strip_prefix(':')?.parse().ok()?;
            return Some((host.to_string(), port));
        }
        // A bare IPv6 address has more than one colon and no brackets;
        // treating its last group as a port would be wrong.
        if s.matches(':').count() > 1 {
            return None;
        }
        let (host, port) = s.rsplit_once(':')?;
        Some((host.to_string(), port.parse().ok()?))
    }

    /// Host component of `host:port`, falling back to the whole string.
    pub fn host_of(target: &str) -> String {
        match split_host_port(target) {
            Some((host, _)) => host,
            None => target.to_string(),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::format_utils::*;
    use std::time::Duration;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(100.0), "100 B/s");
        assert_eq!(format_rate(2048.0), "2.00 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
