//! Utility functions for tidemaster

/// Scheme prefixed onto a node address to form its connection string
pub const CONNECTION_SCHEME: &str = "http://";

/// Strip a transport scheme from a peer address (`http://a:1` -> `a:1`)
pub fn normalize_address(addr: &str) -> String {
    let addr = addr.trim();
    let addr = addr
        .strip_prefix(CONNECTION_SCHEME)
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr);
    addr.trim_end_matches('/').to_string()
}

/// Connection string peers use to reach `addr`
pub fn connection_string(addr: &str) -> String {
    format!("{}{}", CONNECTION_SCHEME, normalize_address(addr))
}

/// Compute CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("http://10.0.0.1:9333"), "10.0.0.1:9333");
        assert_eq!(normalize_address("https://m1:9333/"), "m1:9333");
        assert_eq!(normalize_address(" m2:9333 "), "m2:9333");
        assert_eq!(connection_string("m2:9333"), "http://m2:9333");
        assert_eq!(connection_string("http://m2:9333"), "http://m2:9333");
    }

    #[test]
    fn test_crc32() {
        assert_eq!(crc32(b"hello"), crc32(b"hello"));
        assert_ne!(crc32(b"hello"), crc32(b"world"));
    }
}
