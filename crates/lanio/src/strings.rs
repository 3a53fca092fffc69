use memchr::memchr;

/// Split at the first null byte. Returns the bytes before it and the rest
/// after it, or `None` when no terminator is present.
pub fn split_nul(b: &[u8]) -> Option<(&[u8], &[u8])> {
    let i = memchr(0, b)?;
    Some((&b[..i], &b[i + 1..]))
}

/// Read a null-terminated ASCII string, returning it with the remaining tail.
///
/// Non-UTF-8 bytes are rejected; the game only ever sends ASCII here.
pub fn read_cstring(b: &[u8]) -> Option<(&str, &[u8])> {
    let (head, rest) = split_nul(b)?;
    let s = std::str::from_utf8(head).ok()?;
    Some((s, rest))
}

pub fn push_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_two_consecutive_strings() {
        let (host, rest) = read_cstring(b"DESKTOP-1337ISH\0User\0").unwrap();
        let (user, rest) = read_cstring(rest).unwrap();
        assert_eq!(host, "DESKTOP-1337ISH");
        assert_eq!(user, "User");
        assert!(rest.is_empty());
    }

    #[test]
    fn missing_terminator_is_none() {
        assert!(read_cstring(b"no-null-here").is_none());
    }

    #[test]
    fn empty_string_is_valid() {
        let (s, rest) = read_cstring(b"\0tail").unwrap();
        assert_eq!(s, "");
        assert_eq!(rest, b"tail");
    }
}
