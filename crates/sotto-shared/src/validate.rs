//! Validation of user-supplied identifiers and endpoints.
//!
//! Hand-rolled character checks; the accepted formats are simple enough
//! that a regex dependency is not warranted. The server uses these to
//! compute INVALID_INPUT results, the client to reject bad input before
//! any network activity and to vet a configured host/port pair.

/// A user id: 3..=32 ASCII characters from `[a-zA-Z0-9._-]`, starting with
/// an alphanumeric.
pub fn valid_user_id(s: &str) -> bool {
    if !(3..=32).contains(&s.len()) {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// A password: 6..=128 bytes, no control characters.
pub fn valid_password(s: &str) -> bool {
    (6..=128).contains(&s.len()) && !s.chars().any(|c| c.is_control())
}

/// A display username: non-empty after trimming, at most 64 bytes, no
/// control characters.
pub fn valid_username(s: &str) -> bool {
    let trimmed = s.trim();
    !trimmed.is_empty() && trimmed.len() <= 64 && !trimmed.chars().any(|c| c.is_control())
}

/// A server host: IPv4 dotted quad, `localhost`, or a DNS name of
/// dot-separated labels.
pub fn valid_host(s: &str) -> bool {
    s == "localhost" || is_ipv4(s) || is_domain(s)
}

/// A server port: any nonzero value.
pub fn valid_port(port: u16) -> bool {
    port != 0
}

fn is_ipv4(s: &str) -> bool {
    let octets: Vec<&str> = s.split('.').collect();
    if octets.len() != 4 {
        return false;
    }
    octets.iter().all(|octet| {
        !octet.is_empty()
            && octet.len() <= 3
            && octet.chars().all(|c| c.is_ascii_digit())
            && octet.parse::<u16>().map_or(false, |n| n <= 255)
    })
}

fn is_domain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = s.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
    }
    // The last label must look like a TLD, which rules out trailing
    // numeric labels that would otherwise shadow malformed IPv4 input.
    labels
        .last()
        .map_or(false, |tld| tld.chars().all(|c| c.is_ascii_alphabetic()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_ids() {
        assert!(valid_user_id("alice"));
        assert!(valid_user_id("bob_42"));
        assert!(valid_user_id("a.b-c"));

        assert!(!valid_user_id("ab"));
        assert!(!valid_user_id(&"a".repeat(33)));
        assert!(!valid_user_id("_leading"));
        assert!(!valid_user_id("has space"));
        assert!(!valid_user_id("émilie"));
    }

    #[test]
    fn test_passwords() {
        assert!(valid_password("hunter22"));
        assert!(!valid_password("short"));
        assert!(!valid_password(&"x".repeat(129)));
        assert!(!valid_password("line\nbreak"));
    }

    #[test]
    fn test_usernames() {
        assert!(valid_username("Alice"));
        assert!(valid_username("  padded  "));
        assert!(!valid_username("   "));
        assert!(!valid_username(&"x".repeat(65)));
    }

    #[test]
    fn test_hosts() {
        assert!(valid_host("localhost"));
        assert!(valid_host("127.0.0.1"));
        assert!(valid_host("192.168.1.10"));
        assert!(valid_host("chat.example.org"));
        assert!(valid_host("relay-1.example.com"));

        assert!(!valid_host(""));
        assert!(!valid_host("256.0.0.1"));
        assert!(!valid_host("1.2.3"));
        assert!(!valid_host("1.2.3.4.5"));
        assert!(!valid_host("bare-hostname"));
        assert!(!valid_host("-bad.example.com"));
        assert!(!valid_host("bad-.example.com"));
        assert!(!valid_host("exa mple.com"));
        assert!(!valid_host("example.123"));
    }

    #[test]
    fn test_ports() {
        assert!(valid_port(7667));
        assert!(!valid_port(0));
    }
}
