/// Community URL codec.
///
/// Wire format: `scheme://host[:port][/r]/<room>?public_key=<64-hex-chars>`.
/// The optional `/r/` path prefix is accepted and stripped on parse; the
/// canonical server string always omits it. Host matching is
/// case-insensitive (lowercased in the canonical form), the room token is
/// case-preserving, and the public key must be exactly 64 hex characters —
/// anything else rejects the whole URL, never a partial result.

/// A parsed community address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommunityAddress {
    /// Canonical base URL: lowercase scheme and host, explicit port kept,
    /// no `/r` suffix, no trailing slash.
    pub server: String,
    /// Room token with its original casing preserved.
    pub room: String,
    pub public_key: [u8; 32],
}

impl CommunityAddress {
    /// The full join URL for this address.
    pub fn url(&self) -> String {
        community_url(&self.server, &self.room, &self.public_key)
    }
}

/// Produce the canonical join URL for a community room.
pub fn community_url(server: &str, room: &str, public_key: &[u8; 32]) -> String {
    format!(
        "{}/{}?public_key={}",
        canonical_server(server),
        room,
        hex::encode(public_key)
    )
}

/// Parse a community join URL. Returns `None` on any malformed component —
/// missing scheme, empty room, bad public key — with no partial fields.
pub fn parse_community(url: &str) -> Option<CommunityAddress> {
    let (scheme, rest) = url.split_once("://")?;
    let scheme = scheme.to_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }

    let (path_part, query) = rest.split_once('?')?;
    let public_key = public_key_param(query)?;

    let (host_port, mut path) = match path_part.split_once('/') {
        Some((hp, p)) => (hp, p),
        None => return None, // no room path at all
    };
    if host_port.is_empty() || !valid_host_port(host_port) {
        return None;
    }

    // Strip the optional /r/ prefix.
    if let Some(stripped) = path.strip_prefix("r/") {
        path = stripped;
    }
    let room = path.trim_end_matches('/');
    if room.is_empty() || room.contains('/') {
        return None;
    }
    if !room
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return None;
    }

    Some(CommunityAddress {
        server: format!("{}://{}", scheme, host_port.to_lowercase()),
        room: room.to_string(),
        public_key,
    })
}

/// Canonicalize a base server URL: lowercase scheme and host, strip any `/r`
/// suffix and trailing slashes. Input without a scheme is passed through
/// lowercased, for matching only.
pub fn canonical_server(server: &str) -> String {
    let trimmed = server.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/r").unwrap_or(trimmed);
    match trimmed.split_once("://") {
        Some((scheme, rest)) => format!("{}://{}", scheme.to_lowercase(), rest.to_lowercase()),
        None => trimmed.to_lowercase(),
    }
}

fn public_key_param(query: &str) -> Option<[u8; 32]> {
    let hex_str = query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "public_key").then_some(v)
    })?;
    if hex_str.len() != 64 {
        return None;
    }
    let bytes = hex::decode(hex_str).ok()?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Some(key)
}

fn valid_host_port(host_port: &str) -> bool {
    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (host_port, None),
    };
    if host.is_empty() {
        return false;
    }
    if let Some(port) = port {
        if port.is_empty() || port.parse::<u16>().is_err() {
            return false;
        }
    }
    host.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

/// Two community references point at the same room if their canonical servers
/// match and the room tokens match case-insensitively.
pub fn same_community(a_server: &str, a_room: &str, b_server: &str, b_room: &str) -> bool {
    canonical_server(a_server) == canonical_server(b_server)
        && a_room.eq_ignore_ascii_case(b_room)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const PUBKEY: [u8; 32] =
        hex!("658d29b91892a2389505596b135e76a53db6e11d613a51dbd3d0816adffb231c");

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let url = community_url("https://open.example.org", "SudokuRoom", &PUBKEY);
        let parsed = parse_community(&url).unwrap();
        assert_eq!(parsed.server, "https://open.example.org");
        assert_eq!(parsed.room, "SudokuRoom"); // case preserved
        assert_eq!(parsed.public_key, PUBKEY);
        assert_eq!(parsed.url(), url);
    }

    #[test]
    fn test_host_case_insensitive_room_case_preserved() {
        let url = format!(
            "HTTPS://Open.Example.ORG/SudokuRoom?public_key={}",
            hex::encode(PUBKEY)
        );
        let parsed = parse_community(&url).unwrap();
        assert_eq!(parsed.server, "https://open.example.org");
        assert_eq!(parsed.room, "SudokuRoom");
    }

    #[test]
    fn test_r_prefix_accepted_and_stripped() {
        let url = format!(
            "https://open.example.org/r/lounge?public_key={}",
            hex::encode(PUBKEY)
        );
        let parsed = parse_community(&url).unwrap();
        assert_eq!(parsed.server, "https://open.example.org");
        assert_eq!(parsed.room, "lounge");
        // The produced canonical URL omits /r.
        assert!(!parsed.url().contains("/r/"));
    }

    #[test]
    fn test_explicit_port_kept() {
        let url = community_url("https://open.example.org:8080", "lounge", &PUBKEY);
        let parsed = parse_community(&url).unwrap();
        assert_eq!(parsed.server, "https://open.example.org:8080");
        let reparsed = parse_community(&parsed.url()).unwrap();
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn test_missing_scheme_rejected() {
        let url = format!("open.example.org/lounge?public_key={}", hex::encode(PUBKEY));
        assert!(parse_community(&url).is_none());
        let url = format!("ftp://open.example.org/lounge?public_key={}", hex::encode(PUBKEY));
        assert!(parse_community(&url).is_none());
    }

    #[test]
    fn test_missing_room_rejected() {
        let url = format!("https://open.example.org?public_key={}", hex::encode(PUBKEY));
        assert!(parse_community(&url).is_none());
        let url = format!("https://open.example.org/?public_key={}", hex::encode(PUBKEY));
        assert!(parse_community(&url).is_none());
        // A bare /r prefix with no room is not a room either.
        let url = format!("https://open.example.org/r/?public_key={}", hex::encode(PUBKEY));
        assert!(parse_community(&url).is_none());
    }

    #[test]
    fn test_bad_public_key_rejects_whole_url() {
        // Too short
        let url = "https://open.example.org/lounge?public_key=abcd";
        assert!(parse_community(url).is_none());
        // Too long
        let url = format!(
            "https://open.example.org/lounge?public_key={}ff",
            hex::encode(PUBKEY)
        );
        assert!(parse_community(&url).is_none());
        // Not hex
        let url = format!("https://open.example.org/lounge?public_key={}", "zz".repeat(32));
        assert!(parse_community(&url).is_none());
        // Missing entirely
        let url = "https://open.example.org/lounge?foo=bar";
        assert!(parse_community(url).is_none());
    }

    #[test]
    fn test_canonical_server_strips_r_and_slash() {
        assert_eq!(
            canonical_server("https://Open.Example.org/r/"),
            "https://open.example.org"
        );
        assert_eq!(
            canonical_server("https://open.example.org/"),
            "https://open.example.org"
        );
    }

    #[test]
    fn test_same_community_matching() {
        assert!(same_community(
            "https://open.example.org",
            "Lounge",
            "HTTPS://OPEN.EXAMPLE.ORG/r",
            "lounge"
        ));
        assert!(!same_community(
            "https://open.example.org",
            "lounge",
            "https://other.example.org",
            "lounge"
        ));
    }

    #[test]
    fn test_extra_query_params_tolerated() {
        let url = format!(
            "https://open.example.org/lounge?foo=1&public_key={}&bar=2",
            hex::encode(PUBKEY)
        );
        let parsed = parse_community(&url).unwrap();
        assert_eq!(parsed.room, "lounge");
    }
}
