use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Prefix an ICE server url with its scheme when the relay handed out a bare host:port
pub fn with_ice_scheme(url: &str, has_credentials: bool) -> String {
    let url = url.trim();
    if url.starts_with("turn:") || url.starts_with("turns:") || url.starts_with("stun:") {
        url.to_string()
    } else {
        // credentials only make sense for relays
        let scheme = if has_credentials { "turn:" } else { "stun:" };
        format!("{scheme}{url}")
    }
}
