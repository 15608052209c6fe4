//! Identity keys: one tracking key per signed-in user or network origin.

/// Derive the quota tracking key for a request.
///
/// A signed-in user is keyed by durable id alone, so the same account maps
/// to one entry no matter which network path it arrives on. Anonymous
/// traffic is keyed per origin address.
pub fn client_key(user_id: Option<&str>, origin_addr: &str) -> String {
    match user_id {
        Some(id) => format!("user:{id}"),
        None => format!("ip:{origin_addr}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_in_key_ignores_origin_address() {
        assert_eq!(
            client_key(Some("u1"), "1.2.3.4"),
            client_key(Some("u1"), "5.6.7.8")
        );
    }

    #[test]
    fn signed_in_key_is_deterministic() {
        assert_eq!(client_key(Some("u1"), "1.2.3.4"), "user:u1");
        assert_eq!(client_key(Some("u1"), "1.2.3.4"), "user:u1");
    }

    #[test]
    fn anonymous_keys_differ_per_origin() {
        assert_ne!(client_key(None, "1.2.3.4"), client_key(None, "5.6.7.8"));
    }

    #[test]
    fn user_and_ip_keyspaces_never_collide() {
        // a guest claiming an address that looks like a user id still lands
        // in the ip: keyspace
        assert_ne!(client_key(Some("x"), ""), client_key(None, "x"));
    }
}
