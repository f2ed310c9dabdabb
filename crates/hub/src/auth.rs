//! Minimal auth seam (§1: authentication is an external collaborator,
//! contract only, not a feature to build). Admin WebSocket upgrades may
//! optionally require a shared bearer token; viewers and the broadcaster
//! authenticate implicitly via their clientId / registration, per §6.

/// Constant-time byte comparison so a timing side-channel can't be used
/// to guess the configured token one byte at a time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Checks an admin upgrade's presented token against the configured one.
/// If no token is configured, every admin upgrade is accepted (the auth
/// seam is a no-op until an operator turns it on).
pub fn check_admin_token(configured: Option<&str>, presented: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => match presented {
            Some(given) => constant_time_eq(expected.as_bytes(), given.as_bytes()),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_configured_token_accepts_anything() {
        assert!(check_admin_token(None, None));
        assert!(check_admin_token(None, Some("whatever")));
    }

    #[test]
    fn matching_token_is_accepted() {
        assert!(check_admin_token(Some("secret"), Some("secret")));
    }

    #[test]
    fn mismatched_token_is_rejected() {
        assert!(!check_admin_token(Some("secret"), Some("wrong")));
    }

    #[test]
    fn missing_presented_token_is_rejected_when_configured() {
        assert!(!check_admin_token(Some("secret"), None));
    }

    #[test]
    fn different_length_tokens_are_rejected() {
        assert!(!check_admin_token(Some("secret"), Some("secretlonger")));
    }
}
