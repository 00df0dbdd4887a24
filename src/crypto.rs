use sha2::{Digest, Sha256};

// Transport credentials are bearer secrets for a device, so logs only ever
// carry a short digest of them.
pub fn credential_fingerprint(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    let digest = hasher.finalize();

    digest[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_fingerprint() {
        let a = credential_fingerprint("fcm-token-1");
        let b = credential_fingerprint("fcm-token-1");
        let c = credential_fingerprint("fcm-token-2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
        assert!(!a.contains("fcm"));
    }
}
