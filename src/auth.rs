//! HMAC-SHA-256 tags binding a record's identity and value to a shared key
use hmac::{Hmac, Mac};
use log::{debug, warn};
use sha2::Sha256;

use crate::metrics::{MetricKind, MetricRecord};

type HmacSha256 = Hmac<Sha256>;

/// Computes and verifies record tags for an optional shared key
#[derive(Clone, Default)]
pub struct Authenticator {
    key: Vec<u8>,
}

impl Authenticator {
    /// Create an authenticator. An empty or absent key disables signing and
    /// makes every verification succeed.
    pub fn new(key: Option<&str>) -> Self {
        Self {
            key: key.map(|k| k.as_bytes().to_vec()).unwrap_or_default(),
        }
    }

    /// Whether a key is configured
    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty()
    }

    /// Compute the lowercase hex tag for a record.
    ///
    /// Returns `None` when the record's kind is unknown or the value its kind
    /// requires is missing.
    pub fn create_tag(&self, record: &MetricRecord) -> Option<String> {
        let payload = signing_payload(record)?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a record's tag in constant time
    pub fn verify_tag(&self, record: &MetricRecord) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let Some(payload) = signing_payload(record) else {
            debug!("Cannot verify malformed record {}", record.id);
            return false;
        };

        let received = match hex::decode(&record.hash) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Record {} carries a non-hex hash: {}", record.id, e);
                return false;
            }
        };

        let Some(mut mac) = self.mac() else {
            return false;
        };
        mac.update(payload.as_bytes());
        mac.verify_slice(&received).is_ok()
    }

    /// Attach a tag to the record when a key is configured
    pub fn sign(&self, record: &mut MetricRecord) {
        if !self.is_enabled() {
            return;
        }
        if let Some(tag) = self.create_tag(record) {
            record.hash = tag;
        }
    }

    fn mac(&self) -> Option<HmacSha256> {
        // HMAC accepts keys of any length, including empty
        HmacSha256::new_from_slice(&self.key).ok()
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The string a record's tag is computed over
fn signing_payload(record: &MetricRecord) -> Option<String> {
    match record.kind().ok()? {
        MetricKind::Gauge => Some(format!("{}:gauge:{:.6}", record.id, record.value?)),
        MetricKind::Counter => Some(format!("{}:counter:{}", record.id, record.delta?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_payload() {
        assert_eq!(
            signing_payload(&MetricRecord::gauge("Alloc", 1.5)).unwrap(),
            "Alloc:gauge:1.500000"
        );
        assert_eq!(
            signing_payload(&MetricRecord::counter("PollCount", -3)).unwrap(),
            "PollCount:counter:-3"
        );

        let mut unknown = MetricRecord::gauge("x", 1.0);
        unknown.mtype = "histogram".to_string();
        assert!(signing_payload(&unknown).is_none());
    }

    #[test]
    fn test_tag_is_lowercase_hex_and_deterministic() {
        let auth = Authenticator::new(Some("secret"));
        let record = MetricRecord::gauge("Alloc", 4.56);

        let tag = auth.create_tag(&record).unwrap();
        assert_eq!(tag.len(), 64);
        assert!(tag.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(auth.create_tag(&record).unwrap(), tag);

        let other = Authenticator::new(Some("other"));
        assert_ne!(other.create_tag(&record).unwrap(), tag);
    }

    #[test]
    fn test_verify_signed_records() {
        let auth = Authenticator::new(Some("secret"));

        for mut record in [
            MetricRecord::gauge("Alloc", 123.456789),
            MetricRecord::counter("PollCount", 42),
        ] {
            auth.sign(&mut record);
            assert!(auth.verify_tag(&record));
        }
    }

    #[test]
    fn test_tampering_fails_verification() {
        let auth = Authenticator::new(Some("secret"));

        let mut gauge = MetricRecord::gauge("Alloc", 1.0);
        auth.sign(&mut gauge);

        let mut renamed = gauge.clone();
        renamed.id = "Sys".to_string();
        assert!(!auth.verify_tag(&renamed));

        let mut revalued = gauge.clone();
        revalued.value = Some(2.0);
        assert!(!auth.verify_tag(&revalued));

        let mut counter = MetricRecord::counter("PollCount", 1);
        auth.sign(&mut counter);
        let mut redelta = counter.clone();
        redelta.delta = Some(2);
        assert!(!auth.verify_tag(&redelta));

        let mut garbage = counter.clone();
        garbage.hash = "not hex".to_string();
        assert!(!auth.verify_tag(&garbage));
    }

    #[test]
    fn test_empty_key_disables_authentication() {
        for auth in [Authenticator::new(None), Authenticator::new(Some(""))] {
            assert!(!auth.is_enabled());

            let mut record = MetricRecord::gauge("Alloc", 1.0);
            record.hash = "deadbeef".to_string();
            assert!(auth.verify_tag(&record));

            let mut unsigned = MetricRecord::counter("PollCount", 1);
            auth.sign(&mut unsigned);
            assert!(unsigned.hash.is_empty());
        }
    }
}
