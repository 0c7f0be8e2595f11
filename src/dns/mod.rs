//! DNS side of the dns-01 challenge.
//!
//! * [`DnsProvider`] is the capability to manage records through a provider API,
//!   implemented for Cloudflare in [`cloudflare`].
//! * [`record::ChallengeRecordManager`] creates and removes the `_acme-challenge`
//!   TXT records.
//! * [`propagation::PropagationChecker`] waits for the records to show up in DNS.
//!
//! [`DnsProvider`]: trait.DnsProvider.html
//! [`cloudflare`]: cloudflare/index.html
//! [`record::ChallengeRecordManager`]: record/struct.ChallengeRecordManager.html
//! [`propagation::PropagationChecker`]: propagation/struct.PropagationChecker.html
use crate::zone::ZoneRecord;
use crate::Result;

pub mod cloudflare;
pub mod propagation;
pub mod record;

/// Label under which challenge TXT records live.
pub const ACME_CHALLENGE: &str = "_acme-challenge";

/// TTL for challenge records, in seconds.
pub const CHALLENGE_TTL: u32 = 60;

/// A record as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub record_type: String,
    pub content: String,
}

/// Management of records through a DNS provider API.
pub trait DnsProvider {
    /// All zones visible to the credentials.
    fn list_zones(&self) -> Result<Vec<ZoneRecord>>;
    /// All records of a zone.
    fn list_records(&self, zone_id: &str) -> Result<Vec<DnsRecord>>;
    /// Create a TXT record and return its provider id.
    fn create_txt_record(&self, zone_id: &str, name: &str, value: &str) -> Result<String>;
    /// Delete a record. Fails with `Error::RecordNotFound` when there is no
    /// record with that id.
    fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()>;
}

/// `_acme-challenge.<domain>`, with any wildcard label removed.
pub fn challenge_record_fqdn(domain: &str) -> String {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    format!("{}.{}", ACME_CHALLENGE, domain.trim_end_matches('.'))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_challenge_record_fqdn() {
        assert_eq!(
            challenge_record_fqdn("example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_fqdn("*.example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_fqdn("example.com."),
            "_acme-challenge.example.com"
        );
    }
}
