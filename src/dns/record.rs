//! Creation and removal of `_acme-challenge` TXT records.
use crate::dns::{challenge_record_fqdn, DnsProvider, DnsRecord, ACME_CHALLENGE};
use crate::zone::ZoneBinding;
use crate::{Error, Result};

pub struct ChallengeRecordManager<D: DnsProvider> {
    provider: D,
}

impl<D: DnsProvider> ChallengeRecordManager<D> {
    pub fn new(provider: D) -> Self {
        ChallengeRecordManager { provider }
    }

    pub fn provider(&self) -> &D {
        &self.provider
    }

    /// Publish `value` at `_acme-challenge.<zone>` and return the record id.
    ///
    /// The caller must not call this twice for a domain that already has a
    /// stored record id.
    pub fn create_challenge_record(&self, binding: &ZoneBinding, value: &str) -> Result<String> {
        let name = challenge_record_fqdn(&binding.zone_name);
        let id = self
            .provider
            .create_txt_record(&binding.zone_id, &name, value)?;
        info!("Created {} TXT record {} for {}", name, id, binding.domain);
        Ok(id)
    }

    /// Remove a challenge record. A record that is already gone counts as
    /// removed.
    pub fn delete_challenge_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        match self.provider.delete_record(zone_id, record_id) {
            Ok(()) => {
                debug!("Deleted record {} in zone {}", record_id, zone_id);
                Ok(())
            }
            Err(Error::RecordNotFound { .. }) => {
                debug!("Record {} in zone {} was already gone", record_id, zone_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The challenge records currently present in a zone.
    pub fn list_challenge_records(&self, zone_id: &str) -> Result<Vec<DnsRecord>> {
        let prefix = format!("{}.", ACME_CHALLENGE);
        Ok(self
            .provider
            .list_records(zone_id)?
            .into_iter()
            .filter(|r| r.name.starts_with(&prefix))
            .collect())
    }

    /// Remove every challenge record of a zone, returning how many were
    /// removed. Failures are logged and skipped.
    pub fn purge_challenge_records(&self, zone_id: &str) -> Result<usize> {
        let mut deleted = 0;
        for record in self.list_challenge_records(zone_id)? {
            match self.delete_challenge_record(zone_id, &record.id) {
                Ok(()) => {
                    info!("Removed leftover {} ({})", record.name, record.id);
                    deleted += 1;
                }
                Err(e) => warn!("Could not remove {} ({}): {}", record.name, record.id, e),
            }
        }
        Ok(deleted)
    }
}
