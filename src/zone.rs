//! Binding of requested domains to DNS provider zones.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{Error, Result};

/// A zone as known by the DNS provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub name: String,
    pub id: String,
}

/// The YAML zone file.
///
/// ```yaml
/// zones:
///   - name: example.com
///     id: 023e105f4ecef8ad9ca31a8372d0c353
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneList {
    #[serde(default)]
    pub zones: Vec<ZoneRecord>,
}

impl ZoneList {
    pub fn load(path: &Path) -> Result<ZoneList> {
        let s = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read zone file {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&s)
            .map_err(|e| Error::Config(format!("zone file {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// A requested domain together with the zone that hosts its challenge record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneBinding {
    pub domain: String,
    pub zone_name: String,
    pub zone_id: String,
}

/// Bind every domain to the zone with exactly the same name.
///
/// A wildcard domain `*.example.com` binds to the zone `example.com`. If
/// the zone list names a zone twice, the first entry wins.
///
/// Either every domain binds or the first unmatched domain is reported and
/// nothing is returned.
pub fn resolve<S: AsRef<str>>(domains: &[S], zones: &[ZoneRecord]) -> Result<Vec<ZoneBinding>> {
    domains
        .iter()
        .map(|d| {
            let domain = d.as_ref();
            let base = domain.trim_start_matches("*.");
            zones
                .iter()
                .find(|z| z.name.eq_ignore_ascii_case(base))
                .map(|z| ZoneBinding {
                    domain: domain.to_string(),
                    zone_name: z.name.clone(),
                    zone_id: z.id.clone(),
                })
                .ok_or_else(|| Error::UnmatchedDomain(domain.to_string()))
        })
        .collect()
}

/// Look up the binding of a domain in a resolved list.
pub(crate) fn binding_of<'a>(bindings: &'a [ZoneBinding], domain: &str) -> Result<&'a ZoneBinding> {
    bindings
        .iter()
        .find(|b| b.domain == domain)
        .ok_or_else(|| Error::UnmatchedDomain(domain.to_string()))
}
