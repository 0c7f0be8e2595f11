//! The persisted run state.
//!
//! The state file lists the domains to certify and records the progress of the
//! current order. It is rewritten after every step that changes it, so that a
//! restarted process picks up where the previous one stopped.
//!
//! ```yaml
//! account: ops
//! certDir: /etc/ssl/acme
//! last: 2024-03-01T10:00:00Z
//! domains:
//!   - domain: example.com
//!     email: hostmaster@example.com
//!     Name:
//!       CommonName: example.com
//!       Country: DE
//!     chalRecId: 372e67954025e0ba6aaa6d586b9e0b59
//!     token: RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8
//!     tokVal: 9yOE4KJbGtoDrM4BMZr1yGMLSHFVfjqd6iXWbuwNUzw
//!     ...
//! ```
//!
//! Every field is optional, so a hand written file listing just the domains
//! is a valid fresh state.
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use crate::{Error, Result};

/// Subject fields of the certificate request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subject {
    #[serde(rename = "CommonName")]
    pub common_name: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(rename = "Province")]
    pub province: String,
    #[serde(rename = "Locality")]
    pub locality: String,
    #[serde(rename = "Organisation")]
    pub organisation: String,
    #[serde(rename = "OrganisationUnit")]
    pub organisation_unit: String,
}

/// Progress of the dns-01 challenge for one domain.
///
/// `record_id` is non-empty exactly when the TXT record exists at the
/// provider and has not been deleted yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChallengeState {
    #[serde(rename = "chalRecId")]
    pub record_id: String,
    pub token: String,
    /// The TXT value published for the token.
    #[serde(rename = "tokVal")]
    pub token_value: String,
    /// Challenge url at the CA.
    #[serde(rename = "tokUrl")]
    pub token_url: String,
    #[serde(rename = "tokIssue", with = "time::serde::rfc3339::option")]
    pub issued: Option<OffsetDateTime>,
    #[serde(rename = "expire", with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
    pub order_url: String,
}

impl ChallengeState {
    pub fn has_record(&self) -> bool {
        !self.record_id.is_empty()
    }
}

/// A domain to certify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainRequest {
    pub domain: String,
    pub email: String,
    #[serde(rename = "Name")]
    pub subject: Subject,
    /// Where the last certificate covering this domain was issued.
    #[serde(rename = "certUrl")]
    pub cert_url: String,
    #[serde(flatten)]
    pub challenge: ChallengeState,
}

impl DomainRequest {
    pub fn new(domain: &str) -> Self {
        DomainRequest {
            domain: domain.into(),
            ..Default::default()
        }
    }
}

/// Everything kept between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunState {
    pub account: String,
    #[serde(rename = "last", with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
    pub order_url: String,
    pub cert_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_dir: Option<PathBuf>,
    pub domains: Vec<DomainRequest>,
}

impl RunState {
    pub fn domain_names(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.domain.clone()).collect()
    }

    /// The order a domain belongs to. Older files only carry the run wide
    /// order url, which then applies to every domain.
    pub fn order_url_of(&self, idx: usize) -> &str {
        let own = &self.domains[idx].challenge.order_url;
        if own.is_empty() {
            &self.order_url
        } else {
            own
        }
    }

    /// Domains grouped by order, in first-seen order. Each group becomes one
    /// certificate.
    pub fn order_groups(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = vec![];
        for idx in 0..self.domains.len() {
            let url = self.order_url_of(idx).to_string();
            match groups.iter_mut().find(|(u, _)| *u == url) {
                Some((_, idxs)) => idxs.push(idx),
                None => groups.push((url, vec![idx])),
            }
        }
        groups
    }
}

/// Where a run picks up, derived from the persisted state alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// No challenge records exist.
    Fresh,
    /// Every domain has a published challenge record.
    Published,
    /// Records are published and every order already delivered its
    /// certificate. Only cleanup remains.
    Issued,
}

impl ResumePoint {
    pub fn of(state: &RunState) -> Result<ResumePoint> {
        let (with, without): (Vec<&DomainRequest>, Vec<&DomainRequest>) =
            state.domains.iter().partition(|d| d.challenge.has_record());

        if with.is_empty() {
            return Ok(ResumePoint::Fresh);
        }
        if !without.is_empty() {
            return Err(Error::MixedState {
                with_record: with.iter().map(|d| d.domain.clone()).collect(),
                without_record: without.iter().map(|d| d.domain.clone()).collect(),
            });
        }
        for idx in 0..state.domains.len() {
            if state.order_url_of(idx).is_empty() {
                return Err(Error::Config(format!(
                    "{} has a challenge record but no order url",
                    state.domains[idx].domain
                )));
            }
        }

        let issued = state
            .order_groups()
            .iter()
            .all(|(_, idxs)| idxs.iter().all(|i| !state.domains[*i].cert_url.is_empty()));

        Ok(if issued {
            ResumePoint::Issued
        } else {
            ResumePoint::Published
        })
    }
}

/// Loads and saves the [`RunState`] as YAML.
///
/// [`RunState`]: struct.RunState.html
#[derive(Debug, Clone)]
pub struct CsrStateStore {
    path: PathBuf,
}

impl CsrStateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CsrStateStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<RunState> {
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::StateNotFound(self.path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let state: RunState = serde_yaml::from_str(&s).map_err(|source| Error::StateParse {
            path: self.path.display().to_string(),
            source,
        })?;
        debug!("Loaded state with {} domains", state.domains.len());
        Ok(state)
    }

    /// Write the state, stamping it with the current time. The file is
    /// replaced in one rename so a crash leaves either the old or the new
    /// content.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        state.last_modified = Some(OffsetDateTime::now_utc());
        let yaml = serde_yaml::to_string(state)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        trace!("Saved state to {}", self.path.display());
        Ok(())
    }

    /// Drop everything belonging to the finished order and persist the
    /// result. Certificate urls are kept.
    pub fn clear(&self, mut state: RunState) -> Result<RunState> {
        state.order_url.clear();
        for d in state.domains.iter_mut() {
            d.challenge = ChallengeState::default();
        }
        self.save(&mut state)?;
        Ok(state)
    }
}
