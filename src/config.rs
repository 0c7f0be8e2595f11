//! Run configuration.
//!
//! A [`Config`] is built once (by the command line front end, or by hand when
//! used as a library) and handed by reference to every component. Nothing is
//! read from the environment after that point.
//!
//! [`Config`]: struct.Config.html
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acme::DirectoryUrl;
use crate::cert::KeyAlgorithm;
use crate::{Error, Result};

/// Retry policy for waiting on challenge records to show up in DNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationSettings {
    /// Sleep once before the first lookup.
    pub settle: Duration,
    /// Upper bound on lookups per record.
    pub max_attempts: u32,
    /// Sleep between lookups that found no record.
    pub backoff: Duration,
    /// Only count the record as visible when the expected value is among
    /// the answers. Off by default: any TXT value at the name counts.
    pub require_exact_value: bool,
    /// Ask these name servers instead of the system resolver.
    pub nameservers: Vec<IpAddr>,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        PropagationSettings {
            settle: Duration::from_secs(2),
            max_attempts: 5,
            backoff: Duration::from_secs(10),
            require_exact_value: false,
            nameservers: vec![],
        }
    }
}

/// Polling of order status against the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            delay: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

/// Everything a run needs to know.
#[derive(Debug, Clone)]
pub struct Config {
    /// The YAML run state (domain list and persisted progress).
    pub state_file: PathBuf,
    /// YAML zone list. When absent the zones are listed from the provider.
    pub zone_file: Option<PathBuf>,
    /// Where `<name>.key` and `<name>.crt` are written.
    pub cert_dir: PathBuf,
    /// Where the account key and `contacts.yaml` live.
    pub account_dir: PathBuf,
    /// Account name, used to name the persisted account key.
    pub account: String,
    pub directory_url: String,
    /// One order for all domains (a single certificate), or one per domain.
    pub batch_mode: bool,
    /// Skip the DNS scan made before a run and trust the persisted state.
    pub skip_propagation_check: bool,
    pub key_algorithm: KeyAlgorithm,
    pub propagation: PropagationSettings,
    pub order_poll: PollSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_file: PathBuf::from("csrList.yaml"),
            zone_file: None,
            cert_dir: PathBuf::from("."),
            account_dir: PathBuf::from("."),
            account: "default".into(),
            directory_url: DirectoryUrl::LetsEncrypt.to_url().into(),
            batch_mode: true,
            skip_propagation_check: false,
            key_algorithm: KeyAlgorithm::default(),
            propagation: PropagationSettings::default(),
            order_poll: PollSettings::default(),
        }
    }
}

impl Config {
    /// Check the configuration once before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        require_dir("certificate directory", &self.cert_dir)?;
        require_dir("account directory", &self.account_dir)?;
        if let Some(zone_file) = &self.zone_file {
            if !zone_file.is_file() {
                return Err(Error::Config(format!(
                    "zone file {} does not exist",
                    zone_file.display()
                )));
            }
        }
        if self.account.is_empty() {
            return Err(Error::Config("account name is empty".into()));
        }
        if self.propagation.max_attempts == 0 {
            return Err(Error::Config("propagation attempts must be at least 1".into()));
        }
        if self.order_poll.max_attempts == 0 {
            return Err(Error::Config("order poll attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// The file holding the account contacts.
    pub fn contacts_file(&self) -> PathBuf {
        self.account_dir.join("contacts.yaml")
    }
}

fn require_dir(what: &str, dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{} {} does not exist",
            what,
            dir.display()
        )))
    }
}

/// Contacts registered with the CA account, `contacts.yaml`.
///
/// ```yaml
/// contacts:
///   - mailto:hostmaster@example.com
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFile {
    #[serde(default)]
    pub contacts: Vec<String>,
}

impl AccountFile {
    pub fn load(path: &Path) -> Result<AccountFile> {
        let s = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut file: AccountFile = serde_yaml::from_str(&s)?;
        // bare addresses are accepted and turned into mailto urls
        for c in file.contacts.iter_mut() {
            if !c.contains(':') {
                *c = format!("mailto:{}", c);
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_missing_dirs() {
        let config = Config {
            cert_dir: PathBuf::from("/does/not/exist"),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("certificate directory"));
    }

    #[test]
    fn test_validate_attempts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config {
            cert_dir: dir.path().into(),
            account_dir: dir.path().into(),
            ..Default::default()
        };
        config.validate()?;
        config.propagation.max_attempts = 0;
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_account_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("contacts.yaml");
        fs::write(
            &path,
            "contacts:\n  - hostmaster@example.com\n  - mailto:ops@example.com\n",
        )?;
        let file = AccountFile::load(&path)?;
        assert_eq!(
            file.contacts,
            vec!["mailto:hostmaster@example.com", "mailto:ops@example.com"]
        );
        Ok(())
    }
}
