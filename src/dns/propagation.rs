//! Waiting for challenge records to become visible in DNS.
use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::Resolver;

use crate::config::PropagationSettings;
use crate::dns::challenge_record_fqdn;
use crate::{Error, Result};

/// Answer to a TXT lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxtAnswer {
    Records(Vec<String>),
    /// NXDOMAIN or an empty answer.
    NoRecord,
}

/// TXT lookups. Anything but a missing record is reported as an error.
pub trait TxtResolver {
    fn lookup_txt(&self, name: &str) -> Result<TxtAnswer>;
}

/// Resolver backed by hickory, either using the system configuration or a
/// fixed set of name servers. Answers are never cached.
pub struct SystemResolver {
    resolver: Resolver,
}

impl SystemResolver {
    pub fn new(nameservers: &[IpAddr]) -> Result<SystemResolver> {
        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;
        opts.timeout = Duration::from_secs(5);

        let resolver = if nameservers.is_empty() {
            let (config, _) = hickory_resolver::system_conf::read_system_conf()
                .map_err(|e| Error::Config(format!("system resolver configuration: {}", e)))?;
            Resolver::new(config, opts)?
        } else {
            let group = NameServerConfigGroup::from_ips_clear(nameservers, 53, true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            Resolver::new(config, opts)?
        };
        Ok(SystemResolver { resolver })
    }
}

impl TxtResolver for SystemResolver {
    fn lookup_txt(&self, name: &str) -> Result<TxtAnswer> {
        // absolute name, no search domains
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        match self.resolver.txt_lookup(fqdn.as_str()) {
            Ok(lookup) => {
                let values: Vec<String> = lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part).into_owned())
                            .collect::<String>()
                    })
                    .collect();
                if values.is_empty() {
                    Ok(TxtAnswer::NoRecord)
                } else {
                    Ok(TxtAnswer::Records(values))
                }
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(TxtAnswer::NoRecord),
                _ => Err(Error::Lookup {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// Outcome of waiting for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    Observed { attempts: u32, values: Vec<String> },
    TimedOut { attempts: u32 },
}

impl Propagation {
    pub fn is_observed(&self) -> bool {
        matches!(self, Propagation::Observed { .. })
    }
}

/// Result of looking for challenge records left behind by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// Nothing unexpected. `observed` tells whether the known value is
    /// already visible.
    Clean { observed: bool },
    Stale { found: Vec<String> },
}

pub struct PropagationChecker<R: TxtResolver> {
    resolver: R,
    settings: PropagationSettings,
}

impl<R: TxtResolver> PropagationChecker<R> {
    pub fn new(resolver: R, settings: PropagationSettings) -> Self {
        PropagationChecker { resolver, settings }
    }

    pub fn settings(&self) -> &PropagationSettings {
        &self.settings
    }

    /// One lookup of the challenge record of `domain`.
    pub fn lookup(&self, domain: &str) -> Result<TxtAnswer> {
        let name = challenge_record_fqdn(domain);
        trace!("Lookup TXT {}", name);
        self.resolver.lookup_txt(&name)
    }

    /// Look up the challenge record of `domain` until it shows up, at most
    /// `max_attempts` times with `backoff` in between.
    ///
    /// A missing record is retried. Any other lookup failure ends the wait
    /// with an error. Running out of attempts is not an error.
    pub fn await_record(
        &self,
        domain: &str,
        expected: &str,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<Propagation> {
        for attempt in 1..=max_attempts {
            match self.lookup(domain)? {
                TxtAnswer::Records(values) => {
                    let accepted = !self.settings.require_exact_value
                        || values.iter().any(|v| v == expected);
                    if accepted {
                        debug!(
                            "Challenge record for {} visible after {} attempt(s)",
                            domain, attempt
                        );
                        return Ok(Propagation::Observed {
                            attempts: attempt,
                            values,
                        });
                    }
                    debug!(
                        "Challenge record for {} has {:?}, waiting for {}",
                        domain, values, expected
                    );
                }
                TxtAnswer::NoRecord => {
                    debug!("No challenge record for {} yet (attempt {})", domain, attempt);
                }
            }
            if attempt < max_attempts {
                thread::sleep(backoff);
            }
        }
        Ok(Propagation::TimedOut {
            attempts: max_attempts,
        })
    }

    /// Settle, then wait for the record with the configured policy.
    pub fn await_propagation(&self, domain: &str, expected: &str) -> Result<Propagation> {
        thread::sleep(self.settings.settle);
        self.await_record(
            domain,
            expected,
            self.settings.max_attempts,
            self.settings.backoff,
        )
    }

    /// Look for a challenge record whose value differs from `known_good`.
    /// With an empty `known_good` any record is unexpected.
    pub fn detect_stale_record(&self, domain: &str, known_good: &str) -> Result<Staleness> {
        match self.lookup(domain)? {
            TxtAnswer::NoRecord => Ok(Staleness::Clean { observed: false }),
            TxtAnswer::Records(values) => {
                if !known_good.is_empty() && values.iter().any(|v| v == known_good) {
                    Ok(Staleness::Clean { observed: true })
                } else {
                    Ok(Staleness::Stale { found: values })
                }
            }
        }
    }
}
