#![warn(clippy::all)]
//! acme-dns01 issues certificates from an ACME (Automatic Certificate Management
//! Environment) provider such as [Let's Encrypt](https://letsencrypt.org/), proving
//! control over the domains with `dns-01` challenges published through the
//! Cloudflare API.
//!
//! The work is driven by a state file listing the domains. Every step of an
//! order is written back to that file, so an interrupted run can simply be
//! started again and continues where it stopped.
//!
//! # Quick start
//!
//! ```no_run
//! use acme_dns01::{Config, CsrStateStore, Directory, DirectoryUrl, Error, OrderOrchestrator};
//! use acme_dns01::dns::cloudflare::Cloudflare;
//! use acme_dns01::dns::propagation::SystemResolver;
//! use acme_dns01::persist::FilePersist;
//! use acme_dns01::zone::ZoneList;
//!
//! fn issue() -> Result<(), Error> {
//! let config = Config::default();
//!
//! // The account key lives in the account directory.
//! let dir = Directory::from_url(
//!     FilePersist::new(&config.account_dir),
//!     DirectoryUrl::LetsEncryptStaging,
//!     config.order_poll.clone(),
//! )?;
//! let account = dir.account_with_realm(&config.account, vec![])?;
//!
//! // Cloudflare zones the domains are published in.
//! let cloudflare = Cloudflare::new("api-token");
//! let zones = ZoneList::load(std::path::Path::new("zones.yaml"))?.zones;
//!
//! let resolver = SystemResolver::new(&config.propagation.nameservers)?;
//! let persist = FilePersist::new(&config.cert_dir);
//!
//! let mut state = CsrStateStore::new(&config.state_file).load()?;
//! let mut orchestrator = OrderOrchestrator::new(config, account, cloudflare, resolver, persist);
//! let report = orchestrator.run(&mut state, &zones)?;
//!
//! for cert in &report.certificates {
//!     println!("{} valid for {:?} days", cert.primary, cert.days_left);
//! }
//! Ok(())
//! }
//! ```
//!
//! ## Resuming
//!
//! A domain with a challenge record id in the state file has a published TXT
//! record. Either all domains have one or none does; anything in between is
//! refused and needs a `clean` first.
//!
//! ## Rate limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being
//! abused. Use the staging directory while testing, see
//! [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits/
//! [`DirectoryUrl::LetsEncryptStaging`]: acme/enum.DirectoryUrl.html#variant.LetsEncryptStaging
//!
//! ## Implementation details
//!
//! All I/O is synchronous and blocking. Requests to the ACME API are signed
//! with the [openssl](https://docs.rs/openssl/) crate.
//!
#[macro_use]
extern crate log;

mod error;
mod req;
mod util;

pub mod acme;
pub mod cert;
pub mod config;
pub mod dns;
pub mod orchestrator;
pub mod persist;
pub mod state;
pub mod zone;

#[cfg(test)]
mod test;

pub use crate::acme::{Account, AcmeProvider, Directory, DirectoryUrl};
pub use crate::cert::{Certificate, CertificateMaterializer, KeyAlgorithm};
pub use crate::config::Config;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::orchestrator::{OrderOrchestrator, RunReport, Stage};
pub use crate::state::{CsrStateStore, ResumePoint, RunState};
