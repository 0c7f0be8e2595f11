//! ACME (RFC 8555) client.
//!
//! The orchestration only needs the calls in [`AcmeProvider`]. [`Account`]
//! implements them against a real CA; it is obtained through a
//! [`Directory`], which also takes care of creating and persisting the
//! account key.
//!
//! All calls are synchronous and blocking.
//!
//! [`AcmeProvider`]: trait.AcmeProvider.html
//! [`Account`]: struct.Account.html
//! [`Directory`]: struct.Directory.html
use crate::Result;

mod account;
mod dir;
mod jwt;
mod key;
mod trans;

pub mod api;

pub use self::account::Account;
pub use self::dir::{Directory, DirectoryUrl};

use self::api::{ApiAuth, ApiChallenge, ApiOrder};

/// A newly created order and the url it lives at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRef {
    pub url: String,
    pub order: ApiOrder,
}

/// The CA operations used to get a certificate through dns-01.
pub trait AcmeProvider {
    /// Create an order for the given domains.
    fn new_order(&self, domains: &[&str]) -> Result<OrderRef>;
    /// Read an authorization.
    fn authorization(&self, url: &str) -> Result<ApiAuth>;
    /// The TXT value proving control for a challenge token.
    fn dns_proof(&self, token: &str) -> Result<String>;
    /// Tell the CA to check a challenge.
    fn accept_challenge(&self, url: &str) -> Result<ApiChallenge>;
    /// Read an order.
    fn order(&self, url: &str) -> Result<ApiOrder>;
    /// Poll an order until it leaves `pending`/`processing`.
    fn wait_order(&self, url: &str) -> Result<ApiOrder>;
    /// Submit the CSR (DER) and wait for the order to become `valid`.
    fn finalize_order(&self, order_url: &str, finalize_url: &str, csr_der: &[u8])
        -> Result<ApiOrder>;
    /// Download a certificate chain, leaf first, as DER.
    fn certificate(&self, url: &str) -> Result<Vec<Vec<u8>>>;
}
