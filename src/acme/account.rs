//
use openssl::x509::X509;
use std::sync::Arc;
use std::thread;

use crate::acme::api::{
    ApiAccount, ApiAuth, ApiChallenge, ApiDirectory, ApiEmptyObject, ApiEmptyString, ApiFinalize,
    ApiIdentifier, ApiOrder,
};
use crate::acme::jwt::key_authorization;
use crate::acme::trans::Transport;
use crate::acme::{AcmeProvider, OrderRef};
use crate::config::PollSettings;
use crate::req::req_expect_header;
use crate::util::{base64url, read_json};
use crate::{Error, Result};

#[derive(Clone)]
pub(crate) struct AccountInner {
    pub transport: Transport,
    pub realm: String,
    pub api_account: ApiAccount,
    pub api_directory: ApiDirectory,
    pub poll: PollSettings,
}

/// Account with an ACME provider.
///
/// Accounts are created using [`Directory::account_with_realm`] and consist of
/// optional contacts and a private key for signing requests to the ACME API.
///
/// The account key is an elliptic curve P-256 key. This does not affect which
/// key algorithms can be used for the issued certificates.
///
/// [`Directory::account_with_realm`]: struct.Directory.html#method.account_with_realm
#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    pub(crate) fn new(
        transport: Transport,
        realm: &str,
        api_account: ApiAccount,
        api_directory: ApiDirectory,
        poll: PollSettings,
    ) -> Self {
        Account {
            inner: Arc::new(AccountInner {
                transport,
                realm: realm.into(),
                api_account,
                api_directory,
                poll,
            }),
        }
    }

    /// Private key for this account.
    pub fn acme_private_key_pem(&self) -> Result<String> {
        let pem = self.inner.transport.acme_key().to_pem()?;
        String::from_utf8(pem).map_err(|e| Error::Other(e.to_string()))
    }

    /// The account url (key id) assigned by the CA.
    pub fn key_id(&self) -> &str {
        self.inner.transport.acme_key().key_id().unwrap_or("")
    }

    pub fn realm(&self) -> &str {
        &self.inner.realm
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_account(&self) -> &ApiAccount {
        &self.inner.api_account
    }

    /// POST-as-GET
    fn fetch(&self, url: &str) -> Result<ureq::Response> {
        self.inner.transport.call(url, &ApiEmptyString)
    }

    /// Poll the order while `keep_waiting` holds for it, at most
    /// `poll.max_attempts` times.
    fn poll_order<F: Fn(&ApiOrder) -> bool>(&self, url: &str, keep_waiting: F) -> Result<ApiOrder> {
        let poll = &self.inner.poll;
        let mut order = self.order(url)?;
        let mut attempts = 1;
        while keep_waiting(&order) {
            if attempts >= poll.max_attempts {
                return Err(Error::PollTimeout {
                    url: url.to_string(),
                    status: order.status().to_string(),
                });
            }
            trace!("Order {} is {}, waiting", url, order.status());
            thread::sleep(poll.delay);
            order = self.order(url)?;
            attempts += 1;
        }
        Ok(order)
    }
}

impl AcmeProvider for Account {
    fn new_order(&self, domains: &[&str]) -> Result<OrderRef> {
        let order = ApiOrder {
            identifiers: domains.iter().map(|d| ApiIdentifier::dns(d)).collect(),
            ..Default::default()
        };

        let new_order_url = &self.inner.api_directory.new_order;

        let res = self.inner.transport.call(new_order_url, &order)?;
        let url = req_expect_header(&res, "location")?;
        let order: ApiOrder = read_json(res)?;
        info!("Created order {} for {}", url, domains.join(", "));
        Ok(OrderRef { url, order })
    }

    fn authorization(&self, url: &str) -> Result<ApiAuth> {
        read_json(self.fetch(url)?)
    }

    fn dns_proof(&self, token: &str) -> Result<String> {
        key_authorization(token, self.inner.transport.acme_key(), true)
    }

    fn accept_challenge(&self, url: &str) -> Result<ApiChallenge> {
        let res = self.inner.transport.call(url, &ApiEmptyObject)?;
        let chall: ApiChallenge = read_json(res)?;
        debug!("Challenge {} is {}", url, chall.status);
        Ok(chall)
    }

    fn order(&self, url: &str) -> Result<ApiOrder> {
        read_json(self.fetch(url)?)
    }

    fn wait_order(&self, url: &str) -> Result<ApiOrder> {
        self.poll_order(url, |o| o.is_status_pending() || o.is_status_processing())
    }

    fn finalize_order(
        &self,
        order_url: &str,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<ApiOrder> {
        let finalize = ApiFinalize {
            csr: base64url(csr_der),
        };
        // if the CSR is invalid, we get a 4xx code back
        self.inner.transport.call(finalize_url, &finalize)?;

        // valid -> cert is issued
        // invalid -> the whole thing is off
        let order = self.poll_order(order_url, |o| {
            o.is_status_processing() || o.is_status_ready()
        })?;
        if !order.is_status_valid() {
            return Err(Error::OrderInvalid {
                url: order_url.to_string(),
                problem: order.problem(),
            });
        }
        Ok(order)
    }

    fn certificate(&self, url: &str) -> Result<Vec<Vec<u8>>> {
        let pem = self.fetch(url)?.into_string()?;
        let chain = X509::stack_from_pem(pem.as_bytes())?;
        if chain.is_empty() {
            return Err(Error::Other(format!("no certificate at {}", url)));
        }
        chain
            .iter()
            .map(|c| c.to_der().map_err(Error::from))
            .collect()
    }
}
