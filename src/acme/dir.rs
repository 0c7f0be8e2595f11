//
use std::sync::Arc;

use crate::acme::account::Account;
use crate::acme::api::{ApiAccount, ApiDirectory, Status};
use crate::acme::key::AcmeKey;
use crate::acme::trans::{NoncePool, Transport};
use crate::config::PollSettings;
use crate::persist::{Persist, PersistKey, PersistKind};
use crate::req::{agent, req_expect_header, req_get, req_handle_error};
use crate::util::read_json;
use crate::{Error, Result};

const LETSENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory. Not appropriate for testing and dev.
    LetsEncrypt,
    /// The staging Let's Encrypt directory. Use for testing and dev. Doesn't issue
    /// "valid" certificates. The root signing certificate is not supposed
    /// to be in any trust chains.
    LetsEncryptStaging,
    /// Provide an arbitrary director URL to connect to.
    Other(&'a str),
}

impl<'a> DirectoryUrl<'a> {
    pub fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING,
            DirectoryUrl::Other(s) => s,
        }
    }
}

/// Entry point for accessing an ACME API.
#[derive(Clone)]
pub struct Directory<P: Persist> {
    persist: P,
    agent: ureq::Agent,
    nonce_pool: Arc<NoncePool>,
    api_directory: ApiDirectory,
    poll: PollSettings,
}

impl<P: Persist> Directory<P> {
    /// Create a directory over a persistence implementation and directory url.
    ///
    /// The persistence holds the account key.
    pub fn from_url(persist: P, url: DirectoryUrl, poll: PollSettings) -> Result<Directory<P>> {
        let agent = agent();
        let dir_url = url.to_url();
        debug!("Read directory {}", dir_url);
        let res = req_handle_error(req_get(&agent, dir_url))?;
        let api_directory: ApiDirectory = read_json(res)?;
        let nonce_pool = Arc::new(NoncePool::new(&api_directory.new_nonce));
        Ok(Directory {
            persist,
            agent,
            nonce_pool,
            api_directory,
            poll,
        })
    }

    /// Access the account persisted under `realm`, creating key and account
    /// when they don't exist yet.
    ///
    /// If a persisted private key exists for the `realm`, it will be read
    /// and used for further access. This way we reuse the same ACME API account.
    ///
    /// If one doesn't exist, it is created and the corresponding public key is
    /// uploaded to the ACME API thus creating the account.
    ///
    /// Either way the `newAccount` API endpoint is called and thereby ensures the
    /// account is active and working.
    pub fn account_with_realm(&self, realm: &str, contact: Vec<String>) -> Result<Account> {
        // key in persistence for acme account private key
        let pem_key = PersistKey::new(PersistKind::AccountPrivateKey, realm);

        let (acme_key, is_new) = match self.persist.get(&pem_key)? {
            Some(pem) => {
                // we got a persisted private key. read it.
                debug!("Read persisted acme account key {}", pem_key);
                (AcmeKey::from_pem(&pem)?, false)
            }
            None => {
                debug!("Create new acme account key");
                (AcmeKey::new()?, true)
            }
        };

        // Prepare making a call to newAccount. This is fine to do both for
        // new keys and existing. For existing RFC 8555 says to return a 200
        // with the Location header set to the key id (kid).
        let acc = ApiAccount {
            contact: if contact.is_empty() { None } else { Some(contact) },
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        let account = self.new_account(realm, acme_key, &acc)?;

        // If we did create a new key, save it back to the persistence.
        if is_new {
            debug!("Persist acme account key {}", pem_key);
            let pem = account.acme_private_key_pem()?;
            self.persist.put(&pem_key, pem.as_bytes())?;
        }

        Ok(account)
    }

    /// Access the account persisted under `realm` without creating
    /// anything. Fails if there is no persisted key or the CA does not know
    /// the key.
    pub fn existing_account(&self, realm: &str) -> Result<Account> {
        let pem_key = PersistKey::new(PersistKind::AccountPrivateKey, realm);
        let pem = self.persist.get(&pem_key)?.ok_or_else(|| {
            Error::Config(format!(
                "no account key {}, create the account first",
                pem_key
            ))
        })?;
        let acme_key = AcmeKey::from_pem(&pem)?;
        let acc = ApiAccount {
            only_return_existing: Some(true),
            ..Default::default()
        };
        self.new_account(realm, acme_key, &acc)
    }

    fn new_account(&self, realm: &str, acme_key: AcmeKey, acc: &ApiAccount) -> Result<Account> {
        let mut transport = Transport::new(&self.nonce_pool, self.agent.clone(), acme_key);
        let res = transport.call_jwk(&self.api_directory.new_account, acc)?;
        let kid = req_expect_header(&res, "location")?;
        debug!("Key id is: {}", kid);
        // fill in the server returned key id
        transport.set_key_id(kid);

        let api_account: ApiAccount = read_json(res)?;
        if api_account.status() != Status::Valid {
            return Err(Error::Other(format!(
                "account {} has status {}",
                realm,
                api_account.status()
            )));
        }

        Ok(Account::new(
            transport,
            realm,
            api_account,
            self.api_directory.clone(),
            self.poll.clone(),
        ))
    }

    /// Access the underlying JSON object for debugging.
    pub fn api_directory(&self) -> &ApiDirectory {
        &self.api_directory
    }
}
