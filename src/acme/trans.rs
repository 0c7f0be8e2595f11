use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::acme::jwt::{sign, Jwk, Jws, JwsProtected};
use crate::acme::key::AcmeKey;
use crate::req::{req_expect_header, req_handle_error, req_head, req_post};
use crate::util::base64url;
use crate::{Error, Result};

// A CA that keeps rejecting nonces is broken, not busy.
const MAX_NONCE_RETRIES: usize = 5;

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against newAccount url
/// 3. `set_key_id` from the returned `Location` header.
/// 4. `call()` for all calls after that.
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    acme_key: AcmeKey,
    agent: ureq::Agent,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub fn new(nonce_pool: &Arc<NoncePool>, agent: ureq::Agent, acme_key: AcmeKey) -> Self {
        Transport {
            acme_key,
            agent,
            nonce_pool: nonce_pool.clone(),
        }
    }

    /// Update the key id once it is known (part of setting up the transport).
    pub fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    /// The key used in the transport
    pub fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// Make call using the full jwk. Only for the newAccount request.
    pub fn call_jwk<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<ureq::Response> {
        self.do_call(url, body, jws_with_jwk)
    }

    /// Make call using the key id
    pub fn call<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<ureq::Response> {
        self.do_call(url, body, jws_with_kid)
    }

    fn do_call<T: Serialize + ?Sized, F: Fn(&str, String, &AcmeKey, &T) -> Result<String>>(
        &self,
        url: &str,
        body: &T,
        make_body: F,
    ) -> Result<ureq::Response> {
        // The ACME API may at any point invalidate all nonces. If we detect such an
        // error, we retry with a fresh nonce.
        let mut retries = 0;
        loop {
            // Either get a new nonce, or reuse one from a previous request.
            let nonce = self.nonce_pool.get_nonce(&self.agent)?;

            // Sign the body.
            let body = make_body(url, nonce, &self.acme_key, body)?;

            debug!("Call endpoint {}", url);

            // Post it to the URL
            let response = req_post(&self.agent, url, &body);

            // Regardless of the request being a success or not, there might be
            // a nonce in the response.
            self.nonce_pool.extract_nonce(&response);

            // Turn errors into ApiProblem.
            let result = req_handle_error(response);

            if let Err(problem) = &result {
                if problem.is_bad_nonce() && retries < MAX_NONCE_RETRIES {
                    retries += 1;
                    debug!("Retrying on bad nonce ({})", retries);
                    continue;
                }
            }

            return Ok(result?);
        }
    }
}

/// Shared pool of nonces.
#[derive(Debug)]
pub(crate) struct NoncePool {
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub fn new(nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.into(),
            pool: Default::default(),
        }
    }

    fn extract_nonce(&self, res: &std::result::Result<ureq::Response, ureq::Error>) {
        let res = match res {
            Ok(res) => res,
            Err(ureq::Error::Status(_, res)) => res,
            Err(_) => return,
        };
        if let Some(nonce) = res.header("replay-nonce") {
            trace!("Extract nonce");
            if let Ok(mut pool) = self.pool.lock() {
                pool.push_back(nonce.to_string());
                if pool.len() > 10 {
                    pool.pop_front();
                }
            }
        }
    }

    fn get_nonce(&self, agent: &ureq::Agent) -> Result<String> {
        if let Ok(mut pool) = self.pool.lock() {
            if let Some(nonce) = pool.pop_front() {
                trace!("Use previous nonce");
                return Ok(nonce);
            }
        }
        debug!("Request new nonce");
        let res = req_handle_error(req_head(agent, &self.nonce_url))?;
        Ok(req_expect_header(&res, "replay-nonce")?)
    }
}

fn jws_with_kid<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let kid = key
        .key_id()
        .ok_or_else(|| Error::Other("account key id is not known yet".into()))?;
    let protected = JwsProtected::new_kid(kid, url, nonce);
    jws_with(protected, key, payload)
}

fn jws_with_jwk<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let jwk = Jwk::of(key)?;
    let protected = JwsProtected::new_jwk(jwk, url, nonce);
    jws_with(protected, key, payload)
}

fn jws_with<T: Serialize + ?Sized>(
    protected: JwsProtected,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let protected = {
        let pro_json = serde_json::to_string(&protected)?;
        base64url(pro_json.as_bytes())
    };
    let payload = {
        let pay_json = serde_json::to_string(payload)?;
        if pay_json == "\"\"" {
            // This is a special case produced by ApiEmptyString and should
            // not be further base64url encoded.
            "".to_string()
        } else {
            base64url(pay_json.as_bytes())
        }
    };

    let signature = sign(key, &protected, &payload)?;
    let jws = Jws::new(protected, payload, signature);

    Ok(serde_json::to_string(&jws)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acme::api::ApiEmptyString;

    #[test]
    fn test_post_as_get_has_empty_payload() -> Result<()> {
        let key = AcmeKey::new()?;
        let body = jws_with_jwk("https://ca/x", "nonce".into(), &key, &ApiEmptyString)?;
        let v: serde_json::Value = serde_json::from_str(&body)?;
        assert_eq!(v["payload"], "");
        assert!(!v["protected"].as_str().unwrap_or("").is_empty());
        Ok(())
    }

    #[test]
    fn test_kid_required() -> Result<()> {
        let mut key = AcmeKey::new()?;
        assert!(jws_with_kid("https://ca/x", "n".into(), &key, &ApiEmptyString).is_err());
        key.set_key_id("https://ca/acct/1".into());
        jws_with_kid("https://ca/x", "n".into(), &key, &ApiEmptyString)?;
        Ok(())
    }
}
