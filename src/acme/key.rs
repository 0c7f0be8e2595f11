use openssl::ec::EcKey;
use openssl::pkey;

use crate::cert::EC_GROUP_P256;
use crate::{Error, Result};

/// The P-256 account key and, once the CA told us, its key id.
#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    private_key: EcKey<pkey::Private>,
    /// set once we contacted the ACME API to figure out the key id
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn new() -> Result<AcmeKey> {
        let pri_key = EcKey::generate(&*EC_GROUP_P256)?;
        Ok(Self::from_key(pri_key))
    }

    pub(crate) fn from_pem(pem: &[u8]) -> Result<AcmeKey> {
        let pri_key = EcKey::private_key_from_pem(pem)
            .map_err(|e| Error::Config(format!("account key is not a PEM EC key: {}", e)))?;
        Ok(Self::from_key(pri_key))
    }

    fn from_key(private_key: EcKey<pkey::Private>) -> AcmeKey {
        AcmeKey {
            private_key,
            key_id: None,
        }
    }

    pub(crate) fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.private_key.private_key_to_pem()?)
    }

    pub(crate) fn private_key(&self) -> &EcKey<pkey::Private> {
        &self.private_key
    }

    pub(crate) fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pem_round_trip() -> Result<()> {
        let key = AcmeKey::new()?;
        let pem = key.to_pem()?;
        let again = AcmeKey::from_pem(&pem)?;
        assert_eq!(again.to_pem()?, pem);
        assert!(again.key_id().is_none());
        assert!(AcmeKey::from_pem(b"nope").is_err());
        Ok(())
    }
}
