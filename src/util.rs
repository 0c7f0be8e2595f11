use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::Result;

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

pub(crate) fn read_json<T: DeserializeOwned>(res: ureq::Response) -> Result<T> {
    let res_body = res.into_string()?;
    debug!("{}", res_body);
    Ok(serde_json::from_str(&res_body)?)
}

/// Parse an RFC 3339 timestamp as sent by the ACME API. Unparseable values
/// are treated as absent.
pub(crate) fn parse_timestamp(s: Option<&str>) -> Option<OffsetDateTime> {
    let s = s?;
    match OffsetDateTime::parse(s, &Rfc3339) {
        Ok(t) => Some(t),
        Err(e) => {
            warn!("Ignore unparseable timestamp {:?}: {}", s, e);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_base64url_has_no_padding() {
        assert_eq!(base64url(b"a"), "YQ");
        assert_eq!(base64url(&[0xfb, 0xff]), "-_8");
    }

    #[test]
    fn test_parse_timestamp() {
        let t = parse_timestamp(Some("2019-01-09T08:26:43Z")).unwrap();
        assert_eq!(t.unix_timestamp(), 1547022403);
        assert!(parse_timestamp(Some("yesterday")).is_none());
        assert!(parse_timestamp(None).is_none());
    }
}
