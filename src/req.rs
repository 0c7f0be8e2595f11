use std::time::Duration;

use crate::acme::api::ApiProblem;

pub(crate) type ReqResult<T> = std::result::Result<T, ApiProblem>;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking HTTP agent shared by the ACME and DNS provider clients.
pub(crate) fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(TIMEOUT)
        .timeout_read(TIMEOUT)
        .timeout_write(TIMEOUT)
        .build()
}

pub(crate) fn req_get(agent: &ureq::Agent, url: &str) -> Result<ureq::Response, ureq::Error> {
    let res = agent.get(url).call();
    trace!("GET {} {:?}", url, res.as_ref().map(|r| r.status()));
    res
}

pub(crate) fn req_head(agent: &ureq::Agent, url: &str) -> Result<ureq::Response, ureq::Error> {
    let res = agent.head(url).call();
    trace!("HEAD {} {:?}", url, res.as_ref().map(|r| r.status()));
    res
}

pub(crate) fn req_post(
    agent: &ureq::Agent,
    url: &str,
    body: &str,
) -> Result<ureq::Response, ureq::Error> {
    let res = agent
        .post(url)
        .set("content-type", "application/jose+json")
        .send_string(body);
    trace!("POST {} {:?} {}", url, res.as_ref().map(|r| r.status()), body);
    res
}

/// Turn error responses into an [`ApiProblem`], deserializing
/// `application/problem+json` bodies where the server sent one.
///
/// [`ApiProblem`]: ../acme/api/struct.ApiProblem.html
pub(crate) fn req_handle_error(
    res: Result<ureq::Response, ureq::Error>,
) -> ReqResult<ureq::Response> {
    match res {
        // ok responses pass through
        Ok(res) => Ok(res),

        Err(ureq::Error::Status(status, res)) => {
            let problem = if res.content_type() == "application/problem+json" {
                // if we were sent a problem+json, deserialize it
                let body = req_safe_read_body(res);
                serde_json::from_str(&body).unwrap_or_else(|e| ApiProblem {
                    kind: "problemJsonFail".into(),
                    detail: Some(format!(
                        "Failed to deserialize application/problem+json ({}) body: {}",
                        e, body
                    )),
                    subproblems: None,
                })
            } else {
                // some other problem
                let status = format!("{} {}", status, res.status_text());
                let body = req_safe_read_body(res);
                ApiProblem {
                    kind: "httpReqError".into(),
                    detail: Some(format!("{} body: {}", status, body)),
                    subproblems: None,
                }
            };
            Err(problem)
        }

        Err(ureq::Error::Transport(t)) => Err(ApiProblem {
            kind: "httpTransport".into(),
            detail: Some(t.to_string()),
            subproblems: None,
        }),
    }
}

pub(crate) fn req_expect_header(res: &ureq::Response, name: &str) -> ReqResult<String> {
    res.header(name)
        .map(|v| v.to_string())
        .ok_or_else(|| ApiProblem {
            kind: format!("Missing header: {}", name),
            detail: None,
            subproblems: None,
        })
}

pub(crate) fn req_safe_read_body(res: ureq::Response) -> String {
    res.into_string().unwrap_or_default()
}
