use crate::{Checker, CheckerError, Verdict, VerdictStatus};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// The reference HTTP protocol: flags are submitted with a PUT request to
/// `http://<host>/flags` as a JSON array of strings, authenticated with the
/// `X-Team-Token` header. The checker answers with one verdict per flag.
pub(crate) struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub(crate) fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0) // some checkers misbehave with reused connections
            .build()
            .expect("unable to construct reqwest client");
        Self { client }
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn submit(
        &self,
        host: &str,
        team_token: &str,
        flag_codes: &[String],
    ) -> Result<Vec<Verdict>, CheckerError> {
        let url = format!("http://{host}/flags");
        let response = self
            .client
            .put(&url)
            .header("X-Team-Token", team_token)
            .json(flag_codes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckerError::BadStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        let responses: Vec<FlagResponse> =
            serde_json::from_slice(&body).map_err(CheckerError::FormatError)?;

        debug!(count = responses.len(), "received checker verdicts");
        Ok(responses.into_iter().map(Verdict::from).collect())
    }
}

#[derive(Deserialize, Debug)]
struct FlagResponse {
    flag: String,
    status: String,
    msg: String,
}

impl From<FlagResponse> for Verdict {
    fn from(response: FlagResponse) -> Self {
        let status = match response.status.as_str() {
            "ACCEPTED" => VerdictStatus::Accepted,
            "DENIED" => VerdictStatus::Denied,
            "ERROR" => VerdictStatus::Error,
            other => VerdictStatus::Unknown(other.to_string()),
        };
        Verdict {
            flag_code: response.flag,
            status,
            msg: strip_flag_prefix(&response.msg).to_string(),
        }
    }
}

/// The checker prefixes every message with the echoed flag in brackets,
/// e.g. `[FLAG{..}] invalid flag`. Strip it, keep the rest.
fn strip_flag_prefix(msg: &str) -> &str {
    match msg.split_once(']') {
        Some((_, rest)) => rest.trim_start(),
        None => msg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_deserialize_checker_response() {
        const BODY: &str = r#"[
            {"flag":"FLAG{a}","status":"ACCEPTED","msg":"[FLAG{a}] flag claimed"},
            {"flag":"FLAG{b}","status":"DENIED","msg":"[FLAG{b}] invalid flag"},
            {"flag":"FLAG{c}","status":"ERROR","msg":"service unavailable"},
            {"flag":"FLAG{d}","status":"RESUBMIT","msg":""}
        ]"#;

        let responses: Vec<FlagResponse> = serde_json::from_str(BODY).unwrap();
        let verdicts: Vec<Verdict> = responses.into_iter().map(Verdict::from).collect();

        assert_eq!(verdicts.len(), 4);
        assert_eq!(verdicts[0].status, VerdictStatus::Accepted);
        assert_eq!(verdicts[0].msg, "flag claimed");
        assert_eq!(verdicts[1].status, VerdictStatus::Denied);
        assert_eq!(verdicts[1].msg, "invalid flag");
        assert_eq!(verdicts[2].status, VerdictStatus::Error);
        assert_eq!(verdicts[2].msg, "service unavailable");
        assert_eq!(
            verdicts[3].status,
            VerdictStatus::Unknown("RESUBMIT".to_string())
        );
    }

    #[test]
    fn should_strip_flag_prefix_only_when_present() {
        assert_eq!(strip_flag_prefix("[FLAG{a}] too old"), "too old");
        assert_eq!(strip_flag_prefix("plain message"), "plain message");
    }
}
