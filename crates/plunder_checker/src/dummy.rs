use crate::{Checker, CheckerError, Verdict, VerdictStatus};
use async_trait::async_trait;
use rand::Rng;

/// Accepts every submission with a random verdict. Useful for exercising
/// the pipeline before a competition starts.
pub(crate) struct DummyChecker;

#[async_trait]
impl Checker for DummyChecker {
    async fn submit(
        &self,
        _host: &str,
        _team_token: &str,
        flag_codes: &[String],
    ) -> Result<Vec<Verdict>, CheckerError> {
        let verdicts = flag_codes
            .iter()
            .map(|code| Verdict {
                flag_code: code.clone(),
                status: gen_verdict_status(),
                msg: String::new(),
            })
            .collect();
        Ok(verdicts)
    }
}

fn gen_verdict_status() -> VerdictStatus {
    let mut rng = rand::thread_rng();
    let r = rng.gen_range(0..=99);
    match r {
        0..=69 => VerdictStatus::Accepted,
        70..=89 => VerdictStatus::Denied,
        90..=99 => VerdictStatus::Error,
        _ => unreachable!(),
    }
}
