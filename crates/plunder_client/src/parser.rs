// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

use plunder_common::models::Flag;
use regex::Regex;

/// Scans exploit output for flags and wraps each match with the service
/// metadata it was captured from. Rebuilt whenever the server pushes a new
/// flag format.
pub struct FlagParser {
    format: Regex,
    service_name: String,
    service_port: u16,
}

impl FlagParser {
    pub fn new(
        format: &str,
        service_name: impl Into<String>,
        service_port: u16,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            format: Regex::new(format)?,
            service_name: service_name.into(),
            service_port,
        })
    }

    pub fn parse_line(&self, line: &str, team_id: u16) -> Vec<Flag> {
        self.format
            .find_iter(line)
            .map(|m| {
                Flag::captured(
                    m.as_str(),
                    self.service_name.clone(),
                    self.service_port,
                    team_id,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plunder_common::models::FlagStatus;

    #[test]
    fn should_extract_every_flag_on_a_line() {
        let parser = FlagParser::new(r"[A-Z0-9]{31}=", "notes", 1337).unwrap();
        let line = format!("got {}= and {}=", "A".repeat(31), "B".repeat(31));

        let flags = parser.parse_line(&line, 4);
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].flag_code, format!("{}=", "A".repeat(31)));
        assert_eq!(flags[1].flag_code, format!("{}=", "B".repeat(31)));
    }

    #[test]
    fn should_attach_the_capture_metadata() {
        let parser = FlagParser::new(r"FLAG\{[a-f0-9]+\}", "ticketer", 8080).unwrap();
        let flags = parser.parse_line("FLAG{deadbeef}", 7);

        assert_eq!(flags.len(), 1);
        let flag = &flags[0];
        assert_eq!(flag.service_name, "ticketer");
        assert_eq!(flag.port_service, 8080);
        assert_eq!(flag.team_id, 7);
        assert_eq!(flag.status, FlagStatus::Unsubmitted);
        assert!(flag.submit_time > 0);
    }

    #[test]
    fn should_ignore_lines_without_flags() {
        let parser = FlagParser::new(r"[A-Z0-9]{31}=", "notes", 1337).unwrap();
        assert!(parser.parse_line("exploit log chatter", 1).is_empty());
    }

    #[test]
    fn should_reject_an_invalid_format() {
        assert!(FlagParser::new(r"([A-Z", "notes", 1337).is_err());
    }
}
