//! A minimal rule-scripting engine (§10.5): one `allow`/`deny` directive per
//! line, matching a domain-name suffix or a CIDR. This is the predicate the
//! fake-IP egress path consults to decide whether a DNS answer should be
//! rewritten at all (§4.5) — not a reimplementation of the source rule
//! grammar's full feature set, which is explicitly out of scope (§1).
//!
//! Grammar, one directive per line:
//! ```text
//! # comment
//! allow example.com
//! deny ads.example.com
//! allow 10.0.0.0/8
//! deny 198.18.0.0/15
//! ```
//! Rules are evaluated in file order; the last matching rule wins. A name or
//! IP that matches nothing is allowed (not excluded) by default.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rule script {0:?}: {1}")]
    Read(String, std::io::Error),
    #[error("malformed rule at line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

#[derive(Debug, Clone)]
enum Rule {
    AllowSuffix(String),
    DenySuffix(String),
    AllowCidr(Ipv4Net),
    DenyCidr(Ipv4Net),
}

#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn empty() -> Self {
        Self::default()
    }

    pub async fn load(path: &str) -> Result<Self, RuleError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RuleError::Read(path.to_string(), e))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, RuleError> {
        let mut rules = Vec::new();
        for (idx, raw_line) in contents.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let directive = parts.next().unwrap_or("");
            let target = parts.next().unwrap_or("");
            if target.is_empty() || parts.next().is_some() {
                return Err(RuleError::Malformed {
                    line: idx + 1,
                    text: raw_line.to_string(),
                });
            }
            let rule = if let Ok(cidr) = target.parse::<Ipv4Net>() {
                match directive {
                    "allow" => Rule::AllowCidr(cidr),
                    "deny" => Rule::DenyCidr(cidr),
                    _ => {
                        return Err(RuleError::Malformed {
                            line: idx + 1,
                            text: raw_line.to_string(),
                        })
                    }
                }
            } else {
                match directive {
                    "allow" => Rule::AllowSuffix(target.to_ascii_lowercase()),
                    "deny" => Rule::DenySuffix(target.to_ascii_lowercase()),
                    _ => {
                        return Err(RuleError::Malformed {
                            line: idx + 1,
                            text: raw_line.to_string(),
                        })
                    }
                }
            };
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// `true` if `name`/`ip` should be excluded from fake-IP rewriting
    /// (§4.5: "whose name/ip is not excluded by the configured rule
    /// script"). Rules are evaluated in order; the last match wins.
    pub fn excluded(&self, name: &str, ip: Ipv4Addr) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let mut excluded = false;
        for rule in &self.rules {
            match rule {
                Rule::AllowSuffix(suffix) if name.ends_with(suffix.as_str()) => excluded = false,
                Rule::DenySuffix(suffix) if name.ends_with(suffix.as_str()) => excluded = true,
                Rule::AllowCidr(net) if net.contains(&ip) => excluded = false,
                Rule::DenyCidr(net) if net.contains(&ip) => excluded = true,
                _ => {}
            }
        }
        excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_allow() {
        let engine = RuleEngine::empty();
        assert!(!engine.excluded("example.com", "1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn deny_suffix_excludes_matching_names() {
        let engine = RuleEngine::parse("deny ads.example.com\n").unwrap();
        assert!(engine.excluded("ads.example.com", "1.2.3.4".parse().unwrap()));
        assert!(engine.excluded("sub.ads.example.com", "1.2.3.4".parse().unwrap()));
        assert!(!engine.excluded("example.com", "1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn later_rule_overrides_earlier_one() {
        let engine = RuleEngine::parse("deny example.com\nallow example.com\n").unwrap();
        assert!(!engine.excluded("example.com", "1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn cidr_rule_matches_by_ip() {
        let engine = RuleEngine::parse("deny 10.0.0.0/8\n").unwrap();
        assert!(engine.excluded("anything.invalid", "10.1.2.3".parse().unwrap()));
        assert!(!engine.excluded("anything.invalid", "192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(RuleEngine::parse("nonsense").is_err());
    }
}
