//! Policy result codes
//!
//! Every module call, literal and processing section evaluates to one of
//! these codes. The set is closed so that default-action tables can be total.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown result code: {0}")]
pub struct RCodeParseError(pub String);

/// Result of executing a piece of policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RCode {
    /// Immediately reject the request
    Reject,
    /// Module failed, don't reply
    Fail,
    /// The module is OK, continue
    Ok,
    /// The module handled the request, so stop
    Handled,
    /// The module considers the request invalid
    Invalid,
    /// Reject the request (user is locked out)
    Disallow,
    /// User not found
    NotFound,
    /// Module succeeded without doing anything
    Noop,
    /// OK (pairs modified)
    Updated,
}

impl RCode {
    /// Number of distinct result codes
    pub const COUNT: usize = 9;

    /// All result codes, in table order
    pub const ALL: [RCode; RCode::COUNT] = [
        RCode::Reject,
        RCode::Fail,
        RCode::Ok,
        RCode::Handled,
        RCode::Invalid,
        RCode::Disallow,
        RCode::NotFound,
        RCode::Noop,
        RCode::Updated,
    ];

    /// Position of this code in per-code tables
    pub const fn index(self) -> usize {
        match self {
            RCode::Reject => 0,
            RCode::Fail => 1,
            RCode::Ok => 2,
            RCode::Handled => 3,
            RCode::Invalid => 4,
            RCode::Disallow => 5,
            RCode::NotFound => 6,
            RCode::Noop => 7,
            RCode::Updated => 8,
        }
    }

    /// Policy keyword for this code
    pub const fn as_str(self) -> &'static str {
        match self {
            RCode::Reject => "reject",
            RCode::Fail => "fail",
            RCode::Ok => "ok",
            RCode::Handled => "handled",
            RCode::Invalid => "invalid",
            RCode::Disallow => "disallow",
            RCode::NotFound => "notfound",
            RCode::Noop => "noop",
            RCode::Updated => "updated",
        }
    }

    /// Look up a code by its policy keyword
    pub fn from_keyword(word: &str) -> Option<RCode> {
        RCode::ALL.into_iter().find(|code| code.as_str() == word)
    }

    /// Codes which let processing continue normally
    pub fn is_success(self) -> bool {
        matches!(self, RCode::Ok | RCode::Updated | RCode::Noop | RCode::Handled)
    }
}

impl fmt::Display for RCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RCode {
    type Err = RCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RCode::from_keyword(s).ok_or_else(|| RCodeParseError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_table_order() {
        for (i, code) in RCode::ALL.iter().enumerate() {
            assert_eq!(code.index(), i);
        }
    }

    #[test]
    fn test_keywords() {
        assert_eq!("notfound".parse::<RCode>().unwrap(), RCode::NotFound);
        assert_eq!(RCode::Updated.to_string(), "updated");
        assert!("accept".parse::<RCode>().is_err());
        assert_eq!(RCode::from_keyword("reject"), Some(RCode::Reject));
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&RCode::NotFound).unwrap();
        assert_eq!(json, "\"notfound\"");
        let code: RCode = serde_json::from_str("\"handled\"").unwrap();
        assert_eq!(code, RCode::Handled);
    }

    #[test]
    fn test_success_codes() {
        assert!(RCode::Ok.is_success());
        assert!(!RCode::Reject.is_success());
        assert!(!RCode::Fail.is_success());
    }
}
