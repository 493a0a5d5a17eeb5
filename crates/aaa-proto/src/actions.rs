//! Default action tables
//!
//! A processing section carries a table saying what to do with each result
//! code returned by the policy inside it: remember it with a priority, return
//! from the section straight away, or reject. The table also names the code
//! the section produces when its policy never sets one.

use crate::rcode::RCode;
use serde::{Deserialize, Serialize};

/// What a section does with a result code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModAction {
    /// Keep the code if its priority is at least the current one
    Priority(u8),
    /// Stop the section and return the code
    Return,
    /// Stop the section and return `reject`
    Reject,
}

/// Per-code action table plus the fallback code of a section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModActions {
    actions: [ModAction; RCode::COUNT],
    default_rcode: RCode,
}

impl ModActions {
    /// Build a table from actions in [`RCode::ALL`] order
    pub const fn new(actions: [ModAction; RCode::COUNT], default_rcode: RCode) -> Self {
        ModActions {
            actions,
            default_rcode,
        }
    }

    /// Actions used by `recv` style sections
    pub const fn authorize() -> Self {
        ModActions::new(
            [
                ModAction::Return,      // reject
                ModAction::Return,      // fail
                ModAction::Priority(3), // ok
                ModAction::Return,      // handled
                ModAction::Return,      // invalid
                ModAction::Return,      // disallow
                ModAction::Priority(1), // notfound
                ModAction::Priority(2), // noop
                ModAction::Priority(4), // updated
            ],
            RCode::Noop,
        )
    }

    /// Actions used by `authenticate` sections
    pub const fn authenticate() -> Self {
        ModActions::new(
            [
                ModAction::Return,      // reject
                ModAction::Return,      // fail
                ModAction::Priority(4), // ok
                ModAction::Return,      // handled
                ModAction::Return,      // invalid
                ModAction::Return,      // disallow
                ModAction::Return,      // notfound
                ModAction::Priority(1), // noop
                ModAction::Priority(2), // updated
            ],
            RCode::Reject,
        )
    }

    /// Actions used by `send` style sections
    pub const fn post_auth() -> Self {
        ModActions::new(
            [
                ModAction::Return,      // reject
                ModAction::Return,      // fail
                ModAction::Priority(3), // ok
                ModAction::Return,      // handled
                ModAction::Return,      // invalid
                ModAction::Return,      // disallow
                ModAction::Priority(1), // notfound
                ModAction::Priority(2), // noop
                ModAction::Priority(4), // updated
            ],
            RCode::Noop,
        )
    }

    /// Same table with a different fallback code
    pub const fn with_default(mut self, rcode: RCode) -> Self {
        self.default_rcode = rcode;
        self
    }

    /// Same table with one action replaced
    pub const fn with_action(mut self, rcode: RCode, action: ModAction) -> Self {
        self.actions[rcode.index()] = action;
        self
    }

    /// Action for a result code
    pub const fn action(&self, rcode: RCode) -> ModAction {
        self.actions[rcode.index()]
    }

    /// Code returned when policy produced none
    pub const fn default_rcode(&self) -> RCode {
        self.default_rcode
    }
}
