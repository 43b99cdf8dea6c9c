use serde::{Deserialize, Serialize};

use crate::error::SelectionError;

/// Longest write-in accepted, in characters.
pub const MAX_WRITE_IN_LEN: usize = 256;

/// A single mark on the ballot: either a listed option or a write-in.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SelectionWire", into = "SelectionWire")]
pub struct Selection {
    pub contest_id: String,
    pub choice: Choice,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Choice {
    Option(String),
    WriteIn(String),
}

impl Selection {
    pub fn option(contest_id: impl Into<String>, option_id: impl Into<String>) -> Self {
        Self {
            contest_id: contest_id.into(),
            choice: Choice::Option(option_id.into()),
        }
    }

    pub fn write_in(contest_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            contest_id: contest_id.into(),
            choice: Choice::WriteIn(name.into()),
        }
    }
}

/// Flat JSON form: `{contestId, optionId}` or `{contestId, writeIn}`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SelectionWire {
    contest_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    option_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    write_in: Option<String>,
}

impl TryFrom<SelectionWire> for Selection {
    type Error = SelectionError;

    fn try_from(wire: SelectionWire) -> Result<Self, Self::Error> {
        let choice = match (wire.option_id, wire.write_in) {
            (Some(option), None) => Choice::Option(option),
            (None, Some(name)) => Choice::WriteIn(name),
            _ => return Err(SelectionError::Ambiguous),
        };
        Ok(Self {
            contest_id: wire.contest_id,
            choice,
        })
    }
}

impl From<Selection> for SelectionWire {
    fn from(selection: Selection) -> Self {
        let (option_id, write_in) = match selection.choice {
            Choice::Option(option) => (Some(option), None),
            Choice::WriteIn(name) => (None, Some(name)),
        };
        Self {
            contest_id: selection.contest_id,
            option_id,
            write_in,
        }
    }
}

/// Check the shape of a write-in, independent of any contest rules.
pub fn check_write_in(contest_id: &str, name: &str) -> Result<(), SelectionError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed != name || name.chars().count() > MAX_WRITE_IN_LEN {
        return Err(SelectionError::BadWriteIn(contest_id.to_string()));
    }
    Ok(())
}
