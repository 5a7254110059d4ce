// Agent rollup ids: "leaf", "parent/leaf", "grandparent/parent/leaf".
// "::" is accepted as a separator on input; the canonical form always uses "/".

use std::fmt;

use serde::{Deserialize, Serialize};

const SEPARATOR: &str = "/";
const ALT_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentRollupId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentRollupIdError {
    #[error("agent rollup id must not be empty")]
    Empty,
    #[error("agent rollup id {0:?} has an empty segment")]
    EmptySegment(String),
}

impl AgentRollupId {
    pub fn parse(raw: &str) -> Result<Self, AgentRollupIdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AgentRollupIdError::Empty);
        }
        let normalized = raw.replace(ALT_SEPARATOR, SEPARATOR);
        if normalized.split(SEPARATOR).any(|s| s.trim().is_empty()) {
            return Err(AgentRollupIdError::EmptySegment(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Number of segments; a top-level id has depth 1.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The direct parent grouping, or `None` for a top-level id.
    pub fn parent(&self) -> Option<AgentRollupId> {
        self.0
            .rfind(SEPARATOR)
            .map(|idx| AgentRollupId(self.0[..idx].to_string()))
    }

    /// All ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<AgentRollupId> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(id) = current {
            current = id.parent();
            out.push(id);
        }
        out
    }

    /// The last segment (display name of the node).
    pub fn name(&self) -> &str {
        self.segments().last().unwrap_or(&self.0)
    }
}

impl fmt::Display for AgentRollupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentRollupId {
    type Error = AgentRollupIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentRollupId> for String {
    fn from(value: AgentRollupId) -> Self {
        value.0
    }
}

impl std::str::FromStr for AgentRollupId {
    type Err = AgentRollupIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
