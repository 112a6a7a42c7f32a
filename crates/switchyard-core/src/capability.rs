use crate::error::SwitchyardError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named skill an agent can declare.
///
/// The set is closed: unknown names are rejected when parsed, so routing
/// never dispatches on a misspelled string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Turn a natural-language question into SQL.
    GenerateSql,
    /// Check that a statement parses.
    ValidateSyntax,
    /// Run a statement inside the sandbox.
    ExecuteQuery,
    /// Describe tables and columns.
    IntrospectSchema,
    /// Propose a cheaper equivalent statement.
    OptimizeQuery,
    /// Describe a result set in prose.
    ExplainResults,
    /// Condense a payload.
    Summarize,
}

impl Capability {
    /// Every known capability, in declaration order.
    pub const ALL: [Capability; 7] = [
        Capability::GenerateSql,
        Capability::ValidateSyntax,
        Capability::ExecuteQuery,
        Capability::IntrospectSchema,
        Capability::OptimizeQuery,
        Capability::ExplainResults,
        Capability::Summarize,
    ];

    /// Canonical kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::GenerateSql => "generate-sql",
            Capability::ValidateSyntax => "validate-syntax",
            Capability::ExecuteQuery => "execute-query",
            Capability::IntrospectSchema => "introspect-schema",
            Capability::OptimizeQuery => "optimize-query",
            Capability::ExplainResults => "explain-results",
            Capability::Summarize => "summarize",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase().replace('_', "-");
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == name)
            .ok_or_else(|| SwitchyardError::Validation(format!("Unknown capability: '{s}'")))
    }
}
