//! Agent roster — the `agentId → endpoint` lookup injected into the
//! scheduler.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// One reachable worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    /// Base URL; the invoker POSTs to `{endpoint}/api/chat`.
    pub endpoint: String,
    /// Working directory forwarded to the agent with every request.
    #[serde(default)]
    pub working_directory: String,
    /// Opaque credential blob forwarded verbatim as `claudeAuth`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_auth: Option<serde_json::Value>,
}

/// Lookup table of known worker agents.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentInfo>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentInfo>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    /// Parse a roster from a JSON array of agent entries.
    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        let agents: Vec<AgentInfo> =
            serde_json::from_str(json).map_err(|e| AgentError::Roster(e.to_string()))?;
        Ok(Self::new(agents))
    }

    /// Load a roster file.
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Roster(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentInfo> {
        self.agents.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_from_json() {
        let registry = AgentRegistry::from_json(
            r#"[
                {"id": "a1", "endpoint": "http://localhost:9001", "workingDirectory": "/work"},
                {"id": "a2", "endpoint": "http://localhost:9002"}
            ]"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a1").unwrap().working_directory, "/work");
        assert_eq!(registry.get("a2").unwrap().working_directory, "");
        assert!(registry.get("a3").is_none());
    }

    #[test]
    fn invalid_roster_is_an_error() {
        assert!(AgentRegistry::from_json("not json").is_err());
        assert!(AgentRegistry::from_json(r#"{"id": "missing-array"}"#).is_err());
    }
}
