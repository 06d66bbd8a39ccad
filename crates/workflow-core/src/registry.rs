//! Agent registry: ingests discovery-card announcements and answers
//! schema lookups for personas a node references by name.
//!
//! Single writer (the card-ingestion task), many readers; snapshot reads
//! are taken under a `std::sync::RwLock` rather than `parking_lot`, matching
//! the donor codebase's preference for stdlib/tokio sync primitives over an
//! external lock crate (see `supervisor/parallel.rs`).

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An agent discovery card, as announced on the discovery topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub skills: Vec<Value>,
    #[serde(default)]
    pub capabilities: Value,
    pub url: String,
}

/// Process-wide table of known agents, keyed by name. Readers take a
/// cloned snapshot so resolution never blocks on an in-flight card update.
#[derive(Default)]
pub struct AgentRegistry {
    cards: RwLock<HashMap<String, AgentCard>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&self, card: AgentCard) {
        self.cards.write().unwrap().insert(card.name.clone(), card);
    }

    pub fn get(&self, name: &str) -> Option<AgentCard> {
        self.cards.read().unwrap().get(name).cloned()
    }

    /// `(input_schema, output_schema)` with precedence: node override first,
    /// falling back to the agent card, else `None` for either.
    pub fn effective_schemas(
        &self,
        agent_name: &str,
        input_override: Option<&Value>,
        output_override: Option<&Value>,
    ) -> (Option<Value>, Option<Value>) {
        let card = self.get(agent_name);
        let input = input_override
            .cloned()
            .or_else(|| card.as_ref().and_then(|c| c.input_schema.clone()));
        let output = output_override
            .cloned()
            .or_else(|| card.as_ref().and_then(|c| c.output_schema.clone()));
        (input, output)
    }

    pub fn snapshot(&self) -> Vec<AgentCard> {
        self.cards.read().unwrap().values().cloned().collect()
    }
}
