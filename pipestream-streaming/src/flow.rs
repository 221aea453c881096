//! Flow patterns
//!
//! A flow pattern is an ordered list of hops. At each node, the hop whose
//! `source` is that node names the node types that must see the message next;
//! the hop is stripped before the message is forwarded.

use serde::{Deserialize, Serialize};

use pipestream_core::config::FlowHopConfig;

/// One hop: messages leaving `source` go to every node type in `next`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub source: String,
    pub next: Vec<String>,
}

impl Hop {
    pub fn new(source: impl Into<String>, next: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            source: source.into(),
            next: next.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&FlowHopConfig> for Hop {
    fn from(hop: &FlowHopConfig) -> Self {
        Self {
            source: hop.source.clone(),
            next: hop.next.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowPattern(Vec<Hop>);

impl FlowPattern {
    #[must_use]
    pub fn new(hops: Vec<Hop>) -> Self {
        Self(hops)
    }

    #[must_use]
    pub fn hops(&self) -> &[Hop] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn position(&self, current_node: &str) -> Option<usize> {
        self.0.iter().position(|hop| hop.source == current_node)
    }

    /// Whether `consumer_type` is a direct next hop of `current_node`.
    /// A pattern with no hop for `current_node` routes nowhere.
    #[must_use]
    pub fn is_next_hop(&self, consumer_type: &str, current_node: &str) -> bool {
        self.position(current_node)
            .is_some_and(|index| self.0[index].next.iter().any(|n| n == consumer_type))
    }

    /// Copy of the pattern without the hop of `current_node`
    #[must_use]
    pub fn remaining_flow(&self, current_node: &str) -> Self {
        let mut rest = self.clone();
        if let Some(index) = self.position(current_node) {
            rest.0.remove(index);
        }
        rest
    }
}

impl From<Vec<Hop>> for FlowPattern {
    fn from(hops: Vec<Hop>) -> Self {
        Self(hops)
    }
}

impl From<&[FlowHopConfig]> for FlowPattern {
    fn from(hops: &[FlowHopConfig]) -> Self {
        Self(hops.iter().map(Hop::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> FlowPattern {
        FlowPattern::new(vec![
            Hop::new("a", ["b", "c"]),
            Hop::new("b", ["d"]),
        ])
    }

    #[test]
    fn test_is_next_hop() {
        let flow = pattern();
        assert!(flow.is_next_hop("b", "a"));
        assert!(flow.is_next_hop("c", "a"));
        assert!(!flow.is_next_hop("d", "a"));
        assert!(flow.is_next_hop("d", "b"));
        // No hop for the current node is not an error
        assert!(!flow.is_next_hop("b", "z"));
        assert!(!FlowPattern::default().is_next_hop("b", "a"));
    }

    #[test]
    fn test_remaining_flow_strips_current_node() {
        let flow = pattern();
        let rest = flow.remaining_flow("a");

        assert_eq!(rest.hops(), &[Hop::new("b", ["d"])]);
        assert!(rest.hops().iter().all(|hop| hop.source != "a"));
        // The input pattern is left untouched
        assert_eq!(flow, pattern());
    }

    #[test]
    fn test_remaining_flow_is_noop_when_absent() {
        let rest = pattern().remaining_flow("a");
        let again = rest.remaining_flow("a");
        assert_eq!(rest, again);
        assert_eq!(pattern().remaining_flow("z"), pattern());
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(pattern()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                { "source": "a", "next": ["b", "c"] },
                { "source": "b", "next": ["d"] }
            ])
        );
        let back: FlowPattern = serde_json::from_value(json).unwrap();
        assert_eq!(back, pattern());
    }

    #[test]
    fn test_from_config() {
        let hops = vec![FlowHopConfig {
            source: "a".to_string(),
            next: vec!["b".to_string()],
        }];
        let flow = FlowPattern::from(hops.as_slice());
        assert!(flow.is_next_hop("b", "a"));
    }
}
