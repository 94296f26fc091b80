mod build;

use serde::Serialize;

use crate::feed::UpdateKind;

pub use build::build_graph;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Peer,
    Prefix,
    Origin,
}

impl NodeType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Prefix => "prefix",
            Self::Origin => "origin",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkRelation {
    PeerPrefix,
    OriginPrefix,
    PeerOrigin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub occurrence_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphLink {
    pub source: String,
    pub target: String,
    pub kind: UpdateKind,
    pub relation: LinkRelation,
    pub occurrence_count: u32,
}

/// A complete snapshot derived from one window. Never patched in place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GraphPayload {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

#[cfg(test)]
impl GraphPayload {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

pub fn node_id(node_type: NodeType, key: &str) -> String {
    format!("{}:{key}", node_type.label())
}
