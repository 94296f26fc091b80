use std::collections::HashMap;

use crate::feed::{CanonicalUpdate, UpdateKind};

use super::{GraphLink, GraphNode, GraphPayload, LinkRelation, NodeType, node_id};

type LinkKey = (usize, usize, LinkRelation, UpdateKind);

/// Accumulates one build. Counters live only as long as this value, so every
/// call to [`build_graph`] recomputes from scratch.
#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<GraphNode>,
    node_index: HashMap<(NodeType, String), usize>,
    links: Vec<GraphLink>,
    link_index: HashMap<LinkKey, usize>,
}

impl GraphBuilder {
    fn touch_node(&mut self, node_type: NodeType, key: &str, label: impl FnOnce() -> String) -> usize {
        if let Some(&index) = self.node_index.get(&(node_type, key.to_owned())) {
            self.nodes[index].occurrence_count += 1;
            return index;
        }

        let index = self.nodes.len();
        self.nodes.push(GraphNode {
            id: node_id(node_type, key),
            label: label(),
            node_type,
            occurrence_count: 1,
        });
        self.node_index.insert((node_type, key.to_owned()), index);
        index
    }

    fn touch_link(&mut self, source: usize, target: usize, relation: LinkRelation, kind: UpdateKind) {
        let key = (source, target, relation, kind);
        if let Some(&index) = self.link_index.get(&key) {
            self.links[index].occurrence_count += 1;
            return;
        }

        self.link_index.insert(key, self.links.len());
        self.links.push(GraphLink {
            source: self.nodes[source].id.clone(),
            target: self.nodes[target].id.clone(),
            kind,
            relation,
            occurrence_count: 1,
        });
    }

    fn add_update(&mut self, update: &CanonicalUpdate) {
        let peer = self.touch_node(NodeType::Peer, &update.peer, || update.peer.clone());
        let prefix = self.touch_node(NodeType::Prefix, &update.prefix, || update.prefix.clone());
        self.touch_link(peer, prefix, LinkRelation::PeerPrefix, update.kind);

        if let Some(origin_as) = update.origin_as {
            let origin = self.touch_node(NodeType::Origin, &origin_as.to_string(), || {
                format!("AS{origin_as}")
            });
            self.touch_link(origin, prefix, LinkRelation::OriginPrefix, update.kind);
            self.touch_link(peer, origin, LinkRelation::PeerOrigin, update.kind);
        }
    }

    fn finish(self) -> GraphPayload {
        GraphPayload {
            nodes: self.nodes,
            links: self.links,
        }
    }
}

/// Derives the deduplicated graph for a whole window. Node and link order is
/// first-seen order, so identical input yields identical output.
pub fn build_graph(updates: &[CanonicalUpdate]) -> GraphPayload {
    let mut builder = GraphBuilder::default();
    for update in updates {
        builder.add_update(update);
    }
    builder.finish()
}
