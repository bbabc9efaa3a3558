//! Display-time node merging. The engine stores hint children next to
//! discovered children; renderers collapse a hint and a discovered edge that
//! share a protocol and mux into one edge, with the discovered node's fields
//! winning.

use meshmap_core::{SharedNode, Tree};
use std::collections::{HashMap, HashSet};

fn protocol_and_mux(node: &SharedNode) -> String {
    let node = node.read();
    format!("{}.{}", node.protocol.id, node.protocol_mux)
}

/// Collapses hint nodes into discovered nodes sharing their `(protocol,
/// mux)`. Unmatched hint nodes are kept as-is. Merging mutates the discovered
/// node in place; the returned tree references the same shared nodes.
pub fn merge_hints(nodes: &Tree) -> Tree {
    let mut hints: HashMap<String, SharedNode> = HashMap::new();
    for node in nodes.values() {
        if node.read().from_hint {
            hints.insert(protocol_and_mux(node), node.clone());
        }
    }
    if hints.is_empty() {
        return nodes.clone();
    }

    let mut used: HashSet<String> = HashSet::new();
    let mut merged = Tree::new();
    for (node_ref, node) in nodes {
        if node.read().from_hint {
            continue;
        }
        let key = protocol_and_mux(node);
        if let Some(hint) = hints.get(&key) {
            merge_node_and_hint(node, hint);
            used.insert(key);
        }
        merged.insert(node_ref.clone(), node.clone());
    }

    for (node_ref, node) in nodes {
        if node.read().from_hint && !used.contains(&protocol_and_mux(node)) {
            merged.insert(node_ref.clone(), node.clone());
        }
    }
    merged
}

fn merge_node_and_hint(node: &SharedNode, hint: &SharedNode) {
    let hint = hint.snapshot();
    let mut node = node.write();

    node.from_hint = true;
    node.address = node.address.take().or(hint.address);
    node.containerized = node.containerized || hint.containerized;
    node.service_name = node.service_name.take().or(hint.service_name);
    node.warnings.extend(hint.warnings);
    node.errors.extend(hint.errors);

    // Children union with discovered-node precedence on key collision.
    let mut children = hint.children.unwrap_or_default();
    children.extend(node.children.take().unwrap_or_default());
    node.children = Some(children);
}

/// Strips characters that confuse downstream renderers (DOT quoting, ref
/// separators).
pub fn clean_service_name(name: &str) -> String {
    name.replace('"', "").replace([':', '#'], "_")
}
