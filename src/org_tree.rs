//! Organisation hierarchy assembly.
//!
//! Nodes are persisted flat, each pointing at its parent. The tree is rebuilt from a
//! full flat snapshot every time and is never the source of truth.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrgLevel {
    Root,
    Supervisor,
    #[serde(rename = "World Team")]
    WorldTeam,
    #[serde(rename = "Active World Team")]
    ActiveWorldTeam,
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "GET 2500")]
    Get2500,
    #[serde(rename = "Millionaire Team")]
    Millionaire,
    #[serde(rename = "Mill 7500")]
    Mill7500,
    #[serde(rename = "President Team")]
    President,
    #[serde(rename = "Chairman Club")]
    Chairman,
    #[serde(rename = "Founder Circle")]
    Founder,
}

impl OrgLevel {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Root => "Root",
            Self::Supervisor => "Supervisor",
            Self::WorldTeam => "World Team",
            Self::ActiveWorldTeam => "Active World Team",
            Self::Get => "GET",
            Self::Get2500 => "GET 2500",
            Self::Millionaire => "Millionaire Team",
            Self::Mill7500 => "Mill 7500",
            Self::President => "President Team",
            Self::Chairman => "Chairman Club",
            Self::Founder => "Founder Circle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    pub level: OrgLevel,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Derived on build; ignored as a source of truth.
    #[serde(default)]
    pub children: Vec<OrgNode>,
}

impl OrgNode {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        level: OrgLevel,
        parent_id: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: String::new(),
            level,
            parent_id: parent_id.map(str::to_string),
            children: Vec::new(),
        }
    }

    fn is_root_candidate(&self) -> bool {
        self.parent_id.as_deref().is_none_or(str::is_empty)
    }

    pub fn find(&self, id: &str) -> Option<&OrgNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Copy of the tree with `node` appended to `parent_id`'s children.
    pub fn with_child_added(&self, parent_id: &str, node: OrgNode) -> OrgNode {
        let mut tree = self.clone();
        tree.add_child(parent_id, node);
        tree
    }

    fn add_child(&mut self, parent_id: &str, node: OrgNode) {
        if self.id == parent_id {
            self.children.push(node);
        } else if let Some(branch) = self
            .children
            .iter_mut()
            .find(|child| child.find(parent_id).is_some())
        {
            branch.add_child(parent_id, node);
        }
    }

    /// Copy of the tree with `updated`'s fields applied to the node of the same id.
    /// The existing children are kept.
    pub fn with_node_updated(&self, updated: &OrgNode) -> OrgNode {
        if self.id == updated.id {
            return OrgNode {
                children: self.children.clone(),
                ..updated.clone()
            };
        }
        OrgNode {
            children: self
                .children
                .iter()
                .map(|child| child.with_node_updated(updated))
                .collect(),
            ..self.clone()
        }
    }

    /// Copy of the tree without the node `id` and its subtree. The root itself is
    /// never removed.
    pub fn without_node(&self, id: &str) -> OrgNode {
        OrgNode {
            children: self
                .children
                .iter()
                .filter(|child| child.id != id)
                .map(|child| child.without_node(id))
                .collect(),
            ..self.clone()
        }
    }

    /// Pre-order flat list with children stripped.
    pub fn flatten(&self) -> Vec<OrgNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(OrgNode {
                children: Vec::new(),
                ..node.clone()
            });
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(OrgNode::node_count).sum::<usize>()
    }

    /// Indented outline, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            let _ = writeln!(
                out,
                "{}{} ({}) [{}]",
                "  ".repeat(depth),
                node.name,
                node.id,
                node.level.display_name()
            );
            stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
        out
    }
}

/// Result of assembling a flat list, with everything that did not make it in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgTreeReport {
    pub root: Option<OrgNode>,
    /// Nodes whose parent is not in the list.
    pub orphans: Vec<String>,
    /// Root candidates after the first one.
    pub extra_roots: Vec<String>,
    /// Nodes with a known parent that still cannot be reached from the root.
    pub unreachable: Vec<String>,
    /// Ids that appeared more than once. The node stays at the position of its first
    /// occurrence and takes the fields of its last one.
    pub duplicates: Vec<String>,
}

/// Assemble the hierarchy, returning only the tree.
pub fn build(nodes: &[OrgNode]) -> Option<OrgNode> {
    build_report(nodes).root
}

pub fn build_report(nodes: &[OrgNode]) -> OrgTreeReport {
    let mut report = OrgTreeReport::default();

    // `kept` is in first-seen order; each slot points at the latest occurrence.
    let mut slots: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    let mut kept: Vec<usize> = Vec::with_capacity(nodes.len());
    for (position, node) in nodes.iter().enumerate() {
        match slots.get(node.id.as_str()) {
            Some(&slot) => {
                warn!(target = "biztrack::org_tree", id = %node.id, "Duplicate org node id");
                report.duplicates.push(node.id.clone());
                kept[slot] = position;
            }
            None => {
                slots.insert(node.id.as_str(), kept.len());
                kept.push(position);
            }
        }
    }
    let index: HashMap<&str, usize> = kept
        .iter()
        .map(|&position| (nodes[position].id.as_str(), position))
        .collect();

    let mut root: Option<usize> = None;
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for &position in &kept {
        let node = &nodes[position];
        if node.is_root_candidate() {
            if root.is_none() {
                root = Some(position);
            } else {
                warn!(
                    target = "biztrack::org_tree",
                    id = %node.id,
                    name = %node.name,
                    "Additional root candidate ignored"
                );
                report.extra_roots.push(node.id.clone());
            }
            continue;
        }

        let parent_id = node.parent_id.as_deref().unwrap_or_default();
        match index.get(parent_id) {
            Some(&parent) => children.entry(parent).or_default().push(position),
            None => {
                warn!(
                    target = "biztrack::org_tree",
                    id = %node.id,
                    name = %node.name,
                    parent_id,
                    "Orphaned org node"
                );
                report.orphans.push(node.id.clone());
            }
        }
    }

    let Some(root) = root else {
        if !nodes.is_empty() {
            warn!(target = "biztrack::org_tree", "No root candidate among org nodes");
        }
        report.unreachable = kept
            .iter()
            .map(|&position| nodes[position].id.clone())
            .filter(|id| !report.orphans.contains(id))
            .collect();
        return report;
    };

    // Pre-order walk; each node has one parent so a node is reached at most once.
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root];
    while let Some(position) = stack.pop() {
        if !visited.insert(position) {
            continue;
        }
        order.push(position);
        if let Some(kids) = children.get(&position) {
            stack.extend(kids.iter().rev());
        }
    }

    let mut built: HashMap<usize, OrgNode> = HashMap::with_capacity(order.len());
    for &position in order.iter().rev() {
        let assembled = children
            .get(&position)
            .map(|kids| kids.iter().filter_map(|kid| built.remove(kid)).collect())
            .unwrap_or_default();
        built.insert(
            position,
            OrgNode {
                children: assembled,
                ..nodes[position].clone()
            },
        );
    }

    let excluded: HashSet<&str> = report
        .orphans
        .iter()
        .chain(report.extra_roots.iter())
        .map(String::as_str)
        .collect();
    report.unreachable = kept
        .iter()
        .filter(|position| !visited.contains(*position))
        .map(|&position| nodes[position].id.as_str())
        .filter(|id| !excluded.contains(id))
        .map(str::to_string)
        .collect();
    if !report.unreachable.is_empty() {
        warn!(
            target = "biztrack::org_tree",
            count = report.unreachable.len(),
            "Org nodes unreachable from root"
        );
    }

    report.root = built.remove(&root);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, parent: Option<&str>) -> OrgNode {
        OrgNode::new(id, id.to_uppercase(), OrgLevel::Supervisor, parent)
    }

    fn child_ids(node: &OrgNode) -> Vec<&str> {
        node.children.iter().map(|child| child.id.as_str()).collect()
    }

    #[test]
    fn empty_input_has_no_tree() {
        assert!(build(&[]).is_none());
    }

    #[test]
    fn lone_root_is_a_single_node_tree() {
        let tree = build(&[node("root", None)]).expect("tree");
        assert_eq!(tree.id, "root");
        assert!(tree.children.is_empty());
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn single_root_keeps_input_order() {
        let nodes = [
            node("root", None),
            node("b", Some("root")),
            node("a", Some("root")),
            node("a1", Some("a")),
        ];
        let tree = build(&nodes).expect("tree");
        assert_eq!(tree.id, "root");
        assert_eq!(child_ids(&tree), ["b", "a"]);
        assert_eq!(child_ids(&tree.children[1]), ["a1"]);
        assert_eq!(tree.node_count(), 4);
    }

    #[test]
    fn children_listed_before_parent_still_attach() {
        let nodes = [
            node("leaf", Some("mid")),
            node("mid", Some("root")),
            node("root", None),
        ];
        let tree = build(&nodes).expect("tree");
        assert_eq!(tree.find("leaf").map(|n| n.id.as_str()), Some("leaf"));
    }

    #[test]
    fn orphans_and_cycles_are_excluded() {
        let nodes = [
            node("root", None),
            node("a", Some("root")),
            node("lost", Some("missing")),
            node("x", Some("y")),
            node("y", Some("x")),
        ];
        let report = build_report(&nodes);
        let tree = report.root.expect("tree");
        assert_eq!(tree.node_count(), 2);
        assert_eq!(report.orphans, ["lost"]);
        assert_eq!(report.unreachable, ["x", "y"]);
    }

    #[test]
    fn first_root_wins() {
        let nodes = [
            node("first", None),
            node("second", Some("")),
            node("kid", Some("second")),
        ];
        let report = build_report(&nodes);
        assert_eq!(report.root.map(|root| root.id), Some("first".to_string()));
        assert_eq!(report.extra_roots, ["second"]);
        assert_eq!(report.unreachable, ["kid"]);
    }

    #[test]
    fn duplicate_ids_keep_first_position_and_last_fields() {
        let mut renamed = node("a", Some("root"));
        renamed.name = "Shadow".to_string();
        let nodes = [
            node("root", None),
            node("a", Some("root")),
            node("b", Some("root")),
            renamed,
        ];
        let report = build_report(&nodes);
        let tree = report.root.expect("tree");
        assert_eq!(child_ids(&tree), ["a", "b"]);
        assert_eq!(tree.children[0].name, "Shadow");
        assert_eq!(report.duplicates, ["a"]);
    }

    #[test]
    fn edit_helpers_leave_source_tree_untouched() {
        let nodes = [node("root", None), node("a", Some("root"))];
        let tree = build(&nodes).expect("tree");

        let grown = tree.with_child_added("a", node("a1", Some("a")));
        assert!(tree.find("a1").is_none());
        assert!(grown.find("a1").is_some());

        let mut renamed = node("a", Some("root"));
        renamed.name = "Alice".to_string();
        let updated = grown.with_node_updated(&renamed);
        let a = updated.find("a").expect("a");
        assert_eq!(a.name, "Alice");
        assert_eq!(child_ids(a), ["a1"]);

        let pruned = updated.without_node("a");
        assert_eq!(pruned.node_count(), 1);
        assert_eq!(updated.node_count(), 3);
    }

    #[test]
    fn levels_use_display_names() {
        let json = serde_json::json!({
            "id": "n1",
            "name": "Nia",
            "role": "Lead",
            "level": "Active World Team",
            "parentId": null
        });
        let parsed: OrgNode = serde_json::from_value(json).expect("valid node");
        assert_eq!(parsed.level, OrgLevel::ActiveWorldTeam);
        assert!(parsed.children.is_empty());
        assert_eq!(
            serde_json::to_value(OrgLevel::Get2500).expect("serializes"),
            serde_json::json!("GET 2500")
        );
    }
}
