//! The mount tree.
//!
//! The tree records, for every directory where the set of applicable
//! mounts changes, which mounts contribute to it and in what order. A node
//! is labelled with one or more path components; nodes only exist at mount
//! points and where the paths of two mount points diverge. Mounted at, in
//! order `Bla -> /`, `Bar -> /foo/bar`, `Foo -> /foo` and `Zut, Fop ->
//! /zut/123`, the tree looks like:
//!
//! ```text
//! (Bla:0)
//! /foo (Foo:0, Bla:1)
//!      /bar (Foo:1, Bar:0, Bla:2)
//! /zut/123 (Fop:0, Zut:0, Bla:2)
//! ```
//!
//! Each item's depth is the number of components between the item's mount
//! point and the node, so the physical path of a virtual path for an item
//! is the trailing `depth` components of the node path plus the rest.
//!
//! ## Design Decisions
//!
//! - **Arena storage**: nodes live in a `Vec` and refer to each other by
//!   index. A node keeps its index across splits and merges for as long as
//!   a mount is attached to it.
//! - **Global order**: items in every node are kept sorted by the
//!   repository's mount order, so `Top`, `Bottom`, `Above` and `Below`
//!   placements need no special casing here.
//! - **Normalisation on removal**: a node that carries no mount of its own
//!   is removed when it has no children and merged into its only child
//!   otherwise, repeated upward. The root is never removed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::repository::{MountId, MountInfo};

/// Index of a node in the tree.
pub type NodeId = usize;

/// One mount in effect at a node.
#[derive(Debug, Clone)]
pub struct TreeItem {
    pub mount: Arc<MountInfo>,
    pub depth: usize,
}

#[derive(Debug)]
struct Node {
    comps: Vec<String>,
    up: Option<NodeId>,
    subs: Vec<NodeId>,
    items: Vec<TreeItem>,
}

/// Mount tree of one repository.
#[derive(Debug)]
pub struct MountTree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    registered: HashMap<MountId, NodeId>,
}

impl Default for MountTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTree {
    /// The node for `/`.
    pub const ROOT: NodeId = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node {
                comps: Vec::new(),
                up: None,
                subs: Vec::new(),
                items: Vec::new(),
            })],
            free: Vec::new(),
            registered: HashMap::new(),
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id).and_then(Option::as_ref) {
            Some(node) => node,
            None => panic!("mount tree node {id} does not exist"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("mount tree node {id} does not exist"),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = None;
        self.free.push(id);
    }

    /// Number of live nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Mounts in effect at `node`, highest precedence first.
    pub fn items(&self, node: NodeId) -> &[TreeItem] {
        &self.node(node).items
    }

    /// Node a mount was attached to.
    pub fn mount_node(&self, mount: MountId) -> Option<NodeId> {
        self.registered.get(&mount).copied()
    }

    /// Full virtual path of a node as components.
    pub fn path_of(&self, node: NodeId) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cur = Some(node);
        while let Some(id) = cur {
            let n = self.node(id);
            chain.push(n.comps.clone());
            cur = n.up;
        }
        chain.into_iter().rev().flatten().collect()
    }

    fn sort_items(items: &mut [TreeItem], order: &[MountId]) {
        let rank = |id: MountId| order.iter().position(|m| *m == id).unwrap_or(usize::MAX);
        items.sort_by_key(|item| rank(item.mount.id()));
    }

    fn find_sub(&self, node: NodeId, first: &str) -> Option<NodeId> {
        self.node(node)
            .subs
            .iter()
            .copied()
            .find(|&sub| self.node(sub).comps.first().map(String::as_str) == Some(first))
    }

    /// Attach `mount` at the path `comps`. `order` is the repository's
    /// mount list (already containing `mount`), highest precedence first.
    /// Returns the node for the mount point.
    pub fn add(&mut self, comps: &[&str], mount: Arc<MountInfo>, order: &[MountId]) -> NodeId {
        let id = mount.id();
        let node = self.add_inner(comps, mount, order);
        self.registered.insert(id, node);
        node
    }

    fn add_inner(&mut self, comps: &[&str], mount: Arc<MountInfo>, order: &[MountId]) -> NodeId {
        let mut node = Self::ROOT;
        let mut i = 0;
        loop {
            if i == comps.len() {
                self.add_all(node, &mount, 0, order);
                return node;
            }

            let Some(sub) = self.find_sub(node, comps[i]) else {
                return self.new_sub_tree(node, &comps[i..], mount, order);
            };

            let sub_len = self.node(sub).comps.len();
            let mut matched = 1;
            while matched < sub_len
                && i + matched < comps.len()
                && self.node(sub).comps[matched] == comps[i + matched]
            {
                matched += 1;
            }

            if matched == sub_len {
                node = sub;
                i += matched;
                continue;
            }

            let mid = self.split(sub, matched);
            i += matched;
            if i == comps.len() {
                self.add_all(mid, &mount, 0, order);
                return mid;
            }
            return self.new_sub_tree(mid, &comps[i..], mount, order);
        }
    }

    /// Add an item to `node` and everything below it.
    fn add_all(&mut self, node: NodeId, mount: &Arc<MountInfo>, depth: usize, order: &[MountId]) {
        let n = self.node_mut(node);
        n.items.push(TreeItem {
            mount: Arc::clone(mount),
            depth,
        });
        Self::sort_items(&mut n.items, order);
        let subs: Vec<(NodeId, usize)> = n
            .subs
            .clone()
            .into_iter()
            .map(|s| (s, self.node(s).comps.len()))
            .collect();
        for (sub, len) in subs {
            self.add_all(sub, mount, depth + len, order);
        }
    }

    fn new_sub_tree(
        &mut self,
        parent: NodeId,
        comps: &[&str],
        mount: Arc<MountInfo>,
        order: &[MountId],
    ) -> NodeId {
        let mut items: Vec<TreeItem> = self
            .node(parent)
            .items
            .iter()
            .map(|item| TreeItem {
                mount: Arc::clone(&item.mount),
                depth: item.depth + comps.len(),
            })
            .collect();
        items.push(TreeItem { mount, depth: 0 });
        Self::sort_items(&mut items, order);

        let id = self.alloc(Node {
            comps: comps.iter().map(|c| c.to_string()).collect(),
            up: Some(parent),
            subs: Vec::new(),
            items,
        });
        self.node_mut(parent).subs.push(id);
        id
    }

    /// Split `sub` after its first `at` components. The new upper node
    /// takes `sub`'s place; `sub` keeps its index and the remaining
    /// components.
    fn split(&mut self, sub: NodeId, at: usize) -> NodeId {
        let parent = match self.node(sub).up {
            Some(p) => p,
            None => panic!("cannot split the root of the mount tree"),
        };
        let upper: Vec<String> = self.node(sub).comps[..at].to_vec();
        let items = self
            .node(parent)
            .items
            .iter()
            .map(|item| TreeItem {
                mount: Arc::clone(&item.mount),
                depth: item.depth + at,
            })
            .collect();

        let mid = self.alloc(Node {
            comps: upper,
            up: Some(parent),
            subs: vec![sub],
            items,
        });
        {
            let s = self.node_mut(sub);
            s.comps.drain(..at);
            s.up = Some(mid);
        }
        let p = self.node_mut(parent);
        if let Some(slot) = p.subs.iter_mut().find(|s| **s == sub) {
            *slot = mid;
        }
        mid
    }

    /// Detach a mount from the tree.
    pub fn remove(&mut self, mount: MountId) {
        let Some(node) = self.registered.remove(&mount) else {
            return;
        };
        self.remove_items(node, mount);
        self.normalize(node);
    }

    fn remove_items(&mut self, node: NodeId, mount: MountId) {
        let n = self.node_mut(node);
        n.items.retain(|item| item.mount.id() != mount);
        for sub in n.subs.clone() {
            self.remove_items(sub, mount);
        }
    }

    fn normalize(&mut self, node: NodeId) {
        let n = self.node(node);
        let Some(parent) = n.up else {
            return;
        };
        if n.items.iter().any(|item| item.depth == 0) {
            return;
        }
        match n.subs.len() {
            0 => {
                self.node_mut(parent).subs.retain(|s| *s != node);
                self.release(node);
                self.normalize(parent);
            }
            1 => {
                let child = n.subs[0];
                let mut comps = n.comps.clone();
                {
                    let c = self.node_mut(child);
                    comps.append(&mut c.comps);
                    c.comps = comps;
                    c.up = Some(parent);
                }
                let p = self.node_mut(parent);
                if let Some(slot) = p.subs.iter_mut().find(|s| **s == node) {
                    *slot = child;
                }
                self.release(node);
            }
            _ => {}
        }
    }

    /// Deepest node matching a prefix of `comps`, and how many components
    /// that prefix has.
    pub fn find(&self, comps: &[&str]) -> (NodeId, usize) {
        let mut node = Self::ROOT;
        let mut i = 0;
        loop {
            if i == comps.len() {
                return (node, i);
            }
            let Some(sub) = self.find_sub(node, comps[i]) else {
                return (node, i);
            };
            let sub_comps = &self.node(sub).comps;
            let end = i + sub_comps.len();
            if end > comps.len() || sub_comps.iter().zip(&comps[i..end]).any(|(a, b)| a != b) {
                return (node, i);
            }
            node = sub;
            i = end;
        }
    }

    /// Indented dump of the tree, one node per line. `label` renders the
    /// mount of an item.
    pub fn render(&self, label: &dyn Fn(&MountInfo) -> String) -> String {
        let mut out = String::new();
        self.render_node(Self::ROOT, 0, label, &mut out);
        out
    }

    fn render_node(
        &self,
        node: NodeId,
        indent: usize,
        label: &dyn Fn(&MountInfo) -> String,
        out: &mut String,
    ) {
        let n = self.node(node);
        let items: Vec<String> = n
            .items
            .iter()
            .map(|item| format!("{}:{}", label(&item.mount), item.depth))
            .collect();
        out.push('(');
        out.push_str(&items.join(", "));
        out.push_str(")\n");

        for &sub in &n.subs {
            let mut new_indent = indent;
            out.push_str(&" ".repeat(indent));
            for comp in &self.node(sub).comps {
                out.push('/');
                out.push_str(comp);
                new_indent += 1 + comp.len();
            }
            out.push(' ');
            new_indent += 1;
            self.render_node(sub, new_indent, label, out);
        }
    }
}
