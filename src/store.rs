use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

use crate::{write_file, AcmeError};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Directory,
    Account,
    Order,
    Authorization,
    Challenge,
    Certificate,
    Nonces,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Directory => "directory",
            ResourceType::Account => "account",
            ResourceType::Order => "order",
            ResourceType::Authorization => "authorization",
            ResourceType::Challenge => "challenge",
            ResourceType::Certificate => "certificate",
            ResourceType::Nonces => "nonces",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ACME object, keyed by its URL. `resource == None` means known to exist
/// but not fetched yet. `parent == ""` marks a root.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resource {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub name: String,
    pub parent: String,
    pub resource: Option<Value>,
    pub key: Option<String>,
}

impl Resource {
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

#[derive(Debug)]
pub struct TreeNode<'a> {
    pub resource: &'a Resource,
    pub children: Vec<TreeNode<'a>>,
}

/// All known resources, rewritten to disk in full on every mutation.
#[derive(Debug, Default)]
pub struct ResourceStore {
    path: Option<PathBuf>,
    order: Vec<String>,
    items: HashMap<String, Resource>,
}

impl ResourceStore {
    pub fn open(path: &Path) -> Result<Self, AcmeError> {
        let mut store = ResourceStore {
            path: Some(path.to_path_buf()),
            ..Default::default()
        };
        if path.exists() {
            let list: Vec<Resource> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            for r in list {
                store.insert(r);
            }
        }
        debug!("Loaded {} resources from {:?}", store.order.len(), path);
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Upsert by url. The record becomes exactly what is passed in, name and key included.
    pub fn put(
        &mut self,
        url: &str,
        name: &str,
        kind: ResourceType,
        parent: &str,
        resource: Option<Value>,
        key: Option<&str>,
    ) -> Result<(), AcmeError> {
        if !parent.is_empty() && !self.items.contains_key(parent) {
            warn!("Parent {} of {} is not known (yet)", parent, url);
        }
        self.insert(Resource {
            url: url.to_string(),
            kind,
            name: name.to_string(),
            parent: parent.to_string(),
            resource,
            key: key.map(|k| k.to_string()),
        });
        self.persist()
    }

    /// Records a child we learnt about from its parent. Already known resources
    /// are left alone so a fetched body is not wiped back to "not fetched".
    pub fn register(&mut self, url: &str, kind: ResourceType, parent: &str, key: Option<&str>) -> Result<bool, AcmeError> {
        if self.items.contains_key(url) {
            return Ok(false);
        }
        self.put(url, "", kind, parent, None, key)?;
        Ok(true)
    }

    pub fn get(&self, url: &str) -> Option<&Resource> {
        self.items.get(url)
    }

    pub fn list(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().filter_map(move |u| self.items.get(u))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Walks parent links from `url` (inclusive) until a resource of `kind`
    /// turns up. Stops on a dangling parent or a cycle.
    pub fn find_ancestor_of_type(&self, url: &str, kind: ResourceType) -> Option<&Resource> {
        let mut seen = HashSet::new();
        let mut cur = self.items.get(url);
        while let Some(r) = cur {
            if r.kind == kind {
                return Some(r);
            }
            if !seen.insert(r.url.as_str()) {
                warn!("Parent cycle at {}", r.url);
                return None;
            }
            cur = self.items.get(&r.parent);
        }
        None
    }

    pub fn clear(&mut self) -> Result<(), AcmeError> {
        self.order.clear();
        self.items.clear();
        self.persist()
    }

    /// Resources arranged by parent link. Nodes whose parent is unknown are
    /// attached at the root.
    pub fn tree(&self) -> Vec<TreeNode<'_>> {
        let mut children: HashMap<&str, Vec<&Resource>> = HashMap::new();
        let mut roots = Vec::new();
        for r in self.list() {
            if r.parent.is_empty() || r.parent == r.url {
                roots.push(r);
            } else if self.items.contains_key(&r.parent) {
                children.entry(r.parent.as_str()).or_default().push(r);
            } else {
                warn!("Failed to find parent for '{}' ('{}'), attaching to root", r.url, r.parent);
                roots.push(r);
            }
        }

        let mut seen = HashSet::new();
        let mut tree: Vec<TreeNode> = roots.into_iter().map(|r| build_node(r, &children, &mut seen)).collect();
        // whatever is still unseen hangs off a parent cycle
        for r in self.list() {
            if !seen.contains(r.url.as_str()) {
                warn!("Resource {} is part of a parent cycle, attaching to root", r.url);
                tree.push(build_node(r, &children, &mut seen));
            }
        }
        tree
    }

    fn insert(&mut self, r: Resource) {
        if !self.items.contains_key(&r.url) {
            self.order.push(r.url.clone());
        }
        self.items.insert(r.url.clone(), r);
    }

    fn persist(&self) -> Result<(), AcmeError> {
        match &self.path {
            Some(path) => {
                let list: Vec<&Resource> = self.list().collect();
                write_file(path, serde_json::to_string_pretty(&list)?.as_bytes())
            }
            None => Ok(()),
        }
    }
}

fn build_node<'a>(
    r: &'a Resource,
    children: &HashMap<&str, Vec<&'a Resource>>,
    seen: &mut HashSet<&'a str>,
) -> TreeNode<'a> {
    seen.insert(r.url.as_str());
    let mut node = TreeNode {
        resource: r,
        children: Vec::new(),
    };
    for c in children.get(r.url.as_str()).into_iter().flatten() {
        if !seen.contains(c.url.as_str()) {
            node.children.push(build_node(c, children, seen));
        }
    }
    node
}
