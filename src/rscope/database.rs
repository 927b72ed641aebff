//! Persistent inlining database
//!
//! Stores the inlining structure of compiled methods keyed by
//! `(outer key, optional inner key)`, using class and selector names so an
//! entry survives across runs. Scope trees materialized from the database
//! are always trusted and are never re-walked.

use super::{DatabaseScope, RScopeKind, ScopeId, ScopeTree, UninlinableScope, UntakenSource};
use crate::code::{NativeMethod, ScopeOffset};
use crate::error::{Error, Result};
use crate::lookup::LookupKey;
use crate::oop::{Bci, ClassTable};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Name-based lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseKey {
    pub class: String,
    pub selector: String,
}

impl DatabaseKey {
    pub fn new(class: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            selector: selector.into(),
        }
    }

    /// Name form of a selector key; block keys have none
    pub fn from_key(classes: &ClassTable, key: LookupKey) -> Option<Self> {
        let selector = key.selector()?;
        classes.class(key.class)?;
        Some(Self::new(classes.class_name(key.class), classes.selector_name(selector)))
    }

    /// Resolve against the current class table
    pub fn resolve(&self, classes: &ClassTable) -> Option<LookupKey> {
        let class = classes.class_named(&self.class)?;
        let selector = classes.selector(&self.selector)?;
        Some(LookupKey::new(class, selector))
    }
}

/// Inlined callee at a call site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseChild {
    pub bci: Bci,
    pub key: DatabaseKey,
    pub node: DatabaseNode,
}

/// Recorded structure of one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseNode {
    pub children: Vec<DatabaseChild>,
    pub untaken: Vec<Bci>,
    pub uninlinable: Vec<Bci>,
    pub complete: Vec<Bci>,
}

/// One persisted entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub outer: DatabaseKey,
    pub inner: Option<DatabaseKey>,
    pub root: DatabaseNode,
}

/// On-disk encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseFormat {
    Json,
    Bincode,
}

impl DatabaseFormat {
    /// `.json` files are JSON, everything else bincode
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => DatabaseFormat::Json,
            _ => DatabaseFormat::Bincode,
        }
    }
}

type EntryKey = (DatabaseKey, Option<DatabaseKey>);

/// Inlining database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InliningDatabase {
    entries: BTreeMap<EntryKey, DatabaseNode>,
}

impl InliningDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, outer: DatabaseKey, inner: Option<DatabaseKey>, node: DatabaseNode) {
        self.entries.insert((outer, inner), node);
    }

    pub fn get(&self, outer: &DatabaseKey, inner: Option<&DatabaseKey>) -> Option<&DatabaseNode> {
        self.entries.get(&(outer.clone(), inner.cloned()))
    }

    /// Entry for live keys
    pub fn lookup(&self, classes: &ClassTable, outer: LookupKey, inner: Option<LookupKey>) -> Option<&DatabaseNode> {
        if self.entries.is_empty() {
            return None;
        }
        let outer = DatabaseKey::from_key(classes, outer)?;
        let inner = match inner {
            Some(key) => Some(DatabaseKey::from_key(classes, key)?),
            None => None,
        };
        self.get(&outer, inner.as_ref())
    }

    /// Record the inlining structure of `nm`: the whole method under
    /// `(key, None)` and every directly inlined callee under `(key, callee)`.
    /// Returns the number of entries written.
    pub fn capture(&mut self, classes: &ClassTable, nm: &NativeMethod) -> usize {
        let Some(outer) = DatabaseKey::from_key(classes, nm.key) else {
            debug!(nm = nm.id.0, "block method not recorded in inlining database");
            return 0;
        };
        let Some(root) = nm.root_scope() else {
            return 0;
        };

        let mut nodes: HashMap<ScopeOffset, DatabaseNode> = HashMap::default();
        for desc in &nm.scopes {
            nodes.insert(desc.offset, DatabaseNode::default());
        }
        for trap in nm.traps.iter().filter(|t| !t.is_used()) {
            if let Some(node) = nodes.get_mut(&trap.scope) {
                node.untaken.push(trap.bci);
            }
        }
        for site in &nm.call_sites {
            let Some(node) = nodes.get_mut(&site.scope) else {
                continue;
            };
            let cache = &site.cache;
            if cache.was_never_executed() {
                node.untaken.push(site.bci);
            } else if cache.is_megamorphic() || cache.is_uninlinable() {
                node.uninlinable.push(site.bci);
            } else if !cache.is_empty() {
                node.complete.push(site.bci);
                for entry in cache.entries() {
                    if let Some(key) = DatabaseKey::from_key(classes, LookupKey::new(entry.class, cache.selector())) {
                        node.children.push(DatabaseChild {
                            bci: site.bci,
                            key,
                            node: DatabaseNode::default(),
                        });
                    }
                }
            }
        }

        // Fold children into their senders, deepest offsets first
        let mut descs: Vec<_> = nm.scopes.iter().filter(|d| d.sender.is_some()).collect();
        descs.sort_by(|a, b| b.offset.cmp(&a.offset));
        let mut direct: Vec<(DatabaseKey, DatabaseNode)> = Vec::new();
        for desc in descs {
            let (Some(sender), Some(node)) = (desc.sender, nodes.remove(&desc.offset)) else {
                continue;
            };
            let Some(key) = DatabaseKey::from_key(classes, desc.key) else {
                continue;
            };
            if sender.offset == root.offset {
                direct.push((key.clone(), node.clone()));
            }
            if let Some(parent) = nodes.get_mut(&sender.offset) {
                parent.children.push(DatabaseChild {
                    bci: sender.bci,
                    key,
                    node,
                });
            }
        }

        let Some(mut root_node) = nodes.remove(&root.offset) else {
            return 0;
        };
        normalize(&mut root_node);
        let mut written = 1;
        self.insert(outer.clone(), None, root_node);
        for (key, mut node) in direct {
            normalize(&mut node);
            self.insert(outer.clone(), Some(key), node);
            written += 1;
        }
        debug!(nm = nm.id.0, written, "captured inlining structure");
        written
    }

    /// Always-trusted scope tree for `(outer, inner)`
    pub fn materialize(&self, classes: &ClassTable, outer: LookupKey, inner: Option<LookupKey>) -> Option<ScopeTree> {
        let node = self.lookup(classes, outer, inner)?;
        let key = inner.unwrap_or(outer);
        let Some(method) = key.resolve(classes) else {
            warn!(key = %key.display(classes), "inlining database entry does not resolve");
            return None;
        };
        let mut tree = ScopeTree::with_root(RScopeKind::Database(DatabaseScope { key, method }));
        let root = tree.root();
        fill_children(&mut tree, classes, node, root, 0);
        Some(tree)
    }

    // ==================== Persistence ====================

    pub fn entries(&self) -> Vec<DatabaseEntry> {
        self.entries
            .iter()
            .map(|((outer, inner), root)| DatabaseEntry {
                outer: outer.clone(),
                inner: inner.clone(),
                root: root.clone(),
            })
            .collect()
    }

    pub fn from_entries(entries: Vec<DatabaseEntry>) -> Self {
        let mut db = Self::new();
        for entry in entries {
            db.insert(entry.outer, entry.inner, entry.root);
        }
        db
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries())?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(Self::from_entries(serde_json::from_str(text)?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.entries())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_entries(bincode::deserialize(bytes)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match DatabaseFormat::from_path(path) {
            DatabaseFormat::Json => fs::write(path, self.to_json()?)?,
            DatabaseFormat::Bincode => fs::write(path, self.to_bytes()?)?,
        }
        info!(path = %path.display(), entries = self.len(), "inlining database saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = match DatabaseFormat::from_path(path) {
            DatabaseFormat::Json => Self::from_json(&fs::read_to_string(path)?)?,
            DatabaseFormat::Bincode => Self::from_bytes(&fs::read(path)?)?,
        };
        db.check()?;
        info!(path = %path.display(), entries = db.len(), "inlining database loaded");
        Ok(db)
    }

    /// Structural sanity of loaded data
    fn check(&self) -> Result<()> {
        for (outer, inner) in self.entries.keys() {
            let empty = |k: &DatabaseKey| k.class.is_empty() || k.selector.is_empty();
            if empty(outer) || inner.as_ref().is_some_and(empty) {
                return Err(Error::database(format!(
                    "entry with empty class or selector name: {:?} / {:?}",
                    outer, inner
                )));
            }
        }
        Ok(())
    }
}

/// Sort a node's lists so captures are deterministic
fn normalize(node: &mut DatabaseNode) {
    node.untaken.sort_unstable();
    node.untaken.dedup();
    node.uninlinable.sort_unstable();
    node.uninlinable.dedup();
    node.complete.sort_unstable();
    node.complete.dedup();
    node.children.sort_by(|a, b| a.bci.cmp(&b.bci).then_with(|| a.key.cmp(&b.key)));
    for child in &mut node.children {
        normalize(&mut child.node);
    }
}

/// Add the recorded structure of `node` below scope `id`
pub(super) fn fill_children(tree: &mut ScopeTree, classes: &ClassTable, node: &DatabaseNode, id: ScopeId, level: u32) {
    for bci in &node.untaken {
        tree.add_untaken(id, *bci, UntakenSource::NeverExecuted, level + 1);
    }
    for bci in &node.uninlinable {
        tree.add(
            RScopeKind::Uninlinable(UninlinableScope { megamorphic: true }),
            Some((id, *bci)),
            level + 1,
        );
    }
    for bci in &node.complete {
        tree.mark_complete(id, *bci);
    }
    for child in &node.children {
        let resolved = child
            .key
            .resolve(classes)
            .and_then(|key| key.resolve(classes).map(|method| (key, method)));
        let Some((key, method)) = resolved else {
            warn!(class = %child.key.class, selector = %child.key.selector, "unresolved inlining database key");
            continue;
        };
        let child_id = tree.add(
            RScopeKind::Database(DatabaseScope { key, method }),
            Some((id, child.bci)),
            level + 1,
        );
        fill_children(tree, classes, &child.node, child_id, level + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CallSiteCache, ScopeDesc, ScopeSender};
    use crate::ic::InlineCache;
    use crate::oop::{MethodBuilder, Operand};
    use crate::trap::TrapSite;
    use pretty_assertions::assert_eq;

    struct Fixture {
        classes: ClassTable,
        nm: NativeMethod,
        outer: LookupKey,
        inner: LookupKey,
    }

    fn fixture() -> Fixture {
        let mut classes = ClassTable::new();
        let point = classes.define_class("Point", None);
        let foo = classes.intern("foo");
        let bar = classes.intern("bar");
        let baz = classes.intern("baz");
        let m_foo = classes
            .add_method(point, MethodBuilder::new(foo).send(bar, Operand::SelfRef, vec![]))
            .unwrap();
        let m_bar = classes
            .add_method(point, MethodBuilder::new(bar).work(2).send(baz, Operand::Unknown, vec![]))
            .unwrap();
        let outer = LookupKey::new(point, foo);
        let inner = LookupKey::new(point, bar);

        let mut nm = NativeMethod::new(outer, m_foo, 1);
        nm.scopes.push(ScopeDesc { offset: 0, sender: None, key: outer, method: m_foo, lite: false });
        nm.scopes.push(ScopeDesc {
            offset: 1,
            sender: Some(ScopeSender { offset: 0, bci: 0 }),
            key: inner,
            method: m_bar,
            lite: false,
        });
        nm.call_sites.push(CallSiteCache { scope: 1, bci: 1, cache: InlineCache::new(baz) });
        nm.traps.push(TrapSite::new(0, 4));
        Fixture { classes, nm, outer, inner }
    }

    #[test]
    fn test_capture_structure() {
        let f = fixture();
        let mut db = InliningDatabase::new();
        assert_eq!(db.capture(&f.classes, &f.nm), 2);

        let root = db.lookup(&f.classes, f.outer, None).unwrap();
        assert_eq!(root.untaken, vec![4]);
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].key, DatabaseKey::new("Point", "bar"));
        assert_eq!(root.children[0].node.untaken, vec![1]);

        let inner = db.lookup(&f.classes, f.outer, Some(f.inner)).unwrap();
        assert_eq!(inner.untaken, vec![1]);
    }

    #[test]
    fn test_materialize_database_tree() {
        let f = fixture();
        let mut db = InliningDatabase::new();
        db.capture(&f.classes, &f.nm);

        let tree = db.materialize(&f.classes, f.outer, None).unwrap();
        let root = tree.root();
        assert!(matches!(tree.get(root).unwrap().kind, RScopeKind::Database(_)));
        assert!(tree.is_untaken(root, 4));
        let bar = tree.lookup_subscope(root, 0, f.inner).unwrap();
        assert!(tree.is_untaken(bar, 1));

        let inner = db.materialize(&f.classes, f.outer, Some(f.inner)).unwrap();
        assert_eq!(inner.get(inner.root()).unwrap().key(), Some(f.inner));
    }

    #[test]
    fn test_unknown_names_are_skipped() {
        let f = fixture();
        let mut db = InliningDatabase::new();
        db.insert(
            DatabaseKey::new("Point", "foo"),
            None,
            DatabaseNode {
                children: vec![DatabaseChild {
                    bci: 0,
                    key: DatabaseKey::new("Nowhere", "bar"),
                    node: DatabaseNode::default(),
                }],
                ..DatabaseNode::default()
            },
        );
        let tree = db.materialize(&f.classes, f.outer, None).unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_json_and_bincode_files() {
        let f = fixture();
        let mut db = InliningDatabase::new();
        db.capture(&f.classes, &f.nm);
        let dir = tempfile::tempdir().unwrap();

        let json = dir.path().join("inlining.json");
        db.save(&json).unwrap();
        assert!(fs::read_to_string(&json).unwrap().contains("\"Point\""));
        assert_eq!(InliningDatabase::load(&json).unwrap(), db);

        let bin = dir.path().join("inlining.db");
        db.save(&bin).unwrap();
        assert_eq!(InliningDatabase::load(&bin).unwrap(), db);
    }

    #[test]
    fn test_load_rejects_empty_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(
            &path,
            r#"[{"outer":{"class":"","selector":"foo"},"inner":null,"root":{"children":[],"untaken":[],"uninlinable":[],"complete":[]}}]"#,
        )
        .unwrap();
        assert!(matches!(InliningDatabase::load(&path), Err(Error::Database(_))));
        assert!(InliningDatabase::from_json("not json").is_err());
    }
}
