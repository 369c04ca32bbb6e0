//! kvsync core types: the nested document model and its flat key/value form.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;
use tracing::debug;

/// Separator between nested map keys in a flattened path.
pub const PATH_SEPARATOR: char = '/';
/// Separator between a path and a sequence index.
pub const INDEX_SEPARATOR: char = '.';
/// Text used for null leaves.
pub const NULL_TEXT: &str = "null";

/// A nested document: maps, ordered sequences and scalar leaves.
///
/// Map keys are held in a `BTreeMap` so every walk over a document visits
/// them in lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Node {
    Map(BTreeMap<String, Node>),
    Sequence(Vec<Node>),
    Scalar(String),
}

impl Default for Node {
    fn default() -> Self { Node::Map(BTreeMap::new()) }
}

impl Node {
    /// Number of nodes in this tree, the root included.
    pub fn node_count(&self) -> usize {
        match self {
            Node::Map(m) => 1 + m.values().map(Node::node_count).sum::<usize>(),
            Node::Sequence(s) => 1 + s.iter().map(Node::node_count).sum::<usize>(),
            Node::Scalar(_) => 1,
        }
    }
}

impl From<Yaml> for Node {
    fn from(v: Yaml) -> Self {
        match v {
            Yaml::Mapping(map) => {
                let mut out = BTreeMap::new();
                for (k, child) in map {
                    out.insert(key_text(&k), Node::from(child));
                }
                Node::Map(out)
            }
            Yaml::Sequence(items) => Node::Sequence(items.into_iter().map(Node::from).collect()),
            Yaml::Tagged(tagged) => Node::from(tagged.value),
            other => Node::Scalar(scalar_text(&other).unwrap_or_default()),
        }
    }
}

fn scalar_text(v: &Yaml) -> Option<String> {
    match v {
        Yaml::Null => Some(NULL_TEXT.to_string()),
        Yaml::Bool(b) => Some(b.to_string()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::String(s) => Some(s.clone()),
        Yaml::Tagged(t) => scalar_text(&t.value),
        Yaml::Sequence(_) | Yaml::Mapping(_) => None,
    }
}

// Complex keys (a mapping used as a key) fall back to their YAML rendering.
fn key_text(k: &Yaml) -> String {
    scalar_text(k).unwrap_or_else(|| {
        serde_yaml::to_string(k).map(|s| s.trim_end().to_string()).unwrap_or_default()
    })
}

// ---- parsing ----

/// Bounds applied before a document is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("document too large (>{limit} bytes)")]
    TooLarge { limit: usize },
    #[error("document too complex (>{limit} nodes)")]
    TooComplex { limit: usize },
    #[error("document root must be a mapping, found {found}")]
    NotAMapping { found: &'static str },
    #[error("invalid YAML: {0}")]
    Syntax(#[from] serde_yaml::Error),
}

fn yaml_budget_exceeded(v: &Yaml, max: usize) -> bool {
    // Running counter that stops walking one node past the budget
    fn walk(v: &Yaml, cur: &mut usize, max: usize) {
        if *cur > max { return; }
        *cur += 1;
        match v {
            Yaml::Mapping(map) => {
                for (_k, vv) in map.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            Yaml::Sequence(arr) => {
                for vv in arr.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            Yaml::Tagged(t) => walk(&t.value, cur, max),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Parse a serialized document. Blank text and a bare `null` are an empty map.
pub fn parse_document(text: &str, limits: &ParseLimits) -> Result<Node, ParseError> {
    if text.len() > limits.max_bytes {
        return Err(ParseError::TooLarge { limit: limits.max_bytes });
    }
    if text.trim().is_empty() {
        return Ok(Node::default());
    }
    let val: Yaml = serde_yaml::from_str(text)?;
    if yaml_budget_exceeded(&val, limits.max_nodes) {
        return Err(ParseError::TooComplex { limit: limits.max_nodes });
    }
    match val {
        Yaml::Null => Ok(Node::default()),
        Yaml::Mapping(_) => Ok(Node::from(val)),
        Yaml::Sequence(_) => Err(ParseError::NotAMapping { found: "sequence" }),
        Yaml::Tagged(_) => Err(ParseError::NotAMapping { found: "tagged value" }),
        _ => Err(ParseError::NotAMapping { found: "scalar" }),
    }
}

// ---- flattening ----

/// One flattened leaf: `(path, value)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatEntry {
    pub path: String,
    pub value: String,
}

/// Ordered, path-unique result of flattening one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatKeySet {
    entries: Vec<FlatEntry>,
}

impl FlatKeySet {
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, FlatEntry> { self.entries.iter() }
    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ { self.entries.iter().map(|e| e.path.as_str()) }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.iter().find(|e| e.path == path).map(|e| e.value.as_str())
    }
}

impl<'a> IntoIterator for &'a FlatKeySet {
    type Item = &'a FlatEntry;
    type IntoIter = std::slice::Iter<'a, FlatEntry>;
    fn into_iter(self) -> Self::IntoIter { self.entries.iter() }
}

impl FromIterator<(String, String)> for FlatKeySet {
    /// Later pairs replace the value of an earlier pair with the same path,
    /// keeping the earlier position.
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut entries: Vec<FlatEntry> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (path, value) in iter {
            match index.get(&path) {
                Some(&i) => {
                    debug!(path = %path, "duplicate flattened path; keeping last value");
                    entries[i].value = value;
                }
                None => {
                    index.insert(path.clone(), entries.len());
                    entries.push(FlatEntry { path, value });
                }
            }
        }
        Self { entries }
    }
}

/// Flatten a document into path-keyed scalar entries in depth-first,
/// key-sorted order.
pub fn flatten(doc: &Node) -> FlatKeySet {
    fn walk(node: &Node, path: Option<String>, out: &mut Vec<(String, String)>) {
        match node {
            Node::Map(children) => {
                for (k, child) in children {
                    let next = match &path {
                        Some(p) => format!("{}{}{}", p, PATH_SEPARATOR, k),
                        None => k.clone(),
                    };
                    walk(child, Some(next), out);
                }
            }
            Node::Sequence(items) => {
                let base = path.unwrap_or_default();
                for (i, item) in items.iter().enumerate() {
                    walk(item, Some(format!("{}{}{}", base, INDEX_SEPARATOR, i)), out);
                }
            }
            Node::Scalar(v) => out.push((path.unwrap_or_default(), v.clone())),
        }
    }
    let mut pairs = Vec::new();
    walk(doc, None, &mut pairs);
    pairs.into_iter().collect()
}

// ---- nesting ----

/// Rebuild a nested map from store keys found below `prefix`.
///
/// Keys are split on `/`; folder keys (ending in `/`) carry no value and are
/// skipped. When a path is both a leaf and a parent the map is kept.
pub fn nest<I>(entries: I, prefix: &str) -> Node
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut root: BTreeMap<String, Node> = BTreeMap::new();
    for (key, value) in entries {
        let Some(rel) = key.strip_prefix(prefix) else { continue };
        if rel.ends_with(PATH_SEPARATOR) { continue; }
        let segments: Vec<&str> = rel.split(PATH_SEPARATOR).filter(|s| !s.is_empty()).collect();
        let Some((leaf, parents)) = segments.split_last() else { continue };

        let mut cur = &mut root;
        for seg in parents {
            let slot = cur.entry((*seg).to_string()).or_insert_with(Node::default);
            if !matches!(slot, Node::Map(_)) {
                debug!(key = %key, "scalar replaced by nested map");
                *slot = Node::default();
            }
            cur = match slot {
                Node::Map(m) => m,
                _ => unreachable!("slot was just made a map"),
            };
        }
        match cur.get(*leaf) {
            Some(Node::Map(_)) => debug!(key = %key, "leaf shadowed by nested map"),
            _ => { cur.insert((*leaf).to_string(), Node::Scalar(value)); }
        }
    }
    Node::Map(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(y: &str) -> Node { parse_document(y, &ParseLimits::default()).unwrap() }

    fn pairs(set: &FlatKeySet) -> Vec<(&str, &str)> {
        set.iter().map(|e| (e.path.as_str(), e.value.as_str())).collect()
    }

    #[test]
    fn nested_maps_join_with_slash() {
        let set = flatten(&parse("a:\n  b: v\n"));
        assert_eq!(pairs(&set), vec![("a/b", "v")]);
    }

    #[test]
    fn sequences_append_index() {
        let set = flatten(&parse("a: [x, y]\n"));
        assert_eq!(pairs(&set), vec![("a.0", "x"), ("a.1", "y")]);

        let set = flatten(&parse("a:\n  b:\n    - x\n"));
        assert_eq!(pairs(&set), vec![("a/b.0", "x")]);
    }

    #[test]
    fn sequence_items_recurse() {
        let set = flatten(&parse("a:\n  - b: 1\n  - [p, q]\n"));
        assert_eq!(pairs(&set), vec![("a.0/b", "1"), ("a.1.0", "p"), ("a.1.1", "q")]);
    }

    #[test]
    fn keys_are_visited_in_sorted_order() {
        let one = flatten(&parse("z: 1\nm:\n  y: 2\n  b: 3\na: 4\n"));
        let two = flatten(&parse("a: 4\nm:\n  b: 3\n  y: 2\nz: 1\n"));
        assert_eq!(one, two);
        assert_eq!(one.paths().collect::<Vec<_>>(), vec!["a", "m/b", "m/y", "z"]);
    }

    #[test]
    fn scalars_are_stringified() {
        let set = flatten(&parse("n: 5432\nb: true\nz: ~\ns: \"5432\"\n1: one\n"));
        assert_eq!(set.get("n"), Some("5432"));
        assert_eq!(set.get("b"), Some("true"));
        assert_eq!(set.get("z"), Some(NULL_TEXT));
        assert_eq!(set.get("s"), Some("5432"));
        assert_eq!(set.get("1"), Some("one"));
    }

    #[test]
    fn empty_containers_emit_nothing() {
        let set = flatten(&parse("a: {}\nb: []\nc: v\n"));
        assert_eq!(pairs(&set), vec![("c", "v")]);
    }

    #[test]
    fn colliding_paths_keep_one_entry() {
        // "a.0" as a literal key and as the first element of "a"
        let set = flatten(&parse("a: [x]\na.0: y\n"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("a.0"), Some("y"));
    }

    #[test]
    fn blank_and_null_documents_are_empty() {
        assert!(flatten(&parse("")).is_empty());
        assert!(flatten(&parse("  \n")).is_empty());
        assert!(flatten(&parse("~")).is_empty());
    }

    #[test]
    fn root_must_be_a_mapping() {
        let e = parse_document("- a\n- b\n", &ParseLimits::default()).unwrap_err();
        assert!(matches!(e, ParseError::NotAMapping { found: "sequence" }), "{e}");
        let e = parse_document("just text", &ParseLimits::default()).unwrap_err();
        assert!(matches!(e, ParseError::NotAMapping { found: "scalar" }), "{e}");
    }

    #[test]
    fn malformed_yaml_is_a_syntax_error() {
        let e = parse_document("a: [unclosed\n", &ParseLimits::default()).unwrap_err();
        assert!(matches!(e, ParseError::Syntax(_)), "{e}");
    }

    #[test]
    fn limits_are_enforced() {
        let limits = ParseLimits { max_bytes: 8, max_nodes: 100 };
        assert!(matches!(parse_document("a: 0123456789", &limits), Err(ParseError::TooLarge { limit: 8 })));

        let limits = ParseLimits { max_bytes: 1_000, max_nodes: 3 };
        assert!(matches!(parse_document("a: 1\nb: 2\nc: 3\n", &limits), Err(ParseError::TooComplex { limit: 3 })));
    }

    #[test]
    fn node_limit_is_inclusive() {
        // root plus two leaves
        let limits = ParseLimits { max_bytes: 1_000, max_nodes: 3 };
        let doc = parse_document("a: 1\nb: 2\n", &limits).unwrap();
        assert_eq!(doc.node_count(), 3);

        let limits = ParseLimits { max_bytes: 1_000, max_nodes: 2 };
        assert!(matches!(parse_document("a: 1\nb: 2\n", &limits), Err(ParseError::TooComplex { limit: 2 })));
    }

    #[test]
    fn nest_rebuilds_maps_below_prefix() {
        let entries = vec![
            ("app/db/host".to_string(), "x".to_string()),
            ("app/db/port".to_string(), "5432".to_string()),
            ("app/".to_string(), String::new()),
            ("other/key".to_string(), "skip".to_string()),
        ];
        let node = nest(entries, "app/");
        let set = flatten(&node);
        assert_eq!(pairs(&set), vec![("db/host", "x"), ("db/port", "5432")]);
    }

    #[test]
    fn nest_prefers_maps_over_scalars() {
        let entries = vec![
            ("a".to_string(), "leaf".to_string()),
            ("a/b".to_string(), "v".to_string()),
            ("c/d".to_string(), "v".to_string()),
            ("c".to_string(), "leaf".to_string()),
        ];
        let set = flatten(&nest(entries, ""));
        assert_eq!(pairs(&set), vec![("a/b", "v"), ("c/d", "v")]);
    }

    #[test]
    fn node_serializes_as_plain_yaml() {
        let node = parse("db:\n  host: x\nlist: [a]\n");
        let text = serde_yaml::to_string(&node).unwrap();
        assert_eq!(parse(&text), node);
        assert_eq!(node.node_count(), 5);
    }
}
