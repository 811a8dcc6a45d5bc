//! Bibliography database metadata and entry cleanup.
//! The codec, group tree and change model stay pure; file renames and user
//! interaction are reached through the traits in `storage` and `action`.

pub mod core {
    use crate::codec::{self, DecodeError, ESCAPE, SEPARATOR};
    use crate::metadata::MetaData;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Field holding the citation key.
    pub const KEY_FIELD: &str = "bibtexkey";

    /// Field holding the linked files of an entry.
    pub const FILE_FIELD: &str = "file";

    /// Line break written into persisted metadata blocks.
    pub const NEWLINE: &str = if cfg!(windows) { "\r\n" } else { "\n" };

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntryId(pub Uuid);

    impl EntryId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A bibliography entry: a type plus an ordered field map.
    ///
    /// Field names are case-insensitive and stored lower-cased.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        #[serde(default = "EntryId::new")]
        pub id: EntryId,
        pub entry_type: String,
        #[serde(default)]
        fields: IndexMap<String, String>,
    }

    impl Entry {
        pub fn new(entry_type: impl Into<String>) -> Self {
            Self {
                id: EntryId::new(),
                entry_type: entry_type.into(),
                fields: IndexMap::new(),
            }
        }

        pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
            self.set_field(name, value);
            self
        }

        pub fn field(&self, name: &str) -> Option<&str> {
            self.fields.get(&normalize_field_name(name)).map(String::as_str)
        }

        pub fn has_field(&self, name: &str) -> bool {
            self.fields.contains_key(&normalize_field_name(name))
        }

        /// Sets a field and returns the previous value.
        pub fn set_field(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
            self.fields.insert(normalize_field_name(name), value.into())
        }

        /// Removes a field, keeping the order of the remaining ones.
        pub fn clear_field(&mut self, name: &str) -> Option<String> {
            self.fields.shift_remove(&normalize_field_name(name))
        }

        /// Sets or removes a field depending on `value`.
        pub fn put_field(&mut self, name: &str, value: Option<String>) -> Option<String> {
            match value {
                Some(v) => self.set_field(name, v),
                None => self.clear_field(name),
            }
        }

        pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
            self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
        }

        pub fn citation_key(&self) -> Option<&str> {
            self.field(KEY_FIELD)
        }
    }

    fn normalize_field_name(name: &str) -> String {
        name.trim().to_lowercase()
    }

    /// An open database: its entries plus the metadata persisted alongside them.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct BibDatabase {
        pub entries: Vec<Entry>,
        pub metadata: MetaData,
    }

    impl BibDatabase {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_entry(&mut self, entry: Entry) -> EntryId {
            let id = entry.id;
            self.entries.push(entry);
            id
        }

        pub fn entry(&self, id: EntryId) -> Option<&Entry> {
            self.entries.iter().find(|e| e.id == id)
        }

        pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
            self.entries.iter_mut().find(|e| e.id == id)
        }

        pub fn entry_by_key(&self, key: &str) -> Option<&Entry> {
            self.entries.iter().find(|e| e.citation_key() == Some(key))
        }
    }

    /* --------------------------- Linked files --------------------------- */

    /// One `description:link:type` triple of the `file` field.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LinkedFile {
        pub description: String,
        pub link: String,
        pub file_type: String,
    }

    impl LinkedFile {
        pub fn new(description: &str, link: &str, file_type: &str) -> Self {
            Self {
                description: description.to_string(),
                link: link.to_string(),
                file_type: file_type.to_string(),
            }
        }

        pub fn is_online(&self) -> bool {
            let lower = self.link.to_ascii_lowercase();
            ["http://", "https://", "ftp://", "www."]
                .iter()
                .any(|p| lower.starts_with(p))
        }
    }

    /// Parses a `file` field value. A token without `:` is a bare link.
    pub fn parse_file_field(value: &str) -> Result<Vec<LinkedFile>, DecodeError> {
        let mut files = Vec::new();
        for token in codec::decode_list(value, SEPARATOR, ESCAPE)? {
            if token.is_empty() {
                continue;
            }
            let parts = codec::decode_list(&token, ':', ESCAPE)?;
            let file = match parts.as_slice() {
                [link] => LinkedFile::new("", link, ""),
                [description, link] => LinkedFile::new(description, link, ""),
                [description, link, file_type, ..] => {
                    LinkedFile::new(description, link, file_type)
                }
                [] => continue,
            };
            files.push(file);
        }
        Ok(files)
    }

    pub fn serialize_file_field(files: &[LinkedFile]) -> String {
        files
            .iter()
            .map(|f| {
                let triple = [&f.description, &f.link, &f.file_type]
                    .map(|part| codec::encode(part, ':', ESCAPE))
                    .join(":");
                codec::encode(&triple, SEPARATOR, ESCAPE)
            })
            .collect::<Vec<_>>()
            .join(";")
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("group {0} does not exist")]
        UnknownGroup(usize),
        #[error("group label {0:?} contains a line break")]
        MultilineGroupLabel(String),
        #[error("the root group cannot be removed")]
        RootRemoval,
        #[error("unknown formatter {0:?}")]
        UnknownFormatter(String),
        #[error("malformed field action {0:?}")]
        MalformedFieldAction(String),
        #[error("malformed save order configuration: {0}")]
        MalformedSaveOrder(String),
        #[error("unknown cleanup rule {0:?}")]
        UnknownCleanupRule(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn field_names_are_case_insensitive() {
            let mut entry = Entry::new("article").with_field("Title", "Optics");
            assert_eq!(entry.field("title"), Some("Optics"));
            assert_eq!(entry.field("TITLE"), Some("Optics"));
            assert_eq!(entry.set_field("title", "Physics"), Some("Optics".to_string()));
            assert_eq!(entry.clear_field("Title"), Some("Physics".to_string()));
            assert!(!entry.has_field("title"));
        }

        #[test]
        fn clear_field_keeps_remaining_order() {
            let mut entry = Entry::new("book")
                .with_field("author", "A")
                .with_field("title", "T")
                .with_field("year", "2001");
            entry.clear_field("title");
            let names: Vec<&str> = entry.fields().map(|(k, _)| k).collect();
            assert_eq!(names, vec!["author", "year"]);
        }

        #[test]
        fn file_field_round_trips_escaped_parts() {
            let files = vec![
                LinkedFile::new("Main; final", "papers/a:b.pdf", "PDF"),
                LinkedFile::new("", "C:\\docs\\x.pdf", ""),
            ];
            let raw = serialize_file_field(&files);
            assert_eq!(parse_file_field(&raw).expect("parse"), files);
        }

        #[test]
        fn file_field_accepts_bare_links() {
            let files = parse_file_field("paper.pdf").expect("parse");
            assert_eq!(files, vec![LinkedFile::new("", "paper.pdf", "")]);
            assert!(parse_file_field("").expect("empty").is_empty());
        }

        #[test]
        fn online_links_are_detected() {
            assert!(LinkedFile::new("", "https://example.org/a.pdf", "").is_online());
            assert!(!LinkedFile::new("", "local/a.pdf", "").is_online());
        }
    }
}

pub mod codec {
    //! Escaped-string codec for separator-delimited metadata values.
    //!
    //! The escape character prefixes every separator and every escape character
    //! in a value; nothing else is touched.

    /// Separator between the values of one metadata key.
    pub const SEPARATOR: char = ';';

    /// Escape character, shared by every separator this codec is used with.
    pub const ESCAPE: char = '\\';

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DecodeError {
        #[error("escape character at offset {offset} is not followed by any character")]
        DanglingEscape { offset: usize },
        #[error("unescaped separator at offset {offset}")]
        UnescapedSeparator { offset: usize },
    }

    impl DecodeError {
        pub(crate) fn offset_by(self, by: usize) -> Self {
            match self {
                Self::DanglingEscape { offset } => Self::DanglingEscape { offset: offset + by },
                Self::UnescapedSeparator { offset } => {
                    Self::UnescapedSeparator { offset: offset + by }
                }
            }
        }
    }

    pub fn encode(value: &str, separator: char, escape: char) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            if c == separator || c == escape {
                out.push(escape);
            }
            out.push(c);
        }
        out
    }

    /// One decoded field and the input that follows it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Token<'a> {
        pub value: String,
        pub rest: &'a str,
        /// Whether the field ended at an unescaped separator rather than at end of input.
        pub terminated: bool,
    }

    /// Decodes a single field, stopping after the first unescaped separator.
    pub fn decode_token(
        input: &str,
        separator: char,
        escape: char,
    ) -> Result<Token<'_>, DecodeError> {
        let mut value = String::new();
        let mut chars = input.char_indices();
        while let Some((offset, c)) = chars.next() {
            if c == escape {
                match chars.next() {
                    Some((_, escaped)) => value.push(escaped),
                    None => return Err(DecodeError::DanglingEscape { offset }),
                }
            } else if c == separator {
                return Ok(Token {
                    value,
                    rest: &input[offset + c.len_utf8()..],
                    terminated: true,
                });
            } else {
                value.push(c);
            }
        }
        Ok(Token {
            value,
            rest: "",
            terminated: false,
        })
    }

    /// Exact inverse of [`encode`]; an unescaped separator is an error.
    pub fn decode(input: &str, separator: char, escape: char) -> Result<String, DecodeError> {
        let token = decode_token(input, separator, escape)?;
        if token.terminated {
            let offset = input.len() - token.rest.len() - separator.len_utf8();
            return Err(DecodeError::UnescapedSeparator { offset });
        }
        Ok(token.value)
    }

    /// Decodes a separator-terminated list. The final separator may be missing.
    pub fn decode_list(
        input: &str,
        separator: char,
        escape: char,
    ) -> Result<Vec<String>, DecodeError> {
        let mut values = Vec::new();
        let mut rest = input;
        while !rest.is_empty() {
            let consumed = input.len() - rest.len();
            let token =
                decode_token(rest, separator, escape).map_err(|e| e.offset_by(consumed))?;
            values.push(token.value);
            rest = token.rest;
        }
        Ok(values)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trips_reserved_characters() {
            let samples = [
                "",
                ";",
                "\\",
                "\\\\\\",
                ";;\\;",
                "plain",
                "a;b\\c",
                "trailing\\",
                "ünïcødé;€",
            ];
            for sample in samples {
                let encoded = encode(sample, SEPARATOR, ESCAPE);
                assert_eq!(decode(&encoded, SEPARATOR, ESCAPE).as_deref(), Ok(sample));
            }
        }

        #[test]
        fn encode_only_touches_reserved_characters() {
            assert_eq!(encode("a;b\\c:d", ';', '\\'), "a\\;b\\\\c:d");
            assert_eq!(encode("a;b:c", ':', '\\'), "a;b\\:c");
        }

        #[test]
        fn dangling_escape_is_reported() {
            assert_eq!(
                decode("abc\\", SEPARATOR, ESCAPE),
                Err(DecodeError::DanglingEscape { offset: 3 })
            );
            assert_eq!(
                decode_list("a;bc\\", SEPARATOR, ESCAPE),
                Err(DecodeError::DanglingEscape { offset: 4 })
            );
        }

        #[test]
        fn decode_rejects_unescaped_separator() {
            assert_eq!(
                decode("ab;c", SEPARATOR, ESCAPE),
                Err(DecodeError::UnescapedSeparator { offset: 2 })
            );
        }

        #[test]
        fn decode_list_splits_on_unescaped_separators() {
            let values = decode_list("year;b\\;c;;last", SEPARATOR, ESCAPE).expect("decode");
            assert_eq!(values, vec!["year", "b;c", "", "last"]);
            assert!(decode_list("", SEPARATOR, ESCAPE).expect("empty").is_empty());
        }
    }
}

pub mod groups {
    //! Group tree kept in an arena and flattened to depth-prefixed lines.
    //!
    //! Line format: `<depth> <label>;` where children of the implicit root have
    //! depth 1 and the label is escaped with the metadata codec. Depth grows by
    //! at most one from one line to the next; lines appear in pre-order.

    use crate::codec::{self, DecodeError, ESCAPE, SEPARATOR};
    use crate::core::DomainError;
    use nom::{
        IResult,
        character::complete::{char, digit1},
        combinator::map_res,
        sequence::terminated,
    };

    /// Label of the implicit root ("all entries").
    pub const ROOT_LABEL: &str = "All entries";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct GroupId(usize);

    impl GroupId {
        pub fn index(self) -> usize {
            self.0
        }
    }

    #[derive(Debug, Clone)]
    struct GroupNode {
        label: String,
        children: Vec<GroupId>,
        /// Cleared when the node's subtree is detached from the tree.
        live: bool,
    }

    #[derive(Debug, Clone)]
    pub struct GroupTree {
        nodes: Vec<GroupNode>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TreeParseError {
        #[error("line {line}: missing depth marker")]
        MissingDepth { line: usize },
        #[error("line {line}: depth {depth} is not allowed here (expected 1..={max})")]
        InvalidDepth { line: usize, depth: usize, max: usize },
        #[error("line {line}: {source}")]
        Label {
            line: usize,
            #[source]
            source: DecodeError,
        },
        #[error("line {line}: group label is not terminated by a separator")]
        Unterminated { line: usize },
        #[error("line {line}: unexpected text after the group label")]
        TrailingInput { line: usize },
    }

    impl Default for GroupTree {
        fn default() -> Self {
            Self::new()
        }
    }

    impl GroupTree {
        /// A tree holding only the root.
        pub fn new() -> Self {
            Self {
                nodes: vec![GroupNode {
                    label: ROOT_LABEL.to_string(),
                    children: Vec::new(),
                    live: true,
                }],
            }
        }

        pub fn root(&self) -> GroupId {
            GroupId(0)
        }

        pub fn contains(&self, id: GroupId) -> bool {
            self.nodes.get(id.0).is_some_and(|n| n.live)
        }

        pub fn label(&self, id: GroupId) -> Option<&str> {
            self.node(id).map(|n| n.label.as_str())
        }

        pub fn children(&self, id: GroupId) -> &[GroupId] {
            self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
        }

        /// Whether anything hangs below the root.
        pub fn has_children(&self) -> bool {
            !self.nodes[0].children.is_empty()
        }

        /// Number of groups below the root.
        pub fn len(&self) -> usize {
            self.iter().count()
        }

        pub fn is_empty(&self) -> bool {
            !self.has_children()
        }

        pub fn add_child(
            &mut self,
            parent: GroupId,
            label: impl Into<String>,
        ) -> Result<GroupId, DomainError> {
            let label = label.into();
            if label.contains(['\n', '\r']) {
                return Err(DomainError::MultilineGroupLabel(label));
            }
            if !self.contains(parent) {
                return Err(DomainError::UnknownGroup(parent.0));
            }
            Ok(self.push_child(parent, label))
        }

        pub fn rename(&mut self, id: GroupId, label: impl Into<String>) -> Result<(), DomainError> {
            let label = label.into();
            if label.contains(['\n', '\r']) {
                return Err(DomainError::MultilineGroupLabel(label));
            }
            match self.nodes.get_mut(id.0).filter(|n| n.live) {
                Some(node) => {
                    node.label = label;
                    Ok(())
                }
                None => Err(DomainError::UnknownGroup(id.0)),
            }
        }

        /// Detaches `id` and its whole subtree.
        pub fn remove(&mut self, id: GroupId) -> Result<(), DomainError> {
            if id == self.root() {
                return Err(DomainError::RootRemoval);
            }
            if !self.contains(id) {
                return Err(DomainError::UnknownGroup(id.0));
            }
            for node in self.nodes.iter_mut() {
                node.children.retain(|c| *c != id);
            }
            let mut pending = vec![id];
            while let Some(next) = pending.pop() {
                let node = &mut self.nodes[next.0];
                node.live = false;
                pending.extend(node.children.iter().copied());
            }
            Ok(())
        }

        /// Follows child labels from the root; the first match wins at each level.
        pub fn find_path(&self, path: &[&str]) -> Option<GroupId> {
            let mut current = self.root();
            for label in path {
                current = *self
                    .children(current)
                    .iter()
                    .find(|c| self.label(**c) == Some(*label))?;
            }
            Some(current)
        }

        /// Pre-order walk below the root yielding `(depth, id)`, depth starting at 1.
        pub fn iter(&self) -> impl Iterator<Item = (usize, GroupId)> + '_ {
            let mut stack: Vec<(usize, GroupId)> =
                self.nodes[0].children.iter().rev().map(|c| (1, *c)).collect();
            std::iter::from_fn(move || {
                let (depth, id) = stack.pop()?;
                stack.extend(self.children(id).iter().rev().map(|c| (depth + 1, *c)));
                Some((depth, id))
            })
        }

        pub fn flatten(&self) -> Vec<String> {
            self.iter()
                .map(|(depth, id)| {
                    let label = codec::encode(&self.nodes[id.0].label, SEPARATOR, ESCAPE);
                    format!("{depth} {label}{SEPARATOR}")
                })
                .collect()
        }

        pub fn unflatten<I, S>(lines: I) -> Result<Self, TreeParseError>
        where
            I: IntoIterator<Item = S>,
            S: AsRef<str>,
        {
            let mut tree = GroupTree::new();
            // path[d] is the latest node seen at depth d; path[0] is the root.
            let mut path = vec![tree.root()];
            for (idx, raw) in lines.into_iter().enumerate() {
                let line = idx + 1;
                let (depth, label) = parse_group_line(raw.as_ref(), line)?;
                let max = path.len();
                if depth == 0 || depth > max {
                    return Err(TreeParseError::InvalidDepth { line, depth, max });
                }
                path.truncate(depth);
                let id = tree.push_child(path[depth - 1], label);
                path.push(id);
            }
            Ok(tree)
        }

        fn node(&self, id: GroupId) -> Option<&GroupNode> {
            self.nodes.get(id.0).filter(|n| n.live)
        }

        fn push_child(&mut self, parent: GroupId, label: String) -> GroupId {
            let id = GroupId(self.nodes.len());
            self.nodes.push(GroupNode {
                label,
                children: Vec::new(),
                live: true,
            });
            self.nodes[parent.0].children.push(id);
            id
        }

        fn same_subtree(&self, a: GroupId, other: &GroupTree, b: GroupId) -> bool {
            let (left, right) = (self.children(a), other.children(b));
            left.len() == right.len()
                && left.iter().zip(right).all(|(x, y)| {
                    self.label(*x) == other.label(*y) && self.same_subtree(*x, other, *y)
                })
        }
    }

    /// Structural equality: same labels in the same shape, regardless of arena layout.
    impl PartialEq for GroupTree {
        fn eq(&self, other: &Self) -> bool {
            self.label(self.root()) == other.label(other.root())
                && self.same_subtree(self.root(), other, other.root())
        }
    }

    impl Eq for GroupTree {}

    fn depth_marker(i: &str) -> IResult<&str, usize> {
        terminated(map_res(digit1, |d: &str| d.parse::<usize>()), char(' '))(i)
    }

    fn parse_group_line(raw: &str, line: usize) -> Result<(usize, String), TreeParseError> {
        let (rest, depth) =
            depth_marker(raw).map_err(|_| TreeParseError::MissingDepth { line })?;
        let token = codec::decode_token(rest, SEPARATOR, ESCAPE)
            .map_err(|source| TreeParseError::Label { line, source })?;
        if !token.terminated {
            return Err(TreeParseError::Unterminated { line });
        }
        if !token.rest.is_empty() {
            return Err(TreeParseError::TrailingInput { line });
        }
        Ok((depth, token.value))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn physics_tree() -> GroupTree {
            let mut tree = GroupTree::new();
            let physics = tree.add_child(tree.root(), "Physics").expect("physics");
            tree.add_child(physics, "Optics").expect("optics");
            tree
        }

        #[test]
        fn two_level_tree_flattens_with_depth_markers() {
            let tree = physics_tree();
            assert_eq!(tree.flatten(), vec!["1 Physics;", "2 Optics;"]);
            assert_eq!(GroupTree::unflatten(tree.flatten()).expect("unflatten"), tree);
        }

        #[test]
        fn siblings_with_identical_labels_survive() {
            let mut tree = GroupTree::new();
            let a = tree.add_child(tree.root(), "Same").expect("a");
            tree.add_child(tree.root(), "Same").expect("b");
            tree.add_child(a, "Same").expect("c");
            tree.add_child(tree.root(), "x;y\\z").expect("d");

            let lines = tree.flatten();
            assert_eq!(lines, vec!["1 Same;", "2 Same;", "1 Same;", r"1 x\;y\\z;"]);
            let back = GroupTree::unflatten(&lines).expect("unflatten");
            assert_eq!(back, tree);
            assert_eq!(back.children(back.root()).len(), 3);
        }

        #[test]
        fn deep_chain_and_return_to_top_level() {
            let mut tree = GroupTree::new();
            let mut parent = tree.root();
            for label in ["a", "b", "c", "d"] {
                parent = tree.add_child(parent, label).expect("chain");
            }
            tree.add_child(tree.root(), "top").expect("top");
            let lines = tree.flatten();
            assert_eq!(lines.last().map(String::as_str), Some("1 top;"));
            assert_eq!(GroupTree::unflatten(&lines).expect("unflatten"), tree);
        }

        #[test]
        fn root_only_tree_has_no_lines() {
            let tree = GroupTree::new();
            assert!(tree.is_empty());
            assert!(tree.flatten().is_empty());
            assert_eq!(GroupTree::unflatten(Vec::<String>::new()).expect("empty"), tree);
        }

        #[test]
        fn equality_ignores_arena_layout() {
            let mut left = GroupTree::new();
            let a = left.add_child(left.root(), "A").expect("a");
            left.add_child(left.root(), "B").expect("b");
            left.add_child(a, "A1").expect("a1");

            let right = GroupTree::unflatten(["1 A;", "2 A1;", "1 B;"]).expect("unflatten");
            assert_eq!(left, right);

            let different = GroupTree::unflatten(["1 A;", "1 A1;", "1 B;"]).expect("flat");
            assert_ne!(left, different);
        }

        #[test]
        fn malformed_lines_are_rejected() {
            assert_eq!(
                GroupTree::unflatten(["2 Physics;"]),
                Err(TreeParseError::InvalidDepth { line: 1, depth: 2, max: 1 })
            );
            assert_eq!(
                GroupTree::unflatten(["1 A;", "3 B;"]),
                Err(TreeParseError::InvalidDepth { line: 2, depth: 3, max: 2 })
            );
            assert_eq!(
                GroupTree::unflatten(["0 A;"]),
                Err(TreeParseError::InvalidDepth { line: 1, depth: 0, max: 1 })
            );
            assert_eq!(
                GroupTree::unflatten(["Physics;"]),
                Err(TreeParseError::MissingDepth { line: 1 })
            );
            assert_eq!(
                GroupTree::unflatten(["1 Physics"]),
                Err(TreeParseError::Unterminated { line: 1 })
            );
            assert_eq!(
                GroupTree::unflatten(["1 A;B"]),
                Err(TreeParseError::TrailingInput { line: 1 })
            );
            assert!(matches!(
                GroupTree::unflatten(["1 A;", "1 B\\"]),
                Err(TreeParseError::Label { line: 2, .. })
            ));
        }

        #[test]
        fn remove_detaches_subtree() {
            let mut tree = physics_tree();
            let physics = tree.find_path(&["Physics"]).expect("physics");
            let optics = tree.find_path(&["Physics", "Optics"]).expect("optics");
            tree.remove(physics).expect("remove");
            assert!(!tree.contains(optics));
            assert!(tree.is_empty());
            assert_eq!(tree.remove(tree.root()), Err(DomainError::RootRemoval));
            assert_eq!(tree.add_child(optics, "x"), Err(DomainError::UnknownGroup(optics.index())));
        }

        #[test]
        fn multiline_labels_are_refused() {
            let mut tree = GroupTree::new();
            assert!(matches!(
                tree.add_child(tree.root(), "a\nb"),
                Err(DomainError::MultilineGroupLabel(_))
            ));
        }
    }
}

pub mod formatters {
    //! Field formatters shared by save actions and the cleanup engine.
    //! Every formatter is idempotent: applying it twice equals applying it once.

    use crate::core::{DomainError, Entry};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::take_till1,
        character::complete::{alpha1, char, digit1},
        combinator::{all_consuming, opt},
        multi::separated_list1,
        sequence::{delimited, preceded, terminated, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /// Tokens marking the enabled state of a save-actions block.
    pub const ENABLED: &str = "enabled";
    pub const DISABLED: &str = "disabled";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Formatter {
        Identity,
        LowerCase,
        UpperCase,
        TrimWhitespace,
        RemoveLatexCommands,
        HtmlToLatex,
        NormalizeNames,
        NormalizeDate,
    }

    impl Formatter {
        pub const ALL: [Formatter; 8] = [
            Formatter::Identity,
            Formatter::LowerCase,
            Formatter::UpperCase,
            Formatter::TrimWhitespace,
            Formatter::RemoveLatexCommands,
            Formatter::HtmlToLatex,
            Formatter::NormalizeNames,
            Formatter::NormalizeDate,
        ];

        pub fn key(self) -> &'static str {
            match self {
                Formatter::Identity => "identity",
                Formatter::LowerCase => "lower_case",
                Formatter::UpperCase => "upper_case",
                Formatter::TrimWhitespace => "trim_whitespace",
                Formatter::RemoveLatexCommands => "remove_latex_commands",
                Formatter::HtmlToLatex => "html_to_latex",
                Formatter::NormalizeNames => "normalize_names",
                Formatter::NormalizeDate => "normalize_date",
            }
        }

        pub fn format(self, value: &str) -> String {
            match self {
                Formatter::Identity => value.to_string(),
                Formatter::LowerCase => value.to_lowercase(),
                Formatter::UpperCase => value.to_uppercase(),
                Formatter::TrimWhitespace => collapse_whitespace(value),
                Formatter::RemoveLatexCommands => remove_latex_commands(value),
                Formatter::HtmlToLatex => html_to_latex(value),
                Formatter::NormalizeNames => normalize_names(value),
                Formatter::NormalizeDate => normalize_date(value),
            }
        }
    }

    impl FromStr for Formatter {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let key = s.trim();
            Formatter::ALL
                .into_iter()
                .find(|f| f.key() == key)
                .ok_or_else(|| DomainError::UnknownFormatter(key.to_string()))
        }
    }

    impl fmt::Display for Formatter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.key())
        }
    }

    /* --------------------------- Field actions --------------------------- */

    /// `field[formatter,formatter]`: formatters run left to right on one field.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FieldFormatterAction {
        pub field: String,
        pub formatters: Vec<Formatter>,
    }

    impl FieldFormatterAction {
        pub fn new(field: &str, formatters: Vec<Formatter>) -> Self {
            Self {
                field: field.trim().to_lowercase(),
                formatters,
            }
        }

        pub fn apply(&self, value: &str) -> String {
            self.formatters
                .iter()
                .fold(value.to_string(), |acc, f| f.format(&acc))
        }
    }

    fn field_action(i: &str) -> IResult<&str, (&str, Vec<&str>)> {
        tuple((
            take_till1(|c: char| c == '['),
            delimited(
                char('['),
                separated_list1(char(','), take_till1(|c: char| c == ',' || c == ']')),
                char(']'),
            ),
        ))(i)
    }

    impl FromStr for FieldFormatterAction {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let (_, (field, keys)) = all_consuming(field_action)(s.trim())
                .map_err(|_| DomainError::MalformedFieldAction(s.to_string()))?;
            let formatters = keys
                .into_iter()
                .map(str::parse)
                .collect::<Result<Vec<Formatter>, _>>()?;
            Ok(FieldFormatterAction::new(field, formatters))
        }
    }

    impl fmt::Display for FieldFormatterAction {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let keys: Vec<&str> = self.formatters.iter().map(|x| x.key()).collect();
            write!(f, "{}[{}]", self.field, keys.join(","))
        }
    }

    /// Save actions: formatters applied to fields, switched on or off as a block.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SaveActions {
        pub enabled: bool,
        #[serde(default)]
        pub actions: Vec<FieldFormatterAction>,
    }

    impl SaveActions {
        pub fn new(enabled: bool, actions: Vec<FieldFormatterAction>) -> Self {
            Self { enabled, actions }
        }

        /// Metadata values: the flag token followed by one value per action.
        pub fn to_meta_values(&self) -> Vec<String> {
            let flag = if self.enabled { ENABLED } else { DISABLED };
            std::iter::once(flag.to_string())
                .chain(self.actions.iter().map(|a| a.to_string()))
                .collect()
        }

        pub fn from_meta_values(values: &[String]) -> Result<Self, DomainError> {
            let (flag, rest) = values
                .split_first()
                .ok_or_else(|| DomainError::MalformedFieldAction(String::new()))?;
            let enabled = match flag.trim() {
                ENABLED => true,
                DISABLED => false,
                other => return Err(DomainError::MalformedFieldAction(other.to_string())),
            };
            let actions = rest
                .iter()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.parse())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Self { enabled, actions })
        }

        /// Proposed `(field, value)` updates for `entry`. Actions on the same
        /// field compose in order, and the composed chain is repeated until
        /// its output stops changing.
        pub fn propose(&self, entry: &Entry) -> Vec<(String, Option<String>)> {
            let mut chains: IndexMap<&str, Vec<&FieldFormatterAction>> = IndexMap::new();
            for action in &self.actions {
                chains.entry(action.field.as_str()).or_default().push(action);
            }
            chains
                .into_iter()
                .filter_map(|(field, chain)| {
                    let current = entry.field(field)?;
                    let formatted = apply_to_fixpoint(&chain, current);
                    (formatted != current).then(|| (field.to_string(), Some(formatted)))
                })
                .collect()
        }
    }

    /// Upper bound on chain repetitions; chains of idempotent formatters
    /// settle after one or two passes.
    const MAX_CHAIN_PASSES: usize = 8;

    fn apply_to_fixpoint(chain: &[&FieldFormatterAction], value: &str) -> String {
        let mut current = value.to_string();
        for _ in 0..MAX_CHAIN_PASSES {
            let next = chain.iter().fold(current.clone(), |acc, a| a.apply(&acc));
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /* ---------------------------- Transforms ---------------------------- */

    pub fn collapse_whitespace(value: &str) -> String {
        value.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Drops LaTeX command names and braces, keeping command arguments.
    pub fn remove_latex_commands(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(n) if n.is_ascii_alphabetic() => {
                        while chars.peek().is_some_and(|p| p.is_ascii_alphabetic()) {
                            chars.next();
                        }
                        if chars.peek() == Some(&' ') {
                            chars.next();
                        }
                    }
                    // `\\`, `\{` and `\}` carry no text of their own.
                    Some('\\' | '{' | '}') | None => {}
                    Some(n) => out.push(n),
                },
                '{' | '}' => {}
                _ => out.push(c),
            }
        }
        out
    }

    /// Converts HTML markup and entities to their LaTeX equivalents.
    ///
    /// Entities hidden behind `&amp;` (`&amp;lt;`, `&#38;amp;`) are unwrapped
    /// in the same pass, and a `&` already escaped as `\&` is left alone.
    pub fn html_to_latex(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        let mut escaped = false;
        while let Some(c) = rest.chars().next() {
            if c == '<' {
                if let Ok((after, (closing, name))) = html_tag(rest) {
                    out.push_str(latex_for_tag(closing, &name.to_ascii_lowercase()));
                    rest = after;
                    escaped = false;
                    continue;
                }
            } else if c == '&' && !escaped {
                if let Some((after, replacement)) = html_entity_chain(rest) {
                    out.push_str(&replacement);
                    rest = after;
                    continue;
                }
            }
            escaped = c == '\\' && !escaped;
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }

    /// Resolves one entity, following `&amp;` into any entity spelled after it.
    fn html_entity_chain(i: &str) -> Option<(&str, String)> {
        let (mut rest, mut entity) = html_entity(i).ok()?;
        let mut latex = latex_for_entity(entity)?;
        while entity.is_ampersand() {
            let Ok((after, inner)) = entity_body(rest) else {
                break;
            };
            let Some(inner_latex) = latex_for_entity(inner) else {
                break;
            };
            rest = after;
            entity = inner;
            latex = inner_latex;
        }
        Some((rest, latex))
    }

    fn html_tag(i: &str) -> IResult<&str, (bool, &str)> {
        let (i, _) = char('<')(i)?;
        let (i, closing) = opt(char('/'))(i)?;
        let (i, name) = alpha1(i)?;
        let (i, _) = opt(take_till1(|c: char| c == '>' || c == '<'))(i)?;
        let (i, _) = char('>')(i)?;
        Ok((i, (closing.is_some(), name)))
    }

    #[derive(Clone, Copy)]
    enum Entity<'a> {
        Named(&'a str),
        Numeric(&'a str),
    }

    impl Entity<'_> {
        fn is_ampersand(self) -> bool {
            match self {
                Entity::Named(name) => name == "amp",
                Entity::Numeric(code) => code.parse::<u32>() == Ok(38),
            }
        }
    }

    fn html_entity(i: &str) -> IResult<&str, Entity<'_>> {
        preceded(char('&'), entity_body)(i)
    }

    /// `name;` or `#digits;`, the part of an entity after its `&`.
    fn entity_body(i: &str) -> IResult<&str, Entity<'_>> {
        terminated(
            alt((
                nom::combinator::map(preceded(char('#'), digit1), Entity::Numeric),
                nom::combinator::map(alpha1, Entity::Named),
            )),
            char(';'),
        )(i)
    }

    fn latex_for_tag(closing: bool, name: &str) -> &'static str {
        match (name, closing) {
            ("i" | "em", false) => "\\textit{",
            ("b" | "strong", false) => "\\textbf{",
            ("sub", false) => "$_{",
            ("sup", false) => "$^{",
            ("i" | "em" | "b" | "strong", true) => "}",
            ("sub" | "sup", true) => "}$",
            ("br", _) => " ",
            _ => "",
        }
    }

    fn latex_for_char(c: char) -> String {
        match c {
            '<' => "$<$".to_string(),
            '>' => "$>$".to_string(),
            '&' => "\\&".to_string(),
            other => other.to_string(),
        }
    }

    fn latex_for_entity(entity: Entity<'_>) -> Option<String> {
        match entity {
            Entity::Numeric(code) => code
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map(latex_for_char),
            Entity::Named(name) => {
                let latex = match name {
                    "amp" => "\\&",
                    "lt" => "$<$",
                    "gt" => "$>$",
                    "quot" => "\"",
                    "apos" => "'",
                    "nbsp" => "~",
                    "ndash" => "--",
                    "mdash" => "---",
                    "hellip" => "\\ldots{}",
                    _ => return None,
                };
                Some(latex.to_string())
            }
        }
    }

    /// Rewrites a BibTeX name list as `Last, First and Last, First`.
    /// Braced groups are kept intact and never split.
    pub fn normalize_names(value: &str) -> String {
        let words = brace_aware_words(value);
        let mut names: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for word in &words {
            if word.eq_ignore_ascii_case("and") {
                if !current.is_empty() {
                    names.push(normalize_name(&current));
                }
                current.clear();
            } else {
                current.push(word);
            }
        }
        if !current.is_empty() {
            names.push(normalize_name(&current));
        }
        names.join(" and ")
    }

    fn brace_aware_words(value: &str) -> Vec<String> {
        let mut words = Vec::new();
        let mut word = String::new();
        let mut depth = 0usize;
        for c in value.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                _ => {}
            }
            if c.is_whitespace() && depth == 0 {
                if !word.is_empty() {
                    words.push(std::mem::take(&mut word));
                }
            } else {
                word.push(c);
            }
        }
        if !word.is_empty() {
            words.push(word);
        }
        words
    }

    fn normalize_name(words: &[&str]) -> String {
        let joined = words.join(" ");
        let parts = split_top_level_commas(&joined);
        if parts.len() > 1 {
            return parts
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
        }
        if words.len() < 2 {
            return joined;
        }
        // A lower-case word ("van", "de") starts the last-name part.
        let split = words[1..words.len() - 1]
            .iter()
            .position(|w| w.starts_with(|c: char| c.is_lowercase()))
            .map_or(words.len() - 1, |p| p + 1);
        format!("{}, {}", words[split..].join(" "), words[..split].join(" "))
    }

    fn split_top_level_commas(value: &str) -> Vec<&str> {
        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut start = 0;
        for (idx, c) in value.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(&value[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            }
        }
        parts.push(&value[start..]);
        parts
    }

    const FULL_DATE_FORMATS: [&str; 8] = [
        "%Y-%m-%d", "%d.%m.%Y", "%m/%d/%Y", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y", "%d %B %Y",
        "%d %b %Y",
    ];

    const MONTH_DATE_FORMATS: [&str; 5] = ["%Y-%m", "%m/%Y", "%m.%Y", "%B %Y", "%b %Y"];

    /// Rewrites recognised dates as `YYYY-MM-DD` or `YYYY-MM`; anything else is
    /// returned unchanged.
    pub fn normalize_date(value: &str) -> String {
        let trimmed = value.trim();
        for format in FULL_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return date.format("%Y-%m-%d").to_string();
            }
        }
        for format in MONTH_DATE_FORMATS {
            let padded = format!("{trimmed} 01");
            if let Ok(date) = NaiveDate::parse_from_str(&padded, &format!("{format} %d")) {
                return date.format("%Y-%m").to_string();
            }
        }
        value.to_string()
    }

    /// Parses `jan`, `January`, `#jan#` or `1` into a month number.
    pub fn parse_month(value: &str) -> Option<u32> {
        let cleaned = value.trim().trim_matches('#').trim().to_lowercase();
        if let Ok(n) = cleaned.parse::<u32>() {
            return (1..=12).contains(&n).then_some(n);
        }
        const MONTHS: [&str; 12] = [
            "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
        ];
        let prefix = cleaned.get(..3)?;
        MONTHS
            .iter()
            .position(|m| *m == prefix)
            .map(|p| p as u32 + 1)
    }

}

pub mod metadata {
    //! Per-database metadata: named blocks of ordered string values plus the
    //! group tree.

    use crate::core::DomainError;
    use crate::formatters::SaveActions;
    use crate::groups::GroupTree;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    pub const SAVE_ACTIONS: &str = "saveActions";
    pub const SAVE_ORDER_CONFIG: &str = "saveOrderConfig";
    pub const GROUPSTREE: &str = "groupstree";
    pub const FILE_DIRECTORY: &str = "fileDirectory";
    pub const PROTECTED_FLAG: &str = "protectedFlag";
    pub const DATABASE_TYPE: &str = "databaseType";
    pub const KEY_PATTERN_DEFAULT: &str = "keypatterndefault";

    /// Key → ordered values. Key order carries no meaning; value order does.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct MetaData {
        data: IndexMap<String, Vec<String>>,
        groups: Option<GroupTree>,
    }

    impl MetaData {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get(&self, key: &str) -> Option<&[String]> {
            self.data.get(key).map(Vec::as_slice)
        }

        pub fn put(&mut self, key: impl Into<String>, values: Vec<String>) -> Option<Vec<String>> {
            self.data.insert(key.into(), values)
        }

        pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
            self.data.shift_remove(key)
        }

        pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
            self.data.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
        }

        pub fn is_empty(&self) -> bool {
            self.data.is_empty() && self.groups.as_ref().is_none_or(GroupTree::is_empty)
        }

        pub fn groups(&self) -> Option<&GroupTree> {
            self.groups.as_ref()
        }

        /// Group tree, created root-only on first access.
        pub fn groups_mut(&mut self) -> &mut GroupTree {
            self.groups.get_or_insert_with(GroupTree::new)
        }

        pub fn set_groups(&mut self, tree: GroupTree) {
            self.groups = Some(tree);
        }

        pub fn clear_groups(&mut self) -> Option<GroupTree> {
            self.groups.take()
        }

        pub fn save_order_config(&self) -> Option<Result<SaveOrderConfig, DomainError>> {
            self.get(SAVE_ORDER_CONFIG).map(SaveOrderConfig::from_meta_values)
        }

        pub fn set_save_order_config(&mut self, config: &SaveOrderConfig) {
            self.put(SAVE_ORDER_CONFIG, config.to_meta_values());
        }

        pub fn save_actions(&self) -> Option<Result<SaveActions, DomainError>> {
            self.get(SAVE_ACTIONS).map(SaveActions::from_meta_values)
        }

        pub fn set_save_actions(&mut self, actions: &SaveActions) {
            self.put(SAVE_ACTIONS, actions.to_meta_values());
        }

        pub fn file_directory(&self) -> Option<&str> {
            self.get(FILE_DIRECTORY)
                .and_then(|v| v.first())
                .map(String::as_str)
                .filter(|d| !d.trim().is_empty())
        }

        pub fn set_file_directory(&mut self, dir: &str) {
            self.put(FILE_DIRECTORY, vec![dir.to_string()]);
        }

        pub fn is_protected(&self) -> bool {
            self.get(PROTECTED_FLAG)
                .and_then(|v| v.first())
                .is_some_and(|v| v == "true")
        }

        pub fn set_protected(&mut self, protected: bool) {
            if protected {
                self.put(PROTECTED_FLAG, vec!["true".to_string()]);
            } else {
                self.remove(PROTECTED_FLAG);
            }
        }
    }

    /* ------------------------------ Save order ------------------------------ */

    const ORIGINAL_ORDER: &str = "original";
    const SPECIFIED_ORDER: &str = "specified";

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SortCriterion {
        pub field: String,
        pub descending: bool,
    }

    impl SortCriterion {
        /// Field names are stored trimmed and lower-cased.
        pub fn new(field: &str, descending: bool) -> Self {
            Self {
                field: field.trim().to_lowercase(),
                descending,
            }
        }
    }

    /// Entry order used when writing the database: original order, or three
    /// sort criteria applied in turn.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SaveOrderConfig {
        pub save_in_original_order: bool,
        pub sort_criteria: [SortCriterion; 3],
    }

    impl Default for SaveOrderConfig {
        fn default() -> Self {
            Self {
                save_in_original_order: true,
                sort_criteria: Default::default(),
            }
        }
    }

    impl SaveOrderConfig {
        pub fn specified(criteria: [SortCriterion; 3]) -> Self {
            Self {
                save_in_original_order: false,
                sort_criteria: criteria,
            }
        }

        pub fn to_meta_values(&self) -> Vec<String> {
            let tag = if self.save_in_original_order {
                ORIGINAL_ORDER
            } else {
                SPECIFIED_ORDER
            };
            let mut values = vec![tag.to_string()];
            for criterion in &self.sort_criteria {
                values.push(criterion.field.clone());
                values.push(criterion.descending.to_string());
            }
            values
        }

        pub fn from_meta_values(values: &[String]) -> Result<Self, DomainError> {
            let [tag, rest @ ..] = values else {
                return Err(DomainError::MalformedSaveOrder("no values".to_string()));
            };
            let save_in_original_order = match tag.as_str() {
                ORIGINAL_ORDER => true,
                SPECIFIED_ORDER => false,
                other => {
                    return Err(DomainError::MalformedSaveOrder(format!(
                        "unknown order tag {other:?}"
                    )));
                }
            };
            if rest.len() < 6 {
                return Err(DomainError::MalformedSaveOrder(format!(
                    "expected 6 criterion values, found {}",
                    rest.len()
                )));
            }
            let mut sort_criteria: [SortCriterion; 3] = Default::default();
            for (slot, pair) in sort_criteria.iter_mut().zip(rest.chunks(2)) {
                let descending = pair[1].parse::<bool>().map_err(|_| {
                    DomainError::MalformedSaveOrder(format!("{:?} is not a boolean", pair[1]))
                })?;
                *slot = SortCriterion::new(&pair[0], descending);
            }
            Ok(Self {
                save_in_original_order,
                sort_criteria,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn save_order_round_trips_through_values() {
            let config = SaveOrderConfig::specified([
                SortCriterion::new(" Year ", false),
                SortCriterion::new("author", true),
                SortCriterion::new("title", false),
            ]);
            let values = config.to_meta_values();
            assert_eq!(
                values,
                vec!["specified", "year", "false", "author", "true", "title", "false"]
            );
            assert_eq!(SaveOrderConfig::from_meta_values(&values), Ok(config));
        }

        #[test]
        fn malformed_save_order_is_reported() {
            let short = vec!["specified".to_string(), "year".to_string()];
            assert!(SaveOrderConfig::from_meta_values(&short).is_err());
            let bad_flag: Vec<String> = ["original", "a", "maybe", "b", "false", "c", "false"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            assert!(SaveOrderConfig::from_meta_values(&bad_flag).is_err());
        }

        #[test]
        fn typed_accessors_use_well_known_keys() {
            let mut meta = MetaData::new();
            assert!(meta.is_empty());
            meta.set_file_directory("pdfs");
            meta.set_protected(true);
            assert_eq!(meta.file_directory(), Some("pdfs"));
            assert!(meta.is_protected());
            assert_eq!(meta.get(FILE_DIRECTORY), Some(&["pdfs".to_string()][..]));
            meta.set_protected(false);
            assert_eq!(meta.get(PROTECTED_FLAG), None);
        }

        #[test]
        fn root_only_groups_count_as_empty() {
            let mut meta = MetaData::new();
            meta.groups_mut();
            assert!(meta.is_empty());
            let root = meta.groups_mut().root();
            meta.groups_mut().add_child(root, "Physics").expect("add");
            assert!(!meta.is_empty());
        }
    }
}

pub mod format {
    //! Metadata → persisted text.

    use crate::codec::{self, ESCAPE, SEPARATOR};
    use crate::core::NEWLINE;
    use crate::formatters::{DISABLED, ENABLED};
    use crate::metadata::{GROUPSTREE, MetaData, SAVE_ACTIONS};
    use std::collections::BTreeMap;

    /// Prefix marking a comment block as database metadata.
    pub const META_FLAG: &str = "jabref-meta: ";

    /// Serializes every metadata block, keyed and ordered by name.
    ///
    /// Keys whose serialized form is empty or a bare separator are left out, as
    /// is the group tree when only the root exists.
    pub fn serialize_metadata(metadata: &MetaData) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();

        for (key, values) in metadata.iter() {
            if key == GROUPSTREE {
                continue;
            }
            let mut buf = String::new();
            for value in values {
                buf.push_str(&codec::encode(value, SEPARATOR, ESCAPE));
                buf.push(SEPARATOR);
                if key == SAVE_ACTIONS && (value == ENABLED || value == DISABLED) {
                    buf.push_str(NEWLINE);
                }
            }
            if !buf.is_empty() && buf != SEPARATOR.to_string() {
                out.insert(key.to_string(), buf);
            }
        }

        if let Some(groups) = metadata.groups().filter(|g| g.has_children()) {
            let mut buf = String::from(NEWLINE);
            for line in groups.flatten() {
                buf.push_str(&line);
                buf.push_str(NEWLINE);
            }
            out.insert(GROUPSTREE.to_string(), buf);
        }

        out
    }

    /// Renders serialized metadata as `@Comment{jabref-meta: key:value}` blocks.
    pub fn render_metadata(serialized: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        for (key, value) in serialized {
            out.push_str("@Comment{");
            out.push_str(META_FLAG);
            out.push_str(key);
            out.push(':');
            for c in value.chars() {
                if c == '{' || c == '}' {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
            out.push('}');
            out.push_str(NEWLINE);
            out.push_str(NEWLINE);
        }
        out
    }

}

pub mod parser {
    //! Persisted text → metadata.
    //!
    //! Every key decodes on its own: a broken value is skipped and reported,
    //! a broken group tree falls back to a root-only tree.

    use crate::codec::{self, DecodeError, ESCAPE, SEPARATOR};
    use crate::format::META_FLAG;
    use crate::formatters::{DISABLED, ENABLED};
    use crate::groups::{GroupTree, TreeParseError};
    use crate::metadata::{GROUPSTREE, MetaData, SAVE_ACTIONS};
    use anyhow::{Result, anyhow};
    use nom::{
        IResult,
        bytes::complete::{tag, tag_no_case, take_till1},
        character::complete::{char, multispace0, space0},
        sequence::{terminated, tuple},
    };
    use std::collections::BTreeMap;
    use tracing::warn;

    /// A metadata problem found while loading; the load itself continues.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum MetaDataIssue {
        #[error("metadata key {key:?} skipped: {source}")]
        Value {
            key: String,
            #[source]
            source: DecodeError,
        },
        #[error("group tree discarded: {0}")]
        Groups(#[from] TreeParseError),
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct MetaDataLoad {
        pub metadata: MetaData,
        pub issues: Vec<MetaDataIssue>,
    }

    pub fn deserialize_metadata(serialized: &BTreeMap<String, String>) -> MetaDataLoad {
        let mut load = MetaDataLoad::default();
        for (key, raw) in serialized {
            if key == GROUPSTREE {
                let lines = raw.lines().filter(|l| !l.trim().is_empty());
                match GroupTree::unflatten(lines) {
                    Ok(tree) => load.metadata.set_groups(tree),
                    Err(err) => {
                        warn!(error = %err, "falling back to an empty group tree");
                        load.metadata.set_groups(GroupTree::new());
                        load.issues.push(err.into());
                    }
                }
                continue;
            }
            match decode_values(key, raw) {
                Ok(values) => {
                    load.metadata.put(key.clone(), values);
                }
                Err(source) => {
                    warn!(key = %key, error = %source, "skipping metadata key");
                    load.issues.push(MetaDataIssue::Value {
                        key: key.clone(),
                        source,
                    });
                }
            }
        }
        load
    }

    /// Decodes one value list; save actions may carry a line break after the
    /// enabled/disabled flag.
    fn decode_values(key: &str, raw: &str) -> Result<Vec<String>, DecodeError> {
        let mut values = Vec::new();
        let mut rest = raw;
        while !rest.is_empty() {
            let consumed = raw.len() - rest.len();
            let token = codec::decode_token(rest, SEPARATOR, ESCAPE)
                .map_err(|e| e.offset_by(consumed))?;
            rest = token.rest;
            if key == SAVE_ACTIONS && (token.value == ENABLED || token.value == DISABLED) {
                rest = skip_line_break(rest);
            }
            values.push(token.value);
        }
        Ok(values)
    }

    fn skip_line_break(s: &str) -> &str {
        s.strip_prefix("\r\n")
            .or_else(|| s.strip_prefix('\n'))
            .unwrap_or(s)
    }

    /// Extracts `@Comment{jabref-meta: key:value}` blocks from database text.
    /// Other comments and entries are ignored.
    pub fn parse_metadata_comments(input: &str) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let lowered = input.to_ascii_lowercase();
        let mut cursor = 0;
        while let Some(found) = lowered[cursor..].find("@comment") {
            let start = cursor + found;
            let candidate = &input[start..];
            match meta_header(candidate) {
                Ok((body, key)) => {
                    let (value, after) = balanced_body(body)
                        .ok_or_else(|| anyhow!("unterminated metadata block for key {key:?}"))?;
                    out.insert(key.trim().to_string(), value.to_string());
                    cursor = input.len() - after.len();
                }
                Err(_) => cursor = start + "@comment".len(),
            }
        }
        Ok(out)
    }

    /// Reads metadata blocks from text and decodes them.
    pub fn load_metadata(input: &str) -> Result<MetaDataLoad> {
        Ok(deserialize_metadata(&parse_metadata_comments(input)?))
    }

    fn meta_header(i: &str) -> IResult<&str, &str> {
        let (i, _) = tuple((
            tag_no_case("@comment"),
            multispace0,
            char('{'),
            multispace0,
            tag(META_FLAG.trim_end()),
            space0,
        ))(i)?;
        terminated(
            take_till1(|c: char| c == ':' || c == '\n' || c == '}'),
            char(':'),
        )(i)
    }

    /// Splits at the brace closing the comment block. An escaped character
    /// never opens or closes a brace.
    fn balanced_body(i: &str) -> Option<(&str, &str)> {
        let mut depth = 0usize;
        let mut escaped = false;
        for (idx, c) in i.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                ESCAPE => escaped = true,
                '{' => depth += 1,
                '}' if depth == 0 => return Some((&i[..idx], &i[idx + 1..])),
                '}' => depth -= 1,
                _ => {}
            }
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::NEWLINE;
        use crate::format::{render_metadata, serialize_metadata};
        use crate::formatters::{FieldFormatterAction, Formatter, SaveActions};
        use crate::metadata::{SAVE_ORDER_CONFIG, SaveOrderConfig, SortCriterion};

        fn sample_metadata() -> MetaData {
            let mut meta = MetaData::new();
            meta.set_save_order_config(&SaveOrderConfig::specified([
                SortCriterion::new("year", false),
                SortCriterion::new("author", true),
                SortCriterion::new("title", false),
            ]));
            meta.set_save_actions(&SaveActions::new(
                true,
                vec![FieldFormatterAction::new(
                    "title",
                    vec![Formatter::HtmlToLatex, Formatter::TrimWhitespace],
                )],
            ));
            meta.put("custom", vec!["a;b".to_string(), "c\\d".to_string(), String::new()]);
            let tree = meta.groups_mut();
            let physics = tree.add_child(tree.root(), "Physics").expect("physics");
            tree.add_child(physics, "Optics").expect("optics");
            tree.add_child(tree.root(), "Physics").expect("twin");
            meta
        }

        #[test]
        fn serialized_metadata_decodes_back() {
            let meta = sample_metadata();
            let load = deserialize_metadata(&serialize_metadata(&meta));
            assert!(load.issues.is_empty(), "{:?}", load.issues);
            assert_eq!(load.metadata, meta);
        }

        #[test]
        fn rendered_text_parses_back() {
            let meta = sample_metadata();
            let text = format!(
                "@Article{{a, title = {{x}}}}{NEWLINE}@Comment{{just a note}}{NEWLINE}{}",
                render_metadata(&serialize_metadata(&meta))
            );
            let load = load_metadata(&text).expect("load");
            assert!(load.issues.is_empty());
            assert_eq!(load.metadata, meta);
        }

        #[test]
        fn unbalanced_braces_survive_a_round_trip() {
            let mut meta = MetaData::new();
            meta.set_file_directory("x{");
            let mut tree = GroupTree::new();
            tree.add_child(tree.root(), "a}b").expect("label");
            meta.set_groups(tree);
            let text = render_metadata(&serialize_metadata(&meta));
            let load = load_metadata(&text).expect("load");
            assert!(load.issues.is_empty());
            assert_eq!(load.metadata, meta);
        }

        #[test]
        fn save_actions_line_break_is_ignored() {
            let mut map = BTreeMap::new();
            map.insert(
                SAVE_ACTIONS.to_string(),
                "enabled;\r\ntitle[lower_case];".to_string(),
            );
            let load = deserialize_metadata(&map);
            assert_eq!(
                load.metadata.get(SAVE_ACTIONS),
                Some(&["enabled".to_string(), "title[lower_case]".to_string()][..])
            );
        }

        #[test]
        fn broken_key_is_skipped_and_reported() {
            let mut map = BTreeMap::new();
            map.insert("broken".to_string(), "a;b\\".to_string());
            map.insert(SAVE_ORDER_CONFIG.to_string(), "original;;false;;false;;false;".to_string());
            let load = deserialize_metadata(&map);
            assert_eq!(load.metadata.get("broken"), None);
            assert!(load.metadata.get(SAVE_ORDER_CONFIG).is_some());
            assert_eq!(
                load.issues,
                vec![MetaDataIssue::Value {
                    key: "broken".to_string(),
                    source: DecodeError::DanglingEscape { offset: 3 },
                }]
            );
        }

        #[test]
        fn broken_group_tree_falls_back_to_root() {
            let mut map = BTreeMap::new();
            map.insert(GROUPSTREE.to_string(), "\n1 A;\n3 B;\n".to_string());
            let load = deserialize_metadata(&map);
            assert_eq!(load.metadata.groups(), Some(&GroupTree::new()));
            assert!(matches!(
                load.issues.as_slice(),
                [MetaDataIssue::Groups(TreeParseError::InvalidDepth { line: 2, .. })]
            ));
        }

        #[test]
        fn comment_parser_handles_case_and_nested_braces() {
            let text = "@COMMENT{ jabref-meta: keypatterndefault:[auth]{x};}\n\
                        @comment{jabref-meta: databaseType:bibtex;}";
            let map = parse_metadata_comments(text).expect("parse");
            assert_eq!(
                map.get("keypatterndefault").map(String::as_str),
                Some("[auth]{x};")
            );
            assert_eq!(map.get("databaseType").map(String::as_str), Some("bibtex;"));
        }

        #[test]
        fn unterminated_comment_block_is_an_error() {
            assert!(parse_metadata_comments("@Comment{jabref-meta: a:b;").is_err());
        }
    }
}

pub mod undo {
    //! Reversible field edits, grouped into compound edits and kept on a
    //! bounded undo/redo ledger.

    use crate::core::{BibDatabase, Entry, EntryId};
    use serde::Serialize;
    use serde_with::skip_serializing_none;
    use std::collections::VecDeque;

    /// Something that can hand out entries by id.
    pub trait EntryStore {
        fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry>;
    }

    impl EntryStore for Entry {
        fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
            (self.id == id).then_some(self)
        }
    }

    impl EntryStore for [Entry] {
        fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
            self.iter_mut().find(|e| e.id == id)
        }
    }

    impl EntryStore for Vec<Entry> {
        fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
            self.as_mut_slice().entry_mut(id)
        }
    }

    impl EntryStore for BibDatabase {
        fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
            BibDatabase::entry_mut(self, id)
        }
    }

    /* ----------------------------- Errors ----------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ChangeError {
        #[error("field {field:?} would not change")]
        NoOp { field: String },
        #[error("compound edit {label:?} is already closed")]
        Closed { label: String },
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum UndoError {
        #[error("compound edit {label:?} is still open")]
        InProgress { label: String },
        #[error("entry {0:?} is not in the database")]
        MissingEntry(EntryId),
    }

    /* --------------------------- Field change --------------------------- */

    /// One field going from `old_value` to `new_value`; `None` means absent.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct FieldChange {
        entry: EntryId,
        field: String,
        old_value: Option<String>,
        new_value: Option<String>,
    }

    impl FieldChange {
        pub fn new(
            entry: EntryId,
            field: &str,
            old_value: Option<String>,
            new_value: Option<String>,
        ) -> Result<Self, ChangeError> {
            let field = field.trim().to_lowercase();
            if old_value == new_value {
                return Err(ChangeError::NoOp { field });
            }
            Ok(Self {
                entry,
                field,
                old_value,
                new_value,
            })
        }

        /// Writes `value` into `entry` and records what was there before.
        pub fn record(
            entry: &mut Entry,
            field: &str,
            value: Option<String>,
        ) -> Result<Self, ChangeError> {
            let old_value = entry.field(field).map(str::to_string);
            let change = Self::new(entry.id, field, old_value, value)?;
            change.apply(entry);
            Ok(change)
        }

        pub fn entry(&self) -> EntryId {
            self.entry
        }

        pub fn field(&self) -> &str {
            &self.field
        }

        pub fn old_value(&self) -> Option<&str> {
            self.old_value.as_deref()
        }

        pub fn new_value(&self) -> Option<&str> {
            self.new_value.as_deref()
        }

        pub fn apply(&self, entry: &mut Entry) {
            entry.put_field(&self.field, self.new_value.clone());
        }

        pub fn revert(&self, entry: &mut Entry) {
            entry.put_field(&self.field, self.old_value.clone());
        }
    }

    /* --------------------------- Compound edit --------------------------- */

    /// An ordered group of field changes undone and redone as one step.
    ///
    /// Edits can only be added while open; undo and redo require it closed.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CompoundEdit {
        label: String,
        edits: Vec<FieldChange>,
        closed: bool,
    }

    impl CompoundEdit {
        pub fn new(label: impl Into<String>) -> Self {
            Self {
                label: label.into(),
                edits: Vec::new(),
                closed: false,
            }
        }

        pub fn label(&self) -> &str {
            &self.label
        }

        pub fn edits(&self) -> &[FieldChange] {
            &self.edits
        }

        pub fn is_closed(&self) -> bool {
            self.closed
        }

        pub fn has_edits(&self) -> bool {
            !self.edits.is_empty()
        }

        pub fn add_edit(&mut self, change: FieldChange) -> Result<(), ChangeError> {
            if self.closed {
                return Err(ChangeError::Closed {
                    label: self.label.clone(),
                });
            }
            self.edits.push(change);
            Ok(())
        }

        pub fn extend<I>(&mut self, changes: I) -> Result<(), ChangeError>
        where
            I: IntoIterator<Item = FieldChange>,
        {
            for change in changes {
                self.add_edit(change)?;
            }
            Ok(())
        }

        /// Closes the edit; calling it again has no effect.
        pub fn end(&mut self) {
            self.closed = true;
        }

        /// Reverts the changes in reverse order.
        pub fn undo<S: EntryStore + ?Sized>(&self, store: &mut S) -> Result<(), UndoError> {
            self.check(store)?;
            for change in self.edits.iter().rev() {
                if let Some(entry) = store.entry_mut(change.entry) {
                    change.revert(entry);
                }
            }
            Ok(())
        }

        /// Reapplies the changes in forward order.
        pub fn redo<S: EntryStore + ?Sized>(&self, store: &mut S) -> Result<(), UndoError> {
            self.check(store)?;
            for change in &self.edits {
                if let Some(entry) = store.entry_mut(change.entry) {
                    change.apply(entry);
                }
            }
            Ok(())
        }

        // Nothing is touched unless every entry is reachable.
        fn check<S: EntryStore + ?Sized>(&self, store: &mut S) -> Result<(), UndoError> {
            if !self.closed {
                return Err(UndoError::InProgress {
                    label: self.label.clone(),
                });
            }
            for change in &self.edits {
                if store.entry_mut(change.entry).is_none() {
                    return Err(UndoError::MissingEntry(change.entry));
                }
            }
            Ok(())
        }
    }

    /* ------------------------------ Ledger ------------------------------ */

    pub const DEFAULT_LEDGER_CAPACITY: usize = 100;

    /// Undo/redo history of closed compound edits. The oldest step is dropped
    /// once `capacity` is exceeded.
    #[derive(Debug, Clone)]
    pub struct UndoLedger {
        done: VecDeque<CompoundEdit>,
        undone: Vec<CompoundEdit>,
        capacity: usize,
    }

    impl Default for UndoLedger {
        fn default() -> Self {
            Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
        }
    }

    impl UndoLedger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                done: VecDeque::new(),
                undone: Vec::new(),
                capacity: capacity.max(1),
            }
        }

        /// Records a step. Empty edits are dropped and `false` returned;
        /// recording clears the redo history.
        pub fn push(&mut self, mut edit: CompoundEdit) -> bool {
            if !edit.is_closed() {
                edit.end();
            }
            if !edit.has_edits() {
                return false;
            }
            self.undone.clear();
            self.done.push_back(edit);
            while self.done.len() > self.capacity {
                self.done.pop_front();
            }
            true
        }

        pub fn can_undo(&self) -> bool {
            !self.done.is_empty()
        }

        pub fn can_redo(&self) -> bool {
            !self.undone.is_empty()
        }

        pub fn undo_label(&self) -> Option<&str> {
            self.done.back().map(CompoundEdit::label)
        }

        pub fn redo_label(&self) -> Option<&str> {
            self.undone.last().map(CompoundEdit::label)
        }

        pub fn len(&self) -> usize {
            self.done.len()
        }

        pub fn is_empty(&self) -> bool {
            self.done.is_empty()
        }

        /// Undoes the latest step, returning its label.
        pub fn undo<S: EntryStore + ?Sized>(
            &mut self,
            store: &mut S,
        ) -> Result<Option<String>, UndoError> {
            let Some(edit) = self.done.pop_back() else {
                return Ok(None);
            };
            if let Err(err) = edit.undo(store) {
                self.done.push_back(edit);
                return Err(err);
            }
            let label = edit.label.clone();
            self.undone.push(edit);
            Ok(Some(label))
        }

        /// Redoes the latest undone step, returning its label.
        pub fn redo<S: EntryStore + ?Sized>(
            &mut self,
            store: &mut S,
        ) -> Result<Option<String>, UndoError> {
            let Some(edit) = self.undone.pop() else {
                return Ok(None);
            };
            if let Err(err) = edit.redo(store) {
                self.undone.push(edit);
                return Err(err);
            }
            let label = edit.label.clone();
            self.done.push_back(edit);
            Ok(Some(label))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn entry() -> Entry {
            Entry::new("article")
                .with_field("title", "Old")
                .with_field("year", "1999")
        }

        #[test]
        fn no_op_change_is_rejected() {
            let e = entry();
            let err = FieldChange::new(e.id, "title", Some("x".into()), Some("x".into()));
            assert_eq!(err, Err(ChangeError::NoOp { field: "title".into() }));
            assert!(FieldChange::new(e.id, "title", None, None).is_err());
        }

        #[test]
        fn change_applies_and_reverts_absent_values() {
            let mut e = entry();
            let added = FieldChange::new(e.id, "note", None, Some("n".into())).expect("add");
            added.apply(&mut e);
            assert_eq!(e.field("note"), Some("n"));
            added.revert(&mut e);
            assert!(!e.has_field("note"));

            let removed = FieldChange::record(&mut e, "year", None).expect("remove");
            assert!(!e.has_field("year"));
            assert_eq!(removed.old_value(), Some("1999"));
            removed.revert(&mut e);
            assert_eq!(e.field("year"), Some("1999"));
        }

        #[test]
        fn serialized_change_skips_absent_values() {
            let e = entry();
            let change = FieldChange::new(e.id, "note", None, Some("n".into())).expect("add");
            let json = serde_json::to_value(&change).expect("json");
            assert!(json.get("old_value").is_none());
            assert_eq!(json["new_value"], "n");
        }

        #[test]
        fn compound_edit_undoes_in_reverse_order() {
            let mut entries = vec![entry()];
            let id = entries[0].id;
            let mut edit = CompoundEdit::new("rename");
            let first =
                FieldChange::record(&mut entries[0], "title", Some("Mid".into())).expect("first");
            let second =
                FieldChange::record(&mut entries[0], "title", Some("New".into())).expect("second");
            edit.add_edit(first).expect("open");
            edit.add_edit(second).expect("open");

            assert_eq!(
                edit.undo(&mut entries),
                Err(UndoError::InProgress { label: "rename".into() })
            );
            edit.end();
            edit.end();
            assert!(edit.is_closed());

            edit.undo(&mut entries).expect("undo");
            assert_eq!(
                entries.entry_mut(id).and_then(|e| e.field("title").map(str::to_string)),
                Some("Old".into())
            );
            edit.redo(&mut entries).expect("redo");
            assert_eq!(entries[0].field("title"), Some("New"));
        }

        #[test]
        fn closed_edit_refuses_more_changes() {
            let e = entry();
            let mut edit = CompoundEdit::new("x");
            edit.end();
            let change = FieldChange::new(e.id, "title", None, Some("t".into())).expect("change");
            assert_eq!(edit.add_edit(change), Err(ChangeError::Closed { label: "x".into() }));
            assert!(!edit.has_edits());
        }

        #[test]
        fn missing_entry_leaves_store_untouched() {
            let mut present = entry();
            let ghost = entry();
            let mut edit = CompoundEdit::new("x");
            edit.add_edit(FieldChange::record(&mut present, "title", Some("A".into())).expect("a"))
                .expect("open");
            edit.add_edit(FieldChange::new(ghost.id, "title", None, Some("B".into())).expect("b"))
                .expect("open");
            edit.end();

            let mut store = vec![present];
            assert_eq!(edit.undo(&mut store), Err(UndoError::MissingEntry(ghost.id)));
            assert_eq!(store[0].field("title"), Some("A"));
        }

        #[test]
        fn ledger_round_trip_and_redo_clearing() {
            let mut db = BibDatabase::new();
            let id = db.insert_entry(entry());
            let mut ledger = UndoLedger::new();

            let mut edit = CompoundEdit::new("first");
            let e = db.entry_mut(id).expect("entry");
            edit.add_edit(FieldChange::record(e, "title", Some("One".into())).expect("one"))
                .expect("open");
            assert!(ledger.push(edit));
            assert!(!ledger.push(CompoundEdit::new("empty")));

            assert_eq!(ledger.undo(&mut db), Ok(Some("first".into())));
            assert_eq!(db.entry(id).and_then(|e| e.field("title")), Some("Old"));
            assert!(ledger.can_redo());
            assert_eq!(ledger.redo(&mut db), Ok(Some("first".into())));
            assert_eq!(db.entry(id).and_then(|e| e.field("title")), Some("One"));

            ledger.undo(&mut db).expect("undo");
            let mut next = CompoundEdit::new("second");
            let e = db.entry_mut(id).expect("entry");
            next.add_edit(FieldChange::record(e, "year", Some("2000".into())).expect("year"))
                .expect("open");
            ledger.push(next);
            assert!(!ledger.can_redo());
            assert_eq!(ledger.undo_label(), Some("second"));
        }

        #[test]
        fn ledger_evicts_oldest_step() {
            let mut e = entry();
            let mut ledger = UndoLedger::with_capacity(2);
            for value in ["a", "b", "c"] {
                let mut edit = CompoundEdit::new(value);
                let change =
                    FieldChange::record(&mut e, "title", Some(value.into())).expect("change");
                edit.add_edit(change).expect("open");
                ledger.push(edit);
            }
            assert_eq!(ledger.len(), 2);
            assert_eq!(ledger.undo(&mut e), Ok(Some("c".into())));
            assert_eq!(ledger.undo(&mut e), Ok(Some("b".into())));
            assert_eq!(ledger.undo(&mut e), Ok(None));
            assert_eq!(e.field("title"), Some("a"));
        }
    }
}

pub mod cleanup {
    //! Cleanup engine: a closed set of rules applied to one entry in a fixed
    //! priority order. Every changed field is recorded as a [`FieldChange`];
    //! failed file renames are counted, never raised.

    use crate::core::{
        DomainError, Entry, FILE_FIELD, KEY_FIELD, LinkedFile, parse_file_field,
        serialize_file_field,
    };
    use crate::formatters::{self, SaveActions, parse_month};
    use crate::metadata::MetaData;
    use crate::storage::FileRenamer;
    use crate::undo::{ChangeError, CompoundEdit, FieldChange};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1},
        character::complete::{char, digit1},
        combinator::{map, recognize},
        multi::many0,
        sequence::{delimited, preceded, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::{
        collections::BTreeSet,
        fmt,
        path::{Path, PathBuf},
        str::FromStr,
    };
    use tracing::{debug, warn};

    /* ------------------------------ Rules ------------------------------ */

    /// Cleanup rules. Declaration order is the order rules run in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum CleanupRule {
        CleanUpDoi,
        ConvertToBiblatex,
        ConvertHtml,
        NormalizeNames,
        NormalizeDate,
        FieldFormatters,
        RenameLinkedFile,
    }

    impl CleanupRule {
        pub const PRIORITY: [CleanupRule; 7] = [
            CleanupRule::CleanUpDoi,
            CleanupRule::ConvertToBiblatex,
            CleanupRule::ConvertHtml,
            CleanupRule::NormalizeNames,
            CleanupRule::NormalizeDate,
            CleanupRule::FieldFormatters,
            CleanupRule::RenameLinkedFile,
        ];

        pub fn key(self) -> &'static str {
            match self {
                CleanupRule::CleanUpDoi => "clean_up_doi",
                CleanupRule::ConvertToBiblatex => "convert_to_biblatex",
                CleanupRule::ConvertHtml => "convert_html",
                CleanupRule::NormalizeNames => "normalize_names",
                CleanupRule::NormalizeDate => "normalize_date",
                CleanupRule::FieldFormatters => "field_formatters",
                CleanupRule::RenameLinkedFile => "rename_linked_file",
            }
        }
    }

    impl FromStr for CleanupRule {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let key = s.trim().to_ascii_lowercase().replace('-', "_");
            CleanupRule::PRIORITY
                .into_iter()
                .find(|r| r.key() == key)
                .ok_or_else(|| DomainError::UnknownCleanupRule(s.trim().to_string()))
        }
    }

    impl fmt::Display for CleanupRule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.key())
        }
    }

    /* ---------------------------- Settings ---------------------------- */

    pub const DEFAULT_FILENAME_PATTERN: &str = "[bibtexkey]";

    /// Enabled rules plus their configuration. Field formatters are switched by
    /// `formatters.enabled` rather than by the rule set.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CleanupPreset {
        pub rules: BTreeSet<CleanupRule>,
        pub filename_pattern: String,
        pub rename_only_relative_paths: bool,
        pub formatters: SaveActions,
    }

    impl Default for CleanupPreset {
        fn default() -> Self {
            Self {
                rules: [CleanupRule::CleanUpDoi, CleanupRule::ConvertHtml]
                    .into_iter()
                    .collect(),
                filename_pattern: DEFAULT_FILENAME_PATTERN.to_string(),
                rename_only_relative_paths: false,
                formatters: SaveActions::default(),
            }
        }
    }

    impl CleanupPreset {
        /// A preset with nothing enabled.
        pub fn empty() -> Self {
            Self {
                rules: BTreeSet::new(),
                ..Self::default()
            }
        }

        pub fn with_rule(mut self, rule: CleanupRule) -> Self {
            self.enable(rule, true);
            self
        }

        pub fn without_rule(mut self, rule: CleanupRule) -> Self {
            self.enable(rule, false);
            self
        }

        pub fn with_filename_pattern(mut self, pattern: &str) -> Self {
            self.filename_pattern = pattern.to_string();
            self
        }

        pub fn with_formatters(mut self, formatters: SaveActions) -> Self {
            self.formatters = formatters;
            self
        }

        pub fn enable(&mut self, rule: CleanupRule, on: bool) {
            match (rule, on) {
                (CleanupRule::FieldFormatters, _) => self.formatters.enabled = on,
                (_, true) => {
                    self.rules.insert(rule);
                }
                (_, false) => {
                    self.rules.remove(&rule);
                }
            }
        }

        pub fn is_enabled(&self, rule: CleanupRule) -> bool {
            match rule {
                CleanupRule::FieldFormatters => self.formatters.enabled,
                _ => self.rules.contains(&rule),
            }
        }

        /// Enabled rules in priority order.
        pub fn enabled_rules(&self) -> impl Iterator<Item = CleanupRule> + '_ {
            CleanupRule::PRIORITY
                .into_iter()
                .filter(|r| self.is_enabled(*r))
        }

        pub fn renames_files(&self) -> bool {
            self.is_enabled(CleanupRule::RenameLinkedFile)
        }
    }

    /// Persisted cleanup preferences.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CleanupSettings {
        pub preset: CleanupPreset,
        /// Ask before renaming files; cleared by "do not ask again".
        pub confirm_file_renames: bool,
        pub default_file_directory: Option<PathBuf>,
    }

    impl Default for CleanupSettings {
        fn default() -> Self {
            Self {
                preset: CleanupPreset::default(),
                confirm_file_renames: true,
                default_file_directory: None,
            }
        }
    }

    /* ------------------------- File directories ------------------------- */

    /// Directories relative file links are resolved against, in lookup order.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct FileDirectories {
        dirs: Vec<PathBuf>,
    }

    impl FileDirectories {
        pub fn new(dirs: Vec<PathBuf>) -> Self {
            let mut unique: Vec<PathBuf> = Vec::new();
            for dir in dirs {
                if !unique.contains(&dir) {
                    unique.push(dir);
                }
            }
            Self { dirs: unique }
        }

        /// The database's `fileDirectory` (relative to the database), then the
        /// default directory, then the database directory itself.
        pub fn resolve(
            metadata: &MetaData,
            database_dir: Option<&Path>,
            default_dir: Option<&Path>,
        ) -> Self {
            let mut dirs = Vec::new();
            if let Some(dir) = metadata.file_directory().map(Path::new) {
                match database_dir {
                    Some(base) if dir.is_relative() => dirs.push(base.join(dir)),
                    _ => dirs.push(dir.to_path_buf()),
                }
            }
            dirs.extend(default_dir.map(Path::to_path_buf));
            dirs.extend(database_dir.map(Path::to_path_buf));
            Self::new(dirs)
        }

        pub fn dirs(&self) -> &[PathBuf] {
            &self.dirs
        }

        /// First existing location of `link`.
        pub fn locate(&self, link: &str, renamer: &dyn FileRenamer) -> Option<PathBuf> {
            let path = Path::new(link);
            if path.is_absolute() {
                return renamer.exists(path).then(|| path.to_path_buf());
            }
            self.dirs
                .iter()
                .map(|dir| dir.join(path))
                .find(|candidate| renamer.exists(candidate))
        }
    }

    /* ------------------------------ Engine ------------------------------ */

    /// Outcome of cleaning one entry.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct CleanupResult {
        pub changes: Vec<FieldChange>,
        pub unsuccessful_renames: usize,
    }

    impl CleanupResult {
        /// No field changed: the entry was already clean.
        pub fn is_clean(&self) -> bool {
            self.changes.is_empty()
        }
    }

    #[derive(Debug, Default)]
    struct Proposal {
        updates: Vec<(String, Option<String>)>,
        failed_renames: usize,
    }

    impl Proposal {
        fn set(&mut self, field: &str, value: impl Into<String>) {
            self.updates.push((field.to_string(), Some(value.into())));
        }

        fn clear(&mut self, field: &str) {
            self.updates.push((field.to_string(), None));
        }
    }

    pub struct CleanupWorker<'a> {
        directories: FileDirectories,
        renamer: &'a dyn FileRenamer,
    }

    impl<'a> CleanupWorker<'a> {
        pub fn new(directories: FileDirectories, renamer: &'a dyn FileRenamer) -> Self {
            Self {
                directories,
                renamer,
            }
        }

        /// Runs every enabled rule on `entry`, writing each change into it.
        pub fn cleanup(&self, preset: &CleanupPreset, entry: &mut Entry) -> CleanupResult {
            let mut result = CleanupResult::default();
            for rule in preset.enabled_rules() {
                let proposal = self.propose(rule, preset, entry);
                result.unsuccessful_renames += proposal.failed_renames;
                for (field, value) in proposal.updates {
                    // An update equal to the current value is not a change.
                    if let Ok(change) = FieldChange::record(entry, &field, value) {
                        debug!(
                            rule = rule.key(),
                            field = change.field(),
                            old = ?change.old_value(),
                            new = ?change.new_value(),
                            "field cleaned"
                        );
                        result.changes.push(change);
                    }
                }
            }
            result
        }

        /// Like [`cleanup`](Self::cleanup), also appending the changes to `edit`.
        /// A closed edit is refused before the entry is touched.
        pub fn cleanup_into(
            &self,
            preset: &CleanupPreset,
            entry: &mut Entry,
            edit: &mut CompoundEdit,
        ) -> Result<CleanupResult, ChangeError> {
            if edit.is_closed() {
                return Err(ChangeError::Closed {
                    label: edit.label().to_string(),
                });
            }
            let result = self.cleanup(preset, entry);
            edit.extend(result.changes.iter().cloned())?;
            Ok(result)
        }

        fn propose(&self, rule: CleanupRule, preset: &CleanupPreset, entry: &Entry) -> Proposal {
            match rule {
                CleanupRule::CleanUpDoi => propose_doi(entry),
                CleanupRule::ConvertToBiblatex => propose_biblatex(entry),
                CleanupRule::ConvertHtml => propose_html(entry),
                CleanupRule::NormalizeNames => {
                    propose_with(entry, &["author", "editor"], formatters::normalize_names)
                }
                CleanupRule::NormalizeDate => {
                    propose_with(entry, &["date"], formatters::normalize_date)
                }
                CleanupRule::FieldFormatters => Proposal {
                    updates: preset.formatters.propose(entry),
                    failed_renames: 0,
                },
                CleanupRule::RenameLinkedFile => self.propose_renames(preset, entry),
            }
        }

        fn propose_renames(&self, preset: &CleanupPreset, entry: &Entry) -> Proposal {
            let mut proposal = Proposal::default();
            let Some(raw) = entry.field(FILE_FIELD) else {
                return proposal;
            };
            let mut files = match parse_file_field(raw) {
                Ok(files) => files,
                Err(err) => {
                    warn!(error = %err, "unreadable file field, skipping renames");
                    return proposal;
                }
            };
            let stem = expand_filename_pattern(&preset.filename_pattern, entry);
            if stem.is_empty() {
                return proposal;
            }

            let mut renamed = false;
            for file in &mut files {
                match self.rename_linked_file(file, &stem, preset.rename_only_relative_paths) {
                    Ok(Some(link)) => {
                        file.link = link;
                        renamed = true;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(link = %file.link, error = %err, "linked file rename failed");
                        proposal.failed_renames += 1;
                    }
                }
            }
            if renamed {
                proposal.set(FILE_FIELD, serialize_file_field(&files));
            }
            proposal
        }

        /// Renames one file on disk; `Ok(Some(link))` carries the new link.
        fn rename_linked_file(
            &self,
            file: &LinkedFile,
            stem: &str,
            only_relative: bool,
        ) -> std::io::Result<Option<String>> {
            let link = Path::new(&file.link);
            if file.is_online() || (only_relative && link.is_absolute()) {
                return Ok(None);
            }
            let new_name = match link.extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("{stem}.{ext}"),
                None => stem.to_string(),
            };
            if link.file_name().and_then(|n| n.to_str()) == Some(new_name.as_str()) {
                return Ok(None);
            }
            let Some(current) = self.directories.locate(&file.link, self.renamer) else {
                debug!(link = %file.link, "linked file not found, leaving it alone");
                return Ok(None);
            };
            let target = current.with_file_name(&new_name);
            if self.renamer.exists(&target) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} already exists", target.display()),
                ));
            }
            self.renamer.rename(&current, &target)?;
            Ok(Some(
                link.with_file_name(&new_name).to_string_lossy().into_owned(),
            ))
        }
    }

    /* ------------------------------ Rules ------------------------------ */

    fn propose_with(entry: &Entry, fields: &[&str], format: fn(&str) -> String) -> Proposal {
        let mut proposal = Proposal::default();
        for field in fields {
            if let Some(value) = entry.field(field) {
                let formatted = format(value);
                if formatted != value {
                    proposal.set(field, formatted);
                }
            }
        }
        proposal
    }

    const DOI_SOURCES: [&str; 3] = ["url", "note", "ee"];

    const DOI_RESOLVERS: [&str; 5] = [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ];

    fn propose_doi(entry: &Entry) -> Proposal {
        let mut proposal = Proposal::default();
        if let Some(current) = entry.field("doi") {
            if let Some(doi) = find_doi(current).filter(|d| d != current) {
                proposal.set("doi", doi);
            }
            return proposal;
        }
        for source in DOI_SOURCES {
            let Some(value) = entry.field(source) else {
                continue;
            };
            if let Some(doi) = find_doi(value) {
                if strip_resolver(value) == doi {
                    proposal.clear(source);
                }
                proposal.set("doi", doi);
                break;
            }
        }
        proposal
    }

    fn strip_resolver(value: &str) -> &str {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        DOI_RESOLVERS
            .iter()
            .find(|p| lower.starts_with(*p))
            .map_or(trimmed, |p| trimmed[p.len()..].trim())
    }

    fn doi(i: &str) -> IResult<&str, &str> {
        recognize(tuple((
            tag("10."),
            digit1,
            many0(preceded(char('.'), digit1)),
            char('/'),
            take_till1(|c: char| c.is_whitespace() || c == '}' || c == '"'),
        )))(i)
    }

    /// The first DOI (`10.<registrant>/<suffix>`) in `text`.
    pub fn find_doi(text: &str) -> Option<String> {
        text.match_indices("10.").find_map(|(idx, _)| {
            doi(&text[idx..])
                .ok()
                .map(|(_, found)| found.trim_end_matches(['.', ',', ';']).to_string())
        })
    }

    const BIBLATEX_RENAMES: [(&str, &str); 7] = [
        ("journal", "journaltitle"),
        ("address", "location"),
        ("school", "institution"),
        ("annote", "annotation"),
        ("archiveprefix", "eprinttype"),
        ("primaryclass", "eprintclass"),
        ("key", "sortkey"),
    ];

    fn propose_biblatex(entry: &Entry) -> Proposal {
        let mut proposal = Proposal::default();
        for (from, to) in BIBLATEX_RENAMES {
            if let Some(value) = entry.field(from) {
                if !entry.has_field(to) {
                    proposal.set(to, value);
                    proposal.clear(from);
                }
            }
        }
        if entry.has_field("date") {
            return proposal;
        }
        let Some(year) = entry.field("year").map(str::trim).filter(|y| !y.is_empty()) else {
            return proposal;
        };
        match entry.field("month").and_then(parse_month) {
            Some(month) => {
                proposal.set("date", format!("{year}-{month:02}"));
                proposal.clear("month");
            }
            None => proposal.set("date", year),
        }
        proposal.clear("year");
        proposal
    }

    const HTML_SKIPPED_FIELDS: [&str; 4] = [KEY_FIELD, FILE_FIELD, "url", "doi"];

    fn propose_html(entry: &Entry) -> Proposal {
        let mut proposal = Proposal::default();
        for (field, value) in entry.fields() {
            if HTML_SKIPPED_FIELDS.contains(&field) {
                continue;
            }
            let converted = formatters::html_to_latex(value);
            if converted != value {
                proposal.set(field, converted);
            }
        }
        proposal
    }

    /* -------------------------- Filename pattern -------------------------- */

    enum PatternPiece<'a> {
        Literal(&'a str),
        Field(&'a str),
    }

    fn pattern_piece(i: &str) -> IResult<&str, PatternPiece<'_>> {
        alt((
            map(
                delimited(char('['), take_till1(|c: char| c == ']'), char(']')),
                PatternPiece::Field,
            ),
            map(take_till1(|c: char| c == '['), PatternPiece::Literal),
        ))(i)
    }

    /// Expands `[field]` placeholders against `entry`; `[bibtexkey]`, `[auth]`
    /// and `[year]` are derived. The result is safe to use as a file name.
    pub fn expand_filename_pattern(pattern: &str, entry: &Entry) -> String {
        let mut out = String::new();
        let mut rest = pattern;
        while !rest.is_empty() {
            let Ok((after, piece)) = pattern_piece(rest) else {
                out.push_str(rest);
                break;
            };
            match piece {
                PatternPiece::Literal(text) => out.push_str(text),
                PatternPiece::Field(name) => out.push_str(&pattern_value(name.trim(), entry)),
            }
            rest = after;
        }
        sanitize_file_name(&out)
    }

    fn pattern_value(name: &str, entry: &Entry) -> String {
        match name.to_ascii_lowercase().as_str() {
            "bibtexkey" => entry.citation_key().unwrap_or_default().to_string(),
            "auth" => entry
                .field("author")
                .map(first_author_last_name)
                .unwrap_or_default(),
            "year" => entry
                .field("year")
                .or_else(|| entry.field("date").and_then(|d| d.get(..4)))
                .unwrap_or_default()
                .to_string(),
            other => entry
                .field(other)
                .map(formatters::remove_latex_commands)
                .unwrap_or_default(),
        }
    }

    fn first_author_last_name(authors: &str) -> String {
        let normalized = formatters::normalize_names(authors);
        let first = normalized.split(" and ").next().unwrap_or_default();
        let last = first.split(',').next().unwrap_or_default();
        formatters::remove_latex_commands(last.trim())
    }

    fn sanitize_file_name(name: &str) -> String {
        let cleaned: String = name
            .chars()
            .filter(|c| !c.is_control() && !r#"\/:*?"<>|{}"#.contains(*c))
            .collect();
        formatters::collapse_whitespace(&cleaned)
            .trim_matches('.')
            .to_string()
    }

}

pub mod storage {
    //! Filesystem seams: renaming linked files, database and settings files.

    use crate::cleanup::CleanupSettings;
    use crate::core::{BibDatabase, Entry};
    use crate::format::serialize_metadata;
    use crate::parser::{MetaDataIssue, deserialize_metadata};
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, fs, io, path::Path};
    use tracing::debug;

    /// Renames linked files; failures are reported, not panicked on.
    pub trait FileRenamer {
        fn exists(&self, path: &Path) -> bool;
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    }

    /// Renames files on the local filesystem and never overwrites.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FsRenamer;

    impl FileRenamer for FsRenamer {
        fn exists(&self, path: &Path) -> bool {
            path.exists()
        }

        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            if to.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", to.display()),
                ));
            }
            fs::rename(from, to)
        }
    }

    /// On-disk database: entries plus serialized metadata blocks.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DatabaseFile {
        #[serde(default)]
        pub entries: Vec<Entry>,
        #[serde(default)]
        pub metadata: BTreeMap<String, String>,
    }

    impl DatabaseFile {
        pub fn from_database(db: &BibDatabase) -> Self {
            Self {
                entries: db.entries.clone(),
                metadata: serialize_metadata(&db.metadata),
            }
        }

        /// Decodes the metadata; keys that fail to decode come back as issues.
        pub fn into_database(self) -> (BibDatabase, Vec<MetaDataIssue>) {
            let load = deserialize_metadata(&self.metadata);
            let db = BibDatabase {
                entries: self.entries,
                metadata: load.metadata,
            };
            (db, load.issues)
        }
    }

    pub fn load_database(path: &Path) -> Result<(BibDatabase, Vec<MetaDataIssue>)> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading database {}", path.display()))?;
        let file: DatabaseFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing database {}", path.display()))?;
        debug!(path = %path.display(), entries = file.entries.len(), "database loaded");
        Ok(file.into_database())
    }

    pub fn save_database(path: &Path, db: &BibDatabase) -> Result<()> {
        let json = serde_json::to_string_pretty(&DatabaseFile::from_database(db))
            .context("serializing database")?;
        fs::write(path, json).with_context(|| format!("writing database {}", path.display()))
    }

    /// Reads cleanup settings; a missing file yields the defaults.
    pub fn load_settings(path: &Path) -> Result<CleanupSettings> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(CleanupSettings::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))
    }

    pub fn store_settings(path: &Path, settings: &CleanupSettings) -> Result<()> {
        let json = serde_json::to_string_pretty(settings).context("serializing settings")?;
        fs::write(path, json).with_context(|| format!("writing settings {}", path.display()))
    }

}

pub mod action {
    //! Batch cleanup over a selection of entries, driven through a UI seam.
    //!
    //! The UI is consulted before any entry is touched; once the batch starts
    //! every entry gets its own compound edit on the undo ledger.

    use crate::cleanup::{CleanupPreset, CleanupSettings, CleanupWorker, FileDirectories};
    use crate::core::{BibDatabase, EntryId};
    use crate::storage::FileRenamer;
    use crate::undo::{ChangeError, CompoundEdit, UndoLedger};
    use serde::Serialize;
    use std::{
        path::PathBuf,
        thread::{self, JoinHandle},
    };
    use tracing::{info, warn};

    /// Label of the compound edit recorded per cleaned entry.
    pub const CLEANUP_EDIT_LABEL: &str = "Cleanup entry";

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Decision<T> {
        Proceed(T),
        Cancel,
    }

    /// Answer to the rename confirmation; `ask_again == false` stops future prompts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenameConfirmation {
        pub proceed: bool,
        pub ask_again: bool,
    }

    /// Everything the batch needs from the interactive layer.
    pub trait CleanupUi {
        fn inform_nothing_selected(&mut self);
        /// Stops the user from issuing new edits until [`unblock`](Self::unblock).
        fn block(&mut self);
        fn unblock(&mut self);
        fn output(&mut self, message: &str);
        fn choose_preset(&mut self, current: &CleanupPreset) -> Decision<CleanupPreset>;
        fn confirm_file_renames(&mut self) -> RenameConfirmation;
        fn report_failed_renames(&mut self, count: usize);
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum CleanupError {
        #[error("no entries selected")]
        NothingSelected,
        #[error("cleanup cancelled")]
        UserCancelled,
        #[error(transparent)]
        Edit(#[from] ChangeError),
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct CleanupReport {
        pub selected: usize,
        pub modified_entries: usize,
        pub unsuccessful_renames: usize,
    }

    fn summary(modified: usize) -> String {
        match modified {
            0 => "No entry needed a clean up".to_string(),
            1 => "One entry needed a clean up".to_string(),
            n => format!("{n} entries needed a clean up"),
        }
    }

    pub struct CleanupAction<'a, U: CleanupUi + ?Sized> {
        ui: &'a mut U,
        renamer: &'a dyn FileRenamer,
        database_dir: Option<PathBuf>,
    }

    impl<'a, U: CleanupUi + ?Sized> CleanupAction<'a, U> {
        pub fn new(ui: &'a mut U, renamer: &'a dyn FileRenamer) -> Self {
            Self {
                ui,
                renamer,
                database_dir: None,
            }
        }

        /// Directory of the database file, used to resolve linked files.
        pub fn with_database_dir(mut self, dir: Option<PathBuf>) -> Self {
            self.database_dir = dir;
            self
        }

        pub fn run(
            &mut self,
            db: &mut BibDatabase,
            selection: &[EntryId],
            settings: &mut CleanupSettings,
            ledger: &mut UndoLedger,
        ) -> Result<CleanupReport, CleanupError> {
            if selection.is_empty() {
                self.ui.inform_nothing_selected();
                return Err(CleanupError::NothingSelected);
            }
            self.ui.block();
            self.ui
                .output(&format!("Doing a cleanup for {} entries...", selection.len()));
            let result = self.run_blocked(db, selection, settings, ledger);
            self.ui.unblock();
            result
        }

        fn run_blocked(
            &mut self,
            db: &mut BibDatabase,
            selection: &[EntryId],
            settings: &mut CleanupSettings,
            ledger: &mut UndoLedger,
        ) -> Result<CleanupReport, CleanupError> {
            let Decision::Proceed(preset) = self.ui.choose_preset(&settings.preset) else {
                return Err(CleanupError::UserCancelled);
            };
            settings.preset = preset.clone();

            if preset.renames_files() && settings.confirm_file_renames {
                let answer = self.ui.confirm_file_renames();
                if !answer.ask_again {
                    settings.confirm_file_renames = false;
                }
                if !answer.proceed {
                    return Err(CleanupError::UserCancelled);
                }
            }

            let directories = FileDirectories::resolve(
                &db.metadata,
                self.database_dir.as_deref(),
                settings.default_file_directory.as_deref(),
            );
            let worker = CleanupWorker::new(directories, self.renamer);

            let mut report = CleanupReport {
                selected: selection.len(),
                ..CleanupReport::default()
            };
            for id in selection {
                let Some(entry) = db.entry_mut(*id) else {
                    warn!(entry = ?id, "selected entry is not in the database");
                    continue;
                };
                let mut edit = CompoundEdit::new(CLEANUP_EDIT_LABEL);
                let result = worker.cleanup_into(&preset, entry, &mut edit)?;
                edit.end();
                report.unsuccessful_renames += result.unsuccessful_renames;
                if ledger.push(edit) {
                    report.modified_entries += 1;
                }
            }

            if report.unsuccessful_renames > 0 {
                self.ui.report_failed_renames(report.unsuccessful_renames);
            }
            self.ui.output(&summary(report.modified_entries));
            info!(
                selected = report.selected,
                modified = report.modified_entries,
                failed_renames = report.unsuccessful_renames,
                "cleanup finished"
            );
            Ok(report)
        }
    }

    /* ----------------------------- Background ----------------------------- */

    /// A cleanup batch that owns its inputs so it can run off the caller's thread.
    pub struct CleanupJob<U> {
        pub database: BibDatabase,
        pub selection: Vec<EntryId>,
        pub settings: CleanupSettings,
        pub ledger: UndoLedger,
        pub ui: U,
        pub renamer: Box<dyn FileRenamer + Send>,
        pub database_dir: Option<PathBuf>,
    }

    /// Inputs handed back once the batch finishes.
    pub struct CleanupJobOutcome<U> {
        pub database: BibDatabase,
        pub settings: CleanupSettings,
        pub ledger: UndoLedger,
        pub ui: U,
        pub result: Result<CleanupReport, CleanupError>,
    }

    impl<U: CleanupUi> CleanupJob<U> {
        pub fn run(self) -> CleanupJobOutcome<U> {
            let CleanupJob {
                mut database,
                selection,
                mut settings,
                mut ledger,
                mut ui,
                renamer,
                database_dir,
            } = self;
            let result = CleanupAction::new(&mut ui, &*renamer)
                .with_database_dir(database_dir)
                .run(&mut database, &selection, &mut settings, &mut ledger);
            CleanupJobOutcome {
                database,
                settings,
                ledger,
                ui,
                result,
            }
        }
    }

    impl<U: CleanupUi + Send + 'static> CleanupJob<U> {
        /// Runs the batch on a worker thread.
        pub fn spawn(self) -> JoinHandle<CleanupJobOutcome<U>> {
            thread::spawn(move || self.run())
        }
    }

}

pub use action::{CleanupAction, CleanupJob, CleanupReport, CleanupUi};
pub use cleanup::{CleanupPreset, CleanupRule, CleanupSettings, CleanupWorker};
pub use format::{render_metadata, serialize_metadata};
pub use parser::{deserialize_metadata, parse_metadata_comments};
pub use undo::{CompoundEdit, FieldChange, UndoLedger};
