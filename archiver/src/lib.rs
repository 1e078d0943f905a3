//! Markdown outline library: parses a note into heading sections and list blocks,
//! rewrites the tree (archiving finished tasks, sorting, promoting lists to headings)
//! and prints it back line for line.
//! Parsing and formatting are lossless for documents with consistent indentation.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SectionId(pub Uuid);

    impl SectionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for SectionId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ----------------------------- Indentation ----------------------------- */

    /// How one nesting step is written: a tab, or `tab_size` spaces.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct IndentationSettings {
        pub use_tab: bool,
        pub tab_size: usize,
    }

    impl Default for IndentationSettings {
        fn default() -> Self {
            Self {
                use_tab: true,
                tab_size: 4,
            }
        }
    }

    impl IndentationSettings {
        pub fn tabs() -> Self {
            Self::default()
        }

        pub fn spaces(tab_size: usize) -> Self {
            Self {
                use_tab: false,
                tab_size,
            }
        }

        fn width(&self) -> usize {
            self.tab_size.max(1)
        }

        /// One nesting step as emitted by the formatter.
        pub fn unit(&self) -> String {
            if self.use_tab {
                "\t".to_string()
            } else {
                " ".repeat(self.width())
            }
        }

        /// Nesting steps represented by the leading whitespace of `line`.
        ///
        /// Tabs count one step each. Spaces are divided by the tab size and rounded
        /// up, so a line indented by a few stray spaces still counts as one step.
        pub fn level_of(&self, line: &str) -> usize {
            if self.use_tab {
                line.chars().take_while(|c| *c == '\t').count()
            } else {
                let spaces = line.chars().take_while(|c| *c == ' ').count();
                spaces.div_ceil(self.width())
            }
        }

        /// Removes at most `steps` nesting steps of leading indentation.
        pub fn strip<'a>(&self, line: &'a str, steps: usize) -> &'a str {
            let n = if self.use_tab {
                line.chars().take(steps).take_while(|c| *c == '\t').count()
            } else {
                line.chars()
                    .take(steps * self.width())
                    .take_while(|c| *c == ' ')
                    .count()
            };
            &line[n..]
        }

        /// The leading whitespace of `line` that [`Self::strip`] would remove.
        pub fn prefix<'a>(&self, line: &'a str, steps: usize) -> &'a str {
            let rest = self.strip(line, steps);
            &line[..line.len() - rest.len()]
        }
    }

    /* -------------------------------- Blocks -------------------------------- */

    /// The closed set of block variants. Dispatch is always by tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum BlockKind {
        /// Container for a section body; never renders a line of its own.
        Root,
        /// Bullet or numbered list item. Its children are indented one step.
        List,
        /// Any other line (paragraphs, blank lines, tables, fences...).
        Text,
    }

    /// One line of section body content plus whatever is nested under it.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Block {
        pub kind: BlockKind,
        /// The line without the indentation contributed by enclosing list items.
        /// For list items this still carries the marker (`- `, `1. `).
        pub text: String,
        #[serde(default)]
        pub children: Vec<Block>,
        /// Section the block was parsed under. A lookup key, not an owner.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub section: Option<SectionId>,
    }

    impl Block {
        fn with_kind(kind: BlockKind, text: impl Into<String>) -> Self {
            Self {
                kind,
                text: text.into(),
                children: vec![],
                section: None,
            }
        }

        pub fn root() -> Self {
            Self::with_kind(BlockKind::Root, "")
        }

        pub fn list(text: impl Into<String>) -> Self {
            Self::with_kind(BlockKind::List, text)
        }

        pub fn text(text: impl Into<String>) -> Self {
            Self::with_kind(BlockKind::Text, text)
        }

        pub fn blank() -> Self {
            Self::text("")
        }

        pub fn is_root(&self) -> bool {
            self.kind == BlockKind::Root
        }

        pub fn is_list(&self) -> bool {
            self.kind == BlockKind::List
        }

        /// A text block holding nothing but whitespace.
        pub fn is_blank(&self) -> bool {
            self.kind == BlockKind::Text && self.text.trim().is_empty()
        }

        pub fn append_child(&mut self, child: Block) {
            self.children.push(child);
        }

        /// Depth-first pre-order walk over this block and all descendants.
        pub fn walk<'a>(&'a self, out: &mut Vec<&'a Block>) {
            out.push(self);
            for child in &self.children {
                child.walk(out);
            }
        }

        pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut Block)) {
            f(self);
            for child in &mut self.children {
                child.walk_mut(f);
            }
        }

        /// Number of lines this block renders to.
        pub fn line_count(&self) -> usize {
            let own = usize::from(!self.is_root());
            own + self.children.iter().map(Block::line_count).sum::<usize>()
        }
    }

    /* ------------------------------- Sections ------------------------------- */

    /// A heading and everything nested under it until a heading of equal or higher level.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        pub id: SectionId,
        /// Heading label without the `#` token.
        pub text: String,
        /// 1 for `#`, 2 for `##`, ...; 0 only for the document root.
        pub token_level: usize,
        pub block_content: Block,
        #[serde(default)]
        pub children: Vec<Section>,
    }

    impl Section {
        pub fn root() -> Self {
            Self::new("", 0)
        }

        pub fn new(text: impl Into<String>, token_level: usize) -> Self {
            Self {
                id: SectionId::new(),
                text: text.into(),
                token_level,
                block_content: Block::root(),
                children: vec![],
            }
        }

        pub fn is_root(&self) -> bool {
            self.token_level == 0
        }

        pub fn append_child(&mut self, child: Section) {
            self.children.push(child);
        }

        /// Depth-first pre-order walk over this section and all descendants.
        pub fn walk<'a>(&'a self, out: &mut Vec<&'a Section>) {
            out.push(self);
            for child in &self.children {
                child.walk(out);
            }
        }

        pub fn find(&self, id: SectionId) -> Option<&Section> {
            if self.id == id {
                return Some(self);
            }
            self.children.iter().find_map(|child| child.find(id))
        }

        /// Heading texts from the outermost heading down to `id`, root excluded.
        pub fn heading_chain(&self, id: SectionId) -> Option<Vec<String>> {
            if self.id == id {
                return Some(self.own_label().into_iter().collect());
            }
            for child in &self.children {
                if let Some(mut tail) = child.heading_chain(id) {
                    if let Some(label) = self.own_label() {
                        tail.insert(0, label);
                    }
                    return Some(tail);
                }
            }
            None
        }

        fn own_label(&self) -> Option<String> {
            (!self.is_root()).then(|| self.text.clone())
        }

        /// The section rendered last under this one (itself when it has no children).
        pub fn last_descendant_mut(&mut self) -> &mut Section {
            if self.children.is_empty() {
                return self;
            }
            let last = self.children.len() - 1;
            self.children[last].last_descendant_mut()
        }

        /// Moves this subtree to `level`, keeping relative depths of descendants.
        pub fn set_level(&mut self, level: usize) {
            let old = self.token_level;
            self.shift(level as isize - old as isize);
        }

        fn shift(&mut self, delta: isize) {
            self.token_level = (self.token_level as isize + delta).max(1) as usize;
            for child in &mut self.children {
                child.shift(delta);
            }
        }

        /// Points every block of this subtree at the section it belongs to.
        pub fn stamp_blocks(&mut self) {
            let id = self.id;
            self.block_content.walk_mut(&mut |block| block.section = Some(id));
            for child in &mut self.children {
                child.stamp_blocks();
            }
        }
    }

    /// Follows child indices from `section`; stops early at an index that does not exist.
    pub fn section_at_mut<'a>(section: &'a mut Section, path: &[usize]) -> &'a mut Section {
        match path.split_first() {
            Some((&index, rest)) if index < section.children.len() => {
                section_at_mut(&mut section.children[index], rest)
            }
            _ => section,
        }
    }

    pub fn section_at<'a>(section: &'a Section, path: &[usize]) -> &'a Section {
        match path.split_first() {
            Some((&index, rest)) if index < section.children.len() => {
                section_at(&section.children[index], rest)
            }
            _ => section,
        }
    }

    pub fn block_at_mut<'a>(block: &'a mut Block, path: &[usize]) -> &'a mut Block {
        match path.split_first() {
            Some((&index, rest)) if index < block.children.len() => {
                block_at_mut(&mut block.children[index], rest)
            }
            _ => block,
        }
    }

    /// Index path (pre-order) of the first section below `section` satisfying `pred`.
    pub fn find_section_path(
        section: &Section,
        pred: &dyn Fn(&Section) -> bool,
    ) -> Option<Vec<usize>> {
        for (index, child) in section.children.iter().enumerate() {
            if pred(child) {
                return Some(vec![index]);
            }
            if let Some(mut rest) = find_section_path(child, pred) {
                rest.insert(0, index);
                return Some(rest);
            }
        }
        None
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ArchiveError {
        #[error("{0:?} is not a markdown document")]
        NotADocument(PathBuf),
        #[error("document {0:?} does not exist")]
        MissingDocument(PathBuf),
    }

}

pub mod patterns {
    //! Single-line predicates built on `nom`. Nothing here looks at neighbouring lines.

    use crate::core::IndentationSettings;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{take_while, take_while1},
        character::complete::{anychar, char, digit1, one_of},
        combinator::{map, recognize},
        sequence::{delimited, pair, terminated},
    };
    use serde::{Deserialize, Serialize};

    type PResult<'a, T> = IResult<&'a str, T>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum MarkerKind {
        /// `-`, `*` or `+`
        Bullet,
        /// `1.`, `23.`
        Numbered,
    }

    /// A list item line split into its parts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListItemLine<'a> {
        pub indentation: &'a str,
        pub marker: &'a str,
        pub kind: MarkerKind,
        /// Everything after the marker and its separator.
        pub content: &'a str,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineKind<'a> {
        Heading { level: usize, text: &'a str },
        ListItem(ListItemLine<'a>),
        Text,
    }

    /* ------------------------------ Combinators ------------------------------ */

    fn indentation(i: &str) -> PResult<'_, &str> {
        take_while(|c: char| c == ' ' || c == '\t')(i)
    }

    fn heading_token(i: &str) -> PResult<'_, &str> {
        terminated(take_while1(|c: char| c == '#'), char(' '))(i)
    }

    fn list_marker(i: &str) -> PResult<'_, (MarkerKind, &str)> {
        alt((
            map(recognize(one_of("-*+")), |m| (MarkerKind::Bullet, m)),
            map(recognize(pair(digit1, char('.'))), |m| {
                (MarkerKind::Numbered, m)
            }),
        ))(i)
    }

    fn list_item(i: &str) -> PResult<'_, ListItemLine<'_>> {
        let (i, indentation) = indentation(i)?;
        let (i, (kind, marker)) = list_marker(i)?;
        let (content, _) = one_of(" \t")(i)?;
        Ok((
            "",
            ListItemLine {
                indentation,
                marker,
                kind,
                content,
            },
        ))
    }

    fn checkbox(i: &str) -> PResult<'_, char> {
        delimited(char('['), anychar, char(']'))(i)
    }

    /* ------------------------------ Predicates ------------------------------ */

    pub fn classify(line: &str) -> LineKind<'_> {
        if let Some((level, text)) = parse_heading(line) {
            return LineKind::Heading { level, text };
        }
        match parse_list_item(line) {
            Some(item) => LineKind::ListItem(item),
            None => LineKind::Text,
        }
    }

    /// `# Title` -> `(1, "Title")`. The `#` run must start the line and be followed by a space.
    pub fn parse_heading(line: &str) -> Option<(usize, &str)> {
        let (text, hashes) = heading_token(line).ok()?;
        Some((hashes.len(), text))
    }

    pub fn heading_level(line: &str) -> Option<usize> {
        parse_heading(line).map(|(level, _)| level)
    }

    pub fn is_heading(line: &str) -> bool {
        parse_heading(line).is_some()
    }

    pub fn parse_list_item(line: &str) -> Option<ListItemLine<'_>> {
        list_item(line).ok().map(|(_, item)| item)
    }

    pub fn is_list_item(line: &str) -> bool {
        parse_list_item(line).is_some()
    }

    /// Text after the list marker, e.g. `[x] foo` for `- [x] foo`.
    pub fn list_item_content(line: &str) -> Option<&str> {
        parse_list_item(line).map(|item| item.content)
    }

    /// An indented line that carries on the list item above it.
    pub fn is_indented_continuation(line: &str, indentation: &IndentationSettings) -> bool {
        !is_list_item(line) && line.starts_with(&indentation.unit())
    }

    /// The status character of a task checkbox: `' '` for `- [ ]`, `'x'` for `- [x]`.
    pub fn task_status(line: &str) -> Option<char> {
        let item = parse_list_item(line)?;
        checkbox(item.content).ok().map(|(_, status)| status)
    }

    pub fn is_task(line: &str) -> bool {
        task_status(line).is_some()
    }

    /// Task text after the checkbox, e.g. `water` for `- [x] water`.
    pub fn task_text(line: &str) -> Option<&str> {
        let item = parse_list_item(line)?;
        checkbox(item.content).ok().map(|(rest, _)| rest.trim_start())
    }

    /// `[x]`/`[X]` always count as done. Other non-blank statuses (`[>]`, `[-]`)
    /// only when `any_checked` is set.
    pub fn is_completed_task(line: &str, any_checked: bool) -> bool {
        match task_status(line) {
            Some('x' | 'X') => true,
            Some(' ') | None => false,
            Some(_) => any_checked,
        }
    }

    pub fn is_incomplete_task(line: &str) -> bool {
        task_status(line) == Some(' ')
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn headings_need_a_space() {
            assert_eq!(parse_heading("## Notes"), Some((2, "Notes")));
            assert_eq!(parse_heading("# "), Some((1, "")));
            assert_eq!(parse_heading("#tag"), None);
            assert_eq!(parse_heading(" # indented"), None);
        }

        #[test]
        fn list_items_keep_marker_and_indentation() {
            let item = parse_list_item("\t\t- [ ] task").expect("list item");
            assert_eq!(item.indentation, "\t\t");
            assert_eq!(item.marker, "-");
            assert_eq!(item.kind, MarkerKind::Bullet);
            assert_eq!(item.content, "[ ] task");

            let numbered = parse_list_item("12. step").expect("numbered");
            assert_eq!(numbered.kind, MarkerKind::Numbered);
            assert_eq!(numbered.marker, "12.");

            assert!(is_list_item("*\tstar"));
            assert!(!is_list_item("-no space"));
            assert!(!is_list_item("---"));
            assert!(!is_list_item("1.5 apples"));
        }

        #[test]
        fn continuation_needs_a_full_unit() {
            let tabs = IndentationSettings::tabs();
            assert!(is_indented_continuation("\tmore text", &tabs));
            assert!(!is_indented_continuation("\t- item", &tabs));
            assert!(!is_indented_continuation("  text", &tabs));

            let spaces = IndentationSettings::spaces(2);
            assert!(is_indented_continuation("  text", &spaces));
            assert!(!is_indented_continuation(" text", &spaces));
        }

        #[test]
        fn task_statuses() {
            assert_eq!(task_status("- [x] done"), Some('x'));
            assert_eq!(task_status("1. [ ] open"), Some(' '));
            assert_eq!(task_status("- [[link]]"), None);
            assert_eq!(task_status("[x] not a list"), None);

            assert!(is_completed_task("- [X] done", false));
            assert!(!is_completed_task("- [>] forwarded", false));
            assert!(is_completed_task("- [>] forwarded", true));
            assert!(!is_completed_task("- [ ] open", true));
            assert!(is_incomplete_task("\t- [ ] nested"));
        }

        #[test]
        fn task_text_skips_multibyte_statuses() {
            assert_eq!(task_text("- [x] water"), Some("water"));
            assert_eq!(task_text("\t- [✓] mulch"), Some("mulch"));
            assert_eq!(task_text("- plain"), None);
        }

        #[test]
        fn classify_prefers_headings() {
            assert!(matches!(
                classify("# - not a list"),
                LineKind::Heading { level: 1, .. }
            ));
            assert!(matches!(classify("+ plus"), LineKind::ListItem(_)));
            assert_eq!(classify("plain"), LineKind::Text);
        }
    }
}

pub mod tree {
    //! Level-stack reducer shared by the section and block parsers.
    //!
    //! Input is a flat run of `(node, level)` pairs in document order. Each node
    //! nests under the closest open node with a smaller stack depth. Only nodes that
    //! open a context (headings, list items) are ever pushed; everything else is
    //! attached to the current top and never becomes a parent.

    use crate::core::{Block, Section};

    pub trait TreeNode: Sized {
        fn append_child(&mut self, child: Self);

        /// Whether later, deeper nodes may nest under this one.
        fn opens_context(&self) -> bool;
    }

    impl TreeNode for Block {
        fn append_child(&mut self, child: Self) {
            self.children.push(child);
        }

        fn opens_context(&self) -> bool {
            self.is_list()
        }
    }

    impl TreeNode for Section {
        fn append_child(&mut self, child: Self) {
            self.children.push(child);
        }

        fn opens_context(&self) -> bool {
            !self.is_root()
        }
    }

    /// Nests `flat` under `root`. Levels start at 1; the root sits at 0.
    ///
    /// Popping compares against stack depth, not the level the popped node was
    /// read at, so skipped levels (`#` then `####`) nest under the nearest open
    /// node without fabricating intermediates.
    pub fn build_tree<T: TreeNode>(root: T, flat: impl IntoIterator<Item = (T, usize)>) -> T {
        let mut root = root;
        let mut open: Vec<T> = Vec::new();

        for (node, level) in flat {
            while !open.is_empty() && open.len() >= level {
                close_top(&mut root, &mut open);
            }
            if node.opens_context() {
                open.push(node);
            } else {
                match open.last_mut() {
                    Some(top) => top.append_child(node),
                    None => root.append_child(node),
                }
            }
        }

        while !open.is_empty() {
            close_top(&mut root, &mut open);
        }
        root
    }

    fn close_top<T: TreeNode>(root: &mut T, open: &mut Vec<T>) {
        if let Some(node) = open.pop() {
            match open.last_mut() {
                Some(parent) => parent.append_child(node),
                None => root.append_child(node),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[derive(Debug, PartialEq)]
        struct Node {
            name: &'static str,
            nests: bool,
            children: Vec<Node>,
        }

        fn node(name: &'static str, nests: bool) -> Node {
            Node {
                name,
                nests,
                children: vec![],
            }
        }

        impl TreeNode for Node {
            fn append_child(&mut self, child: Self) {
                self.children.push(child);
            }
            fn opens_context(&self) -> bool {
                self.nests
            }
        }

        fn names(n: &Node) -> Vec<&'static str> {
            n.children.iter().map(|c| c.name).collect()
        }

        #[test]
        fn same_level_nodes_are_siblings() {
            let root = build_tree(
                node("root", true),
                [(node("a", true), 1), (node("b", true), 1), (node("c", true), 2)],
            );
            assert_eq!(names(&root), vec!["a", "b"]);
            assert_eq!(names(&root.children[1]), vec!["c"]);
        }

        #[test]
        fn skipped_levels_nest_under_nearest_open_node() {
            let root = build_tree(
                node("root", true),
                [(node("h1", true), 1), (node("h4", true), 4), (node("h2", true), 2)],
            );
            assert_eq!(names(&root), vec!["h1"]);
            assert_eq!(names(&root.children[0]), vec!["h4", "h2"]);
        }

        #[test]
        fn content_nodes_never_become_parents() {
            let root = build_tree(
                node("root", true),
                [
                    (node("item", true), 1),
                    (node("text", false), 2),
                    (node("deeper", false), 3),
                    (node("sub", true), 2),
                ],
            );
            assert_eq!(names(&root), vec!["item"]);
            assert_eq!(names(&root.children[0]), vec!["text", "deeper", "sub"]);
        }
    }
}

pub mod parser {
    //! Line-oriented parser: headings split the document into sections, each
    //! section body becomes a block tree keyed on indentation. Parsing never fails;
    //! anything unrecognized is kept as a text block.

    use crate::core::{Block, IndentationSettings, Section};
    use crate::patterns;
    use crate::tree::build_tree;

    /* ------------------------------- Blocks ------------------------------- */

    /// Parses the body lines of one section into a tree under a fresh root block.
    pub fn parse_blocks<S: AsRef<str>>(lines: &[S], indentation: &IndentationSettings) -> Block {
        let flat = lines.iter().map(|line| {
            let line = line.as_ref();
            let level = 1 + indentation.level_of(line);
            let block = if patterns::is_list_item(line) {
                Block::list(line)
            } else {
                Block::text(line)
            };
            (block, level)
        });
        let mut root = build_tree(Block::root(), flat);
        strip_inherited_indentation(&mut root, 0, indentation);
        root
    }

    /// Drops the indentation each block inherits from its list ancestors; the
    /// formatter puts it back from tree depth. Extra indentation is kept.
    fn strip_inherited_indentation(
        block: &mut Block,
        depth: usize,
        indentation: &IndentationSettings,
    ) {
        for child in &mut block.children {
            let stripped = indentation.strip(&child.text, depth);
            if stripped.len() != child.text.len() {
                child.text = stripped.to_string();
            }
            let next = if child.is_list() { depth + 1 } else { depth };
            strip_inherited_indentation(child, next, indentation);
        }
    }

    /* ------------------------------ Sections ------------------------------ */

    struct RawSection<'a> {
        heading: Option<(usize, &'a str)>,
        lines: Vec<&'a str>,
    }

    /// Parses a whole document into the root section (level 0, no text).
    pub fn parse_document<S: AsRef<str>>(
        lines: &[S],
        indentation: &IndentationSettings,
    ) -> Section {
        let mut raw = vec![RawSection {
            heading: None,
            lines: vec![],
        }];
        for line in lines {
            let line = line.as_ref();
            match patterns::parse_heading(line) {
                Some(heading) => raw.push(RawSection {
                    heading: Some(heading),
                    lines: vec![],
                }),
                None => {
                    if let Some(current) = raw.last_mut() {
                        current.lines.push(line);
                    }
                }
            }
        }

        let mut sections = raw.into_iter();
        let mut root = Section::root();
        if let Some(preamble) = sections.next() {
            root.block_content = parse_blocks(&preamble.lines, indentation);
        }

        let flat = sections.filter_map(|raw| {
            let (level, text) = raw.heading?;
            let mut section = Section::new(text, level);
            section.block_content = parse_blocks(&raw.lines, indentation);
            Some((section, level))
        });
        let mut root = build_tree(root, flat);
        root.stamp_blocks();
        root
    }

}

pub mod format {
    //! Serialization back to lines: the exact inverse of [`crate::parser`] for
    //! trees that were not restructured.

    use crate::core::{Block, IndentationSettings, Section};
    use crate::parser::parse_document;

    pub fn stringify(root: &Section, indentation: &IndentationSettings) -> Vec<String> {
        let unit = indentation.unit();
        let mut out = Vec::new();
        push_section(&mut out, root, &unit);
        out
    }

    pub fn stringify_block(block: &Block, indentation: &IndentationSettings) -> Vec<String> {
        let unit = indentation.unit();
        let mut out = Vec::new();
        push_block(&mut out, block, "", &unit);
        out
    }

    /// Parse and print again; normalizes misaligned indentation and nothing else.
    pub fn format_lines<S: AsRef<str>>(
        lines: &[S],
        indentation: &IndentationSettings,
    ) -> Vec<String> {
        stringify(&parse_document(lines, indentation), indentation)
    }

    pub fn render_heading(section: &Section) -> String {
        format!("{} {}", "#".repeat(section.token_level), section.text)
    }

    fn push_section(out: &mut Vec<String>, section: &Section, unit: &str) {
        if !section.is_root() {
            out.push(render_heading(section));
        }
        push_block(out, &section.block_content, "", unit);
        for child in &section.children {
            push_section(out, child, unit);
        }
    }

    fn push_block(out: &mut Vec<String>, block: &Block, prefix: &str, unit: &str) {
        if !block.is_root() {
            out.push(format!("{prefix}{}", block.text));
        }
        // Only list items indent what is nested under them.
        let child_prefix = if block.is_list() {
            format!("{prefix}{unit}")
        } else {
            prefix.to_string()
        };
        for child in &block.children {
            push_block(out, child, &child_prefix, unit);
        }
    }

    /* ----------------------------- Line lookup ----------------------------- */

    /// The node that renders a given output line, as index paths from the root.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LineOwner {
        Heading {
            section: Vec<usize>,
        },
        Block {
            section: Vec<usize>,
            block: Vec<usize>,
        },
    }

    /// Maps a 0-based line of `stringify(root)` back to the node that produced it.
    pub fn line_owner(root: &Section, line: usize) -> Option<LineOwner> {
        let mut remaining = line;
        owner_in_section(root, &mut remaining, &mut Vec::new())
    }

    fn owner_in_section(
        section: &Section,
        remaining: &mut usize,
        path: &mut Vec<usize>,
    ) -> Option<LineOwner> {
        if !section.is_root() {
            if *remaining == 0 {
                return Some(LineOwner::Heading {
                    section: path.clone(),
                });
            }
            *remaining -= 1;
        }
        if let Some(block) = owner_in_block(&section.block_content, remaining, &mut Vec::new()) {
            return Some(LineOwner::Block {
                section: path.clone(),
                block,
            });
        }
        for (index, child) in section.children.iter().enumerate() {
            path.push(index);
            if let Some(found) = owner_in_section(child, remaining, path) {
                return Some(found);
            }
            path.pop();
        }
        None
    }

    fn owner_in_block(block: &Block, remaining: &mut usize, path: &mut Vec<usize>) -> Option<Vec<usize>> {
        if !block.is_root() {
            if *remaining == 0 {
                return Some(path.clone());
            }
            *remaining -= 1;
        }
        for (index, child) in block.children.iter().enumerate() {
            path.push(index);
            if let Some(found) = owner_in_block(child, remaining, path) {
                return Some(found);
            }
            path.pop();
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use rstest::rstest;

        fn lines(text: &str) -> Vec<String> {
            text.split('\n').map(String::from).collect()
        }

        fn reindent(text: &str, unit: &str) -> Vec<String> {
            lines(&text.replace('\t', unit))
        }

        const DOCUMENT: &str = "preamble line

- top item
\tcontinuation
\t- [ ] nested task
\t\t- [x] deeper
\t\t\textra indented note
1. numbered
| table | row |
# Heading
## Sub
- a
\t- b

text after
#### Skipped
```
\tcode stays put
```
# ";

        #[rstest]
        #[case::tabs(IndentationSettings::tabs(), "\t")]
        #[case::two_spaces(IndentationSettings::spaces(2), "  ")]
        #[case::three_spaces(IndentationSettings::spaces(3), "   ")]
        #[case::four_spaces(IndentationSettings::spaces(4), "    ")]
        fn round_trips_unmodified_documents(
            #[case] indentation: IndentationSettings,
            #[case] unit: &str,
        ) {
            let input = reindent(DOCUMENT, unit);
            assert_eq!(format_lines(&input, &indentation), input);
        }

        #[test]
        fn round_trips_edge_documents() {
            let tabs = IndentationSettings::tabs();
            for text in ["", "\n", "#", "# ", "-", "- ", "\t\t- skipped levels", "- a\n\t\t\t- b\n\t- c"] {
                let input = lines(text);
                assert_eq!(format_lines(&input, &tabs), input, "input {text:?}");
            }
        }

        #[test]
        fn reinserted_blocks_take_indentation_from_position() {
            let tabs = IndentationSettings::tabs();
            let mut root = parse_document(&["- parent"], &tabs);
            let mut moved = Block::list("- [x] moved");
            moved.append_child(Block::list("- child"));
            root.block_content.children[0].append_child(moved);

            assert_eq!(
                stringify(&root, &tabs),
                vec!["- parent", "\t- [x] moved", "\t\t- child"]
            );
        }

        #[test]
        fn normalizes_misaligned_spaces() {
            let spaces = IndentationSettings::spaces(4);
            let input = ["- a", "  - b"];
            assert_eq!(format_lines(&input, &spaces), vec!["- a", "    - b"]);
        }

        #[test]
        fn line_owner_follows_render_order() {
            let tabs = IndentationSettings::tabs();
            let root = parse_document(&["intro", "# A", "- a", "\t- b", "## B", "text"], &tabs);
            assert_eq!(
                line_owner(&root, 0),
                Some(LineOwner::Block { section: vec![], block: vec![0] })
            );
            assert_eq!(line_owner(&root, 1), Some(LineOwner::Heading { section: vec![0] }));
            assert_eq!(
                line_owner(&root, 3),
                Some(LineOwner::Block { section: vec![0], block: vec![0, 0] })
            );
            assert_eq!(line_owner(&root, 4), Some(LineOwner::Heading { section: vec![0, 0] }));
            assert_eq!(
                line_owner(&root, 5),
                Some(LineOwner::Block { section: vec![0, 0], block: vec![0] })
            );
            assert_eq!(line_owner(&root, 6), None);
        }

        #[test]
        fn text_children_are_not_indented() {
            let mut text = Block::text("para");
            text.append_child(Block::text("same column"));
            let mut root = Block::root();
            root.append_child(text);
            assert_eq!(
                stringify_block(&root, &IndentationSettings::tabs()),
                vec!["para", "same column"]
            );
        }
    }
}

pub mod settings {
    //! Plugin settings. Field names are camelCase so an existing `data.json`
    //! deserializes as-is; every field has a default.

    use crate::core::IndentationSettings;
    use anyhow::{Context, Result};
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    #[derive(Debug, thiserror::Error)]
    pub enum SettingsError {
        #[error("invalid regular expression in `{field}`: {source}")]
        InvalidPattern {
            field: String,
            #[source]
            source: regex::Error,
        },
        #[error("archive heading depth must be between 1 and 6, got {0}")]
        InvalidHeadingDepth(usize),
        #[error("tab size must be at least 1")]
        InvalidTabSize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum SortOrder {
        #[default]
        NewestLast,
        NewestFirst,
    }

    /// A heading or list item label with its own date pattern for `{{date}}`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct LabelTemplate {
        pub text: String,
        pub date_format: String,
    }

    impl Default for LabelTemplate {
        fn default() -> Self {
            Self {
                text: String::new(),
                date_format: "%Y-%m-%d".into(),
            }
        }
    }

    /// Week/day list items archived tasks are grouped under.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct DateTreeSettings {
        pub use_weeks: bool,
        pub weekly_note_format: String,
        pub use_days: bool,
        pub daily_note_format: String,
    }

    impl Default for DateTreeSettings {
        fn default() -> Self {
            Self {
                use_weeks: false,
                weekly_note_format: "%G-W%V".into(),
                use_days: false,
                daily_note_format: "%Y-%m-%d".into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct AdditionalMetadata {
        pub add_metadata: bool,
        pub metadata: String,
        pub date_format: String,
    }

    impl Default for AdditionalMetadata {
        fn default() -> Self {
            Self {
                add_metadata: false,
                metadata: "(completed: {{date}}; source: [[{{sourceFileName}}]])".into(),
                date_format: "%Y-%m-%d".into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct TextReplacement {
        pub apply_replacement: bool,
        pub regex: String,
        pub replacement: String,
    }

    /// Per-task routing. The first rule whose statuses contain the task's status
    /// character, or whose path pattern matches the source path, wins.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct ArchiveRule {
        pub statuses: String,
        pub path_pattern: String,
        pub archive_to_separate_file: bool,
        pub default_archive_file_name: String,
        pub date_format: String,
    }

    impl Default for ArchiveRule {
        fn default() -> Self {
            Self {
                statuses: String::new(),
                path_pattern: String::new(),
                archive_to_separate_file: true,
                default_archive_file_name: "{{sourceFileName}} (archive)".into(),
                date_format: "%Y-%m-%d".into(),
            }
        }
    }

    /// Where a task goes once its routing rule is known.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Route<'a> {
        pub archive_to_separate_file: bool,
        pub file_name: &'a str,
        pub date_format: &'a str,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Settings {
        pub indentation: IndentationSettings,
        pub archive_heading: String,
        pub archive_heading_depth: usize,
        pub add_newlines_around_headings: bool,
        pub archive_to_separate_file: bool,
        pub default_archive_file_name: String,
        pub date_format: String,
        pub headings: Vec<LabelTemplate>,
        pub list_items: Vec<LabelTemplate>,
        pub date_tree: DateTreeSettings,
        pub sort_order: SortOrder,
        pub rules: Vec<ArchiveRule>,
        pub archive_all_checked_task_types: bool,
        pub additional_task_pattern: String,
        pub archive_only_if_subtasks_are_done: bool,
        pub task_completion_pattern: String,
        pub task_completion_date_format: String,
        pub additional_metadata: AdditionalMetadata,
        pub text_replacement: TextReplacement,
        pub sort_alphabetically: bool,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                indentation: IndentationSettings::default(),
                archive_heading: "Archived".into(),
                archive_heading_depth: 1,
                add_newlines_around_headings: true,
                archive_to_separate_file: false,
                default_archive_file_name: "{{sourceFileName}} (archive)".into(),
                date_format: "%Y-%m-%d".into(),
                headings: vec![],
                list_items: vec![],
                date_tree: DateTreeSettings::default(),
                sort_order: SortOrder::default(),
                rules: vec![],
                archive_all_checked_task_types: false,
                additional_task_pattern: String::new(),
                archive_only_if_subtasks_are_done: false,
                task_completion_pattern: r"✅ (\d{4}-\d{2}-\d{2})".into(),
                task_completion_date_format: "%Y-%m-%d".into(),
                additional_metadata: AdditionalMetadata::default(),
                text_replacement: TextReplacement::default(),
                sort_alphabetically: false,
            }
        }
    }

    impl Settings {
        /// Reads settings from a JSON file; a missing file yields the defaults.
        pub fn load(path: &Path) -> Result<Self> {
            if !path.exists() {
                tracing::debug!(?path, "settings file not found, using defaults");
                return Ok(Self::default());
            }
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            let settings: Settings = serde_json::from_str(&text)
                .with_context(|| format!("parsing settings {:?}", path))?;
            Ok(settings)
        }

        /// Checks everything the core assumes is well-formed.
        pub fn validate(&self) -> Result<(), SettingsError> {
            if !(1..=6).contains(&self.archive_heading_depth) {
                return Err(SettingsError::InvalidHeadingDepth(self.archive_heading_depth));
            }
            if self.indentation.tab_size == 0 {
                return Err(SettingsError::InvalidTabSize);
            }

            let mut patterns = vec![
                ("additionalTaskPattern".to_string(), &self.additional_task_pattern),
                ("taskCompletionPattern".to_string(), &self.task_completion_pattern),
            ];
            if self.text_replacement.apply_replacement {
                patterns.push(("textReplacement.regex".to_string(), &self.text_replacement.regex));
            }
            for (index, rule) in self.rules.iter().enumerate() {
                patterns.push((format!("rules[{index}].pathPattern"), &rule.path_pattern));
            }

            for (field, pattern) in patterns {
                if pattern.is_empty() {
                    continue;
                }
                Regex::new(pattern)
                    .map_err(|source| SettingsError::InvalidPattern { field, source })?;
            }
            Ok(())
        }

        /// Literal, case-sensitive match on the configured archive heading.
        pub fn archive_heading_pattern(&self) -> Option<Regex> {
            compile_guarded("archiveHeading", &regex::escape(&self.archive_heading))
        }

        pub fn is_archive_heading(&self, text: &str) -> bool {
            self.archive_heading_pattern()
                .is_some_and(|pattern| pattern.is_match(text))
        }

        /// Patterns for sections that hold archived content: the archive heading
        /// plus every configured heading template.
        pub fn archive_section_patterns(&self) -> Vec<Regex> {
            let templates = self
                .headings
                .iter()
                .filter(|heading| !heading.text.is_empty())
                .filter_map(|heading| crate::placeholders::template_pattern(&heading.text));
            self.archive_heading_pattern()
                .into_iter()
                .chain(templates)
                .collect()
        }

        pub fn is_archive_section(&self, text: &str) -> bool {
            self.archive_section_patterns()
                .iter()
                .any(|pattern| pattern.is_match(text))
        }

        pub fn route_for(&self, status: Option<char>, source_path: &str) -> Route<'_> {
            let rule = self.rules.iter().find(|rule| {
                let by_status = status.is_some_and(|s| rule.statuses.contains(s));
                let by_path = !rule.path_pattern.is_empty()
                    && compile_guarded("pathPattern", &rule.path_pattern)
                        .is_some_and(|pattern| pattern.is_match(source_path));
                by_status || by_path
            });
            match rule {
                Some(rule) => Route {
                    archive_to_separate_file: rule.archive_to_separate_file,
                    file_name: &rule.default_archive_file_name,
                    date_format: &rule.date_format,
                },
                None => Route {
                    archive_to_separate_file: self.archive_to_separate_file,
                    file_name: &self.default_archive_file_name,
                    date_format: &self.date_format,
                },
            }
        }
    }

    /// Compiles `pattern`; an invalid one is logged and reported as `None`.
    pub fn compile_guarded(field: &str, pattern: &str) -> Option<Regex> {
        match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(err) => {
                tracing::warn!(field, %err, "ignoring invalid pattern");
                None
            }
        }
    }

}

pub mod dates {
    //! Clock and date formatting, injected wherever "now" or a date label is needed.

    use chrono::{Local, NaiveDate, NaiveDateTime, format::Item, format::StrftimeItems};
    use std::fmt::Write;

    pub trait Clock {
        fn now(&self) -> NaiveDateTime;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> NaiveDateTime {
            Local::now().naive_local()
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    pub trait DateFormatter {
        fn format(&self, at: NaiveDateTime, pattern: &str) -> String;
    }

    /// strftime-style patterns (`%Y-%m-%d`, `%G-W%V`).
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ChronoFormatter;

    impl DateFormatter for ChronoFormatter {
        fn format(&self, at: NaiveDateTime, pattern: &str) -> String {
            let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
            let mut out = String::new();
            if items.iter().any(|item| matches!(item, Item::Error))
                || write!(out, "{}", at.format_with_items(items.iter())).is_err()
            {
                tracing::warn!(pattern, "invalid date pattern, leaving it verbatim");
                return pattern.to_string();
            }
            out
        }
    }

    pub fn parse_date(text: &str, pattern: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(text, pattern).ok()
    }

}

pub mod placeholders {
    //! `{{token}}` substitution in configured strings (file names, heading and
    //! list labels, metadata). Unknown tokens are left as written.

    use crate::dates::DateFormatter;
    use chrono::{NaiveDate, NaiveDateTime};
    use regex::{Captures, Regex};
    use std::sync::LazyLock;

    static TOKEN: LazyLock<Result<Regex, regex::Error>> =
        LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}"));

    /// What a placeholder can refer to for one task.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlaceholderContext {
        /// Completion date when the task carries one, otherwise "now".
        pub date: NaiveDateTime,
        pub source_file_name: String,
        pub source_file_path: String,
        pub heading_chain: Vec<String>,
        pub completed_date: Option<NaiveDate>,
    }

    /// Whole-text pattern matching anything `template` can resolve to: literal
    /// parts are escaped, each `{{token}}` matches any run of characters.
    pub fn template_pattern(template: &str) -> Option<Regex> {
        let token = TOKEN.as_ref().ok()?;
        let mut pattern = String::from("^");
        let mut last = 0;
        for found in token.find_iter(template) {
            pattern.push_str(&regex::escape(&template[last..found.start()]));
            pattern.push_str(".*");
            last = found.end();
        }
        pattern.push_str(&regex::escape(&template[last..]));
        pattern.push('$');
        Regex::new(&pattern).ok()
    }

    impl PlaceholderContext {
        pub fn heading(&self) -> &str {
            self.heading_chain.last().map(String::as_str).unwrap_or("")
        }
    }

    pub struct Resolver<'a> {
        pub context: &'a PlaceholderContext,
        pub dates: &'a dyn DateFormatter,
        pub completed_date_format: &'a str,
    }

    impl Resolver<'_> {
        /// Substitutes every known token; `date_format` applies to `{{date}}`.
        pub fn resolve(&self, template: &str, date_format: &str) -> String {
            let Ok(token) = TOKEN.as_ref() else {
                return template.to_string();
            };
            token
                .replace_all(template, |caps: &Captures<'_>| {
                    self.value(&caps[1], date_format)
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned()
        }

        fn value(&self, token: &str, date_format: &str) -> Option<String> {
            let ctx = self.context;
            let value = match token {
                "date" => self.dates.format(ctx.date, date_format),
                "sourceFileName" => ctx.source_file_name.clone(),
                "sourceFilePath" => ctx.source_file_path.clone(),
                "heading" => ctx.heading().to_string(),
                "headingChain" => ctx.heading_chain.join(" > "),
                "obsidianTasksCompletedDate" => ctx
                    .completed_date
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|at| self.dates.format(at, self.completed_date_format))
                    .unwrap_or_default(),
                _ => return None,
            };
            Some(value)
        }
    }

}

pub mod tasks {
    //! Task selection and extraction. Extraction detaches matched blocks with their
    //! whole subtree; siblings that stay keep their order.

    use crate::core::{Block, Section};
    use crate::dates::parse_date;
    use crate::patterns;
    use crate::settings::{Settings, compile_guarded};
    use chrono::NaiveDate;
    use regex::Regex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ExtractionDepth {
        /// Top-level blocks of each section only.
        #[default]
        Shallow,
        /// Also nested list items, e.g. a done sub-task under an open parent.
        Deep,
    }

    /// Removes every block accepted by `block_filter` and returns them in document
    /// order. Child sections rejected by `section_filter` are not entered; the
    /// section passed in is always scanned.
    pub fn extract_blocks(
        section: &mut Section,
        depth: ExtractionDepth,
        block_filter: &dyn Fn(&Block) -> bool,
        section_filter: &dyn Fn(&Section) -> bool,
    ) -> Vec<Block> {
        let mut out = Vec::new();
        extract_from_section(section, depth, block_filter, section_filter, &mut out);
        out
    }

    fn extract_from_section(
        section: &mut Section,
        depth: ExtractionDepth,
        block_filter: &dyn Fn(&Block) -> bool,
        section_filter: &dyn Fn(&Section) -> bool,
        out: &mut Vec<Block>,
    ) {
        extract_from_block(&mut section.block_content, depth, block_filter, out);
        for child in &mut section.children {
            if section_filter(child) {
                extract_from_section(child, depth, block_filter, section_filter, out);
            }
        }
    }

    fn extract_from_block(
        parent: &mut Block,
        depth: ExtractionDepth,
        block_filter: &dyn Fn(&Block) -> bool,
        out: &mut Vec<Block>,
    ) {
        let children = std::mem::take(&mut parent.children);
        for mut child in children {
            if block_filter(&child) {
                out.push(child);
                continue;
            }
            if depth == ExtractionDepth::Deep {
                extract_from_block(&mut child, depth, block_filter, out);
            }
            parent.children.push(child);
        }
    }

    /// True when an open task sits anywhere below `block`.
    pub fn has_incomplete_subtask(block: &Block) -> bool {
        block.children.iter().any(|child| {
            (child.is_list() && patterns::is_incomplete_task(&child.text))
                || has_incomplete_subtask(child)
        })
    }

    #[derive(Debug, Clone)]
    enum ExtraPattern {
        Any,
        Pattern(Regex),
        /// The configured pattern did not compile.
        Nothing,
    }

    /// Which list items count as finished tasks ready to be archived or deleted.
    #[derive(Debug, Clone)]
    pub struct TaskFilter {
        any_checked: bool,
        extra: ExtraPattern,
        only_if_subtasks_done: bool,
    }

    impl TaskFilter {
        pub fn from_settings(settings: &Settings) -> Self {
            let extra = if settings.additional_task_pattern.is_empty() {
                ExtraPattern::Any
            } else {
                match compile_guarded("additionalTaskPattern", &settings.additional_task_pattern) {
                    Some(pattern) => ExtraPattern::Pattern(pattern),
                    None => ExtraPattern::Nothing,
                }
            };
            Self {
                any_checked: settings.archive_all_checked_task_types,
                extra,
                only_if_subtasks_done: settings.archive_only_if_subtasks_are_done,
            }
        }

        pub fn matches(&self, block: &Block) -> bool {
            if !block.is_list() || !patterns::is_completed_task(&block.text, self.any_checked) {
                return false;
            }
            let extra = match &self.extra {
                ExtraPattern::Any => true,
                ExtraPattern::Pattern(pattern) => pattern.is_match(&block.text),
                ExtraPattern::Nothing => false,
            };
            extra && !(self.only_if_subtasks_done && has_incomplete_subtask(block))
        }
    }

    /// Completion date stamped on a task line (first capture of the completion pattern).
    pub fn completion_date(line: &str, settings: &Settings) -> Option<NaiveDate> {
        let pattern = compile_guarded("taskCompletionPattern", &settings.task_completion_pattern)?;
        let captures = pattern.captures(line)?;
        parse_date(captures.get(1)?.as_str(), &settings.task_completion_date_format)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::IndentationSettings;
        use crate::format::stringify;
        use crate::parser::parse_document;

        fn texts(blocks: &[Block]) -> Vec<&str> {
            blocks.iter().map(|b| b.text.as_str()).collect()
        }

        fn extract(lines: &[&str], depth: ExtractionDepth, settings: &Settings) -> (Vec<String>, Vec<Block>) {
            let tabs = IndentationSettings::tabs();
            let mut root = parse_document(lines, &tabs);
            let filter = TaskFilter::from_settings(settings);
            let blocks = extract_blocks(&mut root, depth, &|b| filter.matches(b), &|s| {
                !settings.is_archive_heading(&s.text)
            });
            (stringify(&root, &tabs), blocks)
        }

        #[test]
        fn shallow_leaves_nested_tasks_alone() {
            let lines = ["- [ ] bar", "\t- [x] completed sub-task", "- [x] foo", "# Archived"];
            let (rest, blocks) = extract(&lines, ExtractionDepth::Shallow, &Settings::default());
            assert_eq!(texts(&blocks), vec!["- [x] foo"]);
            assert_eq!(rest, vec!["- [ ] bar", "\t- [x] completed sub-task", "# Archived"]);
        }

        #[test]
        fn deep_extracts_nested_tasks_in_document_order() {
            let lines = [
                "- [ ] bar",
                "\t- [x] sub",
                "- [x] foo",
                "\t- [x] moves with foo",
                "# Work",
                "- [x] later",
            ];
            let (rest, blocks) = extract(&lines, ExtractionDepth::Deep, &Settings::default());
            assert_eq!(texts(&blocks), vec!["- [x] sub", "- [x] foo", "- [x] later"]);
            assert_eq!(texts(&blocks[1].children), vec!["- [x] moves with foo"]);
            assert_eq!(rest, vec!["- [ ] bar", "# Work"]);
        }

        #[test]
        fn archive_section_is_not_entered() {
            let lines = ["# Archived", "- [x] old", "## Nested", "- [x] older"];
            let (rest, blocks) = extract(&lines, ExtractionDepth::Deep, &Settings::default());
            assert!(blocks.is_empty());
            assert_eq!(rest, lines.to_vec());
        }

        #[test]
        fn subtask_policy_scans_whole_subtree() {
            let settings = Settings {
                archive_only_if_subtasks_are_done: true,
                ..Settings::default()
            };
            let lines = ["- [x] parent", "\t- note", "\t\t- [ ] still open", "- [x] clean", "\t- [x] done"];
            let (_, blocks) = extract(&lines, ExtractionDepth::Shallow, &settings);
            assert_eq!(texts(&blocks), vec!["- [x] clean"]);
        }

        #[test]
        fn additional_pattern_narrows_and_broken_pattern_matches_nothing() {
            let lines = ["- [x] foo #work", "- [x] bar", "- [>] forwarded #work"];
            let narrowed = Settings {
                additional_task_pattern: "#work".into(),
                archive_all_checked_task_types: true,
                ..Settings::default()
            };
            let (_, blocks) = extract(&lines, ExtractionDepth::Shallow, &narrowed);
            assert_eq!(texts(&blocks), vec!["- [x] foo #work", "- [>] forwarded #work"]);

            let broken = Settings {
                additional_task_pattern: "(".into(),
                ..Settings::default()
            };
            let (_, blocks) = extract(&lines, ExtractionDepth::Shallow, &broken);
            assert!(blocks.is_empty());
        }

        #[test]
        fn reads_completion_date() {
            let settings = Settings::default();
            assert_eq!(
                completion_date("- [x] foo ✅ 2024-02-29", &settings),
                NaiveDate::from_ymd_opt(2024, 2, 29)
            );
            assert_eq!(completion_date("- [x] foo", &settings), None);
            assert_eq!(completion_date("- [x] foo ✅ 2024-13-01", &settings), None);
        }
    }
}

pub mod archive {
    //! Finding or creating the archive destination inside a document tree, and
    //! merging archived blocks into it.

    use crate::core::{Block, Section, find_section_path, section_at, section_at_mut};
    use crate::patterns;
    use crate::placeholders::Resolver;
    use crate::settings::{Settings, SortOrder, compile_guarded};

    /// The section archived content goes into, created if needed.
    ///
    /// With `headings` the chain is walked (or built) from `archiveHeadingDepth`
    /// downwards; each label is looked up at its own level anywhere below the
    /// previous one. Otherwise the first section in pre-order whose text contains
    /// the archive heading is used. New sections go where the parser would nest a
    /// heading of their level, so the next run finds them again.
    pub fn resolve_archive_section<'a>(
        root: &'a mut Section,
        settings: &Settings,
        headings: &[String],
    ) -> &'a mut Section {
        if !headings.is_empty() {
            return heading_chain_mut(root, settings, headings);
        }
        let path = settings
            .archive_heading_pattern()
            .and_then(|pattern| find_section_path(root, &|s| pattern.is_match(&s.text)));
        match path {
            Some(path) => section_at_mut(root, &path),
            None => {
                tracing::debug!(heading = %settings.archive_heading, "creating archive section");
                let level = settings.archive_heading_depth;
                let path = attach_path(root, level);
                let parent = section_at_mut(root, &path);
                add_section(
                    parent,
                    Section::new(settings.archive_heading.clone(), level),
                    settings.add_newlines_around_headings,
                )
            }
        }
    }

    fn heading_chain_mut<'a>(
        root: &'a mut Section,
        settings: &Settings,
        headings: &[String],
    ) -> &'a mut Section {
        let mut path = Vec::new();
        for (offset, label) in headings.iter().enumerate() {
            let level = settings.archive_heading_depth + offset;
            let scope = section_at(root, &path);
            match find_section_path(scope, &|s| s.token_level == level && s.text == *label) {
                Some(found) => path.extend(found),
                None => {
                    path.extend(attach_path(scope, level));
                    let parent = section_at_mut(root, &path);
                    path.push(parent.children.len());
                    add_section(
                        parent,
                        Section::new(label.clone(), level),
                        settings.add_newlines_around_headings,
                    );
                }
            }
        }
        section_at_mut(root, &path)
    }

    /// Path below `section` to the section a new heading at `level` appended at
    /// the end would nest under: the deepest one on the last-child spine with a
    /// lower level.
    fn attach_path(section: &Section, level: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = section;
        while let Some(last) = current.children.last() {
            if last.token_level >= level {
                break;
            }
            path.push(current.children.len() - 1);
            current = last;
        }
        path
    }

    /// Appends `section` as the last child of `parent`. With `newlines`, a blank
    /// line is added first unless whatever renders right above it is already
    /// blank. A heading with no body counts as non-blank.
    pub fn add_section(parent: &mut Section, section: Section, newlines: bool) -> &mut Section {
        if newlines {
            let above = parent.last_descendant_mut();
            let is_heading = above.token_level > 0;
            let content = &mut above.block_content;
            let ends_blank = match content.children.last() {
                Some(last) => last.is_blank(),
                None => !is_heading,
            };
            if !ends_blank {
                content.append_child(Block::blank());
            }
        }
        let index = parent.children.len();
        parent.append_child(section);
        &mut parent.children[index]
    }

    /// Merges `blocks` into `content` under a chain of list items labeled `chain`.
    pub fn insert_under_list_chain(
        content: &mut Block,
        blocks: Vec<Block>,
        chain: &[String],
        settings: &Settings,
    ) {
        trim_blank_edges(content);

        let mut target: &mut Block = content;
        for label in chain {
            let index = match target.children.iter().position(|child| {
                child.is_list() && patterns::list_item_content(&child.text) == Some(label.as_str())
            }) {
                Some(index) => index,
                None => {
                    target.append_child(Block::list(format!("- {label}")));
                    target.children.len() - 1
                }
            };
            target = &mut target.children[index];
        }

        match settings.sort_order {
            SortOrder::NewestFirst => {
                let older = std::mem::replace(&mut target.children, blocks);
                target.children.extend(older);
            }
            SortOrder::NewestLast => target.children.extend(blocks),
        }

        if settings.add_newlines_around_headings {
            content.children.insert(0, Block::blank());
            content.append_child(Block::blank());
        }
    }

    fn trim_blank_edges(content: &mut Block) {
        let keep_from = content
            .children
            .iter()
            .position(|b| !b.is_blank() || !b.children.is_empty())
            .unwrap_or(content.children.len());
        content.children.drain(..keep_from);
        while content
            .children
            .last()
            .is_some_and(|b| b.is_blank() && b.children.is_empty())
        {
            content.children.pop();
        }
    }

    /// Archives `blocks` into `root` at the destination named by the label chains.
    pub fn archive_blocks(
        root: &mut Section,
        headings: &[String],
        list_items: &[String],
        blocks: Vec<Block>,
        settings: &Settings,
    ) {
        let section = resolve_archive_section(root, settings, headings);
        insert_under_list_chain(&mut section.block_content, blocks, list_items, settings);
        section.stamp_blocks();
    }

    /// Moves a whole heading subtree under the archive destination, one level
    /// below it.
    pub fn archive_section(
        root: &mut Section,
        headings: &[String],
        mut section: Section,
        settings: &Settings,
    ) {
        let parent = resolve_archive_section(root, settings, headings);
        section.set_level(parent.token_level + 1);
        add_section(parent, section, settings.add_newlines_around_headings);
    }

    /// Applies the configured text replacement and metadata suffix to a task's own line.
    pub fn decorate_task(block: &mut Block, settings: &Settings, resolver: &Resolver<'_>) {
        let replacement = &settings.text_replacement;
        if replacement.apply_replacement && !replacement.regex.is_empty() {
            if let Some(pattern) = compile_guarded("textReplacement.regex", &replacement.regex) {
                block.text = pattern
                    .replace_all(&block.text, replacement.replacement.as_str())
                    .into_owned();
            }
        }

        let metadata = &settings.additional_metadata;
        if metadata.add_metadata {
            let suffix = resolver.resolve(&metadata.metadata, &metadata.date_format);
            block.text = format!("{} {suffix}", block.text.trim_end());
        }
    }

}

pub mod transforms {
    //! Structural rewrites that are not archiving: sibling sort and list-to-heading
    //! promotion. Both consume or mutate the tree they are given.

    use crate::core::{Block, Section};
    use crate::patterns;
    use crate::settings::Settings;

    /// Sorts the children of `block` into non-tasks, open tasks, then finished
    /// tasks, at every depth. Order within a group is kept unless
    /// `sortAlphabetically` is set, which orders the two task groups by text.
    pub fn sort_blocks(block: &mut Block, settings: &Settings) {
        let any_checked = settings.archive_all_checked_task_types;
        let mut other = Vec::new();
        let mut open = Vec::new();
        let mut done = Vec::new();
        for mut child in std::mem::take(&mut block.children) {
            sort_blocks(&mut child, settings);
            if !child.is_list() || !patterns::is_task(&child.text) {
                other.push(child);
            } else if patterns::is_completed_task(&child.text, any_checked) {
                done.push(child);
            } else {
                open.push(child);
            }
        }

        if settings.sort_alphabetically {
            for group in [&mut open, &mut done] {
                group.sort_by(|a, b| task_label(&a.text).cmp(task_label(&b.text)));
            }
        }

        block.children = other;
        block.children.extend(open);
        block.children.extend(done);
    }

    fn task_label(line: &str) -> &str {
        patterns::task_text(line).unwrap_or(line)
    }

    /// Promotes list items to headings. Items up to `max_depth` become sections at
    /// `base_level + depth`; deeper items stay as list content of the heading above.
    /// The returned root holds any leading non-list content.
    pub fn list_to_sections(list: Block, max_depth: usize, base_level: usize) -> Section {
        let mut root = Section::root();
        for child in list.children {
            place(&mut root, child, 1, max_depth, base_level);
        }
        root
    }

    fn place(parent: &mut Section, block: Block, depth: usize, max_depth: usize, base_level: usize) {
        if !block.is_list() || depth > max_depth {
            // Content that follows a promoted item renders after that item's subtree.
            parent
                .last_descendant_mut()
                .block_content
                .append_child(block);
            return;
        }

        let label = patterns::list_item_content(&block.text)
            .unwrap_or(&block.text)
            .to_string();
        let mut section = Section::new(label, base_level + depth);
        for child in block.children {
            place(&mut section, child, depth + 1, max_depth, base_level);
        }
        parent.append_child(section);
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::IndentationSettings;
        use crate::format::{stringify, stringify_block};
        use crate::parser::parse_blocks;

        fn sorted(lines: &[&str], settings: &Settings) -> Vec<String> {
            let tabs = IndentationSettings::tabs();
            let mut root = parse_blocks(lines, &tabs);
            sort_blocks(&mut root, settings);
            stringify_block(&root, &tabs)
        }

        #[test]
        fn groups_are_stable_at_every_depth() {
            let lines = [
                "- [x] done",
                "- text",
                "- [ ] open",
                "\t- [x] d2",
                "\tnote",
                "\t- [ ] o2",
                "- [x] done later",
                "- more text",
            ];
            assert_eq!(
                sorted(&lines, &Settings::default()),
                vec![
                    "- text",
                    "- more text",
                    "- [ ] open",
                    "\tnote",
                    "\t- [ ] o2",
                    "\t- [x] d2",
                    "- [x] done",
                    "- [x] done later",
                ]
            );
        }

        #[test]
        fn other_checked_statuses_follow_settings() {
            let lines = ["- [>] forwarded", "- [ ] open"];
            assert_eq!(
                sorted(&lines, &Settings::default()),
                vec!["- [>] forwarded", "- [ ] open"]
            );
            let settings = Settings {
                archive_all_checked_task_types: true,
                ..Settings::default()
            };
            assert_eq!(sorted(&lines, &settings), vec!["- [ ] open", "- [>] forwarded"]);
        }

        #[test]
        fn alphabetical_within_task_groups() {
            let settings = Settings {
                sort_alphabetically: true,
                ..Settings::default()
            };
            let lines = ["- zebra", "- [x] b", "- [ ] d", "- apple", "- [x] a", "- [ ] c"];
            assert_eq!(
                sorted(&lines, &settings),
                vec!["- zebra", "- apple", "- [ ] c", "- [ ] d", "- [x] a", "- [x] b"]
            );

            let any_checked = Settings {
                archive_all_checked_task_types: true,
                ..settings
            };
            let lines = ["- [✓] pear", "- [-] fig", "- [x] apple"];
            assert_eq!(
                sorted(&lines, &any_checked),
                vec!["- [x] apple", "- [-] fig", "- [✓] pear"]
            );
        }

        #[test]
        fn promotes_items_down_to_max_depth() {
            let tabs = IndentationSettings::tabs();
            let list = parse_blocks(
                &["- a", "\tnote", "\t- b", "\t\t- c", "\t\t\t- d", "- [ ] e"],
                &tabs,
            );
            let root = list_to_sections(list, 2, 1);
            assert_eq!(
                stringify(&root, &tabs),
                vec!["## a", "note", "### b", "- c", "\t- d", "## [ ] e"]
            );
        }

        #[test]
        fn content_after_promoted_child_stays_below_it() {
            let tabs = IndentationSettings::tabs();
            let list = parse_blocks(&["- a", "\t- b", "\ttext after"], &tabs);
            let root = list_to_sections(list, 2, 0);
            assert_eq!(stringify(&root, &tabs), vec!["# a", "## b", "text after"]);
        }
    }
}

pub mod editor {
    //! Line-number oracles a host editor would provide: the list, list item or
    //! heading range around a cursor line. Ranges are inclusive and 0-based.

    use crate::core::IndentationSettings;
    use crate::patterns;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LineRange {
        pub start: usize,
        pub end: usize,
    }

    impl LineRange {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn line_count(&self) -> usize {
            self.end + 1 - self.start
        }

        pub fn contains(&self, line: usize) -> bool {
            (self.start..=self.end).contains(&line)
        }
    }

    fn part_of_list(line: &str, indentation: &IndentationSettings) -> bool {
        patterns::is_list_item(line) || patterns::is_indented_continuation(line, indentation)
    }

    /// The whole list around `cursor`: contiguous list items and indented
    /// continuation lines, starting at a list item.
    pub fn find_list_range<S: AsRef<str>>(
        lines: &[S],
        cursor: usize,
        indentation: &IndentationSettings,
    ) -> Option<LineRange> {
        let line = |i: usize| lines[i].as_ref();
        if cursor >= lines.len() || !part_of_list(line(cursor), indentation) {
            return None;
        }

        let mut start = cursor;
        while start > 0 && part_of_list(line(start - 1), indentation) {
            start -= 1;
        }
        while start <= cursor && !patterns::is_list_item(line(start)) {
            start += 1;
        }
        if start > cursor {
            return None;
        }

        let mut end = cursor;
        while end + 1 < lines.len() && part_of_list(line(end + 1), indentation) {
            end += 1;
        }
        Some(LineRange::new(start, end))
    }

    /// The list item on the cursor line, or the one owning a continuation line,
    /// together with everything indented under it.
    pub fn find_list_item_range<S: AsRef<str>>(
        lines: &[S],
        cursor: usize,
        indentation: &IndentationSettings,
    ) -> Option<LineRange> {
        let list = find_list_range(lines, cursor, indentation)?;
        let line = |i: usize| lines[i].as_ref();
        let level = |i: usize| indentation.level_of(line(i));

        let owner = if patterns::is_list_item(line(cursor)) {
            cursor
        } else {
            let own = level(cursor);
            (list.start..cursor)
                .rev()
                .find(|&i| patterns::is_list_item(line(i)) && level(i) < own)?
        };

        let owner_level = level(owner);
        let mut end = owner;
        while end < list.end && level(end + 1) > owner_level {
            end += 1;
        }
        Some(LineRange::new(owner, end))
    }

    /// The heading at or above `cursor` and its body, up to the next heading of
    /// the same or a higher level.
    pub fn find_heading_range<S: AsRef<str>>(lines: &[S], cursor: usize) -> Option<LineRange> {
        if cursor >= lines.len() {
            return None;
        }
        let (start, level) = (0..=cursor)
            .rev()
            .find_map(|i| patterns::heading_level(lines[i].as_ref()).map(|level| (i, level)))?;
        let end = (start + 1..lines.len())
            .find(|&i| patterns::heading_level(lines[i].as_ref()).is_some_and(|l| l <= level))
            .map_or(lines.len() - 1, |next| next - 1);
        Some(LineRange::new(start, end))
    }

    /// Level of the closest heading at or above `line`; 0 when there is none.
    pub fn nearest_heading_level<S: AsRef<str>>(lines: &[S], line: usize) -> usize {
        lines
            .iter()
            .take(line.saturating_add(1))
            .rev()
            .find_map(|l| patterns::heading_level(l.as_ref()))
            .unwrap_or(0)
    }

    pub fn replace_range(lines: &[String], range: LineRange, replacement: Vec<String>) -> Vec<String> {
        let start = range.start.min(lines.len());
        let mut out = Vec::with_capacity(lines.len() + replacement.len());
        out.extend_from_slice(&lines[..start]);
        out.extend(replacement);
        out.extend_from_slice(lines.get(range.end + 1..).unwrap_or_default());
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const DOC: [&str; 10] = [
            "# Tasks",
            "intro",
            "- a",
            "\tmore on a",
            "\t- b",
            "\t\t- c",
            "\t- d",
            "",
            "## Sub",
            "- e",
        ];

        #[test]
        fn list_range_spans_items_and_continuations() {
            let tabs = IndentationSettings::tabs();
            assert_eq!(find_list_range(&DOC, 5, &tabs), Some(LineRange::new(2, 6)));
            assert_eq!(find_list_range(&DOC, 3, &tabs), Some(LineRange::new(2, 6)));
            assert_eq!(find_list_range(&DOC, 1, &tabs), None);
            assert_eq!(find_list_range(&DOC, 7, &tabs), None);
            assert_eq!(find_list_range(&DOC, 9, &tabs), Some(LineRange::new(9, 9)));
            assert_eq!(find_list_range(&DOC, 42, &tabs), None);
        }

        #[test]
        fn list_item_range_finds_owner() {
            let tabs = IndentationSettings::tabs();
            assert_eq!(find_list_item_range(&DOC, 4, &tabs), Some(LineRange::new(4, 5)));
            assert_eq!(find_list_item_range(&DOC, 3, &tabs), Some(LineRange::new(2, 6)));
            assert_eq!(find_list_item_range(&DOC, 6, &tabs), Some(LineRange::new(6, 6)));
        }

        #[test]
        fn heading_range_stops_at_same_or_higher_level() {
            assert_eq!(find_heading_range(&DOC, 4), Some(LineRange::new(0, 9)));
            assert_eq!(find_heading_range(&DOC, 9), Some(LineRange::new(8, 9)));
            assert_eq!(find_heading_range(&["text", "# A"], 0), None);
            assert_eq!(find_heading_range(&["# A", "x", "# B"], 1), Some(LineRange::new(0, 1)));
        }

        #[test]
        fn nearest_heading_defaults_to_zero() {
            assert_eq!(nearest_heading_level(&DOC, 5), 1);
            assert_eq!(nearest_heading_level(&DOC, 9), 2);
            assert_eq!(nearest_heading_level(&["- a"], 0), 0);
        }

        #[test]
        fn replaces_inclusive_range() {
            let lines: Vec<String> = ["a", "b", "c", "d"].map(String::from).to_vec();
            let out = replace_range(&lines, LineRange::new(1, 2), vec!["x".into()]);
            assert_eq!(out, vec!["a", "x", "d"]);
            assert_eq!(LineRange::new(1, 2).line_count(), 2);
        }
    }
}

pub mod storage {
    //! Document access. Paths are relative to the store; documents are UTF-8 text
    //! split on `\n`, so a trailing newline shows up as a final empty line.

    use crate::core::ArchiveError;
    use anyhow::{Context, Result};
    use indexmap::IndexMap;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub trait DocumentStore {
        /// `Ok(None)` when the document does not exist yet.
        fn read_lines(&self, path: &Path) -> Result<Option<Vec<String>>>;

        /// Creates the document (and missing parent folders) if needed.
        fn write_lines(&mut self, path: &Path, lines: &[String]) -> Result<()>;
    }

    fn ensure_markdown(path: &Path) -> Result<(), ArchiveError> {
        if path.extension().is_some_and(|ext| ext == "md") {
            Ok(())
        } else {
            Err(ArchiveError::NotADocument(path.to_path_buf()))
        }
    }

    pub fn split_lines(text: &str) -> Vec<String> {
        text.split('\n').map(String::from).collect()
    }

    /// Markdown files under a root directory.
    #[derive(Debug, Clone)]
    pub struct FsDocumentStore {
        pub root: PathBuf,
    }

    impl FsDocumentStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        fn locate(&self, path: &Path) -> Result<PathBuf> {
            ensure_markdown(path)?;
            let abs = self.root.join(path);
            if abs.is_dir() {
                return Err(ArchiveError::NotADocument(path.to_path_buf()).into());
            }
            Ok(abs)
        }
    }

    impl DocumentStore for FsDocumentStore {
        fn read_lines(&self, path: &Path) -> Result<Option<Vec<String>>> {
            let abs = self.locate(path)?;
            if !abs.exists() {
                return Ok(None);
            }
            let text = fs::read_to_string(&abs).with_context(|| format!("reading {:?}", abs))?;
            Ok(Some(split_lines(&text)))
        }

        fn write_lines(&mut self, path: &Path, lines: &[String]) -> Result<()> {
            let abs = self.locate(path)?;
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {:?}", parent))?;
            }
            fs::write(&abs, lines.join("\n")).with_context(|| format!("writing {:?}", abs))
        }
    }

    /// In-memory documents keyed by path, in insertion order.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryDocumentStore {
        pub documents: IndexMap<PathBuf, Vec<String>>,
    }

    impl MemoryDocumentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_document<S: Into<String>>(
            mut self,
            path: impl Into<PathBuf>,
            lines: impl IntoIterator<Item = S>,
        ) -> Self {
            self.documents
                .insert(path.into(), lines.into_iter().map(Into::into).collect());
            self
        }

        pub fn get(&self, path: impl AsRef<Path>) -> Option<&[String]> {
            self.documents.get(path.as_ref()).map(Vec::as_slice)
        }
    }

    impl DocumentStore for MemoryDocumentStore {
        fn read_lines(&self, path: &Path) -> Result<Option<Vec<String>>> {
            ensure_markdown(path)?;
            Ok(self.documents.get(path).cloned())
        }

        fn write_lines(&mut self, path: &Path, lines: &[String]) -> Result<()> {
            ensure_markdown(path)?;
            self.documents.insert(path.to_path_buf(), lines.to_vec());
            Ok(())
        }
    }

}

pub mod commands {
    //! User-facing commands. Each one reads the active document once, transforms
    //! the tree, writes any separate archive files, then writes the active
    //! document, and reports a one-line summary.

    use crate::archive;
    use crate::core::{ArchiveError, Block, Section, SectionId, block_at_mut, section_at, section_at_mut};
    use crate::dates::{ChronoFormatter, Clock, DateFormatter, SystemClock};
    use crate::editor;
    use crate::format::{LineOwner, format_lines, line_owner, stringify, stringify_block};
    use crate::parser::{parse_blocks, parse_document};
    use crate::patterns;
    use crate::placeholders::{PlaceholderContext, Resolver};
    use crate::settings::Settings;
    use crate::storage::DocumentStore;
    use crate::tasks::{self, ExtractionDepth, TaskFilter};
    use crate::transforms;
    use anyhow::{Context, Result};
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CommandOutcome {
        pub message: String,
        /// Whether anything was written.
        pub changed: bool,
    }

    impl CommandOutcome {
        fn changed(message: impl Into<String>) -> Self {
            Self {
                message: message.into(),
                changed: true,
            }
        }

        fn unchanged(message: impl Into<String>) -> Self {
            Self {
                message: message.into(),
                changed: false,
            }
        }
    }

    fn count(n: usize, noun: &str) -> String {
        if n == 1 {
            format!("1 {noun}")
        } else {
            format!("{n} {noun}s")
        }
    }

    /* ------------------------------- Batches ------------------------------- */

    /// Archived content bound for one document, keyed by heading chain and
    /// list item chain.
    #[derive(Debug, Default)]
    struct Batch {
        blocks: IndexMap<(Vec<String>, Vec<String>), Vec<Block>>,
        sections: Vec<(Vec<String>, Section)>,
    }

    impl Batch {
        fn apply(self, root: &mut Section, settings: &Settings) {
            for ((headings, list_items), blocks) in self.blocks {
                archive::archive_blocks(root, &headings, &list_items, blocks, settings);
            }
            for (headings, section) in self.sections {
                archive::archive_section(root, &headings, section, settings);
            }
            root.stamp_blocks();
        }
    }

    /// `None` stands for the active document.
    type Batches = IndexMap<Option<PathBuf>, Batch>;

    /* ------------------------------- Archiver ------------------------------- */

    pub struct Archiver {
        pub settings: Settings,
        clock: Box<dyn Clock>,
        dates: Box<dyn DateFormatter>,
    }

    impl Archiver {
        pub fn new(settings: Settings) -> Self {
            Self {
                settings,
                clock: Box::new(SystemClock),
                dates: Box::new(ChronoFormatter),
            }
        }

        pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
            self.clock = Box::new(clock);
            self
        }

        pub fn with_date_formatter(mut self, dates: impl DateFormatter + 'static) -> Self {
            self.dates = Box::new(dates);
            self
        }

        /* ---------------------------- Commands ---------------------------- */

        pub fn archive_tasks(
            &self,
            store: &mut dyn DocumentStore,
            path: &Path,
            depth: ExtractionDepth,
        ) -> Result<CommandOutcome> {
            let mut root = self.load(store, path)?;
            let extracted = self.extract_tasks(&mut root, depth);
            if extracted.is_empty() {
                return Ok(CommandOutcome::unchanged("No tasks to archive"));
            }
            let archived = extracted.len();
            tracing::debug!(archived, ?path, ?depth, "extracted tasks");

            let mut batches = Batches::new();
            for block in extracted {
                self.enqueue_block(&mut batches, &root, block, path, true);
            }
            self.deliver(store, &mut root, batches)?;
            self.save(store, path, &root)?;
            Ok(CommandOutcome::changed(format!("Archived {}", count(archived, "task"))))
        }

        pub fn delete_tasks(
            &self,
            store: &mut dyn DocumentStore,
            path: &Path,
            depth: ExtractionDepth,
        ) -> Result<CommandOutcome> {
            let mut root = self.load(store, path)?;
            let deleted = self.extract_tasks(&mut root, depth).len();
            if deleted == 0 {
                return Ok(CommandOutcome::unchanged("No tasks to delete"));
            }
            tracing::debug!(deleted, ?path, "deleted tasks");
            self.save(store, path, &root)?;
            Ok(CommandOutcome::changed(format!("Deleted {}", count(deleted, "task"))))
        }

        /// Moves the heading around `line` (0-based), with its subtree, under the
        /// archive destination.
        pub fn archive_heading_under_cursor(
            &self,
            store: &mut dyn DocumentStore,
            path: &Path,
            line: usize,
        ) -> Result<CommandOutcome> {
            const NONE: &str = "No heading under cursor";
            let lines = self.read(store, path)?;
            let Some(range) = editor::find_heading_range(&lines, line) else {
                return Ok(CommandOutcome::unchanged(NONE));
            };
            let mut root = self.parse(&lines);
            let Some(LineOwner::Heading { section: section_path }) = line_owner(&root, range.start)
            else {
                return Ok(CommandOutcome::unchanged(NONE));
            };
            if self.inside_archive(&root, &section_path) {
                tracing::debug!(line, "heading is already archived");
                return Ok(CommandOutcome::unchanged(NONE));
            }

            let section_id = section_at(&root, &section_path).id;
            let context = self.context(&root, Some(section_id), "", path);
            let Some(section) = detach_section(&mut root, &section_path) else {
                return Ok(CommandOutcome::unchanged(NONE));
            };

            let resolver = self.resolver(&context);
            let destination = self.destination(&resolver, None, path);
            let headings = self.heading_labels(&resolver);
            let mut batches = Batches::new();
            batches
                .entry(destination)
                .or_default()
                .sections
                .push((headings, section));

            self.deliver(store, &mut root, batches)?;
            self.save(store, path, &root)?;
            Ok(CommandOutcome::changed("Archived heading"))
        }

        /// Moves the list item on (or owning) `line`, with its subtree, into the
        /// archive destination.
        pub fn archive_list_item_under_cursor(
            &self,
            store: &mut dyn DocumentStore,
            path: &Path,
            line: usize,
        ) -> Result<CommandOutcome> {
            const NONE: &str = "No list item under cursor";
            let lines = self.read(store, path)?;
            let indentation = self.settings.indentation;
            let Some(range) = editor::find_list_item_range(&lines, line, &indentation) else {
                return Ok(CommandOutcome::unchanged(NONE));
            };
            let mut root = self.parse(&lines);
            let Some(LineOwner::Block {
                section: section_path,
                block: block_path,
            }) = line_owner(&root, range.start)
            else {
                return Ok(CommandOutcome::unchanged(NONE));
            };
            if self.inside_archive(&root, &section_path) {
                tracing::debug!(line, "list item is already archived");
                return Ok(CommandOutcome::unchanged(NONE));
            }
            let Some(block) = detach_list_item(&mut root, &section_path, &block_path) else {
                return Ok(CommandOutcome::unchanged(NONE));
            };

            let mut batches = Batches::new();
            self.enqueue_block(&mut batches, &root, block, path, false);
            self.deliver(store, &mut root, batches)?;
            self.save(store, path, &root)?;
            Ok(CommandOutcome::changed("Archived list item"))
        }

        pub fn sort_list_under_cursor(
            &self,
            store: &mut dyn DocumentStore,
            path: &Path,
            line: usize,
        ) -> Result<CommandOutcome> {
            let lines = self.read(store, path)?;
            let indentation = self.settings.indentation;
            let Some(range) = editor::find_list_range(&lines, line, &indentation) else {
                return Ok(CommandOutcome::unchanged("No list under cursor"));
            };

            let mut list = parse_blocks(&lines[range.start..=range.end], &indentation);
            transforms::sort_blocks(&mut list, &self.settings);
            let updated = editor::replace_range(&lines, range, stringify_block(&list, &indentation));
            self.write_if_changed(store, path, &lines, updated, "Sorted list")
        }

        /// Turns the list around `line` into headings, down to the depth of the
        /// item under the cursor.
        pub fn list_to_headings(
            &self,
            store: &mut dyn DocumentStore,
            path: &Path,
            line: usize,
        ) -> Result<CommandOutcome> {
            let lines = self.read(store, path)?;
            let indentation = self.settings.indentation;
            let Some(range) = editor::find_list_range(&lines, line, &indentation) else {
                return Ok(CommandOutcome::unchanged("No list under cursor"));
            };

            let item_line = editor::find_list_item_range(&lines, line, &indentation)
                .map(|item| item.start)
                .filter(|&start| range.contains(start))
                .unwrap_or(range.start);
            let max_depth = 1 + indentation
                .level_of(&lines[item_line])
                .saturating_sub(indentation.level_of(&lines[range.start]));
            let base_level = editor::nearest_heading_level(&lines, range.start);
            tracing::debug!(?range, max_depth, base_level, "promoting list");

            let list = parse_blocks(&lines[range.start..=range.end], &indentation);
            let sections = transforms::list_to_sections(list, max_depth, base_level);
            let updated = editor::replace_range(&lines, range, stringify(&sections, &indentation));
            self.write_if_changed(store, path, &lines, updated, "Turned list into headings")
        }

        /// Parse and print back; only misaligned indentation changes.
        pub fn format(&self, store: &mut dyn DocumentStore, path: &Path) -> Result<CommandOutcome> {
            let lines = self.read(store, path)?;
            let formatted = format_lines(&lines, &self.settings.indentation);
            if formatted == lines {
                return Ok(CommandOutcome::unchanged("Already formatted"));
            }
            store
                .write_lines(path, &formatted)
                .with_context(|| format!("writing {:?}", path))?;
            Ok(CommandOutcome::changed("Formatted document"))
        }

        /* ----------------------------- Internals ----------------------------- */

        fn read(&self, store: &dyn DocumentStore, path: &Path) -> Result<Vec<String>> {
            store
                .read_lines(path)
                .with_context(|| format!("reading {:?}", path))?
                .ok_or_else(|| ArchiveError::MissingDocument(path.to_path_buf()).into())
        }

        fn parse(&self, lines: &[String]) -> Section {
            parse_document(lines, &self.settings.indentation)
        }

        fn load(&self, store: &dyn DocumentStore, path: &Path) -> Result<Section> {
            Ok(self.parse(&self.read(store, path)?))
        }

        fn save(&self, store: &mut dyn DocumentStore, path: &Path, root: &Section) -> Result<()> {
            let lines = stringify(root, &self.settings.indentation);
            store
                .write_lines(path, &lines)
                .with_context(|| format!("writing {:?}", path))
        }

        fn write_if_changed(
            &self,
            store: &mut dyn DocumentStore,
            path: &Path,
            before: &[String],
            after: Vec<String>,
            message: &str,
        ) -> Result<CommandOutcome> {
            if after == before {
                return Ok(CommandOutcome::unchanged(message));
            }
            store
                .write_lines(path, &after)
                .with_context(|| format!("writing {:?}", path))?;
            Ok(CommandOutcome::changed(message))
        }

        fn extract_tasks(&self, root: &mut Section, depth: ExtractionDepth) -> Vec<Block> {
            let filter = TaskFilter::from_settings(&self.settings);
            let archived = self.settings.archive_section_patterns();
            tasks::extract_blocks(root, depth, &|block| filter.matches(block), &|section| {
                !archived.iter().any(|pattern| pattern.is_match(&section.text))
            })
        }

        fn inside_archive(&self, root: &Section, section_path: &[usize]) -> bool {
            let archived = self.settings.archive_section_patterns();
            (1..=section_path.len()).any(|end| {
                let text = &section_at(root, &section_path[..end]).text;
                archived.iter().any(|pattern| pattern.is_match(text))
            })
        }

        fn context(
            &self,
            root: &Section,
            section: Option<SectionId>,
            line: &str,
            source: &Path,
        ) -> PlaceholderContext {
            let completed_date = tasks::completion_date(line, &self.settings);
            let date = completed_date
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .unwrap_or_else(|| self.clock.now());
            PlaceholderContext {
                date,
                source_file_name: source
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                source_file_path: source.to_string_lossy().into_owned(),
                heading_chain: section
                    .and_then(|id| root.heading_chain(id))
                    .unwrap_or_default(),
                completed_date,
            }
        }

        fn resolver<'a>(&'a self, context: &'a PlaceholderContext) -> Resolver<'a> {
            Resolver {
                context,
                dates: self.dates.as_ref(),
                completed_date_format: &self.settings.task_completion_date_format,
            }
        }

        /// Separate archive file for a task, when its routing rule asks for one.
        fn destination(
            &self,
            resolver: &Resolver<'_>,
            status: Option<char>,
            source: &Path,
        ) -> Option<PathBuf> {
            let route = self
                .settings
                .route_for(status, &source.to_string_lossy());
            if !route.archive_to_separate_file {
                return None;
            }
            let name = resolver.resolve(route.file_name, route.date_format);
            let destination = PathBuf::from(format!("{name}.md"));
            (destination != source).then_some(destination)
        }

        fn heading_labels(&self, resolver: &Resolver<'_>) -> Vec<String> {
            self.settings
                .headings
                .iter()
                .map(|heading| resolver.resolve(&heading.text, &heading.date_format))
                .collect()
        }

        /// Date tree levels (week, then day) followed by the configured list items.
        fn list_labels(&self, resolver: &Resolver<'_>) -> Vec<String> {
            let tree = &self.settings.date_tree;
            let date = resolver.context.date;
            let mut labels = Vec::new();
            if tree.use_weeks {
                labels.push(format!("[[{}]]", self.dates.format(date, &tree.weekly_note_format)));
            }
            if tree.use_days {
                labels.push(format!("[[{}]]", self.dates.format(date, &tree.daily_note_format)));
            }
            labels.extend(
                self.settings
                    .list_items
                    .iter()
                    .map(|item| resolver.resolve(&item.text, &item.date_format)),
            );
            labels
        }

        fn enqueue_block(
            &self,
            batches: &mut Batches,
            root: &Section,
            mut block: Block,
            source: &Path,
            decorate: bool,
        ) {
            let context = self.context(root, block.section, &block.text, source);
            let resolver = self.resolver(&context);
            let destination =
                self.destination(&resolver, patterns::task_status(&block.text), source);
            let key = (self.heading_labels(&resolver), self.list_labels(&resolver));
            if decorate {
                archive::decorate_task(&mut block, &self.settings, &resolver);
            }
            batches
                .entry(destination)
                .or_default()
                .blocks
                .entry(key)
                .or_default()
                .push(block);
        }

        /// Applies every batch. Separate files are all rendered before any is
        /// written, and all of them are written before the caller saves the
        /// active document.
        fn deliver(
            &self,
            store: &mut dyn DocumentStore,
            root: &mut Section,
            batches: Batches,
        ) -> Result<()> {
            let mut pending = Vec::new();
            for (destination, batch) in batches {
                let Some(destination) = destination else {
                    batch.apply(root, &self.settings);
                    continue;
                };
                let lines = store
                    .read_lines(&destination)
                    .with_context(|| format!("reading archive {:?}", destination))?
                    .unwrap_or_default();
                let mut archive_root = self.parse(&lines);
                batch.apply(&mut archive_root, &self.settings);
                pending.push((destination, stringify(&archive_root, &self.settings.indentation)));
            }
            for (destination, lines) in pending {
                tracing::debug!(?destination, "writing archive file");
                store
                    .write_lines(&destination, &lines)
                    .with_context(|| format!("writing archive {:?}", destination))?;
            }
            Ok(())
        }
    }

    fn detach_section(root: &mut Section, path: &[usize]) -> Option<Section> {
        let (&index, parent_path) = path.split_last()?;
        let parent = section_at_mut(root, parent_path);
        (index < parent.children.len()).then(|| parent.children.remove(index))
    }

    fn detach_list_item(
        root: &mut Section,
        section_path: &[usize],
        block_path: &[usize],
    ) -> Option<Block> {
        let (&index, parent_path) = block_path.split_last()?;
        let section = section_at_mut(root, section_path);
        let parent = block_at_mut(&mut section.block_content, parent_path);
        let is_list = parent.children.get(index).is_some_and(Block::is_list);
        is_list.then(|| parent.children.remove(index))
    }

}

pub use commands::{Archiver, CommandOutcome};
pub use crate::core::{Block, BlockKind, IndentationSettings, Section};
pub use format::{format_lines, stringify};
pub use parser::parse_document;
pub use settings::Settings;
pub use tasks::ExtractionDepth;
