use std::io::{self, Write};

use super::{escape_bytes, TreeView, Visitable, Visitor};
use crate::{FingerprintBucket, Header, InnerNodeRef, LeafBucket, LeafNode, NodePtr, Tree};

/// Settings which customize the output of the [`DotPrinter`] visitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DotPrinterSettings {
    /// Add pool offsets to the node labels.
    pub display_node_address: bool,
    /// Add the value of each leaf to its label.
    pub display_values: bool,
}

/// A visitor of the radix trie that will print the tree in "dot" notation.
///
/// See ['DOT Language | Graphviz'](https://graphviz.org/doc/info/lang.html) for
/// information about syntax and example of the language.
pub struct DotPrinter<O: Write> {
    output: O,
    next_id: usize,
    settings: DotPrinterSettings,
}

impl<O: Write> DotPrinter<O> {
    /// Write the dot-format of the given tree to the given output.
    pub fn print_tree(output: O, tree: &Tree, settings: DotPrinterSettings) -> io::Result<()> {
        let mut visitor = DotPrinter {
            output,
            next_id: 0,
            settings,
        };

        visitor.output_prelude()?;
        tree.with_view(|view, root| root.visit_with(view, &mut visitor))?;
        visitor.output_epilogue()
    }

    fn output_prelude(&mut self) -> io::Result<()> {
        writeln!(self.output, "strict digraph G {{")?;
        writeln!(self.output, "node [shape=record]")
    }

    fn output_epilogue(&mut self) -> io::Result<()> {
        writeln!(self.output, "}}")
    }

    fn get_id(&mut self) -> usize {
        let new_id = self.next_id;
        self.next_id += 1;
        new_id
    }

    fn address(&self, offset: u64) -> String {
        if self.settings.display_node_address {
            format!(" | {offset:#x}")
        } else {
            String::new()
        }
    }

    /// Write a node with one record field per outgoing edge, then the edges.
    fn write_node(
        &mut self,
        view: TreeView<'_>,
        title: &str,
        header: &Header,
        edges: Vec<(String, crate::OpaqueNodePtr)>,
    ) -> io::Result<usize> {
        let node_id = self.get_id();
        let prefix = header.prefix();
        let address = self.address(view.offset_of(header));

        write!(self.output, "n{node_id} ")?;
        write!(self.output, "[label=\"{{")?;
        // header line
        write!(
            self.output,
            "{{<h0> {title} | level {} | {} \\\"{}\\\"{address}}} | {{",
            header.level(),
            prefix.count(),
            escape_label(prefix.stored()),
        )?;
        // child line
        for (idx, (label, _)) in edges.iter().enumerate() {
            if idx == 0 {
                write!(self.output, "<c{idx}> {label}")?;
            } else {
                write!(self.output, "| <c{idx}> {label}")?;
            }
        }
        writeln!(self.output, "}}}}\"]")?;

        for (idx, (_, child)) in edges.into_iter().enumerate() {
            let child_id = child.visit_with(view, self)?;
            writeln!(self.output, "n{node_id}:c{idx} -> n{child_id}:h0")?;
        }

        Ok(node_id)
    }
}

/// Escape bytes for use inside a quoted record label.
fn escape_label(bytes: &[u8]) -> String {
    let mut out = String::new();
    for c in escape_bytes(bytes).chars() {
        if matches!(c, '"' | '{' | '}' | '|' | '<' | '>' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl<O: Write> Visitor for DotPrinter<O> {
    type Output = io::Result<usize>;

    fn default_output(&self) -> Self::Output {
        unimplemented!("this visitor should never use the default output")
    }

    fn combine_output(&self, _: Self::Output, _: Self::Output) -> Self::Output {
        unimplemented!("this visitor should never combine outputs")
    }

    fn visit_inner(&mut self, view: TreeView<'_>, t: InnerNodeRef<'_>) -> Self::Output {
        let edges = t
            .children()
            .into_iter()
            .map(|(key_fragment, child)| (key_fragment.to_string(), child))
            .collect();
        self.write_node(view, &format!("{:?}", t.node_type()), t.header(), edges)
    }

    fn visit_leaf_bucket(&mut self, view: TreeView<'_>, t: &LeafBucket) -> Self::Output {
        let edges = t
            .leaves()
            .map(|(slot, leaf)| (slot.to_string(), leaf.to_opaque()))
            .collect();
        self.write_node(view, "LeafBucket", &t.header, edges)
    }

    fn visit_fingerprint_bucket(
        &mut self,
        view: TreeView<'_>,
        t: &FingerprintBucket,
    ) -> Self::Output {
        let edges = t
            .sorted(view.pool, view.guard)
            .into_iter()
            .map(|slice| (escape_label(slice.bytes), slice.child))
            .collect();
        self.write_node(view, "FingerprintBucket", &t.header, edges)
    }

    fn visit_leaf(&mut self, view: TreeView<'_>, t: NodePtr<LeafNode>) -> Self::Output {
        let node_id = self.get_id();
        let address = self.address(t.offset());
        write!(self.output, "n{node_id} ")?;
        write!(self.output, "[label=\"{{")?;
        write!(
            self.output,
            "<h0> Leaf | \\\"{}\\\"{address}",
            escape_label(t.key(view.pool, view.guard))
        )?;
        if self.settings.display_values {
            write!(
                self.output,
                " | \\\"{}\\\"",
                escape_label(t.value(view.pool, view.guard))
            )?;
        }
        writeln!(self.output, "}}\"]")?;

        Ok(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Key, LeafLayout, TreeConfig};

    fn print(tree: &Tree, settings: DotPrinterSettings) -> String {
        let mut buffer = Vec::new();
        DotPrinter::print_tree(&mut buffer, tree, settings).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn simple_tree_output_to_dot() {
        let tree = Tree::volatile(TreeConfig::default(), 1 << 22).unwrap();
        for key in ["apple", "app", "apricot"] {
            let _ = tree.insert(&Key::from((key, "x"))).unwrap();
        }

        let dot = print(&tree, DotPrinterSettings::default());
        assert!(dot.starts_with("strict digraph G {\nnode [shape=record]\n"));
        assert!(dot.ends_with("}\n"));
        assert!(dot.contains("Node256"));
        assert!(dot.contains("LeafBucket"));
        assert!(dot.contains("<h0> Leaf | \\\"apricot\\\""));
        assert!(!dot.contains("0x"));
    }

    #[test]
    fn direct_layout_with_addresses_and_values() {
        let config = TreeConfig {
            leaf_layout: LeafLayout::Direct,
            ..TreeConfig::default()
        };
        let tree = Tree::volatile(config, 1 << 22).unwrap();
        let _ = tree.insert(&Key::from(("a|b", "{v}"))).unwrap();
        let _ = tree.insert(&Key::from(("a|c", "w"))).unwrap();

        let dot = print(
            &tree,
            DotPrinterSettings {
                display_node_address: true,
                display_values: true,
            },
        );
        assert!(dot.contains("Node4"));
        assert!(dot.contains("a\\|b"));
        assert!(dot.contains("\\{v\\}"));
        assert!(dot.contains(" | 0x"));
        assert!(!dot.contains("LeafBucket"));
    }
}
