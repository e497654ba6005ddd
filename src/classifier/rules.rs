use crate::page::{Document, NodeId, NodeKind};

/// Tags allowed anywhere below a formatted candidate.
pub const INLINE_TAGS: &[&str] = &[
    "B", "STRONG", "I", "EM", "U", "SPAN", "MARK", "SMALL", "SUB", "SUP", "S", "DEL", "CODE",
    "KBD", "SAMP", "ABBR", "CITE", "DFN", "VAR", "BR",
];

pub const MIN_ALPHABETIC_CHARS: usize = 50;

/// Marker attribute carried by every element the extension injects.
pub const EXTENSION_UI_ATTRIBUTE: &str = "data-simplify-ui";
const EXTENSION_UI_IDS: &[&str] = &["esm-popup"];
const EXTENSION_UI_CLASSES: &[&str] = &["experience-sampling-popup", "gutter-popup"];

/// Element kinds that can become paragraphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Paragraph,
    ListItem,
    TableCell,
    FigureCaption,
    BlockContainer,
}

impl TagKind {
    pub const ALL: [TagKind; 5] = [
        TagKind::Paragraph,
        TagKind::FigureCaption,
        TagKind::ListItem,
        TagKind::TableCell,
        TagKind::BlockContainer,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "P" => Some(TagKind::Paragraph),
            "LI" => Some(TagKind::ListItem),
            "TD" => Some(TagKind::TableCell),
            "FIGCAPTION" => Some(TagKind::FigureCaption),
            "DIV" => Some(TagKind::BlockContainer),
            _ => None,
        }
    }

    /// Kinds with separate plain and formatted rules. The others accept any
    /// inline-only content, including none.
    pub fn has_plain_variant(&self) -> bool {
        matches!(self, TagKind::Paragraph | TagKind::BlockContainer)
    }
}

/// Which rule let an element through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Plain,
    Formatted,
}

pub fn is_inline_tag(tag: &str) -> bool {
    INLINE_TAGS.contains(&tag)
}

/// True when every node below `node` is text or an allow-listed element.
pub fn all_children_inline(doc: &Document, node: NodeId) -> bool {
    doc.child_nodes(node).iter().all(|&child| match doc.kind(child) {
        NodeKind::Element(data) => is_inline_tag(data.tag()) && all_children_inline(doc, child),
        NodeKind::Text(_) => true,
        _ => false,
    })
}

/// Letters `A-Z`, `a-z` and the Latin-1 block `U+00C0..=U+00FF`.
pub fn count_alphabetic(text: &str) -> usize {
    text.chars()
        .filter(|c| c.is_ascii_alphabetic() || ('\u{00C0}'..='\u{00FF}').contains(c))
        .count()
}

pub fn is_inside_extension_ui(doc: &Document, node: NodeId) -> bool {
    doc.closest(node, |d, n| {
        d.attribute(n, EXTENSION_UI_ATTRIBUTE) == Some("1")
            || d
                .attribute(n, "id")
                .map(|id| EXTENSION_UI_IDS.contains(&id))
                .unwrap_or(false)
            || EXTENSION_UI_CLASSES.iter().any(|class| d.has_class(n, class))
    })
    .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_latin1_letters() {
        assert_eq!(count_alphabetic("Grüße, 42!"), 5);
        assert_eq!(count_alphabetic("ÀÿÉ"), 3);
        assert_eq!(count_alphabetic("Ωπ 123"), 0);
    }

    #[test]
    fn nested_inline_is_accepted_but_comments_are_not() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        let b = doc.append_element(p, "b");
        let i = doc.append_element(b, "i");
        doc.append_text(i, "deep");
        assert!(all_children_inline(&doc, p));

        let comment = doc.create_comment("x");
        doc.append_child(b, comment);
        assert!(!all_children_inline(&doc, p));
    }

    #[test]
    fn link_below_span_is_rejected() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        let span = doc.append_element(p, "span");
        doc.append_element(span, "a");
        assert!(!all_children_inline(&doc, p));
    }

    #[test]
    fn extension_ui_markers() {
        let mut doc = Document::new();
        let gutter = doc.append_element(doc.body(), "div");
        doc.add_class(gutter, "gutter-popup");
        let inner = doc.append_element(gutter, "p");
        assert!(is_inside_extension_ui(&doc, inner));

        let marked = doc.append_element(doc.body(), "section");
        doc.set_attribute(marked, EXTENSION_UI_ATTRIBUTE, "1");
        let child = doc.append_element(marked, "p");
        assert!(is_inside_extension_ui(&doc, child));

        let plain = doc.append_element(doc.body(), "p");
        assert!(!is_inside_extension_ui(&doc, plain));
    }
}
