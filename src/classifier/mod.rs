//! Decides which page elements are readable paragraphs worth simplifying.

pub mod rules;
pub mod watcher;

use std::collections::HashSet;

use crate::page::{Document, NodeId};

pub use rules::{TagKind, Variant, MIN_ALPHABETIC_CHARS};
pub use watcher::{ClaimedElement, MutationWatcher};

// Classification runs for every inserted node; keep it quiet by default.
const ENABLE_LOGS: bool = false;

use crate::log_info;

/// How far a classification call commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Evaluate only. Used while scanning for candidates.
    Probe,
    /// The element is visible and about to be processed: on acceptance it
    /// is marked visited so every later call rejects it.
    Claim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    ExtensionUi,
    AlreadyVisited,
    UnsupportedTag,
    NonInlineContent,
    TooFewLetters(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted { kind: TagKind, variant: Variant },
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

/// Per-page classifier state. One instance per content session; the visited
/// set is what guarantees an element is enqueued at most once.
#[derive(Debug, Default)]
pub struct Classifier {
    visited: HashSet<NodeId>,
    include_block_containers: bool,
}

impl Classifier {
    pub fn new(include_block_containers: bool) -> Self {
        Self {
            visited: HashSet::new(),
            include_block_containers,
        }
    }

    pub fn classify(&mut self, doc: &Document, node: NodeId, mode: Mode) -> Verdict {
        let verdict = self.evaluate(doc, node);
        if verdict.is_accepted() && mode == Mode::Claim {
            self.visited.insert(node);
            log_info!("claimed paragraph candidate {:?}", node);
        }
        verdict
    }

    pub fn accepts(&mut self, doc: &Document, node: NodeId, mode: Mode) -> bool {
        self.classify(doc, node, mode).is_accepted()
    }

    pub fn is_visited(&self, node: NodeId) -> bool {
        self.visited.contains(&node)
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    /// Forgets every visited element, used when the page is torn down.
    pub fn reset(&mut self) {
        self.visited.clear();
    }

    /// Probes every recognised element below `root` (grouped by tag kind, in
    /// document order within a kind) and then `root` itself.
    pub fn find_candidates(&self, doc: &Document, root: NodeId) -> Vec<NodeId> {
        let descendants = doc.descendants(root);
        let mut found = Vec::new();

        for kind in TagKind::ALL {
            for &node in &descendants {
                if self.kind_of(doc, node) == Some(kind) && self.evaluate(doc, node).is_accepted() {
                    found.push(node);
                }
            }
        }

        if self.kind_of(doc, root).is_some() && self.evaluate(doc, root).is_accepted() {
            found.push(root);
        }

        found
    }

    fn kind_of(&self, doc: &Document, node: NodeId) -> Option<TagKind> {
        let kind = doc.tag_name(node).and_then(TagKind::from_tag)?;
        if kind == TagKind::BlockContainer && !self.include_block_containers {
            return None;
        }
        Some(kind)
    }

    fn evaluate(&self, doc: &Document, node: NodeId) -> Verdict {
        if rules::is_inside_extension_ui(doc, node) {
            return Verdict::Rejected(Rejection::ExtensionUi);
        }
        if self.visited.contains(&node) {
            return Verdict::Rejected(Rejection::AlreadyVisited);
        }
        let Some(kind) = self.kind_of(doc, node) else {
            return Verdict::Rejected(Rejection::UnsupportedTag);
        };

        let has_child_elements = doc.element_children(node).next().is_some();
        let variant = if !has_child_elements {
            Variant::Plain
        } else {
            Variant::Formatted
        };

        // Plain paragraphs and containers only look at element children;
        // everything else must be inline all the way down.
        let structure_ok = if kind.has_plain_variant() && variant == Variant::Plain {
            true
        } else {
            rules::all_children_inline(doc, node)
        };
        if !structure_ok {
            return Verdict::Rejected(Rejection::NonInlineContent);
        }

        let letters = rules::count_alphabetic(&doc.text_content(node));
        if letters < MIN_ALPHABETIC_CHARS {
            return Verdict::Rejected(Rejection::TooFewLetters(letters));
        }

        Verdict::Accepted { kind, variant }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_TEXT: &str =
        "The committee published its annual report on regional water quality today.";

    fn paragraph(doc: &mut Document, tag: &str, text: &str) -> NodeId {
        let node = doc.append_element(doc.body(), tag);
        doc.append_text(node, text);
        node
    }

    #[test]
    fn plain_paragraph_is_claimed_exactly_once() {
        let mut doc = Document::new();
        let p = paragraph(&mut doc, "p", LONG_TEXT);
        let mut classifier = Classifier::new(true);

        assert_eq!(
            classifier.classify(&doc, p, Mode::Claim),
            Verdict::Accepted {
                kind: TagKind::Paragraph,
                variant: Variant::Plain
            }
        );
        assert_eq!(
            classifier.classify(&doc, p, Mode::Claim),
            Verdict::Rejected(Rejection::AlreadyVisited)
        );
    }

    #[test]
    fn probe_does_not_mark_visited() {
        let mut doc = Document::new();
        let p = paragraph(&mut doc, "p", LONG_TEXT);
        let mut classifier = Classifier::new(true);

        assert!(classifier.accepts(&doc, p, Mode::Probe));
        assert!(classifier.accepts(&doc, p, Mode::Probe));
        assert!(!classifier.is_visited(p));
        assert!(classifier.accepts(&doc, p, Mode::Claim));
        assert!(classifier.is_visited(p));
    }

    #[test]
    fn short_text_is_rejected() {
        let mut doc = Document::new();
        let p = paragraph(&mut doc, "p", "Home | About | Contact");
        let mut classifier = Classifier::new(true);
        assert!(matches!(
            classifier.classify(&doc, p, Mode::Claim),
            Verdict::Rejected(Rejection::TooFewLetters(_))
        ));
    }

    #[test]
    fn formatted_paragraph_with_inline_children_is_accepted() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, "The committee published its ");
        let strong = doc.append_element(p, "strong");
        doc.append_text(strong, "annual report");
        doc.append_text(p, " on regional water quality today.");

        let mut classifier = Classifier::new(true);
        assert_eq!(
            classifier.classify(&doc, p, Mode::Probe),
            Verdict::Accepted {
                kind: TagKind::Paragraph,
                variant: Variant::Formatted
            }
        );
    }

    #[test]
    fn non_inline_descendant_rejects_regardless_of_length() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, &LONG_TEXT.repeat(10));
        let link = doc.append_element(p, "a");
        doc.append_text(link, "read more");

        let li = doc.append_element(doc.body(), "li");
        doc.append_text(li, &LONG_TEXT.repeat(10));
        let em = doc.append_element(li, "em");
        doc.append_element(em, "img");

        let mut classifier = Classifier::new(true);
        assert_eq!(
            classifier.classify(&doc, p, Mode::Claim),
            Verdict::Rejected(Rejection::NonInlineContent)
        );
        assert_eq!(
            classifier.classify(&doc, li, Mode::Claim),
            Verdict::Rejected(Rejection::NonInlineContent)
        );
    }

    #[test]
    fn elements_inside_extension_ui_are_rejected() {
        let mut doc = Document::new();
        let popup = doc.append_element(doc.body(), "div");
        doc.set_attribute(popup, "id", "esm-popup");
        let p = doc.append_element(popup, "p");
        doc.append_text(p, LONG_TEXT);

        let mut classifier = Classifier::new(true);
        assert_eq!(
            classifier.classify(&doc, p, Mode::Claim),
            Verdict::Rejected(Rejection::ExtensionUi)
        );
    }

    #[test]
    fn block_containers_can_be_disabled() {
        let mut doc = Document::new();
        let div = paragraph(&mut doc, "div", LONG_TEXT);

        assert!(Classifier::new(true).accepts(&doc, div, Mode::Probe));
        assert_eq!(
            Classifier::new(false).classify(&doc, div, Mode::Probe),
            Verdict::Rejected(Rejection::UnsupportedTag)
        );
    }

    #[test]
    fn list_items_cells_and_captions_are_recognised() {
        let mut doc = Document::new();
        let li = paragraph(&mut doc, "li", LONG_TEXT);
        let td = paragraph(&mut doc, "td", LONG_TEXT);
        let caption = paragraph(&mut doc, "figcaption", LONG_TEXT);
        let heading = paragraph(&mut doc, "h2", LONG_TEXT);

        let mut classifier = Classifier::new(true);
        assert!(classifier.accepts(&doc, li, Mode::Probe));
        assert!(classifier.accepts(&doc, td, Mode::Probe));
        assert!(classifier.accepts(&doc, caption, Mode::Probe));
        assert_eq!(
            classifier.classify(&doc, heading, Mode::Probe),
            Verdict::Rejected(Rejection::UnsupportedTag)
        );
    }

    #[test]
    fn find_candidates_groups_by_kind_then_root() {
        let mut doc = Document::new();
        let article = doc.append_element(doc.body(), "div");
        let li = doc.append_element(article, "li");
        doc.append_text(li, LONG_TEXT);
        let p = doc.append_element(article, "p");
        doc.append_text(p, LONG_TEXT);

        let classifier = Classifier::new(true);
        // The wrapping div holds block children and is not a candidate.
        assert_eq!(classifier.find_candidates(&doc, article), vec![p, li]);
    }

    #[test]
    fn reset_forgets_visited_elements() {
        let mut doc = Document::new();
        let p = paragraph(&mut doc, "p", LONG_TEXT);
        let mut classifier = Classifier::new(true);
        classifier.classify(&doc, p, Mode::Claim);
        classifier.reset();
        assert!(classifier.accepts(&doc, p, Mode::Claim));
    }
}
