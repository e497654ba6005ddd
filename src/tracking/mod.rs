//! Tracked paragraphs, their toggle controls, and the view they show.

mod state;

use std::collections::HashMap;

use log::warn;

use crate::classifier::rules::EXTENSION_UI_ATTRIBUTE;
use crate::page::{Document, NodeId};
use crate::telemetry::events::word_count;

pub use state::{ControlInput, TrackedParagraph, ViewState};

pub const SIMPLIFIED_CLASS: &str = "simplified-paragraph";
pub const SIMPLIFIED_CONTROL_CLASS: &str = "simplified-paragraph-toggle";
pub const ORIGINAL_CONTROL_CLASS: &str = "original-paragraph-toggle";
pub const NO_SIMPLIFIED_MESSAGE: &str = "No simplified paragraphs found on this page";

/// Result of a single user toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub id: String,
    pub from: ViewState,
    pub to: ViewState,
    pub wordcount_simplified: usize,
    pub wordcount_original: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkToggle {
    NothingToToggle,
    Switched {
        from: ViewState,
        to: ViewState,
        affected: usize,
    },
}

impl BulkToggle {
    pub fn message(&self) -> String {
        match self {
            BulkToggle::NothingToToggle => NO_SIMPLIFIED_MESSAGE.to_string(),
            BulkToggle::Switched { to, affected, .. } => {
                let target = match to {
                    ViewState::Simplified => "simplified",
                    ViewState::Original => "original",
                };
                format!("Switched all paragraphs to {target} text ({affected} paragraphs affected)")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlteredStats {
    pub altered_paragraphs: usize,
    pub altered_words: usize,
}

pub struct ParagraphTracker {
    paragraphs: Vec<TrackedParagraph>,
    by_id: HashMap<String, usize>,
    by_control: HashMap<NodeId, usize>,
    next_id: u64,
    toggle_count: u32,
}

impl Default for ParagraphTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ParagraphTracker {
    pub fn new() -> Self {
        Self {
            paragraphs: Vec::new(),
            by_id: HashMap::new(),
            by_control: HashMap::new(),
            next_id: 1,
            toggle_count: 0,
        }
    }

    /// Starts tracking `element` with its current text. Returns the id used
    /// for the simplification request.
    pub fn register(&mut self, doc: &Document, element: NodeId) -> TrackedParagraph {
        let id = format!("simplify-{}", self.next_id);
        self.next_id += 1;

        let paragraph = TrackedParagraph::new(id.clone(), element, doc.text_content(element));
        self.by_id.insert(id, self.paragraphs.len());
        self.paragraphs.push(paragraph.clone());
        paragraph
    }

    pub fn get(&self, id: &str) -> Option<&TrackedParagraph> {
        self.by_id.get(id).map(|&idx| &self.paragraphs[idx])
    }

    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    pub fn toggle_count(&self) -> u32 {
        self.toggle_count
    }

    pub fn altered_stats(&self) -> AlteredStats {
        self.paragraphs
            .iter()
            .filter(|p| p.is_altered())
            .fold(AlteredStats::default(), |mut stats, p| {
                stats.altered_paragraphs += 1;
                stats.altered_words += word_count(&p.original_text);
                stats
            })
    }

    /// Records the simplified text and, if the element is still on the page,
    /// swaps it in and attaches the toggle control. Returns whether the page
    /// was updated.
    pub fn apply_simplification(&mut self, doc: &mut Document, id: &str, simplified: String) -> bool {
        let Some(&idx) = self.by_id.get(id) else {
            return false;
        };
        self.paragraphs[idx].simplified_text = Some(simplified);

        let element = self.paragraphs[idx].element;
        if !doc.is_connected(element) {
            warn!("Element no longer in DOM: {id}");
            return false;
        }

        doc.add_class(element, SIMPLIFIED_CLASS);
        self.paragraphs[idx].view = ViewState::Simplified;
        self.render(doc, idx, "Toggle between original and simplified text");
        true
    }

    /// Routes input on a toggle control to its paragraph.
    pub fn on_control_input(
        &mut self,
        doc: &mut Document,
        control: NodeId,
        input: &ControlInput,
    ) -> Option<ToggleOutcome> {
        if !input.activates() {
            return None;
        }
        let idx = *self.by_control.get(&control)?;
        self.flip(doc, idx)
    }

    pub fn toggle(&mut self, doc: &mut Document, id: &str) -> Option<ToggleOutcome> {
        let idx = *self.by_id.get(id)?;
        self.flip(doc, idx)
    }

    /// Majority rule over simplified paragraphs still on the page: if at
    /// least half show the simplified text, everything goes back to the
    /// original, otherwise everything is simplified.
    pub fn toggle_all(&mut self, doc: &mut Document) -> BulkToggle {
        let candidates: Vec<usize> = self
            .paragraphs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_altered() && doc.is_connected(p.element))
            .map(|(idx, _)| idx)
            .collect();

        if candidates.is_empty() {
            return BulkToggle::NothingToToggle;
        }

        let simplified = candidates
            .iter()
            .filter(|&&idx| self.paragraphs[idx].view == ViewState::Simplified)
            .count();
        let original = candidates.len() - simplified;
        let (from, to) = if simplified >= original {
            (ViewState::Simplified, ViewState::Original)
        } else {
            (ViewState::Original, ViewState::Simplified)
        };

        for &idx in &candidates {
            if self.paragraphs[idx].view != to {
                self.flip(doc, idx);
            }
        }

        BulkToggle::Switched {
            from,
            to,
            affected: candidates.len(),
        }
    }

    /// Forgets every paragraph and restarts ids. Toggle counts for the
    /// page survive.
    pub fn reset(&mut self) {
        self.paragraphs.clear();
        self.by_id.clear();
        self.by_control.clear();
        self.next_id = 1;
    }

    fn flip(&mut self, doc: &mut Document, idx: usize) -> Option<ToggleOutcome> {
        let paragraph = &mut self.paragraphs[idx];
        paragraph.simplified_text.as_ref()?;

        let from = paragraph.view;
        paragraph.view = from.flipped();
        self.toggle_count += 1;

        let label = match paragraph.view {
            ViewState::Simplified => "Switch to original text",
            ViewState::Original => "Switch to simplified text",
        };
        self.render(doc, idx, label);

        let paragraph = &self.paragraphs[idx];
        Some(ToggleOutcome {
            id: paragraph.id.clone(),
            from,
            to: paragraph.view,
            wordcount_simplified: paragraph
                .simplified_text
                .as_deref()
                .map(word_count)
                .unwrap_or(0),
            wordcount_original: word_count(&paragraph.original_text),
        })
    }

    /// Writes the displayed text and replaces the control for the view.
    fn render(&mut self, doc: &mut Document, idx: usize, label: &str) {
        let paragraph = &mut self.paragraphs[idx];
        if let Some(old) = paragraph.control.take() {
            doc.remove(old);
            self.by_control.remove(&old);
        }

        let element = paragraph.element;
        doc.set_text_content(element, paragraph.displayed_text());

        let class = match paragraph.view {
            ViewState::Simplified => SIMPLIFIED_CONTROL_CLASS,
            ViewState::Original => ORIGINAL_CONTROL_CLASS,
        };
        let control = doc.create_element("button");
        doc.add_class(control, class);
        doc.set_attribute(control, "aria-label", label);
        doc.set_attribute(control, "tabindex", "0");
        doc.set_attribute(control, EXTENSION_UI_ATTRIBUTE, "1");
        doc.append_child(element, control);

        paragraph.control = Some(control);
        self.by_control.insert(control, idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGINAL: &str = "The municipal council approved the proposed budget amendment yesterday.";
    const SIMPLE: &str = "The council said yes to the new budget.";

    fn simplified_paragraph(doc: &mut Document, tracker: &mut ParagraphTracker) -> String {
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, ORIGINAL);
        let tracked = tracker.register(doc, p);
        assert!(tracker.apply_simplification(doc, &tracked.id, SIMPLE.into()));
        tracked.id
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        let a = doc.append_element(doc.body(), "p");
        let b = doc.append_element(doc.body(), "p");
        assert_eq!(tracker.register(&doc, a).id, "simplify-1");
        assert_eq!(tracker.register(&doc, b).id, "simplify-2");
        tracker.reset();
        assert_eq!(tracker.register(&doc, a).id, "simplify-1");
    }

    #[test]
    fn simplification_swaps_text_and_adds_control() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        let id = simplified_paragraph(&mut doc, &mut tracker);
        let paragraph = tracker.get(&id).unwrap().clone();

        assert_eq!(paragraph.view, ViewState::Simplified);
        assert_eq!(doc.text_content(paragraph.element), SIMPLE);
        assert!(doc.has_class(paragraph.element, SIMPLIFIED_CLASS));

        let control = paragraph.control.unwrap();
        assert_eq!(doc.tag_name(control), Some("BUTTON"));
        assert!(doc.has_class(control, SIMPLIFIED_CONTROL_CLASS));
        assert_eq!(doc.attribute(control, EXTENSION_UI_ATTRIBUTE), Some("1"));
        assert_eq!(doc.attribute(control, "tabindex"), Some("0"));
    }

    #[test]
    fn detached_element_keeps_result_without_touching_page() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, ORIGINAL);
        let tracked = tracker.register(&doc, p);
        doc.remove(p);

        assert!(!tracker.apply_simplification(&mut doc, &tracked.id, SIMPLE.into()));
        let paragraph = tracker.get(&tracked.id).unwrap();
        assert_eq!(paragraph.simplified_text.as_deref(), Some(SIMPLE));
        assert_eq!(paragraph.view, ViewState::Original);
        assert_eq!(doc.text_content(p), ORIGINAL);
    }

    #[test]
    fn control_input_toggles_and_text_follows_view() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        let id = simplified_paragraph(&mut doc, &mut tracker);
        let control = tracker.get(&id).unwrap().control.unwrap();

        assert!(tracker
            .on_control_input(&mut doc, control, &ControlInput::Key("a".into()))
            .is_none());

        let outcome = tracker
            .on_control_input(&mut doc, control, &ControlInput::Key("Enter".into()))
            .unwrap();
        assert_eq!(outcome.from, ViewState::Simplified);
        assert_eq!(outcome.to, ViewState::Original);
        assert_eq!(outcome.wordcount_original, word_count(ORIGINAL));

        let paragraph = tracker.get(&id).unwrap();
        assert_eq!(doc.text_content(paragraph.element), ORIGINAL);
        let grey = paragraph.control.unwrap();
        assert!(doc.has_class(grey, ORIGINAL_CONTROL_CLASS));
        assert!(!doc.is_connected(control));

        // The old control no longer routes anywhere.
        assert!(tracker
            .on_control_input(&mut doc, control, &ControlInput::Click)
            .is_none());
        tracker.on_control_input(&mut doc, grey, &ControlInput::Click);
        assert_eq!(doc.text_content(tracker.get(&id).unwrap().element), SIMPLE);
        assert_eq!(tracker.toggle_count(), 2);
    }

    #[test]
    fn unsimplified_paragraph_cannot_toggle() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        let p = doc.append_element(doc.body(), "p");
        let tracked = tracker.register(&doc, p);
        assert!(tracker.toggle(&mut doc, &tracked.id).is_none());
    }

    #[test]
    fn toggle_all_follows_majority() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        let ids: Vec<String> = (0..10)
            .map(|_| simplified_paragraph(&mut doc, &mut tracker))
            .collect();
        for id in &ids[..3] {
            tracker.toggle(&mut doc, id);
        }

        let result = tracker.toggle_all(&mut doc);
        assert_eq!(
            result,
            BulkToggle::Switched {
                from: ViewState::Simplified,
                to: ViewState::Original,
                affected: 10
            }
        );
        for id in &ids {
            let paragraph = tracker.get(id).unwrap();
            assert_eq!(paragraph.view, ViewState::Original);
            assert_eq!(doc.text_content(paragraph.element), ORIGINAL);
        }
        assert_eq!(
            result.message(),
            "Switched all paragraphs to original text (10 paragraphs affected)"
        );
    }

    #[test]
    fn toggle_all_without_simplified_paragraphs() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        let result = tracker.toggle_all(&mut doc);
        assert_eq!(result, BulkToggle::NothingToToggle);
        assert_eq!(result.message(), NO_SIMPLIFIED_MESSAGE);
    }

    #[test]
    fn altered_stats_count_original_words() {
        let mut doc = Document::new();
        let mut tracker = ParagraphTracker::new();
        simplified_paragraph(&mut doc, &mut tracker);
        let untouched = doc.append_element(doc.body(), "p");
        tracker.register(&doc, untouched);

        let stats = tracker.altered_stats();
        assert_eq!(stats.altered_paragraphs, 1);
        assert_eq!(stats.altered_words, word_count(ORIGINAL));
    }
}
