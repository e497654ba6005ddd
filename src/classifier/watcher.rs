//! Feeds inserted page content back into the classifier and holds eligible
//! elements until the host reports them visible.

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::page::{Document, DomMutation, NodeId};

use super::{Classifier, Mode, Verdict};

const ENABLE_LOGS: bool = false;

use crate::log_info;

/// An element that passed the claim check after becoming visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedElement {
    pub node: NodeId,
    pub verdict: Verdict,
}

pub struct MutationWatcher {
    mutations: mpsc::UnboundedReceiver<DomMutation>,
    observed: HashSet<NodeId>,
}

impl MutationWatcher {
    /// Subscribes to insertions on `doc`.
    pub fn attach(doc: &mut Document) -> Self {
        Self {
            mutations: doc.subscribe(),
            observed: HashSet::new(),
        }
    }

    /// Registers every eligible element already on the page.
    pub fn initial_scan(&mut self, doc: &Document, classifier: &Classifier) -> Vec<NodeId> {
        self.register_subtree(doc, classifier, doc.root())
    }

    /// Handles every insertion reported since the last call and returns the
    /// elements newly registered for visibility.
    pub fn drain(&mut self, doc: &Document, classifier: &Classifier) -> Vec<NodeId> {
        let mut registered = Vec::new();
        while let Ok(mutation) = self.mutations.try_recv() {
            registered.extend(self.handle_mutation(doc, classifier, mutation));
        }
        registered
    }

    /// Waits for the next insertion. `None` once the document is gone.
    pub async fn next_mutation(&mut self) -> Option<DomMutation> {
        self.mutations.recv().await
    }

    pub fn handle_mutation(
        &mut self,
        doc: &Document,
        classifier: &Classifier,
        mutation: DomMutation,
    ) -> Vec<NodeId> {
        match mutation {
            DomMutation::ElementAdded(node) => {
                if !doc.is_connected(node) {
                    return Vec::new();
                }
                self.register_subtree(doc, classifier, node)
            }
        }
    }

    /// Viewport intersection for `node`. The registration is consumed either
    /// way; the element is returned only when the claim succeeds.
    pub fn on_intersection(
        &mut self,
        doc: &Document,
        classifier: &mut Classifier,
        node: NodeId,
    ) -> Option<ClaimedElement> {
        if !self.observed.remove(&node) {
            return None;
        }
        let verdict = classifier.classify(doc, node, Mode::Claim);
        if !verdict.is_accepted() {
            log_info!("visible element {:?} no longer eligible: {:?}", node, verdict);
            return None;
        }
        Some(ClaimedElement { node, verdict })
    }

    pub fn is_observed(&self, node: NodeId) -> bool {
        self.observed.contains(&node)
    }

    pub fn observed_count(&self) -> usize {
        self.observed.len()
    }

    /// Drops all visibility registrations and any queued insertions.
    pub fn reset(&mut self) {
        self.observed.clear();
        while self.mutations.try_recv().is_ok() {}
    }

    fn register_subtree(
        &mut self,
        doc: &Document,
        classifier: &Classifier,
        root: NodeId,
    ) -> Vec<NodeId> {
        let mut registered = Vec::new();
        for node in classifier.find_candidates(doc, root) {
            if self.observed.insert(node) {
                registered.push(node);
            }
        }
        if !registered.is_empty() {
            log_info!("registered {} elements below {:?}", registered.len(), root);
        }
        registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_TEXT: &str =
        "Researchers measured how quickly the glacier retreated over the last decade.";

    #[test]
    fn inserted_subtree_is_registered_not_processed() {
        let mut doc = Document::new();
        let mut watcher = MutationWatcher::attach(&mut doc);
        let classifier = Classifier::new(true);

        let section = doc.create_element("section");
        let p = doc.append_element(section, "p");
        doc.append_text(p, LONG_TEXT);
        doc.append_child(doc.body(), section);

        assert_eq!(watcher.drain(&doc, &classifier), vec![p]);
        assert!(watcher.is_observed(p));
        assert!(!classifier.is_visited(p));
    }

    #[test]
    fn intersection_is_one_shot() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, LONG_TEXT);

        let mut watcher = MutationWatcher::attach(&mut doc);
        let mut classifier = Classifier::new(true);
        assert_eq!(watcher.initial_scan(&doc, &classifier), vec![p]);

        let claimed = watcher.on_intersection(&doc, &mut classifier, p);
        assert_eq!(claimed.map(|c| c.node), Some(p));
        assert!(watcher.on_intersection(&doc, &mut classifier, p).is_none());
        assert!(classifier.is_visited(p));
    }

    #[test]
    fn visited_elements_are_not_registered_again() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, LONG_TEXT);

        let mut watcher = MutationWatcher::attach(&mut doc);
        let mut classifier = Classifier::new(true);
        watcher.initial_scan(&doc, &classifier);
        watcher.on_intersection(&doc, &mut classifier, p);

        // Re-inserting the same element must not enqueue it twice.
        doc.remove(p);
        doc.append_child(doc.body(), p);
        assert!(watcher.drain(&doc, &classifier).is_empty());
    }

    #[test]
    fn registration_consumed_when_element_changed_before_visible() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, LONG_TEXT);

        let mut watcher = MutationWatcher::attach(&mut doc);
        let mut classifier = Classifier::new(true);
        watcher.initial_scan(&doc, &classifier);

        doc.set_text_content(p, "Too short");
        assert!(watcher.on_intersection(&doc, &mut classifier, p).is_none());
        assert!(!watcher.is_observed(p));
    }

    #[test]
    fn reset_clears_registrations() {
        let mut doc = Document::new();
        let p = doc.append_element(doc.body(), "p");
        doc.append_text(p, LONG_TEXT);

        let mut watcher = MutationWatcher::attach(&mut doc);
        let classifier = Classifier::new(true);
        watcher.initial_scan(&doc, &classifier);
        watcher.reset();
        assert_eq!(watcher.observed_count(), 0);
    }
}
