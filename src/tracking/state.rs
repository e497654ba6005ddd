use serde::{Deserialize, Serialize};

use crate::page::NodeId;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ViewState {
    Simplified,
    #[default]
    Original,
}

impl ViewState {
    pub fn flipped(self) -> Self {
        match self {
            ViewState::Simplified => ViewState::Original,
            ViewState::Original => ViewState::Simplified,
        }
    }
}

/// Input that activates a toggle control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlInput {
    Click,
    Key(String),
}

impl ControlInput {
    pub fn activates(&self) -> bool {
        match self {
            ControlInput::Click => true,
            ControlInput::Key(key) => key == "Enter" || key == " ",
        }
    }
}

/// A paragraph submitted for simplification.
#[derive(Debug, Clone)]
pub struct TrackedParagraph {
    pub id: String,
    /// Non-owning: the page may detach the element at any time.
    pub element: NodeId,
    pub original_text: String,
    pub simplified_text: Option<String>,
    pub view: ViewState,
    pub control: Option<NodeId>,
}

impl TrackedParagraph {
    pub fn new(id: String, element: NodeId, original_text: String) -> Self {
        Self {
            id,
            element,
            original_text,
            simplified_text: None,
            view: ViewState::Original,
            control: None,
        }
    }

    pub fn is_altered(&self) -> bool {
        self.simplified_text.is_some()
    }

    /// Text that should be on the page for the current view.
    pub fn displayed_text(&self) -> &str {
        match (self.view, self.simplified_text.as_deref()) {
            (ViewState::Simplified, Some(text)) => text,
            _ => &self.original_text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_space_activate() {
        assert!(ControlInput::Click.activates());
        assert!(ControlInput::Key("Enter".into()).activates());
        assert!(ControlInput::Key(" ".into()).activates());
        assert!(!ControlInput::Key("Tab".into()).activates());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_value(ViewState::Simplified).unwrap(), "simplified");
        assert_eq!(ViewState::Original.flipped(), ViewState::Simplified);
    }

    #[test]
    fn new_paragraphs_start_in_original_view() {
        assert_eq!(ViewState::default(), ViewState::Original);
    }
}
