use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Best-effort mapping from stream id (SSRC) to a display label used for
/// output naming. Implementations must answer immediately; a missing entry is
/// a normal outcome, never an error.
pub trait LabelLookup: Send + Sync {
    fn label_for(&self, ssrc: u32) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopLabelLookup;

impl NoopLabelLookup {
    pub fn new() -> Self {
        Self
    }
}

impl LabelLookup for NoopLabelLookup {
    fn label_for(&self, _ssrc: u32) -> Option<String> {
        None
    }
}

/// In-process label table, filled out of band (see the metadata listener).
#[derive(Debug, Default)]
pub struct InMemoryLabelStore {
    labels: RwLock<HashMap<u32, String>>,
}

impl InMemoryLabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the label for `ssrc`; returns the previous one.
    pub fn set(&self, ssrc: u32, label: impl Into<String>) -> Option<String> {
        self.labels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ssrc, label.into())
    }

    pub fn remove(&self, ssrc: u32) -> Option<String> {
        self.labels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LabelLookup for InMemoryLabelStore {
    fn label_for(&self, ssrc: u32) -> Option<String> {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ssrc)
            .cloned()
    }
}

/// Label for `ssrc`, or the decimal SSRC when the lookup has nothing.
pub fn resolve_label(lookup: &dyn LabelLookup, ssrc: u32) -> String {
    lookup
        .label_for(ssrc)
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| ssrc.to_string())
}
