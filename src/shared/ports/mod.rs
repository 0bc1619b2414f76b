pub mod label_lookup;

pub use label_lookup::{resolve_label, InMemoryLabelStore, LabelLookup, NoopLabelLookup};
