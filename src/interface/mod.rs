pub mod metadata;

pub use metadata::{run_metadata_loop, MetadataMessage};
