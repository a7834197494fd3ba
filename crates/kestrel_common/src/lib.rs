//! Shared error taxonomy for the kestrel workspace.
//!
//! Every crate in the workspace reports failures through the types in
//! [`error`]; nothing here performs I/O or holds state.

pub mod error;

pub use error::{ClusterError, KestrelError, StoreError};
