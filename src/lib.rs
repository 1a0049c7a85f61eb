//! Ephemeral, in-memory file sharing.
//!
//! Uploaded files are packaged ([`pack`]), optionally sealed with a password
//! ([`crypto`]) and kept in a [`SecureBuffer`] registered in a
//! [`SecureStore`] under an unguessable handle. Buffers are pinned against
//! swap, wiped when destroyed, and go away once expired or downloaded enough
//! times.

pub mod buf;
pub mod buffer;
pub mod cli;
pub mod crypto;
pub mod duration;
pub mod error;
pub mod hash;
pub mod memory;
pub mod name;
pub mod pack;
pub mod pipeline;
pub mod reaper;
pub mod store;

pub use crate::buffer::SecureBuffer;
pub use crate::error::{Error, StoreError};
pub use crate::pipeline::{ingest, FileUpload, UploadOptions};
pub use crate::reaper::Reaper;
pub use crate::store::{Download, SecureStore};
