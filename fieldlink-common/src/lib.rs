//! Common functionality shared among the fieldlink crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `fieldlink-node`.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod adi;
mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod config;
pub mod constants;
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod device_config;
mod error_code;
pub mod gray;
pub mod resolution;
pub mod status;
pub mod traits;

pub use error_code::ErrorCode;
pub use resolution::Resolution;
pub use status::{AppStatus, CommReadiness, LinkState, Status};
