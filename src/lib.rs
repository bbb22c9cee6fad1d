#![allow(unused, dead_code)]

mod bucket_locks;
mod cache;
mod config;
mod mem_store;
mod node;
mod path;
mod resolve;
mod store;
mod symlink;


pub use bucket_locks::*;
pub use cache::*;
pub use config::*;
pub use mem_store::*;
pub use node::*;
pub use path::*;
pub use resolve::*;
pub use store::*;
pub use symlink::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum NsError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("name too long: {0}")]
    NameTooLong(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("key deleted: {0}")]
    KeyDeleted(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),
    #[error("store error: {0}")]
    StoreError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
}

impl NsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, NsError::NotFound(_))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, NsError::AccessDenied(_))
    }
}

pub type NsResult<T> = std::result::Result<T, NsError>;
