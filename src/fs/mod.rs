//! FUSE filesystem implementation
//!
//! Mirrors a directory tree, sealing regular-file content on the way down
//! and opening it on the way up.

mod filesystem;
mod inode;
pub mod passthrough;
pub mod pipeline;
pub mod policy;

pub use filesystem::EncFs;
pub use inode::{InodeTable, ROOT_INO};
pub use passthrough::{DirEntry, FsStats, SetTime};
pub use pipeline::{ContentPipeline, PathLocks, WholeFilePipeline};
pub use policy::{
    classify_xattr_error, policy_for, EncryptionPolicy, TaggedPolicy, UniformPolicy, TAG_VALUE,
};
