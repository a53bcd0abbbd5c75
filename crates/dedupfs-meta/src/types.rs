//! Identifiers, timestamps, file types and the error type shared by the metadata layer.

use serde::{Deserialize, Serialize};
use std::fmt;

use dedupfs_reduce::ReduceError;

macro_rules! row_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates an id from a raw u64 value
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            /// Returns the raw u64 value of this id
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Row id of a subvolume in the global `subvolume` table
    SubvolumeId
);
row_id!(
    /// Inode number, unique within one subvolume's inode table
    InodeId
);
row_id!(
    /// Row id of a tree node, unique within one subvolume's tree table
    NodeId
);
row_id!(
    /// Row id of an interned name in the global `name` table
    NameId
);
row_id!(
    /// Row id of a content hash in the global `hash` table
    HashId
);
row_id!(
    /// Row id of a compression method in the global `compression_type` table
    CompressionTypeId
);

impl InodeId {
    /// The root inode of every subvolume (POSIX convention)
    pub const ROOT_INODE: InodeId = InodeId(2);
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: i64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                Self {
                    secs: -(d.as_secs() as i64),
                    nanos: 0,
                }
            }
        }
    }

    /// Timestamp at a whole second
    pub fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// File type enumeration matching POSIX file types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Character device (S_IFCHR)
    CharDevice,
    /// FIFO/named pipe (S_IFIFO)
    Fifo,
    /// Socket (S_IFSOCK)
    Socket,
}

/// Mask selecting the file type bits of a mode
pub const S_IFMT: u32 = 0o170000;

impl FileType {
    /// Returns the POSIX S_IFMT bits for this file type
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::RegularFile => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
            FileType::BlockDevice => 0o060000,
            FileType::CharDevice => 0o020000,
            FileType::Fifo => 0o010000,
            FileType::Socket => 0o140000,
        }
    }

    /// Decodes the file type from a full mode value
    pub fn from_mode(mode: u32) -> Option<FileType> {
        match mode & S_IFMT {
            0o100000 => Some(FileType::RegularFile),
            0o040000 => Some(FileType::Directory),
            0o120000 => Some(FileType::Symlink),
            0o060000 => Some(FileType::BlockDevice),
            0o020000 => Some(FileType::CharDevice),
            0o010000 => Some(FileType::Fifo),
            0o140000 => Some(FileType::Socket),
            _ => None,
        }
    }
}

/// Coarse classification of a [`MetaError`], used to map failures onto
/// filesystem error codes and process exit codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Subvolume, name, hash, inode or entry absent
    NotFound,
    /// Unique constraint violated
    Conflict,
    /// Storage backend, serialization or codec failure
    Backend,
    /// Malformed input or operation not allowed in the current state
    Validation,
}

/// Error types for the dedupfs metadata and block store
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// No subvolume with this name
    #[error("subvolume {0:?} not found")]
    SubvolumeNotFound(String),

    /// A subvolume with this name already exists
    #[error("subvolume {0:?} already exists")]
    SubvolumeExists(String),

    /// No interned name with this id
    #[error("name {0} not found")]
    NameNotFound(NameId),

    /// No content hash with this id
    #[error("hash {0} not found")]
    HashNotFound(HashId),

    /// The requested inode does not exist.
    #[error("inode {0} not found")]
    InodeNotFound(InodeId),

    /// A directory entry with the given name was not found.
    #[error("entry '{name}' not found in directory {parent}")]
    EntryNotFound {
        /// Parent directory inode
        parent: InodeId,
        /// Entry name that was not found
        name: String,
    },

    /// A directory entry with the given name already exists.
    #[error("entry '{name}' already exists in directory {parent}")]
    EntryExists {
        /// Parent directory inode
        parent: InodeId,
        /// Existing entry name
        name: String,
    },

    /// A unique index already holds the key being inserted.
    #[error("unique constraint {index} violated on table {table}")]
    UniqueViolation {
        /// Table name
        table: String,
        /// Index name
        index: String,
    },

    /// The table was never created or has been dropped.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// Table identifiers only accept `[a-z0-9_]`.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// Subvolume names must be non-empty.
    #[error("invalid subvolume name: {0}")]
    InvalidName(String),

    /// Engine option out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Write attempted on a read-only subvolume.
    #[error("subvolume {0:?} is read-only")]
    ReadOnly(String),

    /// The specified inode is not a directory when a directory was required.
    #[error("inode {0} is not a directory")]
    NotADirectory(InodeId),

    /// Attempted to delete a non-empty directory.
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(InodeId),

    /// Stored block failed to decode to its recorded size.
    #[error("block for hash {hash} is corrupt: expected {expected} bytes, got {actual}")]
    CorruptBlock {
        /// Hash id of the block
        hash: HashId,
        /// Size recorded in hash_sizes
        expected: u64,
        /// Size after decompression
        actual: u64,
    },

    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// Row encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression registry or codec failure.
    #[error(transparent)]
    Reduce(#[from] ReduceError),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::SubvolumeNotFound(_)
            | MetaError::NameNotFound(_)
            | MetaError::HashNotFound(_)
            | MetaError::InodeNotFound(_)
            | MetaError::EntryNotFound { .. } => ErrorKind::NotFound,
            MetaError::SubvolumeExists(_)
            | MetaError::EntryExists { .. }
            | MetaError::UniqueViolation { .. } => ErrorKind::Conflict,
            MetaError::InvalidTableName(_)
            | MetaError::InvalidName(_)
            | MetaError::InvalidConfig(_)
            | MetaError::ReadOnly(_)
            | MetaError::NotADirectory(_)
            | MetaError::DirectoryNotEmpty(_) => ErrorKind::Validation,
            MetaError::Reduce(
                ReduceError::UnknownMethod(_)
                | ReduceError::DeprecatedMethod(_)
                | ReduceError::InvalidLevel { .. }
                | ReduceError::InvalidMethodSpec(_),
            ) => ErrorKind::Validation,
            MetaError::NoSuchTable(_)
            | MetaError::CorruptBlock { .. }
            | MetaError::KvError(_)
            | MetaError::Serialization(_)
            | MetaError::Reduce(_)
            | MetaError::IoError(_) => ErrorKind::Backend,
        }
    }
}

impl From<bincode::Error> for MetaError {
    fn from(e: bincode::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}
