//! Piece persistence, verification and rarest-first bookkeeping.
//!
//! # Overview
//!
//! Tracked files are split into fixed-size pieces described by a
//! [`TorrentDescriptor`]. The [`PieceStore`] keeps, per file, a bitfield of
//! verified pieces, and across all files the number of peers known to hold
//! each piece together with the set of pieces still wanted.
//!
//! # Components
//!
//! - [`PieceStore`] - Shared store used by every peer connection
//! - [`TorrentDescriptor`] - Piece geometry and SHA-1 hashes of one file
//! - [`PieceDisk`] - On-disk layout: one file per piece, reassembled outputs
//! - [`RarityIndex`] - Rarity counts and the ordered wanted set
//!
//! # Examples
//!
//! ```no_run
//! use swarmwire::storage::{PieceStore, TorrentDescriptor};
//! use swarmwire::peer::PieceId;
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let data = b"hello world, split into tiny pieces".to_vec();
//! let descriptor = TorrentDescriptor::from_data("hello.txt", 8, &data)?;
//!
//! let store = PieceStore::new("./downloads", 1024 * 1024);
//! store.add_tracked_file(descriptor, false).await?;
//!
//! let stored = store
//!     .write_piece(&PieceId::new("hello.txt", 0), Bytes::copy_from_slice(&data[..8]))
//!     .await?;
//! assert!(stored);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File ids name a single file inside the base directory. Ids containing
//! path separators, `..` or a leading dot are rejected.

mod descriptor;
mod disk;
mod error;
mod rarity;
mod store;

pub use descriptor::{hash_piece, TorrentDescriptor};
pub use disk::PieceDisk;
pub use error::StorageError;
pub use rarity::{RarityIndex, SelectionMode};
pub use store::PieceStore;

#[cfg(test)]
mod tests;
