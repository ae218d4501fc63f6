//! Memory caching for verified pieces.
//!
//! [`PieceCache`] keeps recently served or written pieces in memory so that
//! repeated requests for popular pieces do not hit the disk. It is bounded by
//! a byte budget and evicts least-recently-used entries.
//!
//! # Examples
//!
//! ```
//! use swarmwire::cache::PieceCache;
//! use swarmwire::peer::PieceId;
//! use bytes::Bytes;
//!
//! let cache = PieceCache::new(64 * 1024);
//!
//! let key = PieceId::new("movie.mkv", 0);
//! cache.insert(key.clone(), Bytes::from(vec![0u8; 4096]));
//!
//! if let Some(cached) = cache.get(&key) {
//!     assert_eq!(cached.len(), 4096);
//! }
//! ```

mod piece_cache;

pub use piece_cache::PieceCache;
