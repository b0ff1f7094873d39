//! Content digests.
//!
//! A [`Digest`] identifies a vertex, a cache key, or a result by the hash of its
//! content rather than by an incrementing counter. Two digests are equal exactly
//! when the content that produced them was equal.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt::{Debug, Display};

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
	/// Hash a single byte string into a digest.
	pub fn of(bytes: impl AsRef<[u8]>) -> Self {
		let mut hasher = Sha256::new();
		hasher.update(bytes.as_ref());
		Self(hasher.finalize().into())
	}

	/// Combine a base digest with a sequence of child digests, in order.
	///
	/// Used to fold a vertex's own digest together with its inputs' cache keys:
	/// order matters (input zero and input one are never interchangeable), so
	/// this is not commutative.
	pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Digest>) -> Self {
		let mut hasher = Sha256::new();
		for part in parts {
			hasher.update(part.0);
		}
		Self(hasher.finalize().into())
	}

	/// Borrow the raw bytes of this digest.
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl Debug for Digest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Digest({self})")
	}
}

impl Display for Digest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		for byte in &self.0[..8] {
			write!(f, "{byte:02x}")?;
		}
		write!(f, "..")
	}
}
