//! Hash map and set aliases used by the reconciliation indexes.
//!
//! The size and inode indexes are hit once per visited file, so with the
//! `gxhash` feature they use gxhash; without it (e.g. CPUs lacking AES-NI)
//! they fall back to the std hasher. Construct them with `Default`.

/// HashMap that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashMap<K, V> = gxhash::HashMap<K, V>;

/// HashMap that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashMap<K, V> = std::collections::HashMap<K, V>;

/// HashSet that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashSet<T> = gxhash::HashSet<T>;

/// HashSet that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashSet<T> = std::collections::HashSet<T>;
