use fxhash::FxBuildHasher;

#[macro_use]
pub mod macros;
pub mod clock;
pub mod error;
pub mod retry;

pub type Map<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, FxBuildHasher>;
