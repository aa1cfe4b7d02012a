pub mod bitmap;
pub mod error;
pub mod hostlist;
pub mod pack;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;
