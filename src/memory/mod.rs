pub(crate) mod backend;
pub(crate) mod backref;
pub(crate) mod bitmask;
pub(crate) mod block;
pub(crate) mod cache;
pub(crate) mod integration;
pub mod pool;
pub mod raw;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
