//! Per-table behaviour plugged into a [`ClassHash`](super::ClassHash).

/// Hash, compare and reference hooks for one kind of table.
///
/// `get` and `put` are called whenever the table hands out or drops its own
/// reference to an object, so implementations can keep an external count in
/// step with the table.
pub trait HashOps: Send + Sync + 'static {
    /// Lookup key.
    type Key: ?Sized;
    /// Stored object.
    type Object: Send + Sync + 'static;

    /// Bucket index for `key`, already masked with `mask` (table size - 1).
    fn hash(&self, key: &Self::Key, mask: u32) -> u32;

    /// Whether `object` is stored under `key`.
    fn compare(&self, key: &Self::Key, object: &Self::Object) -> bool;

    /// Called when the table acquires a reference to `object`.
    fn get(&self, _object: &Self::Object) {}

    /// Called when the table releases a reference to `object`.
    fn put(&self, _object: &Self::Object) {}
}

/// djb2 string hash, masked to a bucket index.
///
/// ```
/// use ptlrpc_core::djb2;
///
/// assert_eq!(djb2(b"", 127), 5381 & 127);
/// ```
pub fn djb2(bytes: &[u8], mask: u32) -> u32 {
    let hash = bytes
        .iter()
        .fold(5381u32, |hash, &b| hash.wrapping_mul(33).wrapping_add(b as u32));
    hash & mask
}
