use std::fmt;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Cache key for a package filter list: FNV-1a over each filter followed by a
/// NUL separator.
///
/// Order matters, so `["a", "b"]` and `["b", "a"]` build into different
/// binary directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u32);

impl Fingerprint {
    pub fn of<S: AsRef<str>>(filters: &[S]) -> Self {
        let mut hash = FNV_OFFSET_BASIS;
        for filter in filters {
            for &b in filter.as_ref().as_bytes().iter().chain(&[0u8]) {
                hash ^= u32::from(b);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        Self(hash)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
