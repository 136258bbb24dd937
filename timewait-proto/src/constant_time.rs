// Kept out of line so the optimizer cannot short-circuit on the first differing byte.
#[inline(never)]
fn xor_fold(a: &[u8], b: &[u8]) -> u8 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y))
}

/// Compares byte strings in constant time.
pub(crate) fn eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && xor_fold(a, b) == 0
}
