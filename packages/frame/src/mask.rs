/// XORs `buf` in place with `key`, repeating the key every four bytes.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
