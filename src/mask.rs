//! XOR masking of frame payloads (RFC 6455 section 5.3).

/// Masks or unmasks `buf` in place with `key`.
///
/// Byte `i` is XORed with `key[i % 4]`, so applying the same key twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    apply_mask_fast32(buf, key);
}

#[inline]
fn apply_mask_fallback(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Masks the aligned middle of the buffer one `u32` word at a time.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], key: [u8; 4]) {
    // SAFETY: any bit pattern is a valid u32 and align_to_mut only hands out aligned words.
    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, key);

    // the word loop starts `prefix.len()` bytes into the key
    let shift = prefix.len() & 3;
    let mut rotated = key;
    rotated.rotate_left(shift);

    let word_key = u32::from_ne_bytes(rotated);
    for word in words.iter_mut() {
        *word ^= word_key;
    }

    apply_mask_fallback(suffix, rotated);
}
