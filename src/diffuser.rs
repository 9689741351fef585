//! Elephant Diffuser A and B: keyless whitening transforms applied between
//! AES-CBC decryption and the sector-key XOR on Vista/Win7 diffuser volumes.
//!
//! Operates in place on a sector viewed as little-endian u32 words. The
//! index walk (where i2/i3 wrap modulo the word count, and exactly when)
//! matches the upstream reference bit for bit; do not "simplify" it.

fn rotl(v: u32, n: u32) -> u32 {
    v.rotate_left(n)
}

fn words_from_le(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn words_to_le(words: &[u32], data: &mut [u8]) {
    for (chunk, w) in data.chunks_exact_mut(4).zip(words.iter()) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
}

fn diffuser_a_decrypt(v: &mut [u32]) {
    let n = v.len();
    for _ in 0..5 {
        let mut i1 = 0usize;
        let mut i2 = n - 2;
        let mut i3 = n - 5;

        while i1 < n - 1 {
            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ rotl(v[i3], 9));
            i2 += 1;
            i3 += 1;
            if i3 >= n {
                i3 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;
            if i2 >= n {
                i2 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ rotl(v[i3], 13));
            i2 += 1;
            i3 += 1;

            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;
        }
    }
}

fn diffuser_a_encrypt(v: &mut [u32]) {
    let n = v.len();
    for _ in 0..5 {
        let mut i1 = 0usize;
        let mut i2 = n - 2;
        let mut i3 = n - 5;

        while i1 < n - 1 {
            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ rotl(v[i3], 9));
            i2 += 1;
            i3 += 1;
            if i3 >= n {
                i3 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;
            if i2 >= n {
                i2 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ rotl(v[i3], 13));
            i2 += 1;
            i3 += 1;

            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;
        }
    }
}

fn diffuser_b_decrypt(v: &mut [u32]) {
    let n = v.len();
    for _ in 0..3 {
        let mut i1 = 0usize;
        let mut i2 = 2usize;
        let mut i3 = 5usize;

        while i1 < n - 1 {
            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;

            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ rotl(v[i3], 10));
            i2 += 1;
            i3 += 1;
            if i2 >= n {
                i2 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;
            if i3 >= n {
                i3 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_add(v[i2] ^ rotl(v[i3], 25));
            i2 += 1;
            i3 += 1;
        }
    }
}

fn diffuser_b_encrypt(v: &mut [u32]) {
    let n = v.len();
    for _ in 0..3 {
        let mut i1 = 0usize;
        let mut i2 = 2usize;
        let mut i3 = 5usize;

        while i1 < n - 1 {
            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;

            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ rotl(v[i3], 10));
            i2 += 1;
            i3 += 1;
            if i2 >= n {
                i2 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ v[i3]);
            i2 += 1;
            i3 += 1;
            if i3 >= n {
                i3 -= n;
            }

            i1 += 1;
            v[i1] = v[i1].wrapping_sub(v[i2] ^ rotl(v[i3], 25));
            i2 += 1;
            i3 += 1;
        }
    }
}

/// Reverses Diffuser-B then Diffuser-A over `data` in place (decrypt path).
/// `data.len()` must be a multiple of 4 and hold at least 8 words.
pub fn decrypt(data: &mut [u8]) {
    debug_assert!(data.len() % 4 == 0 && data.len() / 4 >= 8);
    let mut words = words_from_le(data);
    diffuser_b_decrypt(&mut words);
    diffuser_a_decrypt(&mut words);
    words_to_le(&words, data);
}

/// Applies Diffuser-A then Diffuser-B over `data` in place (encrypt path).
pub fn encrypt(data: &mut [u8]) {
    debug_assert!(data.len() % 4 == 0 && data.len() / 4 >= 8);
    let mut words = words_from_le(data);
    diffuser_a_encrypt(&mut words);
    diffuser_b_encrypt(&mut words);
    words_to_le(&words, data);
}
