//! Fixed-key RC4 used by RockChip as an obfuscation step.
//!
//! Every call starts from a freshly keyed state, so applying the
//! transform twice to the same buffer restores it.

/// The key baked into every RockChip boot ROM.
pub const RC4_KEY: [u8; 16] = [
    124, 78, 3, 4, 85, 5, 9, 7, 45, 44, 123, 56, 23, 13, 23, 17,
];

/// Chunk size used for loader payloads (`FlashData`, `FlashBoot`).
pub const RC4_CHUNK_SIZE: usize = 512;

struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[idx as usize];
        }
    }
}

/// Encode or decode `data` in place as one RC4 stream.
pub fn rc4_apply(data: &mut [u8]) {
    Rc4::new(&RC4_KEY).apply(data);
}

/// Encode or decode `data` in place, re-keying every [`RC4_CHUNK_SIZE`]
/// bytes. A trailing partial chunk gets its own fresh stream.
pub fn rc4_apply_chunked(data: &mut [u8]) {
    for chunk in data.chunks_mut(RC4_CHUNK_SIZE) {
        rc4_apply(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_rc4_involution_at_chunk_boundaries() {
        for len in [0usize, 1, 511, 512, 513] {
            let original = pattern(len);

            let mut data = original.clone();
            rc4_apply(&mut data);
            if len > 0 {
                assert_ne!(data, original, "len {len} not transformed");
            }
            rc4_apply(&mut data);
            assert_eq!(data, original, "single stream, len {len}");

            let mut data = original.clone();
            rc4_apply_chunked(&mut data);
            rc4_apply_chunked(&mut data);
            assert_eq!(data, original, "chunked, len {len}");
        }
    }

    #[test]
    fn test_chunked_tail_is_rekeyed() {
        let mut long = vec![0u8; 513];
        rc4_apply_chunked(&mut long);

        let mut head = vec![0u8; 512];
        rc4_apply(&mut head);
        let mut tail = vec![0u8; 1];
        rc4_apply(&mut tail);

        assert_eq!(&long[..512], &head[..]);
        assert_eq!(long[512], tail[0]);
    }

    #[test]
    fn test_single_stream_differs_from_chunked_past_512() {
        let mut a = vec![0u8; 1024];
        let mut b = vec![0u8; 1024];
        rc4_apply(&mut a);
        rc4_apply_chunked(&mut b);
        assert_eq!(a[..512], b[..512]);
        assert_ne!(a[512..], b[512..]);
    }
}
