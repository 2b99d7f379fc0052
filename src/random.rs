use rand::{rngs::OsRng, Rng};

/// The base32 alphabet used for every identifier the gateway mints: stream
/// ids, stream secrets, and randomized blob paths.
const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Returns `n` characters drawn uniformly from the base32 alphabet, sourced
/// from the operating system CSPRNG.
pub fn string(n: usize) -> String {
    let mut rng = OsRng;
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Returns a random relative blob path in the standard 4/4/16/48 shape.
pub fn path() -> String {
    path_with(&[4, 4, 16, 48])
}

/// Returns a random relative blob path with one segment per entry in `lens`.
pub fn path_with(lens: &[usize]) -> String {
    lens.iter()
        .map(|&n| string(n))
        .collect::<Vec<String>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_have_the_requested_length() {
        for n in [0, 1, 32, 96] {
            assert_eq!(string(n).len(), n);
        }
    }

    #[test]
    fn strings_stay_inside_the_alphabet() {
        let s = string(512);
        assert!(s.bytes().all(|b| ALPHABET.contains(&b)), "bad chars in {}", s);
    }

    #[test]
    fn strings_do_not_repeat() {
        // With 160 bits of entropy a collision here means the generator is
        // broken, not that we got unlucky.
        assert_ne!(string(32), string(32));
    }

    #[test]
    fn paths_have_the_standard_shape() {
        let p = path();
        let segments: Vec<&str> = p.split('/').collect();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].len(), 4);
        assert_eq!(segments[1].len(), 4);
        assert_eq!(segments[2].len(), 16);
        assert_eq!(segments[3].len(), 48);
    }

    #[test]
    fn paths_honor_custom_segment_lengths() {
        assert_eq!(path_with(&[2]).len(), 2);
        assert_eq!(path_with(&[2, 3]).len(), 2 + 1 + 3);
    }
}
