//! Property-based tests for transfer codes and frame decoding.
//!
//! Uses proptest to verify:
//! 1. Generated codes always canonicalize to themselves.
//! 2. Canonicalization is case-insensitive.
//! 3. Arbitrary strings never cause a panic in `canonicalize`.
//! 4. Arbitrary text never causes a panic in the WS frame decoder.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;

use firma_sign_proto::code::{self, ALPHABET, CODE_LEN};
use firma_sign_proto::ws;

/// Strategy for a valid code: 6 chars drawn from the alphabet.
fn arb_valid_code() -> impl Strategy<Value = String> {
    prop::collection::vec(0..ALPHABET.len(), CODE_LEN)
        .prop_map(|idx| idx.into_iter().map(|i| char::from(ALPHABET[i])).collect())
}

proptest! {
    #[test]
    fn generated_codes_are_fixed_points(seed in any::<u64>()) {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let generated = code::generate_with(&mut rng);
        prop_assert_eq!(code::canonicalize(&generated).unwrap(), generated);
    }

    #[test]
    fn canonicalize_is_case_insensitive(valid in arb_valid_code()) {
        let lower = valid.to_ascii_lowercase();
        prop_assert_eq!(code::canonicalize(&lower).unwrap(), valid);
    }

    #[test]
    fn canonicalize_never_panics(input in "\\PC*") {
        // Any outcome is fine; it just must not panic.
        let _ = code::canonicalize(&input);
    }

    #[test]
    fn canonical_output_stays_in_alphabet(input in "\\PC*") {
        if let Ok(canonical) = code::canonicalize(&input) {
            prop_assert_eq!(canonical.len(), CODE_LEN);
            for c in canonical.chars() {
                prop_assert!(ALPHABET.contains(&(c as u8)));
            }
        }
    }

    #[test]
    fn frame_decoder_never_panics(input in "\\PC*") {
        let _ = ws::decode_client(&input);
        let _ = ws::decode_server(&input);
    }
}
