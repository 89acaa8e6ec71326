// SPDX-License-Identifier: MIT OR Apache-2.0

//! Property tests for the Base64URL identifier codec.

use proptest::prelude::*;
use twd_types::{b64url_decode, b64url_encode};

proptest! {
    #[test]
    fn encode_decode_is_bijective(id in "\\PC*") {
        let encoded = b64url_encode(&id);
        prop_assert_eq!(b64url_decode(&encoded).unwrap(), id);
    }

    #[test]
    fn encoded_form_is_url_safe(id in "\\PC{1,64}") {
        let encoded = b64url_encode(&id);
        let is_url_safe = encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        prop_assert!(is_url_safe);
    }
}
