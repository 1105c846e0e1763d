//! Property-Based Tests for the Cache File Format
//!
//! # Test Properties
//!
//! 1. **Header decoding**: any encodable header decodes to itself and
//!    reports its exact length
//! 2. **Record header decoding**: any non-Eof record header survives
//!    encoding, and an unknown code byte is always rejected
//! 3. **Filename sanitization**: sanitized names never contain a separator
//!    and always desanitize back to the original

#![cfg(test)]

use proptest::prelude::*;

use super::{EntryCode, FileHeader, RecordHeader};
use crate::naming::{desanitize, sanitize};

// =============================================================================
// Property Strategies
// =============================================================================

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_ %;?/:#&=+*$,<>~.-]{0,40}"
}

fn live_code_strategy() -> impl Strategy<Value = EntryCode> {
    prop_oneof![
        Just(EntryCode::Valid),
        Just(EntryCode::Overwritten),
        Just(EntryCode::Deleted),
    ]
}

// =============================================================================
// Header Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_header_decodes_to_itself(
        entry_count in any::<u64>(),
        uuid in any::<u64>(),
        cache_name in name_strategy(),
        set_name in name_strategy(),
        tag_name in proptest::option::of(name_strategy()),
    ) {
        let header = FileHeader { entry_count, uuid, cache_name, set_name, tag_name };
        let bytes = header.encode();

        let (decoded, len) = FileHeader::decode(&bytes)?;
        prop_assert_eq!(len, bytes.len() as u64);
        prop_assert_eq!(len, header.encoded_len());
        prop_assert_eq!(decoded, header);
    }

    #[test]
    fn prop_record_header_decodes_to_itself(
        code in live_code_strategy(),
        key_hash in any::<u32>(),
        key_len in any::<u32>(),
        object_len in any::<u32>(),
    ) {
        let header = RecordHeader { code, key_hash, key_len, object_len };
        let decoded = RecordHeader::decode(0, &header.encode())?;
        prop_assert_eq!(decoded, header);
    }

    #[test]
    fn prop_unknown_code_rejected(
        code in any::<u8>().prop_filter("known code", |c| EntryCode::from_byte(*c).is_none()),
        rest in proptest::collection::vec(any::<u8>(), 12),
    ) {
        let mut bytes = vec![code];
        bytes.extend(rest);
        prop_assert!(RecordHeader::decode(0, &bytes).is_err());
    }

    #[test]
    fn prop_sanitize_reversible(name in name_strategy()) {
        let clean = sanitize(&name);
        prop_assert!(!clean.contains('_'));
        prop_assert!(!clean.contains('/'));
        prop_assert_eq!(desanitize(&clean), name);
    }
}
