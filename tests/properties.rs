use pagecrypt::{
    Codec, CodecContext, CodecError, KeyMaterial, PageGeometry, SuiteId, registry,
};
use proptest::prelude::*;
use zeroize::Zeroizing;

const PAGE_SIZE: usize = 1024;

fn suite_id() -> impl Strategy<Value = SuiteId> {
    prop::sample::select(SuiteId::ALL.to_vec())
}

fn context(id: SuiteId, key_byte: u8) -> CodecContext {
    let suite = registry().get(id);
    let key = KeyMaterial::raw(Zeroizing::new(vec![key_byte; suite.key_len()]), [1u8; 16]);
    CodecContext::attach(suite, key, PageGeometry::for_suite(PAGE_SIZE, suite)).unwrap()
}

/// Random page whose reserved trailer is zero, as the pager hands it over.
fn page(id: SuiteId, seed: &[u8]) -> Vec<u8> {
    let reserved = registry().get(id).reserved_bytes();
    let mut page = vec![0u8; PAGE_SIZE];
    for (dst, src) in page[..PAGE_SIZE - reserved].iter_mut().zip(seed.iter().cycle()) {
        *dst = *src;
    }
    page
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn decrypt_inverts_encrypt(
        id in suite_id(),
        page_no in 2u32..u32::MAX,
        seed in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        let mut ctx = context(id, 7);
        let plain = page(id, &seed);

        let mut stored = ctx.transform_write(page_no, &plain).unwrap().to_vec();
        ctx.transform_read(page_no, &mut stored).unwrap();
        prop_assert_eq!(stored, plain);
    }

    #[test]
    fn distinct_pages_get_distinct_ciphertext(
        id in suite_id(),
        a in 1u32..100_000,
        b in 1u32..100_000,
        seed in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        prop_assume!(a != b);
        let mut ctx = context(id, 7);
        let plain = page(id, &seed);

        let first = ctx.transform_write(a, &plain).unwrap().to_vec();
        let second = ctx.transform_write(b, &plain).unwrap().to_vec();
        prop_assert_ne!(first, second);
    }

    #[test]
    fn any_flipped_bit_is_detected(
        id in prop::sample::select(vec![
            SuiteId::Aes256CbcHmacSha256,
            SuiteId::Aes256Gcm,
            SuiteId::XChaCha20Poly1305,
        ]),
        page_no in 1u32..1000,
        offset in 0usize..PAGE_SIZE,
        bit in 0u8..8,
    ) {
        let mut ctx = context(id, 7);
        let plain = page(id, b"authenticated page");

        let mut stored = ctx.transform_write(page_no, &plain).unwrap().to_vec();
        stored[offset] ^= 1 << bit;

        let err = ctx.transform_read(page_no, &mut stored).unwrap_err();
        prop_assert!(
            matches!(err, CodecError::AuthenticationFailure { page } if page == page_no),
            "unexpected error {err:?}"
        );
    }
}

#[test]
fn wrong_key_length_never_creates_a_context() {
    for id in SuiteId::ALL {
        let suite = registry().get(id);
        let key = KeyMaterial::raw(Zeroizing::new(vec![0u8; suite.key_len() + 1]), [0u8; 16]);
        let err = CodecContext::attach(suite, key, PageGeometry::for_suite(PAGE_SIZE, suite))
            .unwrap_err();
        assert!(matches!(err, CodecError::KeyLengthMismatch { .. }), "{id}");
    }
}
