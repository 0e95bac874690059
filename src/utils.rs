//! Utility functions for identifiers and hashing

use crate::deal::PartyId;
use bech32::Bech32m;
use uuid7::uuid7;

/// Derives a deal id from the full content of the enclosing transaction: the
/// first 32 bits of its SHA-256 digest, placed in the low bits of a `u64`.
pub fn derive_deal_id(tx_content: &[u8]) -> u64 {
    let digest = sha256::digest(tx_content);
    // a hex digest always holds at least four bytes
    let prefix = hex::decode(&digest[..8]).unwrap_or_default();

    prefix.iter().fold(0u64, |id, byte| (id << 8) | *byte as u64)
}

// construct a unique user id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Mints a fresh, unique party identifier under the given prefix.
pub fn new_party_id(hrp: &str) -> anyhow::Result<PartyId> {
    Ok(PartyId::new(new_uuid_to_bech32(hrp)?))
}

/// Parses a transfer memo as a decimal deal id.
pub fn parse_memo(memo: &str) -> Option<u64> {
    let memo = memo.trim();
    if memo.is_empty() || !memo.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    memo.parse().ok()
}
