//! The precompile's wire-level entry point: 4-byte selector dispatch over a
//! fixed-width big-endian byte encoding, decoupled from the economics core
//! in [`super::precompile`] (§6.3).
//!
//! Inputs are NOT Solidity ABI-encoded: every field is a fixed-width,
//! sequential, big-endian byte range per §6.3, so decoding is a sequence of
//! "take N bytes" reads with no dynamic offsets to resolve.

use alloy_primitives::{keccak256, Address, U256};

use super::pagination::Cursor;
use super::precompile::{StakingError, StakingPrecompile};

/// Abstract signature-verification collaborator (§1: crypto primitives are
/// consumed through an abstract sign/verify interface, never implemented
/// in this crate). A host wires in a real secp256k1/BLS backend; tests use
/// a stub that always accepts or always rejects.
pub trait Verifier {
    /// Verify a compressed secp256k1 signature over `message`.
    fn verify_secp256k1(&self, pubkey: &[u8; 33], message: &[u8], signature: &[u8; 64]) -> bool;
    /// Verify a compressed BLS signature over `message`.
    fn verify_bls(&self, pubkey: &[u8; 48], message: &[u8], signature: &[u8; 96]) -> bool;
}

/// Compute the 4-byte selector the same way the host's transaction
/// pipeline does: the first four bytes of `keccak256` of the canonical
/// method signature. Not cached: dispatch is not a hot path, and the
/// crate's non-goals keep an on-the-fly real `keccak256` call here rather
/// than hand-rolling a hash (§1 "Cryptographic primitives... consumed
/// through abstract sign/verify interfaces" governs signatures, not this
/// mechanical ABI bookkeeping already backed by `alloy-primitives`).
fn selector_of(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Maximum entries returned by a single `get_consensus_valset` page.
const CONSENSUS_VALSET_PAGE_SIZE: usize = 50;

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], StakingError> {
    if input.len() < n {
        return Err(StakingError::InvalidInput);
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn take_address(input: &mut &[u8]) -> Result<Address, StakingError> {
    let bytes = take(input, 20)?;
    Ok(Address::from_slice(bytes))
}

fn take_u256(input: &mut &[u8]) -> Result<U256, StakingError> {
    let bytes = take(input, 32)?;
    Ok(U256::from_be_slice(bytes))
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], StakingError> {
    let bytes = take(input, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// U256 to u64, rejecting values that don't fit rather than truncating
/// silently (§6.3 "Unknown selectors return MethodNotSupported"-style
/// strictness extended to malformed numeric fields generally).
fn u256_to_u64(v: U256) -> Result<u64, StakingError> {
    if v > U256::from(u64::MAX) {
        return Err(StakingError::InvalidInput);
    }
    Ok(v.to::<u64>())
}

fn ensure_exhausted(input: &[u8]) -> Result<(), StakingError> {
    if input.is_empty() {
        Ok(())
    } else {
        Err(StakingError::InvalidInput)
    }
}

fn encode_addresses(addrs: &[Address]) -> Vec<u8> {
    addrs.iter().flat_map(|a| a.into_array()).collect()
}

fn encode_page(addrs: &[Address], next: Option<Cursor>) -> Vec<u8> {
    let mut out = encode_addresses(addrs);
    out.extend_from_slice(&next.unwrap_or(Cursor::START).encode());
    out
}

/// Dispatch a raw `(selector, input)` call against `precompile`, mirroring
/// the single-contract-address/function-selector ABI of §6.3. `sender` and
/// `value` come from the surrounding call frame exactly as any other
/// precompile would receive them.
pub fn dispatch(
    precompile: &mut StakingPrecompile,
    verifier: &dyn Verifier,
    selector: [u8; 4],
    mut input: &[u8],
    sender: Address,
    value: U256,
) -> Result<Vec<u8>, StakingError> {
    if selector == selector_of("addValidator(bytes,bytes,address,uint256,uint256,bytes,bytes)") {
        return dispatch_add_validator(precompile, verifier, input, value);
    }
    if selector == selector_of("delegate(address)") {
        let validator = take_address(&mut input)?;
        ensure_exhausted(input)?;
        precompile.delegate(sender, validator, value)?;
        return Ok(Vec::new());
    }
    if selector == selector_of("undelegate(address,uint256)") {
        let validator = take_address(&mut input)?;
        let amount = take_u256(&mut input)?;
        ensure_exhausted(input)?;
        let id = precompile.undelegate(sender, validator, amount)?;
        return Ok(id.to_be_bytes().to_vec());
    }
    if selector == selector_of("withdraw(address,uint256)") {
        let validator = take_address(&mut input)?;
        let id_word = take_u256(&mut input)?;
        ensure_exhausted(input)?;
        let id = u256_to_u64(id_word)?;
        let amount = precompile.withdraw_by_id(sender, validator, id)?;
        return Ok(amount.to_be_bytes::<32>().to_vec());
    }
    if selector == selector_of("compound(address)") {
        let validator = take_address(&mut input)?;
        ensure_exhausted(input)?;
        let compounded = precompile.compound(sender, validator)?;
        return Ok(compounded.to_be_bytes::<32>().to_vec());
    }
    if selector == selector_of("claimRewards(address)") {
        let validator = take_address(&mut input)?;
        ensure_exhausted(input)?;
        let paid = precompile.claim_rewards(sender, validator)?;
        return Ok(paid.to_be_bytes::<32>().to_vec());
    }
    if selector == selector_of("getConsensusValset(uint256)") {
        let start_index = u256_to_u64(take_u256(&mut input)?)? as usize;
        ensure_exhausted(input)?;
        let full = precompile.get_consensus_valset();
        let end = (start_index.saturating_add(CONSENSUS_VALSET_PAGE_SIZE)).min(full.len());
        let page = if start_index >= full.len() { &[][..] } else { &full[start_index..end] };
        return Ok(encode_addresses(page));
    }
    if selector == selector_of("getDelegatorsForValidator(address,bytes32,uint256)") {
        let validator = take_address(&mut input)?;
        let cursor = Cursor::decode(take_array::<20>(&mut input)?);
        let limit = u256_to_u64(take_u256(&mut input)?)? as usize;
        ensure_exhausted(input)?;
        let page = precompile.get_delegators_for_validator(validator, cursor, limit);
        return Ok(encode_page(&page.items, page.next));
    }
    if selector == selector_of("getValidatorsForDelegator(address,bytes32,uint256)") {
        let delegator = take_address(&mut input)?;
        let cursor = Cursor::decode(take_array::<20>(&mut input)?);
        let limit = u256_to_u64(take_u256(&mut input)?)? as usize;
        ensure_exhausted(input)?;
        let page = precompile.get_validators_for_delegator(delegator, cursor, limit);
        return Ok(encode_page(&page.items, page.next));
    }
    Err(StakingError::MethodNotSupported)
}

/// `add_validator`'s wire layout (§6.3, §4.5 table): a sequential run of
/// fixed-width fields, no ABI offsets, ending with both signatures over the
/// concatenation of every field that precedes them.
fn dispatch_add_validator(
    precompile: &mut StakingPrecompile,
    verifier: &dyn Verifier,
    mut input: &[u8],
    declared_stake_value: U256,
) -> Result<Vec<u8>, StakingError> {
    let full_input = input;
    let secp_pubkey = take_array::<33>(&mut input)?;
    let bls_pubkey = take_array::<48>(&mut input)?;
    let auth_address = take_address(&mut input)?;
    let stake = take_u256(&mut input)?;
    let commission_wad = take_u256(&mut input)?;
    let secp_sig = take_array::<64>(&mut input)?;
    let bls_sig = take_array::<96>(&mut input)?;
    ensure_exhausted(input)?;

    if stake != declared_stake_value {
        return Err(StakingError::InvalidInput);
    }
    if commission_wad > U256::from(super::types::UNIT_BIAS) {
        return Err(StakingError::InvalidInput);
    }

    // Signatures cover everything before them: pubkeys, address, stake,
    // commission (§4.5 table: "both signatures must verify over the
    // concatenated input").
    let signed_len = full_input.len() - secp_sig.len() - bls_sig.len();
    let signed_message = &full_input[..signed_len];

    if !verifier.verify_secp256k1(&secp_pubkey, signed_message, &secp_sig) {
        return Err(StakingError::SecpSignatureVerificationFailed);
    }
    if !verifier.verify_bls(&bls_pubkey, signed_message, &bls_sig) {
        return Err(StakingError::BlsSignatureVerificationFailed);
    }

    // UNIT_BIAS-scaled commission down to the precompile's internal
    // basis-point representation (§4.5, rounds toward zero).
    let commission_bps = (commission_wad * U256::from(10_000u32) / U256::from(super::types::UNIT_BIAS)).to::<u16>();
    precompile.add_validator(auth_address, stake, commission_bps)?;
    Ok(Vec::new())
}

/// A verifier that always accepts, for tests that don't exercise signature
/// rejection paths.
#[cfg(any(test, feature = "test-util"))]
pub struct AcceptAllVerifier;

#[cfg(any(test, feature = "test-util"))]
impl Verifier for AcceptAllVerifier {
    fn verify_secp256k1(&self, _pubkey: &[u8; 33], _message: &[u8], _signature: &[u8; 64]) -> bool {
        true
    }
    fn verify_bls(&self, _pubkey: &[u8; 48], _message: &[u8], _signature: &[u8; 96]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staking::types::{MIN_VALIDATE_STAKE, MON};

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::from(bytes)
    }

    fn add_validator_input(auth: Address, stake: U256, commission_wad: U256) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0u8; 33]);
        buf.extend_from_slice(&[0u8; 48]);
        buf.extend_from_slice(&auth.into_array());
        buf.extend_from_slice(&stake.to_be_bytes::<32>());
        buf.extend_from_slice(&commission_wad.to_be_bytes::<32>());
        buf.extend_from_slice(&[0u8; 64]);
        buf.extend_from_slice(&[0u8; 96]);
        buf
    }

    #[test]
    fn unknown_selector_rejected() {
        let mut sp = StakingPrecompile::new();
        let err = dispatch(&mut sp, &AcceptAllVerifier, [0xde, 0xad, 0xbe, 0xef], &[], addr(1), U256::ZERO)
            .unwrap_err();
        assert_eq!(err, StakingError::MethodNotSupported);
    }

    #[test]
    fn add_validator_dispatch_roundtrips_through_core() {
        let mut sp = StakingPrecompile::new();
        let stake = U256::from(MIN_VALIDATE_STAKE);
        let input = add_validator_input(addr(1), stake, U256::ZERO);
        let selector = selector_of("addValidator(bytes,bytes,address,uint256,uint256,bytes,bytes)");
        dispatch(&mut sp, &AcceptAllVerifier, selector, &input, addr(1), stake).unwrap();
        assert!(sp.validator(addr(1)).is_some());
    }

    #[test]
    fn add_validator_rejects_stake_mismatch_with_declared_value() {
        let mut sp = StakingPrecompile::new();
        let input = add_validator_input(addr(1), U256::from(MIN_VALIDATE_STAKE), U256::ZERO);
        let selector = selector_of("addValidator(bytes,bytes,address,uint256,uint256,bytes,bytes)");
        let err = dispatch(&mut sp, &AcceptAllVerifier, selector, &input, addr(1), U256::from(MON * 2))
            .unwrap_err();
        assert_eq!(err, StakingError::InvalidInput);
    }

    #[test]
    fn delegate_dispatch_credits_message_value() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        let selector = selector_of("delegate(address)");
        let input = addr(1).into_array();
        dispatch(&mut sp, &AcceptAllVerifier, selector, &input, addr(2), U256::from(MON)).unwrap();
        assert_eq!(sp.delegator(addr(2), addr(1)).unwrap().delta_stake.unwrap().amount, U256::from(MON));
    }

    #[test]
    fn truncated_input_is_invalid_rather_than_panicking() {
        let mut sp = StakingPrecompile::new();
        let selector = selector_of("delegate(address)");
        let err = dispatch(&mut sp, &AcceptAllVerifier, selector, &[0u8; 4], addr(2), U256::ZERO).unwrap_err();
        assert_eq!(err, StakingError::InvalidInput);
    }

    #[test]
    fn get_consensus_valset_pages_from_start_index() {
        let mut sp = StakingPrecompile::new();
        for i in 1..=3u8 {
            sp.add_validator(addr(i), U256::from(crate::staking::types::ACTIVE_VALIDATOR_STAKE) + U256::from(i), 0)
                .unwrap();
        }
        for _ in 0..3 {
            sp.syscall_on_epoch_change();
        }
        let selector = selector_of("getConsensusValset(uint256)");
        let out = dispatch(&mut sp, &AcceptAllVerifier, selector, &U256::from(1u64).to_be_bytes::<32>(), addr(9), U256::ZERO).unwrap();
        assert_eq!(out.len(), 40);
    }
}
