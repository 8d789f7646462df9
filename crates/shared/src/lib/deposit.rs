//! Deposit proof-of-possession validation, guarding vault valuations against
//! deposit front-running.
//!
//! Signing root construction follows the consensus specs:
//! https://github.com/ethereum/consensus-specs/blob/dev/specs/phase0/beacon-chain.md#compute_domain

use blst::min_pk::{PublicKey, Signature};
use blst::BLST_ERROR;
use ssz_types::{typenum, FixedVector};
use tree_hash::TreeHash;
use tree_hash_derive::TreeHash;

use crate::eth_spec::DOMAIN_DEPOSIT;
use crate::types::{BlsPubkey, BlsSignatureBytes, ForkVersion, Gwei, Hash256, ZERO_HASH};

const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

#[derive(Debug, Clone, PartialEq, TreeHash)]
struct DepositMessage {
    pubkey: FixedVector<u8, typenum::U48>,
    withdrawal_credentials: Hash256,
    amount: Gwei,
}

#[derive(Debug, Clone, PartialEq, TreeHash)]
struct ForkData {
    current_version: FixedVector<u8, typenum::U4>,
    genesis_validators_root: Hash256,
}

#[derive(Debug, Clone, PartialEq, TreeHash)]
struct SigningData {
    object_root: Hash256,
    domain: Hash256,
}

fn compute_fork_data_root(fork_version: ForkVersion, genesis_validators_root: Hash256) -> Hash256 {
    ForkData {
        current_version: fork_version.as_slice().to_vec().into(),
        genesis_validators_root,
    }
    .tree_hash_root()
}

fn compute_domain(domain_type: [u8; 4], fork_version: ForkVersion, genesis_validators_root: Hash256) -> Hash256 {
    let fork_data_root = compute_fork_data_root(fork_version, genesis_validators_root);
    let mut domain = [0u8; 32];
    domain[..4].copy_from_slice(&domain_type);
    domain[4..].copy_from_slice(&fork_data_root.as_slice()[..28]);
    domain.into()
}

fn compute_signing_root(message: &DepositMessage, domain: Hash256) -> Hash256 {
    SigningData {
        object_root: message.tree_hash_root(),
        domain,
    }
    .tree_hash_root()
}

/// Whether the deposit's BLS proof-of-possession is valid for the genesis
/// fork. Deposits are signed against the genesis validators root of zero.
/// Malformed keys or signatures count as invalid rather than erroring: the
/// caller treats either the same way (the deposit is rejected), and the
/// verdict stays a pure function of the inputs.
pub fn is_valid_deposit_signature(
    pubkey: &BlsPubkey,
    withdrawal_credentials: &Hash256,
    amount_gwei: Gwei,
    signature: &BlsSignatureBytes,
    genesis_fork_version: ForkVersion,
) -> bool {
    let message = DepositMessage {
        pubkey: pubkey.as_slice().to_vec().into(),
        withdrawal_credentials: *withdrawal_credentials,
        amount: amount_gwei,
    };
    let domain = compute_domain(DOMAIN_DEPOSIT, genesis_fork_version, ZERO_HASH);
    let signing_root = compute_signing_root(&message, domain);

    let Ok(public_key) = PublicKey::key_validate(pubkey.as_slice()) else {
        tracing::debug!(pubkey = %pubkey, "Deposit pubkey is not a valid BLS public key");
        return false;
    };
    let Ok(sig) = Signature::from_bytes(signature.as_slice()) else {
        tracing::debug!(pubkey = %pubkey, "Deposit signature bytes are not a valid G2 point");
        return false;
    };

    sig.verify(true, signing_root.as_slice(), BLS_DST, &[], &public_key, true) == BLST_ERROR::BLST_SUCCESS
}

#[cfg(test)]
mod tests {
    use blst::min_pk::SecretKey;

    use super::*;

    fn signed_deposit(
        ikm: &[u8; 32],
        withdrawal_credentials: Hash256,
        amount: Gwei,
        fork_version: ForkVersion,
    ) -> (BlsPubkey, BlsSignatureBytes) {
        let sk = SecretKey::key_gen(ikm, &[]).unwrap();
        let pk = sk.sk_to_pk();
        let pubkey = BlsPubkey::from_slice(&pk.to_bytes());

        let message = DepositMessage {
            pubkey: pk.to_bytes().to_vec().into(),
            withdrawal_credentials,
            amount,
        };
        let domain = compute_domain(DOMAIN_DEPOSIT, fork_version, ZERO_HASH);
        let root = compute_signing_root(&message, domain);
        let sig = sk.sign(root.as_slice(), BLS_DST, &[]);
        (pubkey, BlsSignatureBytes::from_slice(&sig.to_bytes()))
    }

    #[test]
    fn accepts_a_correctly_signed_deposit() {
        let wc = Hash256::repeat_byte(0x01);
        let fork = ForkVersion::from([0, 0, 0, 0]);
        let (pubkey, signature) = signed_deposit(&[7u8; 32], wc, 32_000_000_000, fork);

        assert!(is_valid_deposit_signature(&pubkey, &wc, 32_000_000_000, &signature, fork));
    }

    #[test]
    fn rejects_wrong_withdrawal_credentials() {
        let wc = Hash256::repeat_byte(0x01);
        let fork = ForkVersion::from([0, 0, 0, 0]);
        let (pubkey, signature) = signed_deposit(&[7u8; 32], wc, 32_000_000_000, fork);

        let other_wc = Hash256::repeat_byte(0x02);
        assert!(!is_valid_deposit_signature(&pubkey, &other_wc, 32_000_000_000, &signature, fork));
    }

    #[test]
    fn rejects_wrong_fork_version() {
        let wc = Hash256::repeat_byte(0x01);
        let fork = ForkVersion::from([0, 0, 0, 0]);
        let (pubkey, signature) = signed_deposit(&[7u8; 32], wc, 32_000_000_000, fork);

        let other_fork = ForkVersion::from([4, 2, 0, 0]);
        assert!(!is_valid_deposit_signature(&pubkey, &wc, 32_000_000_000, &signature, other_fork));
    }

    #[test]
    fn verdict_is_deterministic() {
        let wc = Hash256::repeat_byte(0x01);
        let fork = ForkVersion::from([0, 0, 0, 0]);
        let (pubkey, signature) = signed_deposit(&[9u8; 32], wc, 1_000_000_000, fork);

        let first = is_valid_deposit_signature(&pubkey, &wc, 1_000_000_000, &signature, fork);
        for _ in 0..10 {
            assert_eq!(
                is_valid_deposit_signature(&pubkey, &wc, 1_000_000_000, &signature, fork),
                first
            );
        }
    }

    #[test]
    fn garbage_signature_bytes_are_invalid() {
        let wc = Hash256::repeat_byte(0x01);
        let fork = ForkVersion::from([0, 0, 0, 0]);
        let (pubkey, _) = signed_deposit(&[7u8; 32], wc, 32_000_000_000, fork);

        let garbage = BlsSignatureBytes::repeat_byte(0xaa);
        assert!(!is_valid_deposit_signature(&pubkey, &wc, 32_000_000_000, &garbage, fork));
    }
}
