//! Selection of the protocol's validators out of the full registry by
//! withdrawal credentials.

use lido_oracle_shared::eth_spec::{COMPOUNDING_WITHDRAWAL_PREFIX, ETH1_ADDRESS_WITHDRAWAL_PREFIX};
use lido_oracle_shared::types::{Epoch, Hash256, IndexedValidator};

/// Credentials can be rotated from 0x01 to 0x02 while keeping the same
/// execution address, so matching goes by the address part once the prefix
/// is an execution one.
pub fn is_lido_validator(validator_wc: &Hash256, lido_wc: &Hash256) -> bool {
    if validator_wc == lido_wc {
        return true;
    }
    let execution_prefix =
        validator_wc[0] == ETH1_ADDRESS_WITHDRAWAL_PREFIX || validator_wc[0] == COMPOUNDING_WITHDRAWAL_PREFIX;
    execution_prefix && validator_wc[12..] == lido_wc[12..]
}

pub fn get_lido_validators<'a>(validators: &'a [IndexedValidator], lido_wc: &Hash256) -> Vec<&'a IndexedValidator> {
    validators
        .iter()
        .filter(|v| is_lido_validator(&v.validator.withdrawal_credentials, lido_wc))
        .collect()
}

pub fn filter_slashed_validators<'a, I>(validators: I) -> Vec<&'a IndexedValidator>
where
    I: IntoIterator<Item = &'a IndexedValidator>,
{
    validators.into_iter().filter(|v| v.validator.slashed).collect()
}

/// Keeps only validators that are not yet withdrawable. Exited validators
/// can still be slashed, so filtering goes by `withdrawable_epoch`, not by
/// `exit_epoch`.
pub fn filter_non_withdrawable_validators<'a, I>(slashed_validators: I, epoch: Epoch) -> Vec<&'a IndexedValidator>
where
    I: IntoIterator<Item = &'a IndexedValidator>,
{
    slashed_validators
        .into_iter()
        .filter(|v| v.validator.withdrawable_epoch > epoch)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wc(prefix: u8, fill: u8) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[0] = prefix;
        for b in bytes[12..].iter_mut() {
            *b = fill;
        }
        Hash256::from(bytes)
    }

    #[test]
    fn matches_exact_and_rotated_credentials() {
        let lido = wc(0x01, 0xaa);
        assert!(is_lido_validator(&wc(0x01, 0xaa), &lido));
        assert!(is_lido_validator(&wc(0x02, 0xaa), &lido));
        assert!(!is_lido_validator(&wc(0x01, 0xbb), &lido));
        assert!(!is_lido_validator(&wc(0x00, 0xaa), &lido));
    }
}
