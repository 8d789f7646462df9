use crate::types::{Gwei, Wei};

pub fn usize_to_u64(val: usize) -> u64 {
    let result = val.try_into();
    match result {
        Ok(v) => v,
        // Intentional panic - if we're getting here, something is wrong with either code or the
        // machine architecture - application won't be able to continue successfully
        Err(error) => panic!("Couldn't convert usize to u64: {error:?}"),
    }
}

pub fn u64_to_usize(val: u64) -> usize {
    let result = val.try_into();
    match result {
        Ok(v) => v,
        // Intentional panic - if we're getting here, something is wrong with either code or the
        // machine architecture - application won't be able to continue successfully
        Err(error) => panic!("Couldn't convert u64 to usize: {error:?}"),
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IntegerError {
    #[error("Integer overflow happened")]
    Overflow,
}

pub fn erroring_add(lhs: u64, rhs: u64) -> Result<u64, IntegerError> {
    match lhs.checked_add(rhs) {
        Some(val) => Ok(val),
        None => Err(IntegerError::Overflow),
    }
}

pub fn gwei_to_wei(amount: Gwei) -> Wei {
    Wei::from(amount) * Wei::from(10u64.pow(9))
}

/// Inclusive `[l, r]` sequence. Empty when `l > r`.
pub fn sequence(l: u64, r: u64) -> impl Iterator<Item = u64> {
    l..=r
}

/// `numerator / denominator` rounded towards positive infinity.
/// Panics on a zero denominator, same as plain division.
pub fn div_ceil(numerator: Wei, denominator: Wei) -> Wei {
    let (quot, rem) = numerator.div_rem(denominator);
    if rem.is_zero() {
        quot
    } else {
        quot + Wei::from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div_ceil_rounds_up() {
        assert_eq!(div_ceil(Wei::from(10), Wei::from(5)), Wei::from(2));
        assert_eq!(div_ceil(Wei::from(11), Wei::from(5)), Wei::from(3));
        assert_eq!(div_ceil(Wei::from(0), Wei::from(5)), Wei::from(0));
    }

    #[test]
    fn gwei_conversion() {
        assert_eq!(gwei_to_wei(32_000_000_000), Wei::from(32u128 * 10u128.pow(18)));
    }
}
