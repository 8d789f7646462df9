//! Packed encoding of exit requests, format 1 of the exit-bus contract:
//! `(module_id:3B | node_operator_id:8B | validator_index:8B | pubkey:48B)`
//! per request, big-endian fields, no separators.

use alloy_primitives::Bytes;

use lido_oracle_shared::types::BlsPubkey;

pub const DATA_FORMAT_LIST: u64 = 1;

const REQUEST_SIZE: usize = 3 + 8 + 8 + 48;

/// (staking module id, node operator id) pair identifying an operator
/// protocol-wide.
pub type NodeOperatorGlobalIndex = (u64, u64);

pub fn encode_data(requests: &[(NodeOperatorGlobalIndex, u64, BlsPubkey)]) -> (Bytes, u64) {
    let mut out = Vec::with_capacity(requests.len() * REQUEST_SIZE);
    for ((module_id, node_operator_id), validator_index, pubkey) in requests {
        out.extend_from_slice(&module_id.to_be_bytes()[5..]);
        out.extend_from_slice(&node_operator_id.to_be_bytes());
        out.extend_from_slice(&validator_index.to_be_bytes());
        out.extend_from_slice(pubkey.as_slice());
    }
    (out.into(), DATA_FORMAT_LIST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fixed_width_records() {
        let pubkey = BlsPubkey::repeat_byte(0xaa);
        let (data, format) = encode_data(&[((1, 2), 3, pubkey), ((0x0a0b0c, u64::MAX, 7), 0, pubkey)]);

        assert_eq!(format, DATA_FORMAT_LIST);
        assert_eq!(data.len(), 2 * REQUEST_SIZE);

        // First record: module 1 in 3 bytes, operator 2, index 3.
        assert_eq!(&data[..3], &[0, 0, 1]);
        assert_eq!(&data[3..11], &2u64.to_be_bytes());
        assert_eq!(&data[11..19], &3u64.to_be_bytes());
        assert_eq!(&data[19..67], pubkey.as_slice());

        // Second record starts right after, module id keeps its low 3 bytes.
        assert_eq!(&data[67..70], &[0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn empty_request_list_encodes_to_empty_data() {
        let (data, _) = encode_data(&[]);
        assert!(data.is_empty());
    }
}
