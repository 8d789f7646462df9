//! The committed report hash is `keccak256(abi.encode(tuple))` and has to
//! match what every other committee member computes. These tests pin the
//! encodings against independently hand-assembled ABI bytes, so a field
//! reorder or type drift in the bindings shows up as a hash change.

use alloy_primitives::{keccak256, Bytes, U256};
use alloy_sol_types::SolValue;

use lido_oracle_client::execution::contracts::{CsFeeOracle, ExitBusOracle};
use lido_oracle_modules::consensus::ReportEncoding;
use lido_oracle_shared::types::Hash256;

fn word_u64(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn string_tail(value: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&word_u64(value.len() as u64));
    let mut padded = value.as_bytes().to_vec();
    padded.resize(value.len().div_ceil(32) * 32, 0);
    out.extend_from_slice(&padded);
    out
}

#[test]
fn performance_report_matches_hand_assembled_abi() {
    let tree_root = Hash256::repeat_byte(0xaa);
    let report = CsFeeOracle::ReportData {
        consensusVersion: U256::from(2),
        refSlot: U256::from(100),
        treeRoot: tree_root,
        treeCid: "QmTree".to_owned(),
        logCid: "QmLog".to_owned(),
        distributed: U256::from(42),
    };

    // Head: 6 words; the two strings are offsets into the tail.
    let mut expected = Vec::new();
    expected.extend_from_slice(&word_u64(2));
    expected.extend_from_slice(&word_u64(100));
    expected.extend_from_slice(tree_root.as_slice());
    expected.extend_from_slice(&word_u64(6 * 32)); // treeCid offset
    expected.extend_from_slice(&word_u64(6 * 32 + 64)); // logCid offset
    expected.extend_from_slice(&word_u64(42));
    expected.extend(string_tail("QmTree"));
    expected.extend(string_tail("QmLog"));

    let encoded = ReportEncoding::abi_encode(&report);
    assert_eq!(encoded, expected);
    assert_eq!(report.hash(), keccak256(&expected));
}

#[test]
fn ejector_report_matches_hand_assembled_abi() {
    let data = Bytes::from(vec![0x11u8; 67]);
    let report = ExitBusOracle::ReportData {
        consensusVersion: U256::from(1),
        refSlot: U256::from(9000),
        requestsCount: U256::from(1),
        dataFormat: U256::from(1),
        data: data.clone(),
    };

    let mut expected = Vec::new();
    expected.extend_from_slice(&word_u64(1));
    expected.extend_from_slice(&word_u64(9000));
    expected.extend_from_slice(&word_u64(1));
    expected.extend_from_slice(&word_u64(1));
    expected.extend_from_slice(&word_u64(5 * 32)); // data offset
    expected.extend_from_slice(&word_u64(67)); // data length
    let mut padded = data.to_vec();
    padded.resize(96, 0);
    expected.extend_from_slice(&padded);

    let encoded = ReportEncoding::abi_encode(&report);
    assert_eq!(encoded, expected);
    assert_eq!(report.hash(), keccak256(&expected));
}

#[test]
fn report_tuples_roundtrip_through_abi() {
    let report = CsFeeOracle::ReportData {
        consensusVersion: U256::from(2),
        refSlot: U256::from(12345),
        treeRoot: Hash256::repeat_byte(0x77),
        treeCid: "bafybeigdyrzt5".to_owned(),
        logCid: "bafybeihdwdce".to_owned(),
        distributed: U256::from(10u64).pow(U256::from(21)),
    };
    let decoded = CsFeeOracle::ReportData::abi_decode(&ReportEncoding::abi_encode(&report), true).unwrap();
    assert_eq!(decoded.consensusVersion, report.consensusVersion);
    assert_eq!(decoded.refSlot, report.refSlot);
    assert_eq!(decoded.treeRoot, report.treeRoot);
    assert_eq!(decoded.treeCid, report.treeCid);
    assert_eq!(decoded.logCid, report.logCid);
    assert_eq!(decoded.distributed, report.distributed);

    let report = ExitBusOracle::ReportData {
        consensusVersion: U256::from(1),
        refSlot: U256::from(1),
        requestsCount: U256::ZERO,
        dataFormat: U256::from(1),
        data: Bytes::new(),
    };
    let decoded = ExitBusOracle::ReportData::abi_decode(&ReportEncoding::abi_encode(&report), true).unwrap();
    assert_eq!(decoded.data, report.data);
    assert_eq!(decoded.requestsCount, report.requestsCount);
}

#[test]
fn identical_reports_hash_identically_and_differing_ones_do_not() {
    let report = |distributed: u64| CsFeeOracle::ReportData {
        consensusVersion: U256::from(2),
        refSlot: U256::from(100),
        treeRoot: Hash256::ZERO,
        treeCid: String::new(),
        logCid: "QmLog".to_owned(),
        distributed: U256::from(distributed),
    };
    assert_eq!(report(0).hash(), report(0).hash());
    assert_ne!(report(0).hash(), report(1).hash());
}
