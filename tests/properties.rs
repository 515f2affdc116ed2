//! Property tests for decoding and operation masks.

use dbchange::sim::{SimulatedClient, TableSpec};
use dbchange::{DecodeOptions, NotificationDecoder, OperationMask, RowChanges, RowId};
use proptest::prelude::*;

const ROWID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn rowid() -> impl Strategy<Value = String> {
    proptest::collection::vec(0..ROWID_ALPHABET.len(), 18)
        .prop_map(|idx| idx.into_iter().map(|i| ROWID_ALPHABET[i] as char).collect())
}

fn mask() -> impl Strategy<Value = OperationMask> {
    (0u32..0x80).prop_map(OperationMask)
}

proptest! {
    #[test]
    fn rows_decode_in_server_order(rowids in proptest::collection::vec(rowid(), 0..40)) {
        let sim = SimulatedClient::new();
        let ctx = sim.connect();
        let refs: Vec<&str> = rowids.iter().map(String::as_str).collect();
        let desc = sim.change_descriptor(None, &[TableSpec::rows("HR.EMPLOYEES", OperationMask::UPDATE, &refs)]);

        let decoded = NotificationDecoder::new(&sim, ctx.env, ctx.error)
            .decode(desc, DecodeOptions { rowids_requested: true })
            .unwrap();
        let event = &decoded.events[0];
        prop_assert_eq!(event.row_count(), rowids.len() as i64);
        let got: Vec<&str> = event.rowids().map(RowId::as_str).collect();
        prop_assert_eq!(got, refs);
    }

    #[test]
    fn rollup_never_carries_rows(ops in mask(), requested in any::<bool>()) {
        let sim = SimulatedClient::new();
        let ctx = sim.connect();
        let flags = ops | OperationMask::ALL_ROWS;
        let desc = sim.change_descriptor(None, &[TableSpec::rollup("HR.JOBS", flags)]);

        let decoded = NotificationDecoder::new(&sim, ctx.env, ctx.error)
            .decode(desc, DecodeOptions { rowids_requested: requested })
            .unwrap();
        let event = &decoded.events[0];
        prop_assert_eq!(&event.object.as_ref().unwrap().rows, &RowChanges::FullTable);
        prop_assert_eq!(event.row_count(), -1);
        prop_assert!(!event.operations().contains(OperationMask::ALL_ROWS));
    }

    #[test]
    fn effective_mask_is_never_empty(ops in mask()) {
        let effective = ops.effective();
        let watchable = OperationMask(ops.bits() & OperationMask::ALL.bits());
        prop_assert!(!effective.is_empty());
        prop_assert!(OperationMask::ALL.contains(effective));
        if watchable.is_empty() {
            prop_assert_eq!(effective, OperationMask::ALL);
        } else {
            prop_assert_eq!(effective, watchable);
        }
    }

    #[test]
    fn rowid_text_roundtrips(text in rowid()) {
        let parsed: RowId = text.parse().unwrap();
        prop_assert_eq!(parsed.as_str(), text.as_str());
        prop_assert_eq!(parsed.to_string(), text);
    }
}
