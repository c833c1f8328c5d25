//! Property tests for data bus demultiplexing.

use bytes::Bytes;
use proptest::prelude::*;
use snapsend::replica::{Replica, TransferId};
use snapsend::streaming::protocol::{read_frame, write_frame, encode_frame, MessageType};
use snapsend::streaming::{DataFrame, DataPayload, END_FAIL, END_SUCCESS};

fn transfer(share: &str) -> TransferId {
    let replica = Replica {
        id: 1,
        pool: "pool0".to_string(),
        share: share.to_string(),
        appliance: "10.0.0.2".to_string(),
        dpool: "backup".to_string(),
    };
    TransferId::new("10.0.0.1", &replica, "snap")
}

/// Diff chunks; a chunk that is exactly a sentinel token is not a valid chunk.
fn any_chunk() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..2048)
        .prop_filter("sentinel token", |c| c != END_SUCCESS && c != END_FAIL)
}

/// Two interleaved streams: (which transfer, chunk)
fn any_interleaving() -> impl Strategy<Value = Vec<(bool, Vec<u8>)>> {
    proptest::collection::vec((any::<bool>(), any_chunk()), 0..64)
}

proptest! {
    #[test]
    fn prop_demux_preserves_each_stream(steps in any_interleaving(), a_ok in any::<bool>()) {
        let a = transfer("docs");
        let b = transfer("media");

        let mut bus: Vec<Bytes> = steps
            .iter()
            .map(|(is_a, chunk)| {
                let id = if *is_a { a.clone() } else { b.clone() };
                DataFrame::chunk(id, Bytes::from(chunk.clone())).encode()
            })
            .collect();
        bus.push(if a_ok { DataFrame::end_success(a.clone()) } else { DataFrame::end_fail(a.clone()) }.encode());
        bus.push(DataFrame::end_success(b.clone()).encode());

        let decoded_a: Vec<DataPayload> = bus.iter().filter_map(|raw| DataFrame::decode_for(&a, raw)).collect();
        let decoded_b: Vec<DataPayload> = bus.iter().filter_map(|raw| DataFrame::decode_for(&b, raw)).collect();

        let expected_a: Vec<&[u8]> = steps.iter().filter(|(is_a, _)| *is_a).map(|(_, c)| c.as_slice()).collect();
        let expected_b: Vec<&[u8]> = steps.iter().filter(|(is_a, _)| !*is_a).map(|(_, c)| c.as_slice()).collect();

        prop_assert_eq!(decoded_a.len(), expected_a.len() + 1);
        prop_assert_eq!(decoded_b.len(), expected_b.len() + 1);
        for (payload, chunk) in decoded_a.iter().zip(&expected_a) {
            prop_assert_eq!(payload, &DataPayload::Chunk(Bytes::copy_from_slice(chunk)));
        }
        for (payload, chunk) in decoded_b.iter().zip(&expected_b) {
            prop_assert_eq!(payload, &DataPayload::Chunk(Bytes::copy_from_slice(chunk)));
        }

        let last_a = decoded_a.last().unwrap();
        prop_assert_eq!(last_a, if a_ok { &DataPayload::EndSuccess } else { &DataPayload::EndFail });
        prop_assert_eq!(decoded_a.iter().filter(|p| p.is_sentinel()).count(), 1);
        prop_assert_eq!(decoded_b.iter().filter(|p| p.is_sentinel()).count(), 1);
    }

    #[test]
    fn prop_data_frames_survive_tcp_framing(chunks in proptest::collection::vec(any_chunk(), 1..16)) {
        let id = transfer("docs");
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut wire = Vec::new();
            for chunk in &chunks {
                let raw = DataFrame::chunk(id.clone(), Bytes::from(chunk.clone())).encode();
                write_frame(&mut wire, &encode_frame(MessageType::Data, &raw).unwrap()).await.unwrap();
            }

            let mut reader = wire.as_slice();
            for chunk in &chunks {
                let (msg_type, raw) = read_frame(&mut reader).await.unwrap();
                assert_eq!(msg_type, MessageType::Data);
                assert_eq!(
                    DataFrame::decode_for(&id, &raw),
                    Some(DataPayload::Chunk(Bytes::from(chunk.clone())))
                );
            }
            assert!(reader.is_empty());
        });
    }
}
