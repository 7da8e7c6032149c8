//! Chunk-invariance and round-trip laws for the frame codec.

use bytes::Bytes;
use futures::StreamExt;
use proptest::prelude::*;
use seqwire_framing::{BufferArena, FrameCodec};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

fn encode_all(payloads: &[Vec<u8>]) -> Vec<u8> {
    let codec = FrameCodec::new();
    payloads
        .iter()
        .flat_map(|p| codec.encode(p).unwrap().to_vec())
        .collect()
}

/// Split `data` at the given (sorted, deduplicated) cut points.
fn split_at_points(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for point in points.into_iter().chain(std::iter::once(data.len())) {
        if point > start {
            chunks.push(data[start..point].to_vec());
            start = point;
        }
    }
    chunks
}

proptest! {
    #[test]
    fn chunked_feed_matches_whole_feed(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..16),
    ) {
        let stream = encode_all(&payloads);

        let mut whole = FrameCodec::new();
        let expected = whole.decode(&stream).unwrap();

        let mut chunked = FrameCodec::new();
        let mut actual: Vec<Bytes> = Vec::new();
        for chunk in split_at_points(&stream, &cuts) {
            actual.extend(chunked.decode(&chunk).unwrap());
        }

        prop_assert_eq!(&actual, &expected);
        prop_assert_eq!(actual.len(), payloads.len());
        prop_assert_eq!(chunked.buffered_len(), 0);
    }

    #[test]
    fn encode_then_decode_returns_payload(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut codec = FrameCodec::new();
        let framed = codec.encode(&payload).unwrap();
        let frames = codec.decode(&framed).unwrap();

        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(&frames[0][..], &payload[..]);
    }

    #[test]
    fn arena_feed_matches_whole_feed(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..16),
        slack in 0usize..32,
    ) {
        let stream = encode_all(&payloads);

        let mut arena = BufferArena::with_slack(slack);
        let mut codec = FrameCodec::new();
        let mut actual = Vec::new();
        for chunk in split_at_points(&stream, &cuts) {
            let region = arena.acquire_write_region(chunk.len());
            region[..chunk.len()].copy_from_slice(&chunk);
            actual.extend(arena.commit_write(chunk.len(), &mut codec).unwrap());
        }

        let actual: Vec<Vec<u8>> = actual.iter().map(|f| f.to_vec()).collect();
        prop_assert_eq!(actual, payloads);
    }
}

#[tokio::test]
async fn test_framed_read_over_duplex() {
    let (mut client, server) = tokio::io::duplex(8);
    let stream = encode_all(&[b"ping".to_vec(), Vec::new(), b"pong".to_vec()]);

    tokio::spawn(async move {
        // Small duplex buffer forces partial reads.
        client.write_all(&stream).await.unwrap();
    });

    let frames: Vec<_> = FramedRead::new(server, FrameCodec::new())
        .map(|frame| frame.unwrap())
        .collect()
        .await;

    assert_eq!(frames.len(), 3);
    assert_eq!(&frames[0][..], b"ping");
    assert!(frames[1].is_empty());
    assert_eq!(&frames[2][..], b"pong");
}
