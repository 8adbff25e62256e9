//! Transcoder output reaches the consumer whole-frame and in order.

use crate::helpers::{BOUND, sh};
use liverelay::pipeline::{Pipeline, PipelineCommands, PipelineState};
use liverelay::stream::PCM_FRAME_BYTES;
use tokio::io::AsyncReadExt;

#[tokio::test]
async fn stand_in_transcoder_output_is_frame_aligned() {
    // 100 ms of 48 kHz stereo s16le.
    let frames = 4_800;
    let commands = PipelineCommands {
        fetcher: sh("head -c 100000 /dev/urandom; exec sleep 30"),
        transcoder: sh(&format!("head -c {} /dev/zero", frames * PCM_FRAME_BYTES)),
    };
    let (pipeline, mut reader) = Pipeline::build(&commands, "http://radio.test/live", 1).unwrap();

    let mut pcm = Vec::new();
    tokio::time::timeout(BOUND, reader.read_to_end(&mut pcm))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(pcm.len() % PCM_FRAME_BYTES, 0);
    assert_eq!(pcm.len(), frames * PCM_FRAME_BYTES);

    tokio::time::timeout(BOUND, pipeline.wait_closed()).await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Closed);
    assert!(pipeline.fetcher().state().is_terminal());
}

#[tokio::test]
async fn fetched_bytes_pass_through_unchanged() {
    let commands = PipelineCommands {
        fetcher: sh("seq 1 2000; exec sleep 30"),
        transcoder: sh("cat"),
    };
    let (pipeline, mut reader) = Pipeline::build(&commands, "http://radio.test/live", 1).unwrap();

    let expected: String = (1..=2000).map(|n| format!("{n}\n")).collect();
    let mut out = vec![0u8; expected.len()];
    tokio::time::timeout(BOUND, reader.read_exact(&mut out))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, expected.as_bytes());

    pipeline.destroy().await;
}
