use std::io::Write;
use std::time::Duration;

use tokio_stream::StreamExt;

use framewise_filter::{
    BackendKind, FilterStage, PixelFormat, StageOptions, VideoFrame, spawn_stream_from_channel,
};

const IDENTITY_MODEL: &str = r#"{
    "input": { "name": "in", "channels": 1, "dtype": "uint8" },
    "output": { "name": "out" },
    "op": { "type": "identity" }
}"#;

#[tokio::test(flavor = "multi_thread")]
async fn stage_transforms_a_synthetic_stream() {
    let mut model = tempfile::NamedTempFile::new().unwrap();
    model.write_all(IDENTITY_MODEL.as_bytes()).unwrap();

    let mut options = StageOptions::new(BackendKind::Native, model.path(), "in", "out");
    options.nireq = 2;
    options.batch_size = 2;
    let stage = FilterStage::new(&options, PixelFormat::Gray8, 64, 36).unwrap();

    let input = spawn_stream_from_channel(4, move |tx| {
        for index in 0..5u64 {
            let frame = VideoFrame::new(PixelFormat::Gray8, 64, 36)
                .unwrap()
                .with_frame_index(Some(index))
                .with_timestamp(Some(Duration::from_millis(index * 33)));
            if tx.blocking_send(Ok(frame)).is_err() {
                return;
            }
        }
    });

    let mut output = stage.into_stream(input);
    let mut frames = Vec::new();
    while let Some(item) = output.next().await {
        frames.push(item.unwrap());
    }
    assert_eq!(frames.len(), 5);
    assert_eq!(frames[0].width(), 64);
    assert_eq!(
        frames.iter().map(|f| f.frame_index()).collect::<Vec<_>>(),
        (0..5).map(Some).collect::<Vec<_>>()
    );
}
