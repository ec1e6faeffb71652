//! End-to-end stage behavior over the native backend: negotiation,
//! super-resolution geometry, chroma carry-around, and the stream edge.

use std::io::Write;
use std::time::Duration;

use framewise_filter::{BackendKind, FilterError, FilterStage, PixelFormat, StageOptions, VideoFrame};

fn model_file(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

fn options_for(model: &tempfile::NamedTempFile) -> StageOptions {
    StageOptions::new(BackendKind::Native, model.path(), "in", "out")
}

fn frame(format: PixelFormat, width: u32, height: u32, index: u64) -> VideoFrame {
    let mut frame = VideoFrame::new(format, width, height).unwrap();
    for plane_index in 0..frame.plane_count() {
        let plane = frame.plane_mut(plane_index);
        for (position, byte) in plane.data_mut().iter_mut().enumerate() {
            *byte = ((position + index as usize * 13 + plane_index * 29) % 251) as u8;
        }
    }
    frame
        .with_frame_index(Some(index))
        .with_timestamp(Some(Duration::from_millis(index * 40)))
}

const UPSCALE_2X_GRAYF32: &str = r#"{
    "input": { "name": "in", "channels": 1, "height": 240, "width": 320, "dtype": "float32" },
    "output": { "name": "out" },
    "op": { "type": "upscale", "factor": 2 }
}"#;

const IDENTITY_F32_DYNAMIC: &str = r#"{
    "input": { "name": "in", "channels": 1, "dtype": "float32" },
    "output": { "name": "out" },
    "op": { "type": "identity" }
}"#;

const IDENTITY_SINGLE_CHANNEL_U8: &str = r#"{
    "input": { "name": "in", "channels": 1, "dtype": "uint8" },
    "output": { "name": "out" },
    "op": { "type": "identity" }
}"#;

#[test]
fn super_resolution_doubles_geometry_and_keeps_pts() {
    let model = model_file(UPSCALE_2X_GRAYF32);
    let mut stage =
        FilterStage::new(&options_for(&model), PixelFormat::GrayF32, 320, 240).unwrap();

    stage
        .submit(frame(PixelFormat::GrayF32, 320, 240, 0))
        .unwrap();
    let end = stage.signal_end_of_stream(None).unwrap();
    assert_eq!(end.frames.len(), 1);
    let output = &end.frames[0];
    assert_eq!((output.width(), output.height()), (640, 480));
    assert_eq!(output.format(), PixelFormat::GrayF32);
    assert_eq!(output.timestamp(), Some(Duration::from_millis(0)));
    assert_eq!(end.timestamp, Some(Duration::from_millis(0)));
}

#[test]
fn batch_saturation_preserves_order() {
    let model = model_file(IDENTITY_SINGLE_CHANNEL_U8);
    let mut options = options_for(&model);
    options.nireq = 2;
    options.batch_size = 4;
    let mut stage = FilterStage::new(&options, PixelFormat::Gray8, 64, 48).unwrap();

    for index in 0..9 {
        stage.submit(frame(PixelFormat::Gray8, 64, 48, index)).unwrap();
    }
    let end = stage.signal_end_of_stream(None).unwrap();
    let timestamps: Vec<_> = end.frames.iter().map(|f| f.timestamp()).collect();
    assert_eq!(
        timestamps,
        (0..9)
            .map(|i| Some(Duration::from_millis(i * 40)))
            .collect::<Vec<_>>()
    );
    assert_eq!(end.timestamp, Some(Duration::from_millis(8 * 40)));
    assert_eq!(stage.dropped_frames(), 0);
}

#[test]
fn rgb_into_single_channel_model_fails_negotiation() {
    let model = model_file(IDENTITY_SINGLE_CHANNEL_U8);
    let err = FilterStage::new(&options_for(&model), PixelFormat::Rgb24, 64, 48).unwrap_err();
    assert!(matches!(err, FilterError::Configuration { .. }));
}

#[test]
fn yuv420_chroma_passes_through_untouched() {
    let model = model_file(IDENTITY_F32_DYNAMIC);
    let mut stage =
        FilterStage::new(&options_for(&model), PixelFormat::Yuv420p, 256, 256).unwrap();

    let input = frame(PixelFormat::Yuv420p, 256, 256, 0);
    let u_plane = input.plane(1).data().to_vec();
    let v_plane = input.plane(2).data().to_vec();
    stage.submit(input).unwrap();
    let end = stage.signal_end_of_stream(None).unwrap();
    assert_eq!(end.frames.len(), 1);
    let output = &end.frames[0];
    assert_eq!(output.format(), PixelFormat::Yuv420p);
    assert_eq!((output.width(), output.height()), (256, 256));
    assert_eq!(output.plane(1).data(), &u_plane[..]);
    assert_eq!(output.plane(2).data(), &v_plane[..]);
}

#[test]
fn end_of_stream_is_at_most_once() {
    let model = model_file(IDENTITY_SINGLE_CHANNEL_U8);
    let mut stage = FilterStage::new(&options_for(&model), PixelFormat::Gray8, 16, 16).unwrap();

    stage.submit(frame(PixelFormat::Gray8, 16, 16, 0)).unwrap();
    let first = stage.signal_end_of_stream(Some(Duration::from_secs(9))).unwrap();
    assert_eq!(first.frames.len(), 1);
    assert_eq!(first.timestamp, Some(Duration::from_millis(0)));

    // Draining again yields nothing new and keeps the produced timestamp.
    let second = stage.signal_end_of_stream(Some(Duration::from_secs(9))).unwrap();
    assert!(second.frames.is_empty());
    assert_eq!(second.timestamp, Some(Duration::from_millis(0)));

    // The stage refuses frames once flushed.
    let err = stage.submit(frame(PixelFormat::Gray8, 16, 16, 1)).unwrap_err();
    assert!(matches!(err, FilterError::Shutdown));
}

#[test]
fn eos_timestamp_falls_back_to_upstream_value_when_nothing_was_drained() {
    let model = model_file(IDENTITY_SINGLE_CHANNEL_U8);
    let mut stage = FilterStage::new(&options_for(&model), PixelFormat::Gray8, 16, 16).unwrap();
    let end = stage
        .signal_end_of_stream(Some(Duration::from_millis(1234)))
        .unwrap();
    assert!(end.frames.is_empty());
    assert_eq!(end.timestamp, Some(Duration::from_millis(1234)));
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_edge_preserves_order_and_terminates() {
    use tokio_stream::StreamExt;

    let model = model_file(IDENTITY_SINGLE_CHANNEL_U8);
    let mut options = options_for(&model);
    options.nireq = 2;
    options.batch_size = 3;
    let stage = FilterStage::new(&options, PixelFormat::Gray8, 32, 32).unwrap();

    let input = framewise_filter::spawn_stream_from_channel(4, move |tx| {
        for index in 0..10 {
            if tx
                .blocking_send(Ok(frame(PixelFormat::Gray8, 32, 32, index)))
                .is_err()
            {
                return;
            }
        }
    });

    let mut output = stage.into_stream(input);
    let mut indices = Vec::new();
    while let Some(item) = output.next().await {
        indices.push(item.unwrap().frame_index());
    }
    assert_eq!(indices, (0..10).map(Some).collect::<Vec<_>>());
}
