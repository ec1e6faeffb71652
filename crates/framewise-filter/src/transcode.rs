//! Frame/tensor conversion feeding and draining the model.
//!
//! Packed RGB and gray frames map onto the tensor wholesale; planar YUV
//! runs only its luma plane through inference while the chroma planes are
//! carried around the model, rescaled if the model changes resolution.

use framewise_types::{
    ElementType, FilterError, FilterResult, PixelFormat, Plane, Tensor, TensorData, TensorDesc,
    TensorLayout, VideoFrame,
};

use crate::resample::resize_bicubic;

#[derive(Debug)]
pub struct Transcoder {
    format: PixelFormat,
    width: u32,
    height: u32,
    input_desc: TensorDesc,
    output_desc: TensorDesc,
}

fn check_element(format: PixelFormat, element: ElementType, role: &str) -> FilterResult<()> {
    let compatible = match format {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => true,
        PixelFormat::Gray8 => element == ElementType::U8,
        PixelFormat::GrayF32 => element == ElementType::F32,
        _ => element == ElementType::F32,
    };
    if compatible {
        Ok(())
    } else {
        Err(FilterError::configuration(format!(
            "{format} frames are incompatible with a {element} model {role} tensor"
        )))
    }
}

impl Transcoder {
    /// Validate the negotiated stream against the model descriptors and fix
    /// any dynamic dimensions. Fails the stage on channel, element type, or
    /// geometry mismatches.
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        model_input: TensorDesc,
        model_output: TensorDesc,
    ) -> FilterResult<Self> {
        if width == 0 || height == 0 {
            return Err(FilterError::configuration(format!(
                "invalid stream geometry {width}x{height}"
            )));
        }
        if model_input.layout() != TensorLayout::Nhwc || model_output.layout() != TensorLayout::Nhwc
        {
            return Err(FilterError::configuration(
                "model tensors must accept channel-last data",
            ));
        }
        let channels = format.model_channels() as i64;
        if model_input.channels() != channels {
            return Err(FilterError::configuration(format!(
                "{format} frames carry {channels} channel(s), model input expects {}",
                model_input.channels()
            )));
        }
        if model_output.channels() != channels {
            return Err(FilterError::configuration(format!(
                "{format} frames carry {channels} channel(s), model output produces {}",
                model_output.channels()
            )));
        }
        check_element(format, model_input.element(), "input")?;
        check_element(format, model_output.element(), "output")?;

        let input_desc = model_input.resolved(i64::from(height), i64::from(width));
        if input_desc.height() != i64::from(height) || input_desc.width() != i64::from(width) {
            return Err(FilterError::configuration(format!(
                "stream geometry {width}x{height} does not match model input {}x{}",
                input_desc.width(),
                input_desc.height()
            )));
        }
        let output_desc = model_output.resolved(input_desc.height(), input_desc.width());

        Ok(Self {
            format,
            width,
            height,
            input_desc,
            output_desc,
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn input_desc(&self) -> &TensorDesc {
        &self.input_desc
    }

    pub fn output_desc(&self) -> &TensorDesc {
        &self.output_desc
    }

    /// Convert `frame` into batch position `batch_index` of the request's
    /// input tensor.
    pub fn preproc(
        &self,
        frame: &VideoFrame,
        tensor: &mut Tensor,
        batch_index: usize,
    ) -> FilterResult<()> {
        if frame.format() != self.format
            || frame.width() != self.width
            || frame.height() != self.height
        {
            return Err(FilterError::configuration(format!(
                "frame {}x{} {} does not match the negotiated stream {}x{} {}",
                frame.width(),
                frame.height(),
                frame.format(),
                self.width,
                self.height,
                self.format
            )));
        }
        let elements = self.input_desc.frame_elements()?;
        let offset = batch_index * elements;
        if offset + elements > tensor.data().len() {
            return Err(FilterError::resource(format!(
                "batch index {batch_index} exceeds the request buffer"
            )));
        }
        let rows = self.height as usize;
        let row_values = elements / rows;
        let plane = frame.plane(0);

        match (self.format, tensor.data_mut()) {
            (PixelFormat::Gray8, TensorData::U8(data))
            | (PixelFormat::Rgb24, TensorData::U8(data))
            | (PixelFormat::Bgr24, TensorData::U8(data)) => {
                copy_rows_to_u8(plane, rows, row_values, &mut data[offset..offset + elements]);
            }
            (PixelFormat::Rgb24, TensorData::F32(data))
            | (PixelFormat::Bgr24, TensorData::F32(data)) => {
                widen_rows(plane, rows, row_values, &mut data[offset..offset + elements]);
            }
            (PixelFormat::GrayF32, TensorData::F32(data)) => {
                copy_rows_to_f32(plane, rows, row_values, &mut data[offset..offset + elements]);
            }
            (format, TensorData::F32(data)) if format.is_planar_yuv() => {
                widen_rows(plane, rows, row_values, &mut data[offset..offset + elements]);
            }
            _ => {
                return Err(FilterError::execution(
                    "transcode",
                    "request tensor element does not match the negotiated conversion",
                ));
            }
        }
        Ok(())
    }

    /// Convert batch position `batch_index` of an output tensor back into a
    /// frame, inheriting format and metadata from `input`.
    pub fn postproc(
        &self,
        tensor: &Tensor,
        batch_index: usize,
        input: &VideoFrame,
    ) -> FilterResult<VideoFrame> {
        let desc = tensor.desc();
        if desc.height() <= 0 || desc.width() <= 0 {
            return Err(FilterError::execution(
                "transcode",
                format!("model produced invalid output geometry {:?}", desc.dims()),
            ));
        }
        if desc.channels() != self.format.model_channels() as i64 {
            return Err(FilterError::execution(
                "transcode",
                format!(
                    "model produced {} channels, {} frames need {}",
                    desc.channels(),
                    self.format,
                    self.format.model_channels()
                ),
            ));
        }
        let out_width = desc.width() as u32;
        let out_height = desc.height() as u32;
        let elements = desc.frame_elements()?;
        let offset = batch_index * elements;
        if offset + elements > tensor.data().len() {
            return Err(FilterError::resource(format!(
                "batch index {batch_index} exceeds the response buffer"
            )));
        }
        let rows = out_height as usize;
        let row_values = elements / rows;

        let mut output = VideoFrame::new(self.format, out_width, out_height)?;
        match (self.format, tensor.data()) {
            (PixelFormat::Gray8, TensorData::U8(data))
            | (PixelFormat::Rgb24, TensorData::U8(data))
            | (PixelFormat::Bgr24, TensorData::U8(data)) => {
                fill_rows_from_u8(&data[offset..offset + elements], rows, output.plane_mut(0));
            }
            (PixelFormat::Rgb24, TensorData::F32(data))
            | (PixelFormat::Bgr24, TensorData::F32(data)) => {
                narrow_rows(&data[offset..offset + elements], rows, output.plane_mut(0));
            }
            (PixelFormat::GrayF32, TensorData::F32(data)) => {
                fill_rows_from_f32(&data[offset..offset + elements], rows, row_values, output.plane_mut(0));
            }
            (format, TensorData::F32(data)) if format.is_planar_yuv() => {
                narrow_rows(&data[offset..offset + elements], rows, output.plane_mut(0));
                self.carry_chroma(input, &mut output)?;
            }
            _ => {
                return Err(FilterError::execution(
                    "transcode",
                    "response tensor element does not match the negotiated conversion",
                ));
            }
        }
        output.copy_metadata_from(input);
        Ok(output)
    }

    /// Attach the chroma planes the model never saw: verbatim when the
    /// geometry is unchanged, bicubic-rescaled otherwise.
    fn carry_chroma(&self, input: &VideoFrame, output: &mut VideoFrame) -> FilterResult<()> {
        let same_geometry =
            input.width() == output.width() && input.height() == output.height();
        for plane_index in 1..self.format.plane_count() {
            let (src_width, src_rows) =
                self.format
                    .plane_geometry(input.width(), input.height(), plane_index);
            let (dst_width, dst_rows) =
                self.format
                    .plane_geometry(output.width(), output.height(), plane_index);
            let src = input.plane(plane_index);
            if same_geometry {
                let dst = output.plane_mut(plane_index);
                for row in 0..src_rows {
                    let line = &src.row(row)[..src_width];
                    dst.data_mut()[row * dst_width..(row + 1) * dst_width].copy_from_slice(line);
                }
            } else {
                let resized = resize_bicubic(
                    src.data(),
                    src_width,
                    src_rows,
                    src.stride(),
                    dst_width,
                    dst_rows,
                );
                output.plane_mut(plane_index).data_mut().copy_from_slice(&resized);
            }
        }
        Ok(())
    }
}

fn copy_rows_to_u8(plane: &Plane, rows: usize, row_bytes: usize, dst: &mut [u8]) {
    for row in 0..rows {
        let line = &plane.row(row)[..row_bytes];
        dst[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(line);
    }
}

fn widen_rows(plane: &Plane, rows: usize, row_values: usize, dst: &mut [f32]) {
    for row in 0..rows {
        let line = &plane.row(row)[..row_values];
        let out = &mut dst[row * row_values..(row + 1) * row_values];
        for (value, &byte) in out.iter_mut().zip(line) {
            *value = f32::from(byte) / 255.0;
        }
    }
}

fn copy_rows_to_f32(plane: &Plane, rows: usize, row_values: usize, dst: &mut [f32]) {
    for row in 0..rows {
        let line = &plane.row(row)[..row_values * 4];
        let out = &mut dst[row * row_values..(row + 1) * row_values];
        for (value, bytes) in out.iter_mut().zip(line.chunks_exact(4)) {
            *value = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
    }
}

fn fill_rows_from_u8(src: &[u8], rows: usize, plane: &mut Plane) {
    let row_bytes = src.len() / rows;
    for row in 0..rows {
        let line = &src[row * row_bytes..(row + 1) * row_bytes];
        plane.data_mut()[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(line);
    }
}

fn narrow_rows(src: &[f32], rows: usize, plane: &mut Plane) {
    let row_values = src.len() / rows;
    for row in 0..rows {
        let line = &src[row * row_values..(row + 1) * row_values];
        let out = &mut plane.data_mut()[row * row_values..(row + 1) * row_values];
        for (byte, &value) in out.iter_mut().zip(line) {
            *byte = (value * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn fill_rows_from_f32(src: &[f32], rows: usize, row_values: usize, plane: &mut Plane) {
    for row in 0..rows {
        let line = &src[row * row_values..(row + 1) * row_values];
        let out = &mut plane.data_mut()[row * row_values * 4..(row + 1) * row_values * 4];
        for (bytes, value) in out.chunks_exact_mut(4).zip(line) {
            bytes.copy_from_slice(&value.to_ne_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(element: ElementType, dims: [i64; 4]) -> TensorDesc {
        TensorDesc::new(element, dims, TensorLayout::Nhwc)
    }

    fn identity_transcoder(format: PixelFormat, width: u32, height: u32) -> Transcoder {
        let element = match format {
            PixelFormat::Gray8 => ElementType::U8,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => ElementType::U8,
            _ => ElementType::F32,
        };
        let channels = format.model_channels() as i64;
        let dims = [1, channels, i64::from(height), i64::from(width)];
        Transcoder::new(format, width, height, desc(element, dims), desc(element, dims)).unwrap()
    }

    fn patterned_frame(format: PixelFormat, width: u32, height: u32) -> VideoFrame {
        let mut frame = VideoFrame::new(format, width, height).unwrap();
        for plane_index in 0..frame.plane_count() {
            let plane = frame.plane_mut(plane_index);
            for (position, byte) in plane.data_mut().iter_mut().enumerate() {
                *byte = ((position * 7 + plane_index * 31) % 256) as u8;
            }
        }
        frame
    }

    fn identity_round_trip(format: PixelFormat) {
        let transcoder = identity_transcoder(format, 8, 6);
        let frame = patterned_frame(format, 8, 6);
        let mut tensor = Tensor::zeroed(*transcoder.input_desc()).unwrap();
        transcoder.preproc(&frame, &mut tensor, 0).unwrap();
        let restored = transcoder.postproc(&tensor, 0, &frame).unwrap();
        for plane_index in 0..frame.plane_count() {
            assert_eq!(
                restored.plane(plane_index).data(),
                frame.plane(plane_index).data(),
                "{format} plane {plane_index} changed in transit"
            );
        }
    }

    #[test]
    fn identity_round_trips_every_supported_format() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Gray8,
            PixelFormat::GrayF32,
            PixelFormat::Yuv420p,
            PixelFormat::Yuv422p,
            PixelFormat::Yuv444p,
            PixelFormat::Yuv410p,
            PixelFormat::Yuv411p,
        ] {
            identity_round_trip(format);
        }
    }

    #[test]
    fn rgb_widen_narrow_round_trips_through_float() {
        let dims = [1, 3, 4, 4];
        let transcoder = Transcoder::new(
            PixelFormat::Rgb24,
            4,
            4,
            desc(ElementType::F32, dims),
            desc(ElementType::F32, dims),
        )
        .unwrap();
        let frame = patterned_frame(PixelFormat::Rgb24, 4, 4);
        let mut tensor = Tensor::zeroed(*transcoder.input_desc()).unwrap();
        transcoder.preproc(&frame, &mut tensor, 0).unwrap();
        let restored = transcoder.postproc(&tensor, 0, &frame).unwrap();
        assert_eq!(restored.plane(0).data(), frame.plane(0).data());
    }

    #[test]
    fn rejects_channel_mismatch() {
        let err = Transcoder::new(
            PixelFormat::Rgb24,
            4,
            4,
            desc(ElementType::F32, [1, 1, 4, 4]),
            desc(ElementType::F32, [1, 1, 4, 4]),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::Configuration { .. }));
    }

    #[test]
    fn rejects_incompatible_elements() {
        assert!(
            Transcoder::new(
                PixelFormat::Gray8,
                4,
                4,
                desc(ElementType::F32, [1, 1, 4, 4]),
                desc(ElementType::F32, [1, 1, 4, 4]),
            )
            .is_err()
        );
        assert!(
            Transcoder::new(
                PixelFormat::Yuv420p,
                4,
                4,
                desc(ElementType::U8, [1, 1, 4, 4]),
                desc(ElementType::U8, [1, 1, 4, 4]),
            )
            .is_err()
        );
    }

    #[test]
    fn rejects_fixed_geometry_mismatch() {
        let err = Transcoder::new(
            PixelFormat::Gray8,
            8,
            8,
            desc(ElementType::U8, [1, 1, 4, 4]),
            desc(ElementType::U8, [1, 1, 4, 4]),
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::Configuration { .. }));
    }

    #[test]
    fn dynamic_dims_resolve_to_stream_geometry() {
        let transcoder = Transcoder::new(
            PixelFormat::Gray8,
            10,
            6,
            desc(ElementType::U8, [1, 1, -1, -1]),
            desc(ElementType::U8, [1, 1, -1, -1]),
        )
        .unwrap();
        assert_eq!(transcoder.input_desc().dims(), [1, 1, 6, 10]);
        assert_eq!(transcoder.output_desc().dims(), [1, 1, 6, 10]);
    }

    #[test]
    fn yuv_chroma_rescales_when_geometry_changes() {
        // Identity-shaped input desc, output twice the size.
        let transcoder = Transcoder::new(
            PixelFormat::Yuv420p,
            8,
            8,
            desc(ElementType::F32, [1, 1, 8, 8]),
            desc(ElementType::F32, [1, 1, 16, 16]),
        )
        .unwrap();
        let frame = patterned_frame(PixelFormat::Yuv420p, 8, 8);
        let mut tensor = Tensor::zeroed(*transcoder.input_desc()).unwrap();
        transcoder.preproc(&frame, &mut tensor, 0).unwrap();

        let out_tensor = Tensor::zeroed(*transcoder.output_desc()).unwrap();
        let output = transcoder.postproc(&out_tensor, 0, &frame).unwrap();
        assert_eq!(output.width(), 16);
        assert_eq!(output.height(), 16);

        for plane_index in 1..3 {
            let (src_width, src_rows) = PixelFormat::Yuv420p.plane_geometry(8, 8, plane_index);
            let expected = resize_bicubic(
                frame.plane(plane_index).data(),
                src_width,
                src_rows,
                frame.plane(plane_index).stride(),
                8,
                8,
            );
            assert_eq!(output.plane(plane_index).data(), &expected[..]);
        }
    }

    #[test]
    fn batched_preproc_lands_in_the_right_slot() {
        let dims = [2, 1, 2, 2];
        let transcoder = Transcoder::new(
            PixelFormat::Gray8,
            2,
            2,
            desc(ElementType::U8, dims),
            desc(ElementType::U8, dims),
        )
        .unwrap();
        let mut tensor = Tensor::zeroed(*transcoder.input_desc()).unwrap();

        let mut first = VideoFrame::new(PixelFormat::Gray8, 2, 2).unwrap();
        first.plane_mut(0).data_mut().copy_from_slice(&[1, 2, 3, 4]);
        let mut second = VideoFrame::new(PixelFormat::Gray8, 2, 2).unwrap();
        second.plane_mut(0).data_mut().copy_from_slice(&[5, 6, 7, 8]);

        transcoder.preproc(&first, &mut tensor, 0).unwrap();
        transcoder.preproc(&second, &mut tensor, 1).unwrap();
        assert_eq!(
            tensor.data().as_u8().unwrap(),
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert!(transcoder.preproc(&second, &mut tensor, 2).is_err());

        let restored = transcoder.postproc(&tensor, 1, &second).unwrap();
        assert_eq!(restored.plane(0).data(), &[5, 6, 7, 8]);
    }
}
