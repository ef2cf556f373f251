use crate::error::PipelineError;
use crate::options::{FallbackConfig, InferenceDevice};
use crate::pipeline::mask;
use crate::pipeline::types::{Detection, Frame};
use anyhow::{anyhow, bail, Context, Result};
use opencv::core::{self, Mat, Point, Scalar, Size, Vector};
use opencv::prelude::*;
use opencv::{dnn, imgproc, photo};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Removes masked content from a frame.
pub trait Inpainter: Send {
    fn name(&self) -> &'static str;

    /// Dimension multiple the backend needs; `None` accepts any size.
    fn required_stride(&self) -> Option<i32> {
        None
    }

    /// `image` is BGR24, `mask` single-channel with 255 where content is removed.
    /// Returns a BGR24 image of the same size.
    fn inpaint(&mut self, image: &Mat, mask: &Mat) -> Result<Mat>;
}

pub type SharedInpainter = Arc<Mutex<Box<dyn Inpainter>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InpaintBackendKind {
    Model,
    Fallback,
}

/// LaMa-style inpainting network loaded through OpenCV's DNN module.
///
/// The network takes an RGB `image` in [0, 1] and a binary `mask`, both
/// NCHW, and returns RGB in [0, 1].
pub struct LamaInpainter {
    net: dnn::Net,
    stride: i32,
}

// SAFETY: the network is only driven behind the shared inpainter mutex.
unsafe impl Send for LamaInpainter {}

impl LamaInpainter {
    pub fn load(model_path: &Path, device: InferenceDevice, stride: i32) -> Result<Self> {
        if !model_path.exists() {
            bail!("Inpainting model not found: {:?}", model_path);
        }
        let model_file = model_path
            .to_str()
            .ok_or_else(|| anyhow!("Inpainting model path is not valid UTF-8: {:?}", model_path))?;

        let mut net = dnn::read_net_from_onnx(model_file)
            .with_context(|| format!("Failed to read inpainting model {:?}", model_path))?;
        if net.empty()? {
            bail!("Inpainting model {:?} has no layers", model_path);
        }

        let cuda_devices = core::get_cuda_enabled_device_count().unwrap_or(0);
        let use_cuda = match device {
            InferenceDevice::Cpu => false,
            InferenceDevice::Auto => cuda_devices > 0,
            InferenceDevice::Cuda => {
                if cuda_devices == 0 {
                    bail!("CUDA requested for inpainting but no CUDA device is available");
                }
                true
            }
        };
        if use_cuda {
            net.set_preferable_backend(dnn::DNN_BACKEND_CUDA)?;
            net.set_preferable_target(dnn::DNN_TARGET_CUDA)?;
        } else {
            net.set_preferable_backend(dnn::DNN_BACKEND_OPENCV)?;
            net.set_preferable_target(dnn::DNN_TARGET_CPU)?;
        }

        tracing::info!(
            "Loaded inpainting model from {:?} (device={}, stride={})",
            model_path,
            if use_cuda { "cuda" } else { "cpu" },
            stride
        );
        Ok(Self { net, stride })
    }
}

impl Inpainter for LamaInpainter {
    fn name(&self) -> &'static str {
        "lama"
    }

    fn required_stride(&self) -> Option<i32> {
        Some(self.stride)
    }

    fn inpaint(&mut self, image: &Mat, mask: &Mat) -> Result<Mat> {
        let image_blob = dnn::blob_from_image(
            image,
            1.0 / 255.0,
            Size::default(),
            Scalar::default(),
            true,
            false,
            core::CV_32F,
        )?;
        let mut binary = Mat::default();
        imgproc::threshold(mask, &mut binary, 0.0, 1.0, imgproc::THRESH_BINARY)?;
        let mask_blob = dnn::blob_from_image(
            &binary,
            1.0,
            Size::default(),
            Scalar::default(),
            false,
            false,
            core::CV_32F,
        )?;

        self.net
            .set_input(&image_blob, "image", 1.0, Scalar::default())?;
        self.net.set_input(&mask_blob, "mask", 1.0, Scalar::default())?;
        let output = self.net.forward_single_def()?;

        let mut images: Vector<Mat> = Vector::new();
        dnn::images_from_blob(&output, &mut images)?;
        let rgb = images
            .iter()
            .next()
            .ok_or_else(|| anyhow!("Inpainting model returned an empty batch"))?;

        let mut rgb_u8 = Mat::default();
        rgb.convert_to(&mut rgb_u8, core::CV_8U, 255.0, 0.0)?;
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(&rgb_u8, &mut bgr, imgproc::COLOR_RGB2BGR)?;
        Ok(bgr)
    }
}

/// Deterministic inpainting: dilated mask, Navier-Stokes fill, soft edge blend.
pub struct FallbackInpainter {
    config: FallbackConfig,
}

impl FallbackInpainter {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }
}

impl Inpainter for FallbackInpainter {
    fn name(&self) -> &'static str {
        "opencv-ns"
    }

    fn inpaint(&mut self, image: &Mat, mask: &Mat) -> Result<Mat> {
        let k = self.config.dilation_kernel.max(1);
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            Size::new(k, k),
            Point::new(-1, -1),
        )?;
        let mut dilated = Mat::default();
        imgproc::dilate(
            mask,
            &mut dilated,
            &kernel,
            Point::new(-1, -1),
            self.config.dilation_iterations.max(1),
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut filled = Mat::default();
        photo::inpaint(
            image,
            &dilated,
            &mut filled,
            self.config.inpaint_radius,
            photo::INPAINT_NS,
        )?;

        if !self.config.edge_blend {
            return Ok(filled);
        }
        blend_edges(&filled, &dilated, self.config.blend_weight)
    }
}

/// Mix a lightly blurred copy of `image` into it, weighted by a feathered `mask`.
fn blend_edges(image: &Mat, mask: &Mat, weight: f32) -> Result<Mat> {
    let mut mask_f = Mat::default();
    mask.convert_to(&mut mask_f, core::CV_32F, 1.0 / 255.0, 0.0)?;
    let mut feather = Mat::default();
    imgproc::gaussian_blur_def(&mask_f, &mut feather, Size::new(15, 15), 0.0)?;

    let mut blurred = Mat::default();
    imgproc::gaussian_blur_def(image, &mut blurred, Size::new(5, 5), 0.0)?;

    let mut out = image.try_clone()?;
    let channels = image.channels() as usize;
    let weights = feather.data_typed::<f32>()?;
    let soft = blurred.data_bytes()?;
    let dst = out.data_bytes_mut()?;
    if dst.len() != weights.len() * channels || soft.len() != dst.len() {
        bail!("Edge blend buffers do not line up");
    }

    for (px, w) in weights.iter().enumerate() {
        let alpha = (w * weight).clamp(0.0, 1.0);
        for c in 0..channels {
            let i = px * channels + c;
            let v = dst[i] as f32 * (1.0 - alpha) + soft[i] as f32 * alpha;
            dst[i] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}

/// Routes each frame to the model or fallback backend.
///
/// The backend is chosen once: a model that failed to initialize never gets
/// retried mid-run.
pub struct InpaintDispatcher {
    model: Option<SharedInpainter>,
    fallback: FallbackInpainter,
    padding: i32,
    stride: i32,
}

impl InpaintDispatcher {
    pub fn new(
        model: Option<SharedInpainter>,
        fallback: FallbackConfig,
        padding: i32,
        stride: i32,
    ) -> Self {
        Self {
            model,
            fallback: FallbackInpainter::new(fallback),
            padding,
            stride,
        }
    }

    pub fn kind(&self) -> InpaintBackendKind {
        if self.model.is_some() {
            InpaintBackendKind::Model
        } else {
            InpaintBackendKind::Fallback
        }
    }

    /// Inpaint one frame. `Ok(None)` means the frame passes through unchanged.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        detection: &Detection,
    ) -> Result<Option<Mat>, PipelineError> {
        let Some(bbox) = detection.region() else {
            return Ok(None);
        };
        let index = frame.index;
        let size = frame
            .image
            .size()
            .map_err(|e| PipelineError::frame(index, e))?;
        if mask::padded_region(&bbox, size.width, size.height, self.padding).is_none() {
            return Ok(None);
        }

        let mask = mask::build_mask(size.width, size.height, &bbox, self.padding)
            .map_err(|e| PipelineError::frame(index, e))?;

        let result = match &self.model {
            Some(model) => {
                let mut model = model
                    .lock()
                    .map_err(|_| PipelineError::frame(index, "inpainting model lock poisoned"))?;
                let stride = combined_stride(self.stride, model.required_stride());
                run_padded(&mut **model, &frame.image, &mask, stride)
            }
            None => self.fallback.inpaint(&frame.image, &mask),
        }
        .map_err(|e| PipelineError::frame(index, format!("{:#}", e)))?;

        let out_size = result
            .size()
            .map_err(|e| PipelineError::frame(index, e))?;
        if out_size != size {
            return Err(PipelineError::frame(
                index,
                format!(
                    "inpainter returned {}x{}, expected {}x{}",
                    out_size.width, out_size.height, size.width, size.height
                ),
            ));
        }
        Ok(Some(result))
    }
}

/// Smallest stride that satisfies both the configured and the model's multiple.
fn combined_stride(configured: i32, required: Option<i32>) -> i32 {
    let a = configured.max(1);
    let b = required.unwrap_or(1).max(1);
    let (mut x, mut y) = (a, b);
    while y != 0 {
        (x, y) = (y, x % y);
    }
    a / x * b
}

/// Pad to `stride`, inpaint, then crop back to the input size.
fn run_padded(inpainter: &mut dyn Inpainter, image: &Mat, mask: &Mat, stride: i32) -> Result<Mat> {
    let padded = mask::pad_to_stride(image, mask, stride)?;
    let result = inpainter.inpaint(&padded.image, &padded.mask)?;
    let result_size = result.size()?;
    if result_size != padded.image.size()? {
        bail!(
            "{} returned {}x{} for a {}x{} input",
            inpainter.name(),
            result_size.width,
            result_size.height,
            padded.image.cols(),
            padded.image.rows()
        );
    }
    mask::crop_to(&result, padded.original)
}
