use std::{
    fmt::Display,
    path::{Path, PathBuf},
    time::Instant,
};

use ndarray::prelude::*;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::SessionBuilder, Session},
    value::{DynValue, TensorRef},
};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    codec::ImageArray,
    errors::{InstanSegError, Result},
    params::ModelName,
    traits::{EngineFactory, SegmentationEngine},
};

/// Spatial dimensions of the network input must be a multiple of this.
const PADDING_MULTIPLE: usize = 32;
const PERCENTILE_LOW: f32 = 0.1;
const PERCENTILE_HIGH: f32 = 99.9;
const PIXEL_SIZE_METADATA_KEY: &str = "pixel_size";
/// Upper bound on the padded `C×H×W` network input (1 GiB of f32).
const MAX_INPUT_ELEMENTS: usize = 1 << 28;

/// InstanSeg network exported to ONNX.
pub struct InstanSegModel {
    pub model_name: ModelName,
    /// Resolution the weights expect, in µm/px.
    pub pixel_size: f64,
    input_name: String,
    session: Mutex<Session>,
}

fn model_error<E: Display>(operation: impl Into<String>) -> impl FnOnce(E) -> InstanSegError {
    let operation = operation.into();
    move |e| InstanSegError::model(operation, e.to_string())
}

impl InstanSegModel {
    pub fn new(model_name: ModelName, model_path: &Path, device_id: i32) -> Result<Self> {
        let session = SessionBuilder::new()
            .map_err(model_error("session builder init"))?
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()])
            .map_err(model_error("execution provider setup"))?
            .with_memory_pattern(true)
            .map_err(model_error("memory pattern setup"))?
            .commit_from_file(model_path)
            .map_err(model_error(format!(
                "model load: {}",
                model_path.display()
            )))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| InstanSegError::model("model input lookup", "model has no inputs"))?;

        let pixel_size =
            read_pixel_size(&session).unwrap_or_else(|| model_name.default_pixel_size());
        debug!(%model_name, pixel_size, input = %input_name, "model loaded");

        Ok(Self {
            model_name,
            pixel_size,
            input_name,
            session: Mutex::new(session),
        })
    }

    /// Runs the network on a `1×C×H×W` tensor and returns its label output.
    pub fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<i32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        extract_labels(&outputs[0])
    }
}

impl SegmentationEngine for InstanSegModel {
    fn eval_small_image(
        &self,
        image: &ImageArray,
        pixel_size: f64,
    ) -> Result<(Array4<i32>, Array4<f32>)> {
        let started = Instant::now();
        let output = run_pipeline(image, pixel_size / self.pixel_size, |input| {
            self.predict(input)
        })?;
        debug!(
            model_name = %self.model_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inference finished"
        );
        Ok(output)
    }
}

/// Normalizes, rescales and pads `image`, runs `network` on the `1×C×H×W`
/// tensor, then crops the padding off and resizes labels back to the input
/// size.
fn run_pipeline<F>(
    image: &ImageArray,
    scale: f64,
    network: F,
) -> Result<(Array4<i32>, Array4<f32>)>
where
    F: FnOnce(ArrayView4<f32>) -> Result<Array4<i32>>,
{
    let (height, width) = image.spatial_size();

    let planes = to_channels_first(image)?;
    let planes = percentile_normalize(planes.view())?;
    let planes = rescale(planes, scale)?;
    let (channels, scaled_h, scaled_w) = planes.dim();
    check_input_size(channels, scaled_h, scaled_w)?;

    let input = pad_to_multiple(planes.view(), PADDING_MULTIPLE).insert_axis(Axis(0));
    let labels = network(input.view())?;
    let labels = resize_labels(
        labels.slice(s![.., .., ..scaled_h, ..scaled_w]),
        height,
        width,
    )?;
    let image_tensor = input.slice(s![.., .., ..scaled_h, ..scaled_w]).to_owned();
    Ok((labels, image_tensor))
}

/// Loads `<model_dir>/<model_name>.onnx` for every request.
#[derive(Debug, Clone)]
pub struct OnnxEngineFactory {
    model_dir: PathBuf,
    device_id: i32,
}

impl OnnxEngineFactory {
    pub fn new(model_dir: impl Into<PathBuf>, device_id: i32) -> Self {
        Self {
            model_dir: model_dir.into(),
            device_id,
        }
    }

    pub fn model_path(&self, model_name: ModelName) -> PathBuf {
        self.model_dir.join(format!("{model_name}.onnx"))
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn create(&self, model_name: ModelName) -> Result<Box<dyn SegmentationEngine>> {
        let path = self.model_path(model_name);
        if !path.is_file() {
            return Err(InstanSegError::FileSystem {
                path,
                operation: "model lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "model file does not exist",
                ),
            });
        }
        Ok(Box::new(InstanSegModel::new(
            model_name,
            &path,
            self.device_id,
        )?))
    }
}

fn read_pixel_size(session: &Session) -> Option<f64> {
    let metadata = session.metadata().ok()?;
    let value = metadata.custom(PIXEL_SIZE_METADATA_KEY).ok()??;
    value.trim().parse().ok().filter(|v: &f64| *v > 0.0)
}

/// Exported models emit integer labels; older exports emit floats.
fn extract_labels(value: &DynValue) -> Result<Array4<i32>> {
    let labels = if let Ok(view) = value.try_extract_array::<i32>() {
        view.to_owned()
    } else if let Ok(view) = value.try_extract_array::<i64>() {
        view.mapv(|v| v as i32)
    } else {
        value.try_extract_array::<f32>()?.mapv(|v| v.round() as i32)
    };
    Ok(labels.into_dimensionality::<Ix4>()?)
}

/// `H×W` becomes `1×H×W`, `H×W×C` becomes `C×H×W`.
fn to_channels_first(image: &ImageArray) -> Result<Array3<f32>> {
    let view = image.view();
    let planes = if view.ndim() == 2 {
        view.into_dimensionality::<Ix2>()?
            .insert_axis(Axis(0))
            .to_owned()
    } else {
        view.into_dimensionality::<Ix3>()?
            .permuted_axes([2, 0, 1])
            .to_owned()
    };
    Ok(planes)
}

fn percentile_normalize(planes: ArrayView3<f32>) -> Result<Array3<f32>> {
    let normalized = (0..planes.len_of(Axis(0)))
        .into_par_iter()
        .map(|c| normalize_plane(planes.index_axis(Axis(0), c)))
        .collect::<Vec<_>>();
    stack_planes(&normalized)
}

fn normalize_plane(plane: ArrayView2<f32>) -> Array2<f32> {
    let mut values: Vec<f32> = plane.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Array2::zeros(plane.raw_dim());
    }
    values.sort_unstable_by(f32::total_cmp);

    let low = percentile(&values, PERCENTILE_LOW);
    let high = percentile(&values, PERCENTILE_HIGH);
    let range = high - low;
    if range <= f32::EPSILON {
        return Array2::zeros(plane.raw_dim());
    }
    plane.mapv(|v| (v - low) / range)
}

/// Linear interpolation between closest ranks.
fn percentile(sorted: &[f32], q: f32) -> f32 {
    let rank = q / 100.0 * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Rejects inputs whose padded tensor would exceed `MAX_INPUT_ELEMENTS`.
fn check_input_size(channels: usize, height: usize, width: usize) -> Result<()> {
    let padded = |len: usize| len.div_ceil(PADDING_MULTIPLE).checked_mul(PADDING_MULTIPLE);
    let elements = padded(height)
        .zip(padded(width))
        .and_then(|(h, w)| channels.checked_mul(h)?.checked_mul(w));
    match elements {
        Some(n) if n <= MAX_INPUT_ELEMENTS => Ok(()),
        _ => Err(InstanSegError::model(
            "input size check",
            format!("{channels}x{height}x{width} input exceeds {MAX_INPUT_ELEMENTS} elements"),
        )),
    }
}

/// Bilinear rescale by `scale`.
fn rescale(planes: Array3<f32>, scale: f64) -> Result<Array3<f32>> {
    if (scale - 1.0).abs() < 1e-3 {
        return Ok(planes);
    }
    let (channels, height, width) = planes.dim();
    if height == 0 || width == 0 {
        return Err(InstanSegError::model("input rescale", "empty image"));
    }
    let new_height = ((height as f64 * scale).round() as usize).max(1);
    let new_width = ((width as f64 * scale).round() as usize).max(1);
    check_input_size(channels, new_height, new_width)?;

    let resized = (0..channels)
        .into_par_iter()
        .map(|c| resize_plane(planes.index_axis(Axis(0), c), new_height, new_width))
        .collect::<Vec<_>>();
    stack_planes(&resized)
}

fn pad_to_multiple(planes: ArrayView3<f32>, multiple: usize) -> Array3<f32> {
    let (channels, height, width) = planes.dim();
    let padded_height = height.div_ceil(multiple) * multiple;
    let padded_width = width.div_ceil(multiple) * multiple;

    let mut padded = Array3::zeros((channels, padded_height, padded_width));
    padded.slice_mut(s![.., ..height, ..width]).assign(&planes);
    padded
}

/// Nearest-neighbor resize on pixel centers.
///
/// `imageops::resize` goes through an f32 intermediate clamped to the
/// subpixel range, so label ids are indexed directly instead.
fn resize_labels(labels: ArrayView4<i32>, height: usize, width: usize) -> Result<Array4<i32>> {
    let (batch, channels, h, w) = labels.dim();
    if (h, w) == (height, width) {
        return Ok(labels.to_owned());
    }
    if h == 0 || w == 0 {
        return Err(InstanSegError::model("label resize", "empty label map"));
    }

    let source = |target: usize, target_len: usize, source_len: usize| {
        let position = (target as f64 + 0.5) * source_len as f64 / target_len as f64;
        (position.floor() as usize).min(source_len - 1)
    };
    Ok(Array4::from_shape_fn(
        (batch, channels, height, width),
        |(n, c, y, x)| labels[[n, c, source(y, height, h), source(x, width, w)]],
    ))
}

/// Bilinear resample on half-pixel centers. Samples are not clamped, so the
/// normalization tails survive.
fn resize_plane(plane: ArrayView2<f32>, height: usize, width: usize) -> Array2<f32> {
    let (h, w) = plane.dim();
    let taps = |target_len: usize, source_len: usize| -> Vec<(usize, usize, f32)> {
        let ratio = source_len as f64 / target_len as f64;
        (0..target_len)
            .map(|target| {
                let position =
                    ((target as f64 + 0.5) * ratio - 0.5).clamp(0.0, (source_len - 1) as f64);
                let lower = position.floor() as usize;
                let upper = (lower + 1).min(source_len - 1);
                (lower, upper, (position - lower as f64) as f32)
            })
            .collect()
    };
    let rows = taps(height, h);
    let cols = taps(width, w);

    Array2::from_shape_fn((height, width), |(y, x)| {
        let (y0, y1, wy) = rows[y];
        let (x0, x1, wx) = cols[x];
        let top = plane[[y0, x0]] * (1.0 - wx) + plane[[y0, x1]] * wx;
        let bottom = plane[[y1, x0]] * (1.0 - wx) + plane[[y1, x1]] * wx;
        top * (1.0 - wy) + bottom * wy
    })
}

fn stack_planes(planes: &[Array2<f32>]) -> Result<Array3<f32>> {
    let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}
