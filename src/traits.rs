use ndarray::prelude::*;

use crate::codec::ImageArray;
use crate::errors::Result;
use crate::params::ModelName;

/// A pretrained instance-segmentation network.
pub trait SegmentationEngine: Send + Sync {
    /// Segments a single image that fits in memory in one pass.
    ///
    /// `pixel_size` is the physical resolution of `image` in µm/px. Returns
    /// the label tensor (`N×C×H×W`, same height and width as `image`) and the
    /// preprocessed image tensor that was fed to the network.
    fn eval_small_image(
        &self,
        image: &ImageArray,
        pixel_size: f64,
    ) -> Result<(Array4<i32>, Array4<f32>)>;
}

/// Builds engines for a model variant.
///
/// Held by the application state so request handlers never reach for a
/// global model.
pub trait EngineFactory: Send + Sync {
    fn create(&self, model_name: ModelName) -> Result<Box<dyn SegmentationEngine>>;
}
