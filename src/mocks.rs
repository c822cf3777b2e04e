use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use ndarray::prelude::*;

use crate::codec::ImageArray;
use crate::errors::{InstanSegError, Result};
use crate::params::ModelName;
use crate::traits::{EngineFactory, SegmentationEngine};

/// Deterministic stand-in for the ONNX network.
///
/// Output channel `c` is filled with the value `c + 1`, which makes the
/// channel order visible to tests.
#[derive(Debug, Clone)]
pub struct MockSegmentationEngine {
    pub output_channels: usize,
}

impl MockSegmentationEngine {
    pub const fn new(output_channels: usize) -> Self {
        Self { output_channels }
    }

    /// Nuclei and cells for the fluorescence model, nuclei only for
    /// brightfield.
    pub const fn for_model(model_name: ModelName) -> Self {
        match model_name {
            ModelName::FluorescenceNucleiAndCells => Self::new(2),
            ModelName::BrightfieldNuclei => Self::new(1),
        }
    }
}

impl SegmentationEngine for MockSegmentationEngine {
    fn eval_small_image(
        &self,
        image: &ImageArray,
        _pixel_size: f64,
    ) -> Result<(Array4<i32>, Array4<f32>)> {
        let (height, width) = image.spatial_size();
        let labels = Array4::from_shape_fn(
            (1, self.output_channels, height, width),
            |(_, c, _, _)| c as i32 + 1,
        );
        let channels = if image.ndim() == 3 { image.shape()[2] } else { 1 };
        Ok((labels, Array4::zeros((1, channels, height, width))))
    }
}

/// Factory handing out [`MockSegmentationEngine`]s and counting the calls.
#[derive(Debug, Clone, Default)]
pub struct MockEngineFactory {
    created: Arc<AtomicUsize>,
    fail: bool,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose engines can never be built.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, model_name: ModelName) -> Result<Box<dyn SegmentationEngine>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(InstanSegError::model("model load", "mock failure"));
        }
        Ok(Box::new(MockSegmentationEngine::for_model(model_name)))
    }
}
