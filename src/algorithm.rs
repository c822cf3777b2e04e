use std::time::Instant;

use ndarray::prelude::*;
use tracing::{debug, info};

use crate::{
    errors::{InstanSegError, Result},
    params::{ModelName, Parameters},
    results::{ResultMetadata, SegmentationOutput, SegmentationResult},
    traits::EngineFactory,
};

/// Runs InstanSeg on validated parameters.
///
/// A fresh engine is built for every call. Engine errors are returned as-is.
pub fn run_algorithm(
    engines: &dyn EngineFactory,
    params: &Parameters,
) -> Result<Vec<SegmentationResult>> {
    let started = Instant::now();
    info!(
        model_name = %params.model_name,
        pixel_size = params.pixel_size,
        shape = ?params.image.shape(),
        "running segmentation"
    );

    let engine = engines.create(params.model_name)?;
    let (labels, _image_tensor) = engine.eval_small_image(&params.image, params.pixel_size)?;
    let output = postprocess(labels, params.model_name)?;

    debug!(
        kind = output.kind(),
        shape = ?output.shape(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "segmentation finished"
    );
    Ok(vec![SegmentationResult {
        output,
        metadata: ResultMetadata::for_model(params.model_name),
    }])
}

/// Turns the raw `N×C×H×W` label tensor into the variant's output shape.
pub fn postprocess(labels: Array4<i32>, model_name: ModelName) -> Result<SegmentationOutput> {
    if labels.len_of(Axis(0)) == 0 {
        return Err(InstanSegError::model(
            "output postprocessing",
            "segmentation output has an empty batch",
        ));
    }
    let segmentation = reverse_channel_axis(labels.index_axis_move(Axis(0), 0));

    Ok(match model_name {
        ModelName::FluorescenceNucleiAndCells => SegmentationOutput::Mask3d(segmentation),
        ModelName::BrightfieldNuclei => {
            SegmentationOutput::InstanceMask(squeeze(segmentation.into_dyn()))
        }
    })
}

/// Flips the channel order of the engine output.
///
/// The exported networks emit channels in the opposite order of what
/// clients display; this depends on the export and must be rechecked when
/// the weights change.
pub fn reverse_channel_axis(segmentation: Array3<i32>) -> Array3<i32> {
    segmentation.slice_move(s![..;-1, .., ..])
}

/// Removes every axis of length 1.
pub fn squeeze<A>(mut array: ArrayD<A>) -> ArrayD<A> {
    for axis in (0..array.ndim()).rev() {
        if array.len_of(Axis(axis)) == 1 {
            array = array.index_axis_move(Axis(axis), 0);
        }
    }
    array
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ImageArray;
    use crate::mocks::MockEngineFactory;

    fn params(model_name: ModelName, shape: &[usize]) -> Parameters {
        Parameters {
            image: ImageArray::try_from(ArrayD::<f32>::zeros(IxDyn(shape))).unwrap(),
            model_name,
            pixel_size: 0.5,
        }
    }

    #[test]
    fn test_fluorescence_returns_single_mask3d() -> Result<()> {
        let results = run_algorithm(
            &MockEngineFactory::new(),
            &params(ModelName::FluorescenceNucleiAndCells, &[32, 24, 3]),
        )?;
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.output.kind(), "mask3d");
        assert_eq!(result.output.shape(), &[2, 32, 24]);
        assert_eq!(
            result.metadata.name,
            "InstanSeg (fluorescence_nuclei_and_cells)"
        );
        Ok(())
    }

    #[test]
    fn test_fluorescence_channels_are_reversed() -> Result<()> {
        let results = run_algorithm(
            &MockEngineFactory::new(),
            &params(ModelName::FluorescenceNucleiAndCells, &[4, 4]),
        )?;
        let SegmentationOutput::Mask3d(mask) = &results[0].output else {
            panic!("expected a 3D mask");
        };
        // the mock fills channel c with c + 1
        assert!(mask.index_axis(Axis(0), 0).iter().all(|&v| v == 2));
        assert!(mask.index_axis(Axis(0), 1).iter().all(|&v| v == 1));
        Ok(())
    }

    #[test]
    fn test_brightfield_returns_squeezed_instance_mask() -> Result<()> {
        let results = run_algorithm(
            &MockEngineFactory::new(),
            &params(ModelName::BrightfieldNuclei, &[32, 24, 3]),
        )?;
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.output.kind(), "instance_mask");
        assert_eq!(result.output.shape(), &[32, 24]);
        assert!(result.output.shape().iter().all(|&d| d != 1));
        assert_eq!(result.metadata.name, "InstanSeg (brightfield_nuclei)");
        Ok(())
    }

    #[test]
    fn test_engine_failure_propagates() {
        let factory = MockEngineFactory::failing();
        let err = run_algorithm(&factory, &params(ModelName::BrightfieldNuclei, &[4, 4]))
            .unwrap_err();
        assert!(matches!(err, InstanSegError::Model { .. }));
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn test_reverse_channel_axis() {
        let segmentation = Array3::from_shape_fn((3, 2, 2), |(c, _, _)| c as i32);
        let reversed = reverse_channel_axis(segmentation);
        assert_eq!(reversed[[0, 0, 0]], 2);
        assert_eq!(reversed[[2, 1, 1]], 0);
    }

    #[test]
    fn test_squeeze_removes_all_unit_axes() {
        let squeezed = squeeze(ArrayD::<i32>::zeros(IxDyn(&[1, 5, 1, 7, 1])));
        assert_eq!(squeezed.shape(), &[5, 7]);

        let untouched = squeeze(ArrayD::<i32>::zeros(IxDyn(&[2, 3])));
        assert_eq!(untouched.shape(), &[2, 3]);

        let scalar = squeeze(ArrayD::<i32>::zeros(IxDyn(&[1, 1])));
        assert_eq!(scalar.ndim(), 0);
    }

    #[test]
    fn test_postprocess_rejects_empty_batch() {
        let err = postprocess(Array4::zeros((0, 1, 2, 2)), ModelName::BrightfieldNuclei)
            .unwrap_err();
        assert!(matches!(err, InstanSegError::Model { .. }));
    }
}
