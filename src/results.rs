use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::encode_array;
use crate::params::ModelName;

pub const ALGORITHM_NAME: &str = "InstanSeg";

/// Shape of a segmentation output, which depends on the model variant.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentationOutput {
    /// One label map per output channel (`C×H×W`).
    Mask3d(Array3<i32>),
    /// A single label map with every size-1 axis removed.
    InstanceMask(ArrayD<i32>),
}

impl SegmentationOutput {
    /// Wire tag understood by clients.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Mask3d(_) => "mask3d",
            Self::InstanceMask(_) => "instance_mask",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Mask3d(array) => array.shape(),
            Self::InstanceMask(array) => array.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub name: String,
}

impl ResultMetadata {
    pub fn for_model(model_name: ModelName) -> Self {
        Self {
            name: format!("{ALGORITHM_NAME} ({model_name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationResult {
    pub output: SegmentationOutput,
    pub metadata: ResultMetadata,
}

/// JSON form of a [`SegmentationResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedResult {
    #[serde(rename = "type")]
    pub kind: String,
    /// Base64 of the little-endian `int32` buffer in C order.
    pub data: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    pub data_params: ResultMetadata,
}

impl From<&SegmentationResult> for SerializedResult {
    fn from(result: &SegmentationResult) -> Self {
        let data = match &result.output {
            SegmentationOutput::Mask3d(array) => encode_array(array),
            SegmentationOutput::InstanceMask(array) => encode_array(array),
        };
        Self {
            kind: result.output.kind().to_string(),
            data,
            shape: result.output.shape().to_vec(),
            dtype: "int32".to_string(),
            data_params: result.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_name() {
        assert_eq!(
            ResultMetadata::for_model(ModelName::BrightfieldNuclei).name,
            "InstanSeg (brightfield_nuclei)"
        );
        assert_eq!(
            ResultMetadata::for_model(ModelName::FluorescenceNucleiAndCells).name,
            "InstanSeg (fluorescence_nuclei_and_cells)"
        );
    }

    #[test]
    fn test_serialized_result_json() {
        let result = SegmentationResult {
            output: SegmentationOutput::InstanceMask(ArrayD::zeros(IxDyn(&[2, 3]))),
            metadata: ResultMetadata::for_model(ModelName::BrightfieldNuclei),
        };
        let json = serde_json::to_value(SerializedResult::from(&result)).unwrap();
        assert_eq!(json["type"], "instance_mask");
        assert_eq!(json["shape"], serde_json::json!([2, 3]));
        assert_eq!(json["dtype"], "int32");
        assert_eq!(json["data_params"]["name"], "InstanSeg (brightfield_nuclei)");
        // 6 int32 values → 24 bytes → 32 base64 chars
        assert_eq!(json["data"].as_str().unwrap().len(), 32);
    }
}
