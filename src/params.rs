use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec::{decode_contents, ImageArray};
use crate::errors::{InstanSegError, Result};

pub const PIXEL_SIZE_MIN: f64 = 0.1;
pub const PIXEL_SIZE_MAX: f64 = 10.0;
pub const PIXEL_SIZE_DEFAULT: f64 = 0.5;
/// Slider granularity advertised to clients. Not enforced.
pub const PIXEL_SIZE_STEP: f64 = 0.05;

/// Pretrained InstanSeg variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelName {
    #[default]
    FluorescenceNucleiAndCells,
    BrightfieldNuclei,
}

impl ModelName {
    pub const ALL: [ModelName; 2] = [Self::FluorescenceNucleiAndCells, Self::BrightfieldNuclei];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FluorescenceNucleiAndCells => "fluorescence_nuclei_and_cells",
            Self::BrightfieldNuclei => "brightfield_nuclei",
        }
    }

    /// Physical resolution the weights were trained at, in µm/px.
    pub const fn default_pixel_size(&self) -> f64 {
        match self {
            Self::FluorescenceNucleiAndCells | Self::BrightfieldNuclei => 0.5,
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelName {
    type Err = InstanSegError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<_> = Self::ALL.iter().map(|m| format!("'{m}'")).collect();
                InstanSegError::validation(
                    "model_name",
                    format!("Input should be {}", allowed.join(" or ")),
                )
            })
    }
}

/// Request body as it arrives on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawParameters {
    pub image: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub pixel_size: Option<f64>,
}

/// Validated algorithm parameters.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub image: ImageArray,
    pub model_name: ModelName,
    pub pixel_size: f64,
}

impl TryFrom<RawParameters> for Parameters {
    type Error = InstanSegError;

    /// The image is decoded last so that cheap checks fail first.
    fn try_from(raw: RawParameters) -> Result<Self> {
        let model_name = match raw.model_name.as_deref() {
            Some(name) => name.parse()?,
            None => ModelName::default(),
        };
        let pixel_size = validate_pixel_size(raw.pixel_size.unwrap_or(PIXEL_SIZE_DEFAULT))?;
        let image = decode_contents(&raw.image)?;

        Ok(Self {
            image,
            model_name,
            pixel_size,
        })
    }
}

pub fn validate_pixel_size(pixel_size: f64) -> Result<f64> {
    if !pixel_size.is_finite() {
        return Err(InstanSegError::validation(
            "pixel_size",
            "Input should be a finite number",
        ));
    }
    if pixel_size < PIXEL_SIZE_MIN {
        return Err(InstanSegError::validation(
            "pixel_size",
            format!("Input should be greater than or equal to {PIXEL_SIZE_MIN}"),
        ));
    }
    if pixel_size > PIXEL_SIZE_MAX {
        return Err(InstanSegError::validation(
            "pixel_size",
            format!("Input should be less than or equal to {PIXEL_SIZE_MAX}"),
        ));
    }
    Ok(pixel_size)
}

/// JSON schema of the request body, including the widget hints clients use
/// to render a form.
pub fn parameters_schema() -> Value {
    let models: Vec<_> = ModelName::ALL.iter().map(ModelName::as_str).collect();
    json!({
        "title": "Parameters",
        "description": "Defines the algorithm parameters",
        "type": "object",
        "properties": {
            "image": {
                "title": "Image",
                "description": "Input image (2D, RGB).",
                "type": "string",
                "widget_type": "image",
            },
            "model_name": {
                "title": "Model",
                "description": "Segmentation model",
                "enum": models,
                "type": "string",
                "default": ModelName::default().as_str(),
                "widget_type": "dropdown",
            },
            "pixel_size": {
                "title": "Pixel size (um/px)",
                "description": "Pixel size (um/px)",
                "type": "number",
                "minimum": PIXEL_SIZE_MIN,
                "maximum": PIXEL_SIZE_MAX,
                "default": PIXEL_SIZE_DEFAULT,
                "widget_type": "float",
                "step": PIXEL_SIZE_STEP,
            },
        },
        "required": ["image"],
    })
}
