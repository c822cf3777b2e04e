pub mod algorithm;
pub mod codec;
pub mod config;
pub mod errors;
pub mod model;
pub mod params;
pub mod results;
pub mod samples;
pub mod server;
pub mod traits;

pub mod mocks;

pub use algorithm::run_algorithm;
pub use codec::{decode_contents, ImageArray};
pub use config::Config;
pub use errors::{InstanSegError, Result};
pub use model::{InstanSegModel, OnnxEngineFactory};
pub use params::{ModelName, Parameters, RawParameters};
pub use results::{ResultMetadata, SegmentationOutput, SegmentationResult, SerializedResult};
pub use samples::{load_sample_images, SampleImage};
pub use server::{create_router, serve, AppState};
pub use traits::*;
