pub mod acquire;
pub mod cache;
pub mod codec;
pub mod config;
pub mod device_map;
mod error;
pub mod handler;
pub mod loader;
mod loader_factory;
pub mod pipeline;
pub mod schema;
mod stable_diffusion;
mod util;

pub use acquire::{Acquirer, DownloadBackend, ModelSource};
pub use cache::ModelCache;
pub use device_map::*;
pub use error::{TintError, TintResult};
pub use handler::{ErrorPayload, JobHandler, JobOutput};
pub use loader::DiffusersLoader;
pub use loader_factory::ModelVariant;
pub use pipeline::*;
pub use schema::{ImageInput, JobInput};
pub use stable_diffusion::StableDiffusionModel;
pub(crate) use util::*;
