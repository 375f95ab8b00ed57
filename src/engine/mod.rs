pub mod openai;
pub mod types;

use crate::request::RequestDescriptor;
use async_trait::async_trait;

pub use types::{InferenceResponse, InvokeError, Usage};

/// The single call to the external model. Transport, credentials and any
/// client-side timeout live behind this seam.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn invoke(&self, req: &RequestDescriptor) -> Result<InferenceResponse, InvokeError>;
}
