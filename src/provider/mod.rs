pub mod mock;
pub mod traits;

pub use mock::{MockProvider, MockResponse, MockToolCall};
pub use traits::{Chunk, Provider, ProviderRequest, ToolDefinition};
