mod response;
mod stream;

pub use response::transform_response;
pub use stream::GeminiStreamToClaudeEvents;
