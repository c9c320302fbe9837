pub mod claude2gemini;
pub mod gemini2claude;
pub mod model_mapping;
pub mod signature_recovery;
pub mod stream2nostream;
