pub mod analysis;
mod gemini;

pub use gemini::GeminiClient;
