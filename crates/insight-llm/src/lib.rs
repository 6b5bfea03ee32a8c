pub mod converter;
pub mod gemini;
pub mod mock;

pub use gemini::GeminiReasoner;
pub use mock::{MockReasoner, MockTurn};
