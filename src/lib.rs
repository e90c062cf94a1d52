pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

pub use config::{AppConfig, ExtractionConfig, ModelConfig};
pub use error::{Error, Result};
pub use models::{Fact, Interaction, PreferenceAnalysis, QuizQuestion, SwipeDirection};
