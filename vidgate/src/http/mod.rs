pub mod error;
pub mod health;
pub mod video;

pub use error::{AppError, AppResult};
