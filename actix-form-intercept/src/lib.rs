//! Multipart form interception for Actix Web.
//!
//! [`FormIntercept`] parses `multipart/form-data` POST and PUT requests
//! before they reach handlers. Text fields become [`FormFields`] (a name sent
//! more than once collects every value), uploads are stored on disk and
//! described by [`UploadedFiles`]. Every other request passes through
//! untouched.

mod config;
mod engine;
mod extractor;
mod form;
mod middleware;

pub use config::*;
pub use engine::*;
pub use extractor::*;
pub use form::*;
pub use middleware::*;
