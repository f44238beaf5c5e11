pub mod envelope;
pub mod error;

pub use envelope::{ok, Envelope, ListResponse, Pagination};
pub use error::AppError;
