//! HTTP lifecycle API for tabular classification models.
//!
//! Two services share the same pipeline: [`single`] keeps one model in
//! memory, [`persistent`] stores many models in the record and artifact
//! stores.

pub mod error;
pub mod persistent;
pub mod request;
pub mod single;
pub mod state;

pub use error::ApiError;
pub use persistent::AppState;
pub use single::SingleState;
pub use state::Settings;
