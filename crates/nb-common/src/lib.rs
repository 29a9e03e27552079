pub mod envelope;
pub mod logging;

pub use envelope::{Envelope, EnvelopeStatus, Map, StatusCode, TIMESTAMP_FORMAT};
