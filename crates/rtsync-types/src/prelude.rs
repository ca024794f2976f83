pub use crate::error::{Error, RtResult};
pub use tracing::{debug, error, info, trace, warn};

// vim: ts=4
