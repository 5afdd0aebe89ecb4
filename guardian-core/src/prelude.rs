pub use crate::Strng;
pub use std::sync::Arc;
pub use std::time::Duration;
pub use tracing::{debug, error, info, trace, warn};
