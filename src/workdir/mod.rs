mod credentials;
mod store;
mod variables;
mod workspace;

pub use credentials::Credentials;
pub use store::{normalize_environment, validate_file_name, ConfigStore};
pub use variables::{Variable, Variables};
pub use workspace::{WorkingDirectory, LOGS_DIR, OVERLAY_FILE};
