// Authentication module
// Manages the session lifecycle: login, validation, single-flight refresh, logout

mod manager;
pub mod recovery;
mod refresh;
pub mod token;
mod types;

pub use manager::{SessionManager, SessionOptions, LOGIN_PATH, LOGOUT_PATH, PROFILE_PATH};
pub use refresh::REFRESH_PATH;
pub use types::{LoginCredentials, Session, SessionState, UserProfile};
