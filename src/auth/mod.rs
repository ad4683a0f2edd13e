pub mod refresh;
pub mod tokens;

pub use refresh::OauthRefresher;
pub use tokens::{TokenDetails, TokenPair};
