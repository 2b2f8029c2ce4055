mod callback;
mod context;
mod error;
mod oauth;
mod token_store;
mod tokens;
mod utils;

pub use callback::{AuthorizationCallback, CallbackFlow, CallbackPhase};
pub use context::{SessionContext, SessionState};
pub use error::AuthError;
pub use oauth::{AuthorizationGrant, LoginOutcome, OAuthFlowHandler, PendingAuthorization};
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use tokens::{TokenPair, UserSnapshot, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
pub use utils::random_state;
