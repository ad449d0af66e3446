// OAuth login, session tokens and provider token management

pub mod coordinator;
pub mod login;
pub mod provider;
pub mod state;
pub mod token;
pub mod token_manager;

pub use coordinator::{CompletedLogin, OAuthCoordinator};
pub use login::{LoginService, RedirectPolicy};
pub use provider::{IdentityProvider, OAuthProvider, ProviderIdentity, ProviderTokens};
pub use state::{StateData, StateStore};
pub use token::SessionTokens;
pub use token_manager::TokenManager;
