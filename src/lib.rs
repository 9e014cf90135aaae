pub mod activation;
pub mod codec;
pub mod codes;
pub mod crypto;
pub mod ecies;
pub mod error;
pub mod keys;
pub mod password;
pub mod session;
pub mod signature;
pub mod status;
pub mod vault;

pub use error::{PowerAuthError, Result};
pub use session::{ServerSignedKey, Session, State};
