use bcrypt::{hash, verify};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Password hashing failed: {0}")]
    HashingError(#[from] bcrypt::BcryptError),
    #[error("Authentication failed")]
    AuthenticationFailed,
}

/// Username/password pair presented to a proxy (RFC 1929).
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Server-side credential store. Passwords are kept only as bcrypt hashes.
pub struct AuthManager {
    users: HashMap<String, String>,
}

impl AuthManager {
    /// Lower costs make hashing cheap enough for short-lived test servers.
    pub fn with_cost(users: &HashMap<String, String>, cost: u32) -> Result<Self, AuthError> {
        let mut hashed_users = HashMap::new();
        for (username, password) in users {
            let hashed_password = hash(password, cost)?;
            hashed_users.insert(username.clone(), hashed_password);
        }
        Ok(AuthManager {
            users: hashed_users,
        })
    }

    pub fn from_credentials(credentials: &Credentials, cost: u32) -> Result<Self, AuthError> {
        let mut users = HashMap::new();
        users.insert(credentials.username.clone(), credentials.password.clone());
        Self::with_cost(&users, cost)
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    /// Bcrypt comparison runs inside `spawn_blocking` to avoid stalling the Tokio runtime.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        if self.users.is_empty() {
            return Ok(true);
        }

        match self.users.get(username) {
            Some(hashed_password) => {
                let hashed = hashed_password.clone();
                let pwd = password.to_string();
                let is_valid = tokio::task::spawn_blocking(move || verify(&pwd, &hashed))
                    .await
                    .map_err(|_| AuthError::AuthenticationFailed)??;
                Ok(is_valid)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_authenticate() {
        let mut users = HashMap::new();
        users.insert("admin".to_string(), "password".to_string());
        users.insert("user1".to_string(), "pass123".to_string());

        let auth_manager = AuthManager::with_cost(&users, 4).unwrap();

        assert!(auth_manager
            .authenticate("admin", "password")
            .await
            .unwrap());
        assert!(auth_manager.authenticate("user1", "pass123").await.unwrap());
        assert!(!auth_manager
            .authenticate("admin", "wrongpass")
            .await
            .unwrap());
        assert!(!auth_manager
            .authenticate("nonexistent", "password")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_empty_store_accepts_anyone() {
        let auth_manager = AuthManager::with_cost(&HashMap::new(), 4).unwrap();
        assert!(!auth_manager.has_users());
        assert!(auth_manager.authenticate("who", "ever").await.unwrap());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "s3cret");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("s3cret"));
    }
}
