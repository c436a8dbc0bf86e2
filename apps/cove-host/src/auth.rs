use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::info;

/// Bearer-token check shared by HTTP handlers and the websocket route.
/// The token is the hex SHA-256 of the password, so clients never send
/// the password itself after login.
pub struct Auth {
    token: String,
}

impl Auth {
    /// Use the configured password, or generate a random one and print
    /// it once so the operator can pair the first client.
    pub fn new(password: Option<String>) -> Self {
        let password = match password {
            Some(p) => p,
            None => {
                let generated: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(12)
                    .map(char::from)
                    .collect();
                info!(password = %generated, "no password configured, generated one");
                generated
            }
        };
        Self {
            token: hash_password(&password),
        }
    }

    pub fn verify_token(&self, token: &str) -> bool {
        token == self.token
    }

    /// Accepts `Authorization: Bearer <token>` or the bare token.
    pub fn verify_header(&self, header: Option<&str>) -> bool {
        match header {
            Some(value) => {
                let token = value.strip_prefix("Bearer ").unwrap_or(value);
                self.verify_token(token)
            }
            None => false,
        }
    }
}

pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_sha256_hex_of_password() {
        // sha256("hunter2")
        assert_eq!(
            hash_password("hunter2"),
            "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7"
        );
    }

    #[test]
    fn header_forms_accepted() {
        let auth = Auth::new(Some("hunter2".into()));
        let token = hash_password("hunter2");
        assert!(auth.verify_header(Some(&format!("Bearer {token}"))));
        assert!(auth.verify_header(Some(&token)));
        assert!(!auth.verify_header(Some("Bearer nope")));
        assert!(!auth.verify_header(None));
    }

    #[test]
    fn generated_password_yields_some_token() {
        let auth = Auth::new(None);
        assert!(!auth.verify_token(""));
    }
}
