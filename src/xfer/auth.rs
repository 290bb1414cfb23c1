//! Login verification and capability sets.
//!
//! A `login USER NONCE SIGNATURE` line binds the credentials to the rest of
//! the batch: NONCE must be the SHA1 of every byte after the login line, and
//! SIGNATURE must be SHA1(NONCE ‖ password).

use crate::config::UserConfig;
use crate::hash::sha1_hex;
use crate::xfer::codec::Message;
use std::collections::HashMap;

/// User whose capabilities every session holds without logging in
pub const NOBODY: &str = "nobody";

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        /// `o`: pull artifacts
        const READ = 1 << 0;
        /// `i`: push artifacts
        const WRITE = 1 << 1;
        /// `g`: clone the repository
        const CLONE = 1 << 2;
    }
}

impl Capabilities {
    /// Parse a capability letter string such as `"oig"`. Unknown letters are
    /// ignored; `a` and `s` (admin, setup) imply everything.
    pub fn from_letters(letters: &str) -> Self {
        letters.chars().fold(Self::empty(), |caps, c| match c {
            'o' => caps | Self::READ,
            'i' => caps | Self::WRITE,
            'g' => caps | Self::CLONE,
            'a' | 's' => Self::all(),
            _ => caps,
        })
    }

    pub fn to_letters(self) -> String {
        let mut out = String::new();
        if self.contains(Self::READ) {
            out.push('o');
        }
        if self.contains(Self::WRITE) {
            out.push('i');
        }
        if self.contains(Self::CLONE) {
            out.push('g');
        }
        out
    }
}

#[derive(Debug, Clone)]
struct UserEntry {
    password: String,
    caps: Capabilities,
}

/// Users known to a serving repository.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, UserEntry>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(users: &[UserConfig]) -> Self {
        let mut table = Self::new();
        for user in users {
            table.insert(
                &user.name,
                &user.password,
                Capabilities::from_letters(&user.caps),
            );
        }
        table
    }

    pub fn insert(&mut self, name: &str, password: &str, caps: Capabilities) {
        self.users.insert(
            name.to_string(),
            UserEntry {
                password: password.to_string(),
                caps,
            },
        );
    }

    /// Capabilities granted before any login.
    pub fn nobody(&self) -> Capabilities {
        self.users
            .get(NOBODY)
            .map(|entry| entry.caps)
            .unwrap_or_default()
    }

    /// Verify a login line. `rest` is every byte of the batch after the
    /// login line. Returns the user's capabilities on success.
    pub fn verify(&self, user: &str, nonce: &str, signature: &str, rest: &[u8]) -> Option<Capabilities> {
        if user == NOBODY {
            return None;
        }
        if sha1_hex(rest) != nonce {
            tracing::warn!("login nonce for {} does not match message body", user);
            return None;
        }
        let entry = self.users.get(user)?;
        if sign(nonce, &entry.password) != signature {
            tracing::warn!("login signature mismatch for {}", user);
            return None;
        }
        Some(entry.caps)
    }
}

/// SHA1(nonce ‖ password) in hex.
pub fn sign(nonce: &str, password: &str) -> String {
    let mut input = String::with_capacity(nonce.len() + password.len());
    input.push_str(nonce);
    input.push_str(password);
    sha1_hex(input.as_bytes())
}

/// Build the login line that authenticates `body` (everything sent after it).
pub fn login_message(user: &str, password: &str, body: &[u8]) -> Message {
    let nonce = sha1_hex(body);
    let signature = sign(&nonce, password);
    Message::Login {
        user: user.to_string(),
        nonce,
        signature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> UserTable {
        let mut table = UserTable::new();
        table.insert("alice", "secret", Capabilities::from_letters("oi"));
        table.insert(NOBODY, "", Capabilities::from_letters("g"));
        table
    }

    #[test]
    fn test_letters() {
        assert_eq!(
            Capabilities::from_letters("oig"),
            Capabilities::READ | Capabilities::WRITE | Capabilities::CLONE
        );
        assert_eq!(Capabilities::from_letters("xo"), Capabilities::READ);
        assert_eq!(Capabilities::from_letters("s"), Capabilities::all());
        assert_eq!(Capabilities::from_letters("io").to_letters(), "oi");
    }

    #[test]
    fn test_valid_login() {
        let body = b"pull a b\n";
        let Message::Login {
            user,
            nonce,
            signature,
        } = login_message("alice", "secret", body)
        else {
            panic!("Expected Login");
        };
        let caps = table().verify(&user, &nonce, &signature, body).unwrap();
        assert_eq!(caps, Capabilities::READ | Capabilities::WRITE);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let body = b"push a b\n";
        let Message::Login { nonce, signature, .. } = login_message("alice", "guess", body) else {
            panic!("Expected Login");
        };
        assert!(table().verify("alice", &nonce, &signature, body).is_none());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let Message::Login { nonce, signature, .. } =
            login_message("alice", "secret", b"pull a b\n")
        else {
            panic!("Expected Login");
        };
        assert!(table()
            .verify("alice", &nonce, &signature, b"push a b\n")
            .is_none());
    }

    #[test]
    fn test_nobody_cannot_log_in() {
        let body = b"clone\n";
        let nonce = sha1_hex(body);
        let signature = sign(&nonce, "");
        assert!(table().verify(NOBODY, &nonce, &signature, body).is_none());
        assert_eq!(table().nobody(), Capabilities::CLONE);
    }
}
