//! Where the listener gets its bearer token from.

use std::path::PathBuf;

use notify_channel::CredentialSource;
use tracing::debug;

/// Token given on the command line, or a file re-read on every poll so that
/// rewriting the file rotates the credential.
#[derive(Debug, Clone)]
pub enum TokenSource {
    Fixed(String),
    File(PathBuf),
}

impl CredentialSource for TokenSource {
    fn current(&self) -> Option<String> {
        match self {
            TokenSource::Fixed(token) => Some(token.clone()),
            TokenSource::File(path) => match std::fs::read_to_string(path) {
                Ok(contents) => Some(contents.trim().to_string()),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Token file unreadable");
                    None
                }
            },
        }
    }
}
