// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! Credential vault.
//!
//! Hosts marked `PasswordRequired` need a sudo password on their remote
//! shell. The vault hands out the unlocked password for a host, asking the
//! secret-prompt collaborator exactly once per host and caching the answer
//! under a mutex for the rest of the run. The run clears the vault on the way
//! out, so unlocked credentials never outlive the process's working phase.
//! At-rest encryption of the configured vault file is handled outside this
//! crate; cfgpush only ever sees the unlocked values.

use crate::Result;

use std::{
    collections::HashMap,
    sync::Mutex,
};
use tracing::debug;

/// Collaborator answering interactive secret prompts.
pub trait SecretPrompt: Send + Sync {
    /// Obtain a secret from the operator.
    ///
    /// # Errors
    ///
    /// Will fail if the prompt cannot be shown or the operator cancels it.
    fn secret(&self, prompt: &str) -> Result<String>;
}

/// Per-host unlocked sudo passwords.
pub struct Vault {
    prompt: Box<dyn SecretPrompt>,
    secrets: Mutex<HashMap<String, String>>,
}

impl Vault {
    /// Construct an empty vault backed by a secret prompt.
    pub fn new(prompt: Box<dyn SecretPrompt>) -> Self {
        Self { prompt, secrets: Mutex::new(HashMap::new()) }
    }

    /// Unlocked sudo password of a host, prompting on first use.
    ///
    /// # Panics
    ///
    /// Will panic if the secret mutex is poisoned.
    ///
    /// # Errors
    ///
    /// Will fail if the operator cancels the prompt.
    pub fn unlock(&self, host: impl AsRef<str>) -> Result<String> {
        let host = host.as_ref();

        if let Some(secret) = self.secrets.lock().unwrap().get(host) {
            return Ok(secret.clone());
        }

        debug!("Vault miss for {host:?}, prompting");
        let secret = self.prompt.secret(&format!("sudo password for {host}"))?;
        self.secrets.lock().unwrap().insert(host.into(), secret.clone());

        Ok(secret)
    }

    /// Drop every unlocked credential.
    ///
    /// # Panics
    ///
    /// Will panic if the secret mutex is poisoned.
    pub fn clear(&self) {
        self.secrets.lock().unwrap().clear();
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.secrets.lock().map(|secrets| secrets.len()).unwrap_or(0);
        write!(f, "Vault {{ unlocked: {count} }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct CountingPrompt(Arc<AtomicUsize>);

    impl SecretPrompt for CountingPrompt {
        fn secret(&self, prompt: &str) -> Result<String> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(format!("secret for {prompt}"))
        }
    }

    #[test]
    fn smoke_vault_prompts_once_per_host() -> Result<()> {
        let count = Arc::new(AtomicUsize::new(0));
        let vault = Vault::new(Box::new(CountingPrompt(count.clone())));

        let first = vault.unlock("web01")?;
        let second = vault.unlock("web01")?;
        let other = vault.unlock("db01")?;

       pretty_assertions::assert_eq!(first, second);
        assert_ne!(first, other);
       pretty_assertions::assert_eq!(count.load(Ordering::Relaxed), 2);

        Ok(())
    }

    #[test]
    fn smoke_vault_clear_forces_reprompt() -> Result<()> {
        let count = Arc::new(AtomicUsize::new(0));
        let vault = Vault::new(Box::new(CountingPrompt(count.clone())));

        vault.unlock("web01")?;
        vault.unlock("web01")?;
        vault.clear();
        vault.unlock("web01")?;

       pretty_assertions::assert_eq!(count.load(Ordering::Relaxed), 2);

        Ok(())
    }
}
