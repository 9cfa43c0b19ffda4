//! Development mailbox for verification tokens.

use party_core::identity::{IdentityError, VerificationToken};
use party_core::model::Email;
use party_postgres::{ConsoleMailer, VerificationMailer};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Logs every verification e-mail and keeps the latest token per address.
///
/// Lets a local run finish the verification flow without a mail server.
#[derive(Clone, Debug, Default)]
pub struct DevMailbox {
    console: ConsoleMailer,
    latest: Arc<Mutex<HashMap<Email, VerificationToken>>>,
}

impl DevMailbox {
    /// Empty mailbox
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent token sent to `email`
    #[must_use]
    pub fn latest(&self, email: &Email) -> Option<VerificationToken> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(email)
            .cloned()
    }
}

impl VerificationMailer for DevMailbox {
    fn send_verification<'a>(
        &'a self,
        to: &'a Email,
        token: &'a VerificationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), IdentityError>> + Send + 'a>> {
        Box::pin(async move {
            self.console.send_verification(to, token).await?;
            self.latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(to.clone(), token.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keeps_latest_token_per_address() {
        let mailbox = DevMailbox::new();
        let ana = Email::new("ana@example.com");

        mailbox.send_verification(&ana, &VerificationToken::new("first")).await.ok();
        mailbox.send_verification(&ana, &VerificationToken::new("second")).await.ok();

        assert_eq!(mailbox.latest(&ana), Some(VerificationToken::new("second")));
        assert_eq!(mailbox.latest(&Email::new("bob@example.com")), None);
    }
}
