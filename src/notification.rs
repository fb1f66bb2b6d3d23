//! Status messages posted back to the originating PR thread

use async_trait::async_trait;

use crate::error::CollaboratorError;

pub const DEFAULT_SITE_URL: &str = "https://cha-ching.it";

/// Posts comments on issue/PR threads.
///
/// Fire-and-forget from the caller's side: failures are logged by the
/// caller, never retried.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// `repo` is `owner/name`.
    async fn post_comment(
        &self,
        repo: &str,
        thread_number: u64,
        body: &str,
    ) -> Result<(), CollaboratorError>;
}

/// The messages the bot ever sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    AddressRequest { author: String },
    AddressReceived { author: String, address: String },
    Payout { author: String, site_url: String },
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::AddressRequest { .. } => "address-request",
            Notice::AddressReceived { .. } => "address-received",
            Notice::Payout { .. } => "payout",
        }
    }

    pub fn render(&self) -> String {
        match self {
            Notice::AddressRequest { author } => format!(
                "Hey @{},\n\nThanks for your contribution! 🙌 This PR is linked to a bounty.\n\n\
                 To receive the payout once it is merged, please reply in this thread with the \
                 EVM address of your wallet (e.g. `0x...`).",
                author
            ),
            Notice::AddressReceived { author, address } => format!(
                "Thanks @{}! 🙏\n\nWe recorded `{}` as your payout address. \
                 The bounty will be sent there once this PR is merged.",
                author, address
            ),
            Notice::Payout { author, site_url } => format!(
                "Hey @{},\n\nCHAAAA-CHIIIING! 🥳🥳🥳\n\nThe bounty was sent to your wallet. \
                 Enjoy! 🚀\n\nFeel free to come back and find more bounties at {}",
                author, site_url
            ),
        }
    }
}
