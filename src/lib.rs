//! Gitclaim - pay out GitHub issue bounties against verified web proofs
//!
//! Funders attach a bounty to a repository issue. The service then follows
//! the GitHub webhook stream for that repository:
//!
//! 1. A PR whose body closes a bounty's issue is linked to the bounty and
//!    its author is asked for an EVM payout address
//! 2. The author supplies the address in the PR body or a comment
//! 3. Once the PR is merged, a proof source document is uploaded, a web
//!    proof is generated for it and verified remotely
//! 4. The verified proof is stored on the bounty and the author is told
//!    the payout went out
//!
//! Every step re-reads the bounty before writing and checks the entry's
//! state first, so duplicate or replayed deliveries never repeat a notice
//! or a proof.

pub mod config;
pub mod error;
pub mod github;
pub mod linker;
pub mod model;
pub mod notification;
pub mod pg_storage;
pub mod pipeline;
pub mod references;
pub mod repository;
pub mod router;
pub mod server;
pub mod storage;
pub mod upload;
pub mod verifier;
pub mod webproof;

pub use config::Config;
pub use error::{CollaboratorError, PipelineError, RepositoryError};
pub use github::GitHubClient;
pub use linker::PullRequestLinker;
pub use model::{Bounty, BountyStatus, EntryState, NewBounty, PullRequestEntry};
pub use pg_storage::PgBountyRepository;
pub use pipeline::{ProofJob, ProofPipeline, ProofQueue, ProofScheduler, ProofWorker};
pub use repository::BountyRepository;
pub use router::{Dispatch, EventEnvelope, EventRouter};
pub use storage::SqliteBountyRepository;
pub use upload::LighthouseUploader;
pub use verifier::HttpProofVerifier;
pub use webproof::VlayerCli;
