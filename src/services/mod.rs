pub mod credentials;
pub mod network;
pub mod reporting;
pub mod session;

pub use credentials::CredentialService;
pub use network::NetworkReadinessGate;
pub use reporting::DeploymentReporter;
pub use session::{AuthDecision, AuthRetryGuard, ImageConfirmationGate};
