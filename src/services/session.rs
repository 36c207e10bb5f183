//! Authentication session policy
//!
//! Bounds authentication retries against an unreachable or rejecting server
//! while the running image is unconfirmed, and confirms the image exactly
//! once on the first successful authentication after boot.

use crate::device_service_client::DeviceService;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};

/// Outcome of one authentication-failure callback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AuthDecision {
    /// Library keeps retrying on its own poll interval
    Continue,
    /// Retry budget exhausted, caller must treat the session as fatal
    Fatal,
}

/// Counts consecutive authentication failures while the image is
/// unconfirmed.
///
/// The counter lives for the whole process: a fatal decision ends in a
/// reboot, so it never needs resetting.
pub struct AuthRetryGuard {
    tries: u32,
    max_tries: u32,
}

impl AuthRetryGuard {
    pub fn new(max_tries: u32) -> Self {
        Self {
            tries: 0,
            max_tries,
        }
    }

    /// Decide whether the agent keeps retrying after one more failure.
    ///
    /// A failure with a confirmed image is non-fatal regardless of the
    /// counter: the firmware is known good and policy does not require
    /// rollback. Otherwise the budget shrinks, and the decision turns fatal
    /// on exactly the call where the count reaches `max_tries`.
    pub fn on_failure(&mut self, image_confirmed: bool) -> AuthDecision {
        if image_confirmed {
            debug!("authentication failed but image is confirmed, continuing");
            return AuthDecision::Continue;
        }

        self.tries += 1;

        if self.tries < self.max_tries {
            warn!(
                "authentication failed with unconfirmed image (try {}/{})",
                self.tries, self.max_tries
            );
            AuthDecision::Continue
        } else {
            error!(
                "authentication failed {} times with unconfirmed image, giving up",
                self.tries
            );
            AuthDecision::Fatal
        }
    }
}

/// Confirms the currently running image as good on first successful
/// authentication.
///
/// Confirmation state is owned by the bootloader collaborator and queried
/// every time instead of being cached, so it survives independent of this
/// component's lifetime.
pub struct ImageConfirmationGate;

impl ImageConfirmationGate {
    /// Confirm the running image unless the collaborator already did.
    ///
    /// A confirmation failure after a successful network round-trip points
    /// at a defective update-marking mechanism and must propagate; the
    /// caller reports the authentication success as failed.
    pub async fn confirm_current<D>(device: &D) -> Result<()>
    where
        D: DeviceService + Sync,
    {
        if device
            .is_image_confirmed()
            .await
            .context("failed to query image confirmation state")?
        {
            debug!("running image already confirmed");
            return Ok(());
        }

        device
            .confirm_image()
            .await
            .context("failed to confirm running image")?;

        info!("running image confirmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_service_client::MockDeviceService;
    use mockall::Sequence;

    #[test]
    fn fatal_on_and_only_on_threshold_call() {
        let mut guard = AuthRetryGuard::new(3);

        assert_eq!(guard.on_failure(false), AuthDecision::Continue);
        assert_eq!(guard.on_failure(false), AuthDecision::Continue);
        assert_eq!(guard.on_failure(false), AuthDecision::Fatal);
    }

    #[test]
    fn confirmed_image_does_not_consume_budget() {
        let mut guard = AuthRetryGuard::new(3);

        assert_eq!(guard.on_failure(false), AuthDecision::Continue);
        assert_eq!(guard.on_failure(false), AuthDecision::Continue);
        // confirmation arrived before the third failure
        assert_eq!(guard.on_failure(true), AuthDecision::Continue);
        assert_eq!(guard.on_failure(true), AuthDecision::Continue);
    }

    #[test]
    fn single_try_budget_is_immediately_fatal() {
        let mut guard = AuthRetryGuard::new(1);
        assert_eq!(guard.on_failure(false), AuthDecision::Fatal);
    }

    #[tokio::test]
    async fn confirms_unconfirmed_image_once() {
        let mut device = MockDeviceService::new();
        let mut seq = Sequence::new();

        device
            .expect_is_image_confirmed()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Box::pin(async { Ok(false) }));
        device
            .expect_confirm_image()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Box::pin(async { Ok(()) }));

        ImageConfirmationGate::confirm_current(&device)
            .await
            .expect("should confirm");
    }

    #[tokio::test]
    async fn does_not_reconfirm_confirmed_image() {
        let mut device = MockDeviceService::new();
        device
            .expect_is_image_confirmed()
            .times(1)
            .returning(|| Box::pin(async { Ok(true) }));
        device.expect_confirm_image().never();

        ImageConfirmationGate::confirm_current(&device)
            .await
            .expect("confirmed image is a success");
    }

    #[tokio::test]
    async fn propagates_confirmation_failure() {
        let mut device = MockDeviceService::new();
        device
            .expect_is_image_confirmed()
            .returning(|| Box::pin(async { Ok(false) }));
        device
            .expect_confirm_image()
            .returning(|| Box::pin(async { anyhow::bail!("marking mechanism defective") }));

        let result = ImageConfirmationGate::confirm_current(&device).await;
        assert!(result.is_err());
        assert!(
            format!("{:#}", result.unwrap_err()).contains("failed to confirm running image")
        );
    }
}
