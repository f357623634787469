//! Keeping the operator registered as a member candidate of an application.
//!
//! Per application, the operator goes through
//! `Unregistered -> PollingEligibility -> Registering -> Registered -> Monitoring`.
//! Nothing here is persisted: the chain is asked again at every start.
use std::sync::Arc;

use parking_lot::Mutex;
use smol::Task;
use tracing::{debug, error, info, warn};

use crate::{
    cancel::Cancellation,
    chain::{Address, ChainHandle},
};

/// Where the operator stands with one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    /// Waiting for the operator to become eligible.
    PollingEligibility,
    /// A registration has been submitted, and awaits confirmation.
    Registering,
    Registered,
    /// Registered, keeping the operator's status up to date.
    Monitoring,
}

#[derive(Clone)]
pub(crate) struct SharedState(Arc<Mutex<RegistrationState>>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(RegistrationState::Unregistered)))
    }

    fn set(&self, state: RegistrationState) {
        *self.0.lock() = state;
    }

    pub(crate) fn get(&self) -> RegistrationState {
        *self.0.lock()
    }
}

/// The registration task of one application.
pub(crate) struct RegistrationMonitor {
    pub(crate) application: Address,
    pub(crate) state: SharedState,
    pub(crate) task: Task<()>,
}

impl RegistrationMonitor {
    pub(crate) fn spawn(
        cancel: Cancellation,
        chain: Arc<dyn ChainHandle>,
        application: Address,
        check_interval_blocks: u64,
    ) -> Self {
        let state = SharedState::new();
        let task = smol::spawn(check_status_and_register(
            cancel,
            chain,
            application,
            check_interval_blocks,
            state.clone(),
        ));
        Self {
            application,
            state,
            task,
        }
    }
}

/// Register the operator for an application if it isn't yet, and then keep
/// its status up to date, until cancelled.
async fn check_status_and_register(
    cancel: Cancellation,
    chain: Arc<dyn ChainHandle>,
    application: Address,
    check_interval_blocks: u64,
    state: SharedState,
) {
    let is_registered = match chain.is_registered_for_application(application).await {
        Ok(is_registered) => is_registered,
        Err(e) => {
            error!(
                application = %application,
                error = %e,
                "failed to check if operator is registered for application"
            );
            return;
        }
    };

    if !is_registered {
        register_as_member_candidate(&cancel, chain.as_ref(), application, &state).await;
        if !wait_until_registered(&cancel, chain.as_ref(), application, check_interval_blocks).await
        {
            return;
        }
    }
    state.set(RegistrationState::Registered);

    monitor_signer_pool_status(&cancel, chain.as_ref(), application, &state).await;
}

/// Check eligibility at every block, and register once eligible.
///
/// Registration is attempted once: whatever its outcome, polling stops.
async fn register_as_member_candidate(
    parent: &Cancellation,
    chain: &dyn ChainHandle,
    application: Address,
    state: &SharedState,
) {
    let cancel = parent.child();
    let blocks = chain.block_counter().watch_blocks();
    state.set(RegistrationState::PollingEligibility);

    while let Some(Ok(block)) = cancel.run_until_cancelled(blocks.recv()).await {
        match chain.is_eligible_for_application(application).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(application = %application, block, "operator is not eligible for application");
                continue;
            }
            Err(e) => {
                error!(
                    application = %application,
                    error = %e,
                    "failed to check operator eligibility for application"
                );
                continue;
            }
        }

        info!(application = %application, block, "registering member candidate for application");
        state.set(RegistrationState::Registering);
        if let Err(e) = chain.register_as_member_candidate(application).await {
            error!(
                application = %application,
                error = %e,
                "failed to register member candidate for application"
            );
        }
        cancel.cancel();
    }
}

/// Poll the registration every `check_interval_blocks` blocks until it is confirmed.
///
/// Returns false if cancelled first.
async fn wait_until_registered(
    cancel: &Cancellation,
    chain: &dyn ChainHandle,
    application: Address,
    check_interval_blocks: u64,
) -> bool {
    let counter = chain.block_counter();
    loop {
        if cancel.is_cancelled() {
            return false;
        }

        match chain.is_registered_for_application(application).await {
            Ok(true) => {
                info!(application = %application, "operator is registered for application");
                return true;
            }
            Ok(false) => {
                info!(application = %application, "operator is not yet registered for application");
            }
            Err(e) => {
                error!(
                    application = %application,
                    error = %e,
                    "failed to check if operator is registered for application"
                );
            }
        }

        let next_check = match counter.current_block().await {
            Ok(current) => current + check_interval_blocks,
            Err(e) => {
                error!(error = %e, "failed to check the current block");
                let next_block = counter.watch_blocks();
                if cancel.run_until_cancelled(next_block.recv()).await.is_none() {
                    return false;
                }
                continue;
            }
        };

        match cancel
            .run_until_cancelled(counter.wait_for_block_height(next_check))
            .await
        {
            None => return false,
            Some(Err(e)) => {
                error!(block = next_check, error = %e, "failed waiting for block");
            }
            Some(Ok(())) => {}
        }
    }
}

/// Check the operator's status at every block, updating it when stale.
async fn monitor_signer_pool_status(
    cancel: &Cancellation,
    chain: &dyn ChainHandle,
    application: Address,
    state: &SharedState,
) {
    debug!(application = %application, "starting monitoring status for application");
    let blocks = chain.block_counter().watch_blocks();
    state.set(RegistrationState::Monitoring);

    while let Some(Ok(block)) = cancel.run_until_cancelled(blocks.recv()).await {
        match chain.is_status_up_to_date_for_application(application).await {
            Ok(true) => {
                debug!(application = %application, block, "operator status is up to date");
            }
            Ok(false) => {
                info!(application = %application, block, "updating operator status for application");
                if let Err(e) = chain.update_status_for_application(application).await {
                    error!(
                        application = %application,
                        error = %e,
                        "failed to update operator status for application"
                    );
                }
            }
            Err(e) => {
                error!(
                    application = %application,
                    error = %e,
                    "failed to check operator status for application"
                );
            }
        }
    }
}
