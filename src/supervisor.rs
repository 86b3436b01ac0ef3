use crate::protocol::{
    error::{Error, Result},
    framer::PolicyRegistry,
    session::{ConnectionState, Session, SessionConfig, SessionEvent, SessionExit},
};
use arc_swap::ArcSwapOption;
use backoff::backoff::{Backoff, Constant};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, oneshot, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

/// What to do after an established connection drops
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReconnectPolicy {
    pub enabled: bool,
    pub interval: Duration,
}

/// Shared handles the supervisor publishes into
#[derive(Debug, Clone)]
pub(crate) struct SupervisorLinks {
    /// Session currently owned by the supervisor, if any
    pub current: Arc<ArcSwapOption<Session>>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub events_tx: broadcast::Sender<SessionEvent>,
}

/// Owns the session lifecycle of one logical connection and reconnects
/// with a fixed delay after transport loss.
///
/// Reconnect is only scheduled once the first attempt reached `Ready`; a
/// failing first attempt is reported to the caller of [`Supervisor::start`].
#[derive(Debug)]
pub(crate) struct Supervisor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn the supervisor task and wait for the first attempt's outcome
    pub async fn start(
        config: Arc<SessionConfig>,
        registry: Arc<PolicyRegistry>,
        policy: ReconnectPolicy,
        links: SupervisorLinks,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run(
            config,
            registry,
            policy,
            links,
            cancel.clone(),
            ready_tx,
        ));
        let mut supervisor = Self {
            cancel,
            task: Some(task),
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(supervisor),
            Ok(Err(e)) => {
                supervisor.stop().await;
                Err(e)
            }
            Err(_) => {
                supervisor.stop().await;
                Err(Error::ErrNotConnected)
            }
        }
    }

    /// Whether the supervisor task is still alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Close the current session and stop reconnecting.
    ///
    /// Pending jobs fail with `ErrNotConnected`.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "S7 supervisor task ended abnormally");
            }
        }
    }

    async fn run(
        config: Arc<SessionConfig>,
        registry: Arc<PolicyRegistry>,
        policy: ReconnectPolicy,
        links: SupervisorLinks,
        cancel: CancellationToken,
        ready_tx: oneshot::Sender<Result<()>>,
    ) {
        let mut ready_tx = Some(ready_tx);
        let mut backoff = Constant::new(policy.interval);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let session = Session::new(
                Arc::clone(&config),
                Arc::clone(&registry),
                links.events_tx.clone(),
                cancel.child_token(),
            );
            links.current.store(Some(Arc::clone(&session)));

            let outcome = Self::drive(&session, &links, &mut ready_tx).await;
            links.current.store(None);

            match outcome {
                Ok(SessionExit::Closed) => break,
                Ok(SessionExit::TransportLost) => {
                    backoff.reset();
                    attempt = 0;
                    if !policy.enabled {
                        tracing::info!("S7 connection lost, auto-reconnect disabled");
                        break;
                    }
                }
                Err(e) => {
                    // the first attempt is the caller's error to handle
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(e));
                        return;
                    }
                    if e.is_transport() {
                        tracing::debug!(error = %e, "S7 reconnect attempt failed");
                    } else {
                        tracing::warn!(error = %e, "S7 reconnect attempt failed during negotiation");
                    }
                }
            }

            let Some(delay) = backoff.next_backoff() else {
                break;
            };
            attempt = attempt.saturating_add(1);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "S7 connect retry"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        if cancel.is_cancelled() {
            links.state_tx.send_replace(ConnectionState::Closed);
        }
        tracing::debug!("S7 supervisor stopped");
    }

    /// Run one session to completion, mirroring its lifecycle into the
    /// client-wide state channel.
    async fn drive(
        session: &Arc<Session>,
        links: &SupervisorLinks,
        ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Result<SessionExit> {
        let mut lifecycle = session.lifecycle();
        let mut events = session.subscribe_events();
        let run = Arc::clone(session).run();
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                res = &mut run => break res,
                changed = lifecycle.changed() => {
                    if changed.is_ok() {
                        let state = *lifecycle.borrow_and_update();
                        Self::publish(links, state, ready_tx);
                    }
                }
                ev = events.recv() => match ev {
                    Ok(SessionEvent::TransportDown { reason }) => {
                        tracing::debug!(reason, "S7 transport down");
                    }
                    Ok(SessionEvent::Negotiated(ctx)) => {
                        tracing::debug!(
                            local_tsap = %ctx.local_tsap,
                            remote_tsap = %ctx.remote_tsap,
                            pdu_size = ctx.pdu_size,
                            "S7 parameters negotiated"
                        );
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "S7 session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        };

        let last = *lifecycle.borrow_and_update();
        Self::publish(links, last, ready_tx);
        if result.is_ok() {
            // connected and lost before the Ready change was observed
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        result
    }

    fn publish(
        links: &SupervisorLinks,
        state: ConnectionState,
        ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
    ) {
        links.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if state.is_ready() {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
