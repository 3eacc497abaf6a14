//! The event loop hosting the service
//!
//! The service is synchronous and holds its lock across file I/O, so every
//! call into it runs on the blocking pool. The loop itself only turns timer
//! ticks and the shutdown signal into service events.

use std::{future::Future, sync::Arc, time::Duration};

use metrics::gauge;
use netstats_core::{
    platform::{ConnectivitySource, NetworkState},
    service::{self, Event, Operation, Service},
};
use tokio::{
    task::{self, JoinError},
    time::{self, MissedTickBehavior},
};
use tracing::{error, info};

use crate::platform::AlertProbe;

/// Errors produced by [`run`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The service failed an event the loop cannot continue past
    #[error("Service error: {0}")]
    Service(#[from] service::Error),
    /// A blocking service call panicked or was cancelled
    #[error("Unable to join blocking task: {0}")]
    Join(#[from] JoinError),
}

/// Host-side state the loop watches for changes.
#[derive(Clone)]
pub struct Probes {
    /// Read on every refresh tick, compared with the previous reading
    pub connectivity: Arc<dyn ConnectivitySource>,
    /// Checked on every refresh tick
    pub alert: Arc<dyn AlertProbe>,
}

impl std::fmt::Debug for Probes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probes").finish_non_exhaustive()
    }
}

/// Tick periods of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Period of the poll alarm
    pub poll: Duration,
    /// Period of the connectivity and global alert checks
    pub refresh: Duration,
}

type Connectivity = (Vec<NetworkState>, Option<String>);

struct Refresh {
    alert_fired: bool,
    connectivity: Connectivity,
}

async fn dispatch(service: &Arc<Service>, event: Event) -> Result<Operation, Error> {
    let service = Arc::clone(service);
    Ok(task::spawn_blocking(move || service.handle_event(event)).await??)
}

async fn refresh(probes: &Probes) -> Result<Refresh, JoinError> {
    let probes = probes.clone();
    task::spawn_blocking(move || Refresh {
        alert_fired: probes.alert.take_alert(),
        connectivity: (
            probes.connectivity.networks(),
            probes.connectivity.default_iface(),
        ),
    })
    .await
}

/// Drive `service` until `shutdown` resolves, then shut it down.
///
/// The service must already be ready. The first connectivity reading is
/// delivered on the first refresh tick, which fires immediately.
///
/// # Errors
///
/// Fails if the service cannot be shut down or a blocking call panics.
/// Failures of other events are logged and the loop carries on.
pub async fn run<F>(
    service: Arc<Service>,
    probes: Probes,
    intervals: Intervals,
    shutdown: F,
) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    let mut poll = time::interval(intervals.poll);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut refresh_tick = time::interval(intervals.refresh);
    refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Readiness already took a baseline.
    poll.tick().await;

    let mut last_connectivity: Option<Connectivity> = None;
    tokio::pin!(shutdown);
    loop {
        let mut events = Vec::with_capacity(2);
        tokio::select! {
            _ = poll.tick() => events.push(Event::PollAlarm),
            _ = refresh_tick.tick() => {
                gauge!("netstatsd.running").set(1.0);
                let reading = refresh(&probes).await?;
                if last_connectivity.as_ref() != Some(&reading.connectivity) {
                    last_connectivity = Some(reading.connectivity);
                    events.push(Event::ConnectivityChanged);
                }
                if reading.alert_fired {
                    events.push(Event::GlobalAlertReached);
                }
            },
            () = &mut shutdown => {
                info!("shutdown signal received");
                events.push(Event::Shutdown);
            },
        }

        for event in events {
            match dispatch(&service, event).await {
                Ok(Operation::Continue) => {}
                Ok(Operation::Exit) => return Ok(()),
                Err(Error::Service(err)) if event != Event::Shutdown => {
                    error!(?event, %err, "event failed");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
