use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use netstats::{
    config::{self, Config, Telemetry},
    daemon::{self, Intervals, Probes},
};
use netstats_core::{
    platform::Platform,
    service::{self, Service},
};
use tokio::{runtime::Builder, signal, task::JoinError};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load netstatsd config: {0}")]
    Config(#[from] config::Error),
    #[error("Network stats service failed: {0}")]
    Service(#[from] service::Error),
    #[error("Event loop failed: {0}")]
    Daemon(#[from] daemon::Error),
    #[error("Unable to join blocking task: {0}")]
    Join(#[from] JoinError),
    #[error("Failed to install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[cfg(not(target_os = "linux"))]
    #[error("Interface counters are only available on Linux")]
    UnsupportedHost,
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to the configuration file
    #[clap(long, default_value = "/etc/netstats/netstats.yaml")]
    config: PathBuf,
    /// seconds the runtime is given to wind down on exit
    #[clap(long, default_value_t = 10)]
    max_shutdown_delay: u16,
}

#[cfg(target_os = "linux")]
fn host(config: &Config) -> Result<(Platform, Probes), Error> {
    use netstats::{
        linux::ProcNetDev,
        platform::{
            AlertProbe, ConfiguredPackages, FileSink, HostConnectivity, InterfaceProbe,
            SystemPermissions,
        },
    };
    use netstats_core::platform::{ConnectivitySource, Noop, SystemClock, TrustedTime};

    let source = Arc::new(ProcNetDev::new());
    let probe: Arc<dyn InterfaceProbe> = source.clone();
    let alert: Arc<dyn AlertProbe> = source.clone();
    let connectivity: Arc<dyn ConnectivitySource> = Arc::new(HostConnectivity::new(
        &config.networks,
        probe,
        config.classify_unknown,
    ));
    let time: Arc<dyn TrustedTime> = Arc::new(SystemClock::new());
    let diagnostics = Arc::new(FileSink::new(
        &config.data_dir.join("diagnostics"),
        Arc::clone(&time),
    ));
    let platform = Platform {
        counters: source,
        connectivity: Arc::clone(&connectivity),
        time,
        permissions: Arc::new(SystemPermissions),
        packages: Arc::new(ConfiguredPackages::new(config.app_ids.clone())),
        listener: Arc::new(Noop),
        wake_lock: Arc::new(Noop),
        tether_plugin: Arc::new(Noop),
        diagnostics,
    };
    Ok((
        platform,
        Probes {
            connectivity,
            alert,
        },
    ))
}

#[cfg(not(target_os = "linux"))]
fn host(_config: &Config) -> Result<(Platform, Probes), Error> {
    Err(Error::UnsupportedHost)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                error!("unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("received ctrl-c"),
            Err(err) => error!("unable to listen for ctrl-c: {err}"),
        },
        () = terminate => info!("received SIGTERM"),
    }
}

async fn inner_main(config: Config) -> Result<(), Error> {
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = &config.telemetry
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(*addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("prometheus exporter listening on {addr}");
    }

    let (platform, probes) = host(&config)?;
    let intervals = Intervals {
        poll: config.poll_interval(),
        refresh: config.iface_refresh(),
    };
    let service = Arc::new(Service::new(
        service::Config {
            data_dir: config.data_dir.clone(),
            legacy_dir: config.legacy_dir.clone(),
            settings: config.settings,
        },
        platform,
    ));

    let ready = Arc::clone(&service);
    tokio::task::spawn_blocking(move || ready.system_ready()).await??;
    daemon::run(service, probes, intervals, shutdown_signal()).await?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting netstatsd {version}.");
    let args = Args::parse();
    let config = Config::from_path(&args.config)?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    runtime.shutdown_timeout(Duration::from_secs(args.max_shutdown_delay.into()));
    if let Err(err) = &res {
        error!("netstatsd exited with an error: {err}");
    }
    info!("Bye. :)");
    res
}
