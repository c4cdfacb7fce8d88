use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rrd2whisper::*;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

/// Log everything to the logfile, warnings and errors additionally to
/// stderr. The returned guard flushes the file writer on drop.
fn init_logging(
    logfile: &std::path::Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logfile)
        .with_context(|| format!("could not open logfile {}", logfile.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::filter::LevelFilter::WARN),
        )
        .init();
    Ok(guard)
}

/// Cancels the token on the first SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::warn!("received shutdown signal, finishing running conversions");
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::warn!("received shutdown signal, finishing running conversions");
        cancel.cancel();
    });
}

/// Fetches the service uuid to perfdata map, or loads it from the cache file
/// when the database is off limits. `None` means conversions fall back to
/// the datasource names from the sidecar files.
async fn load_perfdata(config: &config::AppConfig) -> Result<Option<lookup::PerfdataMap>> {
    if config.no_sql {
        let Some(cache_path) = &config.sql_cache else {
            return Ok(None);
        };
        let map = lookup::load_cache(cache_path)?;
        tracing::info!(
            services = map.len(),
            path = %cache_path.display(),
            "loaded perfdata labels from cache file"
        );
        return Ok(Some(map));
    }

    let service = lookup::LookupService::connect(
        config.mysql_dsn.as_deref(),
        &config.mysql_cnf,
        config.mysql_retry,
    )
    .await
    .context("could not connect to mysql server")?;
    let map = service
        .fetch_perfdata(config.oitc_version)
        .await
        .context("could not fetch perfdata labels")?;
    service.close().await;

    if let Some(cache_path) = &config.sql_cache {
        lookup::store_cache(cache_path, &map)?;
        tracing::info!(
            services = map.len(),
            path = %cache_path.display(),
            "wrote perfdata label cache"
        );
    }
    Ok(Some(map))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Cli::parse().into_config()?;
    let _guard = init_logging(&config.logfile)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.source.display(),
        "rrd2whisper starting"
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let perfdata = load_perfdata(&config).await?;
    if config.only_sql_cache {
        return Ok(());
    }

    println!("Scanning {} for xml perfdata files", config.source.display());
    let options = scan::ScanOptions {
        cutoff: (config.max_age > 0)
            .then(|| chrono::Utc::now() - chrono::Duration::seconds(config.max_age)),
        limit: config.limit,
        include_corrupt: config.include_corrupt,
    };
    let workdata = scan::scan(&config.source, &options, &cancel)
        .await
        .context("could not scan source directory")?;
    println!(
        "Scanning finished\nTotal: {} Todo: {} After Limit: {} Too Old: {} Corrupt RRD: {} XML File Broken: {}",
        workdata.total,
        workdata.todo,
        workdata.pending.len(),
        workdata.too_old,
        workdata.corrupt,
        workdata.broken_xml
    );
    tracing::info!(
        total = workdata.total,
        todo = workdata.todo,
        after_limit = workdata.pending.len(),
        too_old = workdata.too_old,
        corrupt = workdata.corrupt,
        broken_xml = workdata.broken_xml,
        "scan finished"
    );
    if config.check || workdata.pending.is_empty() {
        return Ok(());
    }

    let reader: Arc<dyn rrd::ArchiveReader> =
        Arc::new(rrd::RrdtoolReader::locate().context("rrdtool binary not found")?);
    let converter = Arc::new(convert::Converter::new(
        Arc::new(convert::ConvertConfig {
            destination: config.destination.clone(),
            archive: config.archive.clone(),
            temp: config.temp_dir.clone(),
            merge: config.merge,
            delete_rrd: config.delete_rrd,
            retentions: config.retentions.clone(),
        }),
        reader,
        perfdata,
        cancel.clone(),
    ));
    let visitor = Arc::new(progress::ProgressVisitor::new(workdata.pending.len() as u64));

    convert::worker::run(
        convert::worker::PoolDeps {
            items: workdata.pending,
            converter,
            visitor: visitor.clone(),
            cancel: cancel.clone(),
        },
        config.parallel,
    )
    .await;
    visitor.finish();
    tracing::info!("conversion finished");

    Ok(())
}
