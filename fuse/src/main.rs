//! studip-fuse binary — thin CLI shell over the [`studip_core`] library crate.

mod dispatcher;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use studip_core::{
    Crawler, Endpoints, HttpRemoteSource, MountConfig, Resolver, StatusReporter, Template,
};

use dispatcher::StudipFs;

/// Read-only FUSE projection of a Stud.IP course tree onto a local mountpoint.
#[derive(Parser)]
#[command(name = "studip-fuse", version, about, long_about = None)]
struct Cli {
    /// Base URL of the Stud.IP REST API, e.g. https://studip.example.edu/
    #[arg(long)]
    base_url: Option<String>,

    /// Personal access token; can also be supplied via STUDIP_FUSE_TOKEN
    #[arg(long, env = "STUDIP_FUSE_TOKEN")]
    access_token: Option<String>,

    /// Path template controlling directory layout (spec §4.2, §6)
    #[arg(long)]
    path_template: Option<String>,

    /// Local directory to mount the virtual filesystem onto
    mountpoint: Option<PathBuf>,

    /// Directory to store downloaded file contents in
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Optional TOML config file merged under CLI flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of concurrent requests to the remote service
    #[arg(long)]
    max_concurrent_requests: Option<usize>,

    /// Run in the foreground instead of daemonizing
    #[arg(long)]
    foreground: bool,

    /// Allow other local users to access the mount
    #[arg(long)]
    allow_other: bool,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, unmounting..."),
            _ = sigterm.recv() => info!("received SIGTERM, unmounting..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, unmounting...");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("studip_fuse=info".parse().unwrap())
                .add_directive("studip_core=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config_file = match &cli.config {
        Some(path) => match studip_core::ConfigFile::load(path).await {
            Ok(file) => file,
            Err(e) => {
                error!(error = %e, "failed to load config file");
                std::process::exit(1);
            }
        },
        None => studip_core::ConfigFile::default(),
    };

    let config = match MountConfig::merge(
        config_file,
        cli.base_url,
        cli.access_token,
        cli.path_template,
        cli.mountpoint,
        cli.cache_dir,
        cli.max_concurrent_requests,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let template = match Template::compile(&config.path_template) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, template = %config.path_template, "path template did not compile");
            std::process::exit(1);
        }
    };

    let status = Arc::new(StatusReporter::new(studip_core::config::default_status_log_path()));
    let _ = status.info("session open").await;
    info!(base_url = %config.base_url, mountpoint = %config.mountpoint.display(), "starting up");

    let mut headers = reqwest::header::HeaderMap::new();
    let auth_value = match reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.access_token))
    {
        Ok(v) => v,
        Err(_) => {
            error!("access token contains characters invalid for an HTTP header");
            std::process::exit(1);
        }
    };
    headers.insert(reqwest::header::AUTHORIZATION, auth_value);
    let client = match reqwest::Client::builder().default_headers(headers).build() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let endpoints = Endpoints {
        discovery_url: config.base_url.join("api.php").ok(),
        user_url: config.base_url.join("api.php/user").ok(),
        settings_url: config.base_url.join("api.php/settings").ok(),
        folder_types_url: config.base_url.join("api.php/folder_types").ok(),
        course_types_url: config.base_url.join("api.php/course_types").ok(),
        semesters_url: config.base_url.join("api.php/semesters").ok(),
        courses_url: config.base_url.join("api.php/courses").ok(),
        top_folder_url: config.base_url.join("api.php/folder").ok(),
        folder_url: config.base_url.join("api.php/folder").ok(),
        file_url: config.base_url.join("api.php/file").ok(),
        download_url: config.base_url.join("api.php/download").ok(),
    };

    // Fail fast if the remote is unreachable rather than mounting an empty,
    // permanently-erroring tree (spec §6).
    let probe_url = endpoints
        .discovery_url
        .clone()
        .or_else(|| endpoints.semesters_url.clone())
        .unwrap_or_else(|| config.base_url.clone());
    match client.head(probe_url.clone()).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {}
        Ok(resp) => {
            error!(status = %resp.status(), url = %probe_url, "remote endpoint unreachable");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, url = %probe_url, "failed to reach remote service");
            std::process::exit(1);
        }
    }

    let remote = HttpRemoteSource::new(client, endpoints);
    let crawler = Arc::new(Crawler::new(remote, config.max_concurrent_requests));
    let cache = Arc::new(studip_core::ContentCache::new(config.cache_dir.clone(), crawler.clone()));

    match cache.sweep_orphaned_parts().await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "removed orphaned partial downloads from a previous run"),
        Err(e) => error!(error = %e, "failed to sweep cache directory"),
    }

    let resolver = Arc::new(Resolver::new(template, crawler, config.generic_root_names.clone()));
    let _ = status.info("resolver root ready").await;

    // The dispatcher's node-tree worker runs on its own runtime so that a
    // slow remote response never competes with the outer runtime's own
    // bookkeeping tasks (signal handling, the mount's blocking thread).
    let worker_runtime = tokio::runtime::Runtime::new().expect("failed to start worker runtime");
    let fs = StudipFs::spawn(resolver, cache, status.clone(), config.base_url.clone(), &worker_runtime);

    let mount_options = vec![
        fuser::MountOption::RO,
        fuser::MountOption::FSName("studip-fuse".to_string()),
        if cli.allow_other { fuser::MountOption::AllowOther } else { fuser::MountOption::AllowRoot },
    ];

    if let Err(e) = std::fs::create_dir_all(&config.mountpoint) {
        error!(error = %e, path = %config.mountpoint.display(), "failed to create mountpoint directory");
        std::process::exit(1);
    }

    let mountpoint = config.mountpoint.clone();
    let session = match tokio::task::spawn_blocking(move || fuser::spawn_mount2(fs, &mountpoint, &mount_options))
        .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            error!(error = %e, "failed to mount filesystem");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "mount task panicked");
            std::process::exit(1);
        }
    };

    let _ = status.info("mount ready").await;
    info!(mountpoint = %config.mountpoint.display(), "mounted, press Ctrl+C to unmount");

    shutdown_signal().await;
    drop(session);
    let _ = status.info("shutdown").await;
}
