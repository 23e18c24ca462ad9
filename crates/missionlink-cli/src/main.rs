//! missionlink - command line client for the volunteer-matching backend.
//!
//! Browses missions, manages registrations and notifications, shows impact
//! stats, and drives the offline cache manager. Output is JSON on stdout;
//! logs go to stderr (and optionally a daily file).

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use missionlink_core::offline::{Destination, DiskCacheStorage, OfflineCacheManager, Request};
use missionlink_core::resources::{
    BadgesResource, ImpactStatsResource, MissionDetailResource, MissionFilters, MissionsResource,
    NotificationsResource, ProfileResource, RecommendationsResource, RegistrationsResource,
    ResourceContext,
};
use missionlink_core::{
    Clock, Config, DataApiClient, LocalValue, QueryClient, QueryState, SystemClock,
};

/// Log file name prefix inside the configured log directory
const LOG_FILE_PREFIX: &str = "missionlink.log";

/// Local value holding the last mission filters
const SAVED_FILTERS: &str = "mission_filters";

#[derive(Parser)]
#[command(name = "missionlink", version, about = "Find and track volunteering missions")]
struct Cli {
    /// User id to act for (defaults to `user_id` from the config file)
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List published missions
    Missions {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        city: Option<String>,
        /// Only missions starting on or after this day (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        limit: Option<usize>,
        /// One summary line per mission instead of JSON
        #[arg(long)]
        brief: bool,
    },
    /// Show one mission (and whether you are registered)
    Mission { id: String },
    /// List your registrations
    Registrations,
    /// Register for a mission
    Register { mission_id: String },
    /// Cancel a registration
    Cancel { mission_id: String },
    /// Show your profile
    Profile {
        /// Replace your spoken languages (comma separated)
        #[arg(long, value_delimiter = ',')]
        languages: Option<Vec<String>>,
    },
    /// List your notifications
    Notifications,
    /// Mark a notification (or all of them) as read
    Read {
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Delete a notification
    Dismiss { id: String },
    /// Show your impact stats
    Stats,
    /// List your badges
    Badges,
    /// Missions near your profile location
    Recommend {
        #[arg(long, default_value_t = 25.0)]
        radius_km: f64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Offline cache management
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Precache the app shell and activate the cache generation
    Install {
        #[arg(long, default_value = "v1")]
        generation: String,
    },
    /// Fetch a URL through the offline cache
    Get {
        url: String,
        #[arg(long, value_enum, default_value_t = RequestKind::Other)]
        kind: RequestKind,
        #[arg(long, default_value = "v1")]
        generation: String,
    },
    /// Entry counts per cache partition
    Stats {
        #[arg(long, default_value = "v1")]
        generation: String,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RequestKind {
    Document,
    Image,
    Script,
    Style,
    Other,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    let _guard = init_tracing(config.log_dir.as_deref());
    info!("missionlink starting");

    match cli.command {
        Command::Cache { command } => run_cache(&config, command).await,
        command => {
            let user = cli.user.or_else(|| config.user_id.clone());
            run_resource(&config, user, command).await
        }
    }
}

fn resource_context(config: &Config) -> Result<ResourceContext> {
    let mut api = DataApiClient::new(config.api_url()?, config.api_key()?)?;
    if let Some(token) = &config.access_token {
        api.set_token(token.clone());
    }
    let queries = QueryClient::with_options(
        Arc::new(SystemClock),
        config.stale_time(),
        config.retry_policy(),
    );
    Ok(ResourceContext::new(api, queries))
}

/// Print the data of a settled query, or fail with its error.
fn emit<T: Serialize>(state: QueryState<T>) -> Result<()> {
    if let Some(error) = state.error {
        bail!(error);
    }
    println!("{}", serde_json::to_string_pretty(&state.data)?);
    Ok(())
}

async fn run_resource(config: &Config, user: Option<String>, command: Command) -> Result<()> {
    let ctx = resource_context(config)?;
    let require_user = || user.clone().context("No user id (pass --user or set user_id in the config)");

    match command {
        Command::Missions {
            category,
            city,
            from,
            limit,
            brief,
        } => {
            // Filters given on the command line become the new defaults
            let saved =
                LocalValue::open(&config.data_dir()?, SAVED_FILTERS, MissionFilters::default());
            let filters = MissionFilters {
                category,
                city,
                from_date: from,
                limit,
            };
            let filters = if filters.is_empty() {
                saved.get()
            } else {
                saved.set(filters.clone());
                filters
            };

            let missions = MissionsResource::new(&ctx);
            missions.load(filters).await;
            if !brief {
                return emit(missions.state());
            }
            let state = missions.state();
            if let Some(error) = state.error {
                bail!(error);
            }
            for mission in state.data.unwrap_or_default() {
                println!("{}", mission.summary_line());
            }
            Ok(())
        }
        Command::Mission { id } => {
            let detail = MissionDetailResource::new(&ctx);
            detail.set_mission(Some(id.clone())).await;
            let state = detail.state();
            if let Some(error) = state.error {
                bail!(error);
            }

            let registered = match user.clone() {
                Some(user) => {
                    let registrations = RegistrationsResource::new(&ctx);
                    registrations.set_user(Some(user)).await;
                    Some(registrations.is_registered(&id))
                }
                None => None,
            };
            let output = json!({ "mission": state.data, "registered": registered });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Registrations => {
            let registrations = RegistrationsResource::new(&ctx);
            registrations.set_user(Some(require_user()?)).await;
            emit(registrations.state())
        }
        Command::Register { mission_id } => {
            let registrations = RegistrationsResource::new(&ctx);
            registrations.set_user(Some(require_user()?)).await;
            let created = registrations.register(&mission_id).await?;
            println!("{}", serde_json::to_string_pretty(&created)?);
            Ok(())
        }
        Command::Cancel { mission_id } => {
            let registrations = RegistrationsResource::new(&ctx);
            registrations.set_user(Some(require_user()?)).await;
            registrations.cancel(&mission_id).await?;
            emit(registrations.state())
        }
        Command::Profile { languages } => {
            let profile = ProfileResource::new(&ctx);
            profile.set_user(Some(require_user()?)).await;
            if let Some(languages) = languages {
                profile.update_languages(languages).await?;
            }
            emit(profile.state())
        }
        Command::Notifications => {
            let notifications = NotificationsResource::new(&ctx);
            notifications.set_user(Some(require_user()?)).await;
            let unread = notifications.unread_count();
            let state = notifications.state();
            if let Some(error) = state.error {
                bail!(error);
            }
            let output = json!({ "unread": unread, "notifications": state.data });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Read { id, all } => {
            let notifications = NotificationsResource::new(&ctx);
            notifications.set_user(Some(require_user()?)).await;
            match (id, all) {
                (_, true) => notifications.mark_all_read().await?,
                (Some(id), false) => notifications.mark_read(&id).await?,
                (None, false) => bail!("Pass a notification id or --all"),
            }
            println!("{}", json!({ "unread": notifications.unread_count() }));
            Ok(())
        }
        Command::Dismiss { id } => {
            let notifications = NotificationsResource::new(&ctx);
            notifications.set_user(Some(require_user()?)).await;
            notifications.dismiss(&id).await?;
            println!("{}", json!({ "unread": notifications.unread_count() }));
            Ok(())
        }
        Command::Stats => {
            let impact = ImpactStatsResource::new(&ctx);
            impact.set_user(Some(require_user()?)).await;
            emit(impact.state())
        }
        Command::Badges => {
            let badges = BadgesResource::new(&ctx);
            badges.set_user(Some(require_user()?)).await;
            emit(badges.state())
        }
        Command::Recommend { radius_km, limit } => {
            let profile = ProfileResource::new(&ctx);
            profile.set_user(Some(require_user()?)).await;
            let recommendations = RecommendationsResource::new(&ctx).with_radius(radius_km, limit);
            recommendations.sync(&profile.state()).await;
            emit(recommendations.state())
        }
        Command::Cache { command } => run_cache(config, command).await,
    }
}

fn cache_manager(config: &Config, generation: &str) -> Result<OfflineCacheManager> {
    let origin = config
        .app_origin
        .as_deref()
        .context("No app_origin configured for the offline cache")?;
    let origin = Url::parse(origin).with_context(|| format!("Invalid app_origin: {}", origin))?;
    let storage = DiskCacheStorage::new(config.cache_dir()?)?;

    let mut builder = OfflineCacheManager::builder(origin)
        .storage(Arc::new(storage))
        .generation(generation)
        .precache(&config.precache);
    if let Some(host) = config.api_host() {
        builder = builder.api_host(&host);
    }
    Ok(builder.build()?)
}

async fn run_cache(config: &Config, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Install { generation } => {
            let manager = cache_manager(config, &generation)?;
            manager.install().await?;
            let deleted = manager.activate().await?;
            let output = json!({
                "state": manager.state().to_string(),
                "static_cache": manager.names().static_cache,
                "deleted": deleted,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        CacheCommand::Get {
            url,
            kind,
            generation,
        } => {
            let manager = cache_manager(config, &generation)?;
            if !manager.resume().await? {
                bail!("Offline cache is not installed; run `missionlink cache install` first");
            }
            let request = match kind {
                RequestKind::Document => Request::navigate(&url),
                RequestKind::Image => Request::get(&url).map(|r| r.with_destination(Destination::Image)),
                RequestKind::Script => Request::get(&url).map(|r| r.with_destination(Destination::Script)),
                RequestKind::Style => Request::get(&url).map(|r| r.with_destination(Destination::Style)),
                RequestKind::Other => Request::get(&url),
            }
            .with_context(|| format!("Invalid URL: {}", url))?;

            let response = manager.handle_fetch(&request).await?;
            manager.wait_until_idle().await;
            let output = json!({
                "status": response.status,
                "type": response.response_type,
                "url": response.url,
                "content_type": response.header("content-type"),
                "bytes": response.body.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        CacheCommand::Stats { generation } => {
            let manager = cache_manager(config, &generation)?;
            let now = SystemClock.now();
            let partitions: Vec<_> = manager
                .stats()
                .await?
                .into_iter()
                .map(|p| {
                    json!({
                        "name": p.name,
                        "entries": p.entries,
                        "updated": p.newest.map(|t| missionlink_core::utils::format_age(t, now)),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&partitions)?);
            Ok(())
        }
    }
}
