use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use marketscout::api::create_router;
use marketscout::browser::{BrowserSettings, ChromiumBrowser};
use marketscout::config::CONFIG;
use marketscout::crawler::{CrawlOutcome, CrawlRunner, Crawler};
use marketscout::data_models::SearchIdentity;
use marketscout::db::{Database, MongoStore};
use marketscout::detector::ChangeDetector;
use marketscout::marketplace::{SEARCH_CATEGORY, SearchFilters, city_slug, parse_conditions};
use marketscout::normalizer::DiagnosticSpool;
use marketscout::notify::{AlertPolicy, NotifyConfig, NtfyNotifier, notify_new_listings};
use marketscout::page::{PageStructure, SessionStore};
use marketscout::scheduler::{Scheduler, SchedulerContext};
use marketscout::session::{Credentials, SessionConfig};
use marketscout::store::{ListingStore, MemoryStore};

#[derive(Parser)]
#[command(name = "marketscout", about = "Marketplace listing crawler with new-listing alerts")]
struct Cli {
    /// Keep listings in memory instead of MongoDB
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl once and print the result as JSON
    Crawl {
        #[command(flatten)]
        search: SearchArgs,
        /// Push alerts for new listings
        #[arg(long)]
        notify: bool,
    },
    /// Crawl repeatedly, alerting on new listings
    Watch {
        #[command(flatten)]
        search: SearchArgs,
        /// Seconds between crawls
        #[arg(long, default_value_t = 600)]
        every: u64,
        /// Stop after this many crawls
        #[arg(long)]
        times: Option<u32>,
    },
    /// Serve the HTTP API
    Serve,
}

#[derive(Args, Clone)]
struct SearchArgs {
    #[arg(long)]
    city: String,
    #[arg(long, default_value = SEARCH_CATEGORY)]
    category: String,
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    max_price: Option<u32>,
    #[arg(long)]
    min_price: Option<u32>,
    /// Item condition, repeatable: New, "Used - Like New", "Used - Good", "Used - Fair"
    #[arg(long = "condition")]
    conditions: Vec<String>,
}

impl SearchArgs {
    fn identity(self) -> anyhow::Result<SearchIdentity> {
        let Some(city) = city_slug(&self.city) else {
            anyhow::bail!("unsupported city: {}", self.city);
        };
        let filters = SearchFilters {
            query: self.query,
            min_price: self.min_price,
            max_price: self.max_price,
            conditions: parse_conditions(self.conditions.iter().map(String::as_str))?,
            ..SearchFilters::default()
        };
        Ok(filters.into_identity(&city, &self.category))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    // Bad search arguments are rejected before the browser and database start.
    let identity = match &cli.command {
        Command::Crawl { search, .. } | Command::Watch { search, .. } => {
            Some(search.clone().identity()?)
        }
        Command::Serve => None,
    };
    let crawler = Arc::new(build_crawler(cli.memory).await?);

    match (cli.command, identity) {
        (Command::Crawl { notify, .. }, Some(identity)) => {
            let outcome = crawler.crawl(&identity).await?;
            if notify {
                send_alerts(&outcome).await;
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        (Command::Watch { every, times, .. }, Some(identity)) => {
            let context = SchedulerContext::new(identity, Duration::from_secs(every), times);
            let (mut scheduler, _updates) = Scheduler::new(crawler, context);
            if let Some((notifier, config)) = notifier() {
                scheduler = scheduler.with_notifier(Arc::new(notifier), config);
            }

            let token = CancellationToken::new();
            let ctrl_c = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Ctrl-C received, stopping after the current crawl");
                    ctrl_c.cancel();
                }
            });

            let finished = scheduler.run(token).await;
            if let Some(error) = finished.last_error {
                anyhow::bail!("schedule ended with error: {error}");
            }
        }
        (Command::Crawl { .. } | Command::Watch { .. }, None) => {
            unreachable!("search identity is resolved for crawl and watch")
        }
        (Command::Serve, _) => {
            let app = create_router(crawler);
            let addr = format!("{}:{}", CONFIG.host, CONFIG.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            log::info!("listening on http://{addr}");
            axum::serve(listener, app).await?;
        }
    }
    Ok(())
}

async fn build_crawler(memory: bool) -> anyhow::Result<Crawler> {
    let structure = match &CONFIG.page_structure_path {
        Some(path) => PageStructure::from_file(path)?,
        None => PageStructure::default(),
    };

    let credentials = match (&CONFIG.fb_user, &CONFIG.fb_password) {
        (Some(email), Some(password)) => Some(Credentials {
            email: email.clone(),
            password: password.clone(),
        }),
        _ => {
            log::warn!("FB_USER/FB_PASSWORD not set, crawls fail if a login is required");
            None
        }
    };
    let session = SessionConfig {
        credentials,
        scroll_iterations: CONFIG.scroll_iterations,
        wait_timeout: Duration::from_millis(CONFIG.wait_timeout_ms),
        ..SessionConfig::default()
    };

    let store: Arc<dyn ListingStore> = if memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(MongoStore::new(Database::init_global().await?))
    };

    let browser = ChromiumBrowser::launch(&BrowserSettings {
        headless: CONFIG.headless,
        chrome_path: CONFIG.chrome_path.clone(),
    })
    .await?;

    let mut crawler = Crawler::new(
        Arc::new(browser),
        Arc::new(structure),
        session,
        Arc::new(ChangeDetector::new(store)),
    )
    .with_session_store(SessionStore::new(CONFIG.session_state_path.clone()));
    if let Some(path) = &CONFIG.failed_listing_spool {
        crawler = crawler.with_spool(DiagnosticSpool::new(path.clone()));
    }
    Ok(crawler)
}

fn notifier() -> Option<(NtfyNotifier, NotifyConfig)> {
    let Some(topic) = CONFIG.ntfy_topic.clone() else {
        log::warn!("NTFY_TOPIC not set, alerts disabled");
        return None;
    };
    Some((
        NtfyNotifier::new(CONFIG.ntfy_server.clone()),
        NotifyConfig {
            topic,
            limit: CONFIG.notify_limit,
            policy: AlertPolicy::default(),
        },
    ))
}

async fn send_alerts(outcome: &CrawlOutcome) {
    let Some((notifier, config)) = notifier() else {
        return;
    };
    let report =
        notify_new_listings(&notifier, &config, &outcome.new_listings, outcome.batch_len).await;
    log::info!(
        "alerts: {} sent, {} suppressed, {} summarized, {} failed",
        report.sent,
        report.suppressed,
        report.summarized,
        report.failed
    );
}
