//! # Forage Server
//!
//! CI failure search service: harvests tracker bugs and CI job artifacts
//! into a flat on-disk corpus and serves low-latency full-text search
//! over it by shelling out to an external regex engine.
//!
//! ## Architecture
//!
//! The server wires together the forage-core substrate:
//! - periodic tracker watchers reflected into in-memory stores,
//! - rate-limited batched comment fetches published atomically to disk,
//! - an object-storage index scanner and artifact fetcher for job runs,
//! - a TTL sweeper keeping stores and corpus convergent,
//! - the search executor translating queries into engine invocations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use forage_core::corpus::writer::load_bugs;
use forage_core::corpus::{BugPublisher, Corpus, Dialect, PublishOp, Sweeper, SweeperConfig};
use forage_core::fetch::comments::CommentClient;
use forage_core::fetch::{
    ArtifactFetcher, ArtifactFetcherConfig, CommentFetcher, CommentFetcherConfig, TokenBucket,
    WorkQueue, WorkQueueConfig,
};
use forage_core::resolve::{PathResolver, ResolverConfig};
use forage_core::search::{SearchExecutor, tool::SearchTool};
use forage_core::sources::deck::{DeckConfig, DeckPoller, JobsSnapshot};
use forage_core::sources::jira::{JiraClient, JiraConfig};
use forage_core::sources::objstore::{
    IndexScanner, IndexScannerConfig, ObjStoreClient, ObjStoreConfig,
};
use forage_core::sources::tracker::{TrackerAuth, TrackerClient, TrackerConfig};
use forage_core::store::{MissingAction, Reflector, ReflectorConfig, Store, StoreEvent};
use forage_core::watch::periodic::{ChangeLister, PeriodicWatcher, PeriodicWatcherConfig};
use forage_model::{Bug, JobRun};
use forage_server::{routes, state::AppState};

/// Command line arguments for the Forage search server
#[derive(Parser, Debug)]
#[command(name = "forage-server")]
#[command(about = "Search CI failures: build logs, junit failures, and tracker bugs")]
struct Args {
    /// Corpus root directory (the tree the regex engine searches)
    #[arg(long, required = true)]
    path: PathBuf,

    /// Bind address for the HTTP listener
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Age after which corpus entities are evicted
    #[arg(long, default_value = "14d", value_parser = parse_duration_flag)]
    max_age: Duration,

    /// Indexing period; 0 disables indexing entirely
    #[arg(long, default_value = "5m", value_parser = parse_duration_flag)]
    interval: Duration,

    /// Optional configuration file served back at /config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Live job-list frontend base URL (prowjobs.js endpoint)
    #[arg(long)]
    deck_uri: Option<Url>,

    /// Base URL for job detail links
    #[arg(long)]
    job_uri_prefix: Option<Url>,

    /// Base URL for artifact display links
    #[arg(long)]
    artifact_uri_prefix: Option<Url>,

    /// Object-storage bucket holding the job index and artifacts
    #[arg(long)]
    index_bucket: Option<String>,

    /// Virtual prefix of the finished-job index inside the bucket
    #[arg(long, default_value = "index/job-state")]
    index_prefix: String,

    /// Object-storage JSON API base
    #[arg(long, default_value = "https://storage.googleapis.com/storage/v1/")]
    storage_api: Url,

    /// Bug tracker REST base URL; bug indexing is enabled when set
    #[arg(long)]
    bugzilla_url: Option<Url>,

    /// File holding the bug tracker bearer token
    #[arg(long)]
    bugzilla_token_file: Option<PathBuf>,

    /// Tracker quicksearch restricting which bugs are indexed
    #[arg(long)]
    bugzilla_search: Option<String>,

    /// Issue tracker REST base URL; issue indexing is enabled when set
    #[arg(long)]
    jira_url: Option<Url>,

    /// File holding the issue tracker bearer token
    #[arg(long)]
    jira_token_file: Option<PathBuf>,

    /// JQL clause restricting which issues are indexed
    #[arg(long)]
    jira_search: Option<String>,
}

fn parse_duration_flag(raw: &str) -> Result<Duration, humantime::DurationError> {
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    let corpus = Arc::new(Corpus::new(&args.path));
    corpus
        .ensure_layout()
        .await
        .with_context(|| format!("creating corpus layout under {}", args.path.display()))?;

    // Validate the config file up front; a bad one is a startup error,
    // not a 500 at request time.
    if let Some(path) = &args.config {
        config::Config::builder()
            .add_source(config::File::from(path.clone()))
            .build()
            .with_context(|| format!("loading --config {}", path.display()))?;
    }

    let indexing = !args.interval.is_zero();
    if !indexing {
        info!("indexing disabled (--interval 0); serving search only");
    }

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    spawn_signal_handler(cancel.clone());

    let job_store: Arc<Store<JobRun>> = Arc::new(Store::new());
    let jobs_snapshot = JobsSnapshot::new();

    let bug_store = match &args.bugzilla_url {
        Some(_) => Some(load_store(&corpus, Dialect::Bug).await?),
        None => None,
    };
    let issue_store = match &args.jira_url {
        Some(_) => Some(load_store(&corpus, Dialect::Issue).await?),
        None => None,
    };

    if indexing {
        if let (Some(url), Some(store)) = (&args.bugzilla_url, &bug_store) {
            let auth = match read_token(args.bugzilla_token_file.as_deref())? {
                Some(token) => TrackerAuth::Bearer(token),
                None => TrackerAuth::Anonymous,
            };
            let client = Arc::new(
                TrackerClient::new(TrackerConfig {
                    base_url: url.clone(),
                    auth,
                    search: args.bugzilla_search.clone(),
                    timeout: Duration::from_secs(60),
                })
                .context("building tracker client")?,
            );
            start_tracker_pipeline(
                &args,
                client,
                Dialect::Bug,
                store,
                &corpus,
                &cancel,
                &mut tasks,
            );
        }
        if let (Some(url), Some(store)) = (&args.jira_url, &issue_store) {
            let client = Arc::new(
                JiraClient::new(JiraConfig {
                    base_url: url.clone(),
                    token: read_token(args.jira_token_file.as_deref())?,
                    search: args.jira_search.clone(),
                    timeout: Duration::from_secs(60),
                })
                .context("building issue tracker client")?,
            );
            start_tracker_pipeline(
                &args,
                client,
                Dialect::Issue,
                store,
                &corpus,
                &cancel,
                &mut tasks,
            );
        }
        if let Some(bucket) = &args.index_bucket {
            start_job_pipeline(&args, bucket, &corpus, &job_store, &cancel, &mut tasks)
                .context("starting job pipeline")?;
        }
        if let Some(deck) = &args.deck_uri {
            let poller = DeckPoller::new(
                DeckConfig {
                    base_url: deck.clone(),
                    interval: args.interval,
                    timeout: Duration::from_secs(30),
                },
                Arc::clone(&job_store),
                jobs_snapshot.clone(),
            )
            .context("starting job-list poller")?;
            tasks.push(tokio::spawn(poller.run(cancel.clone())));
        }

        let sweeper = Sweeper::new(
            Arc::clone(&corpus),
            bug_store.clone(),
            issue_store.clone(),
            Some(Arc::clone(&job_store)),
            SweeperConfig {
                interval: args.interval.max(Duration::from_secs(60)),
                max_age: args.max_age,
            },
        );
        tasks.push(tokio::spawn(sweeper.run(cancel.clone())));
    }

    let resolver = Arc::new(PathResolver::new(
        Arc::clone(&corpus),
        bug_store.clone(),
        issue_store.clone(),
        ResolverConfig {
            bug_url_base: args.bugzilla_url.clone(),
            issue_url_base: args.jira_url.clone(),
            job_url_base: args.artifact_uri_prefix.clone(),
        },
    ));
    resolver
        .refresh()
        .await
        .context("building the initial disk index")?;
    if indexing {
        tasks.push(tokio::spawn(run_index_marker(
            Arc::clone(&resolver),
            Arc::clone(&corpus),
            args.interval,
            cancel.clone(),
        )));
    }

    let tool = SearchTool::detect().context("locating a search engine (rg or grep)")?;
    info!("using search engine {:?} at {}", tool.kind, tool.path.display());
    let executor = Arc::new(SearchExecutor::new(Arc::clone(&resolver), tool));

    let state = AppState {
        executor,
        resolver,
        jobs: jobs_snapshot,
        config_path: args.config.clone(),
        max_age_cap: args.max_age,
    };
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("http server")?;

    info!("shutting down; draining background tasks");
    cancel.cancel();
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .is_err()
        {
            warn!("background task did not stop within 30s");
        }
    }
    info!("shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(err) => {
                        warn!("failed to install SIGTERM handler: {err}");
                        let _ = ctrl_c.await;
                        cancel.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        cancel.cancel();
    });
}

fn read_token(path: Option<&std::path::Path>) -> anyhow::Result<Option<String>> {
    match path {
        Some(path) => {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("reading token file {}", path.display()))?;
            Ok(Some(token.trim().to_string()))
        }
        None => Ok(None),
    }
}

/// Prepopulate a tracker store from the corpus so comments survive
/// restarts; closed memorials stay on disk only.
async fn load_store(corpus: &Arc<Corpus>, dialect: Dialect) -> anyhow::Result<Arc<Store<Bug>>> {
    let store: Arc<Store<Bug>> = Arc::new(Store::new());
    let loaded = {
        let corpus = Arc::clone(corpus);
        tokio::task::spawn_blocking(move || load_bugs(&corpus, dialect))
            .await
            .context("corpus load task")??
    };
    info!("loaded {} {dialect:?} records from corpus", loaded.len());
    for bug in loaded {
        store.insert(bug);
    }
    Ok(store)
}

/// Reflector, comment fetcher, refresh sweeper, and atomic publisher for
/// one tracker source. Both tracker dialects run through this.
fn start_tracker_pipeline<C>(
    args: &Args,
    client: Arc<C>,
    dialect: Dialect,
    store: &Arc<Store<Bug>>,
    corpus: &Arc<Corpus>,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) where
    C: ChangeLister<Bug> + CommentClient + 'static,
{
    let (publish_tx, publish_rx) = mpsc::channel(1024);
    let publisher = BugPublisher::new(Arc::clone(corpus), Arc::clone(store), dialect, publish_rx);
    tasks.push(tokio::spawn(publisher.run(cancel.clone())));

    let queue = Arc::new(WorkQueue::new(WorkQueueConfig::default()));
    let fetcher_config = CommentFetcherConfig {
        refresh_interval: args.interval.max(Duration::from_secs(60)) * 6,
        ..CommentFetcherConfig::default()
    };
    let refresh_interval = fetcher_config.refresh_interval;
    let fetcher = Arc::new(CommentFetcher::new(
        Arc::clone(store),
        Arc::clone(&client) as Arc<dyn CommentClient>,
        Arc::clone(&queue),
        TokenBucket::new(3, Duration::from_secs(15)),
        publish_tx.clone(),
        fetcher_config,
    ));
    tasks.push(tokio::spawn(fetcher.run(cancel.clone())));
    tasks.push(tokio::spawn(CommentFetcher::run_refresh_sweeper(
        Arc::clone(store),
        Arc::clone(&queue),
        refresh_interval,
        cancel.clone(),
    )));

    // Store events feed the fetch queue; an entity flipping to closed
    // gets one memorial write instead.
    {
        let queue = Arc::clone(&queue);
        store.add_handler(move |event| match event {
            StoreEvent::Added(bug) => queue.add(bug.id),
            StoreEvent::Updated { old, new } => {
                if new.is_closed() && !old.is_closed() {
                    if publish_tx
                        .try_send(PublishOp::Closed(Arc::clone(new)))
                        .is_err()
                    {
                        warn!("publish queue full; dropping memorial for {}", new.id);
                    }
                } else if !new.is_closed() {
                    queue.add(new.id);
                }
            }
            StoreEvent::Deleted(_) => {}
        });
    }

    let watcher = Arc::new(PeriodicWatcher::new(
        client,
        PeriodicWatcherConfig {
            poll_interval: args.interval,
            ..PeriodicWatcherConfig::default()
        },
    ));
    let reflector = Reflector::new(watcher, Arc::clone(store), ReflectorConfig::default())
        .with_carry(|existing: &Bug, mut fresh: Bug| {
            // Header updates keep the comments and the refresh clock; the
            // fetch triggered by this update advances both.
            fresh.comments = existing.comments.clone();
            fresh.refresh_time = existing.refresh_time;
            fresh
        })
        .with_tombstone(|bug: &Bug| {
            if bug.is_closed() {
                MissingAction::Keep
            } else {
                let mut memorial = bug.clone();
                memorial.status = "CLOSED".to_string();
                MissingAction::Replace(memorial)
            }
        });
    tasks.push(tokio::spawn(reflector.run(cancel.clone())));
}

/// Object-storage index scanner plus the artifact fetch workers.
fn start_job_pipeline(
    args: &Args,
    bucket: &str,
    corpus: &Arc<Corpus>,
    job_store: &Arc<Store<JobRun>>,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> anyhow::Result<()> {
    let client = Arc::new(
        ObjStoreClient::new(ObjStoreConfig {
            api_base: args.storage_api.clone(),
            bucket: bucket.to_string(),
            index_prefix: args.index_prefix.clone(),
            timeout: Duration::from_secs(60),
        })
        .context("building storage client")?,
    );

    let scanner = IndexScanner::new(
        Arc::clone(&client),
        Arc::clone(job_store),
        IndexScannerConfig {
            interval: args.interval,
            initial_lookback: args.max_age,
            last_key_path: corpus.last_key_path(),
        },
    );
    tasks.push(tokio::spawn(scanner.run(cancel.clone())));

    let queue = Arc::new(WorkQueue::new(WorkQueueConfig::default()));
    {
        let queue = Arc::clone(&queue);
        job_store.add_handler(move |event| match event {
            StoreEvent::Added(run) | StoreEvent::Updated { new: run, .. } => {
                if run.state.is_terminal() {
                    queue.add(run.key());
                }
            }
            StoreEvent::Deleted(_) => {}
        });
    }
    let fetcher = Arc::new(ArtifactFetcher::new(
        Arc::clone(corpus),
        client,
        Arc::clone(job_store),
        queue,
        ArtifactFetcherConfig {
            bucket: bucket.to_string(),
            max_age: args.max_age,
            ..ArtifactFetcherConfig::default()
        },
    ));
    tasks.push(tokio::spawn(fetcher.run(cancel.clone())));
    Ok(())
}

/// Rebuild the disk index every interval and stamp `.indexed-at` after
/// each successful pass.
async fn run_index_marker(
    resolver: Arc<PathResolver>,
    corpus: Arc<Corpus>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match resolver.refresh().await {
            Ok(paths) => {
                info!("index pass complete: {paths} paths");
                if let Err(err) = corpus.write_indexed_at(chrono::Utc::now()).await {
                    warn!("failed to stamp .indexed-at: {err}");
                }
            }
            Err(err) => warn!("index pass failed: {err}"),
        }
    }
}
