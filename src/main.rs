use std::{process, sync::Arc, time::Duration};

use biztrack::{
    DataLayer, EntityLabels, LiveHandle, LoadMore, MemoryRemote, QueryKey, QueryState, Record,
    ViewSpec,
    cache::{CacheConfig, CacheStore},
    config::{self, CacheCommand, CliArgs, Command, Settings},
    error::DataError,
    identity::{Identity, IdentityHandle},
    live::Phase,
    notify::ToastQueue,
    org_tree::{self, OrgNode},
    remote::{Operator, OrderBy, RemoteError},
    telemetry,
};
use clap::Parser;
use serde_json::json;
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const DEMO_OWNER: &str = "demo-owner";
const DEMO_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("no cached entry for `{0}`")]
    NotCached(String),
    #[error("demo stalled: {0}")]
    Demo(&'static str),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &CliError) {
    if dispatcher::has_been_set() {
        error!(target = "biztrack::cli", error = %error, "command failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(target = "biztrack::cli", error = %error, "command failed");
    });
}

async fn run() -> Result<(), CliError> {
    let cli = CliArgs::parse();
    let settings = config::load(&cli)?;
    telemetry::init(&settings.logging)?;

    match cli.command.unwrap_or(Command::Demo) {
        Command::Cache(args) => run_cache(&settings, args.command).await,
        Command::OrgTree(args) => run_org_tree(&args.input).await,
        Command::Demo => run_demo(&settings).await,
    }
}

async fn run_cache(settings: &Settings, command: CacheCommand) -> Result<(), CliError> {
    let store = CacheStore::open(&CacheConfig::from(&settings.cache)).await;

    match command {
        CacheCommand::Stats => {
            let stats = store.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        CacheCommand::Get { key } => {
            let entry = store
                .get(&QueryKey::from(key.clone()))
                .await
                .ok_or(CliError::NotCached(key))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        CacheCommand::Clear { owner } => {
            let cleared = store.clear_for_owner(&owner).await;
            info!(
                target = "biztrack::cli",
                owner_id = %owner,
                memory = cleared.memory,
                persistent = cleared.persistent,
                "Cache cleared"
            );
            println!("{}", serde_json::to_string_pretty(&cleared)?);
        }
    }
    Ok(())
}

async fn run_org_tree(input: &std::path::Path) -> Result<(), CliError> {
    let raw = tokio::fs::read_to_string(input)
        .await
        .map_err(|source| CliError::Read {
            path: input.display().to_string(),
            source,
        })?;
    let nodes: Vec<OrgNode> = serde_json::from_str(&raw)?;
    let report = org_tree::build_report(&nodes);

    match &report.root {
        Some(root) => print!("{}", root.render()),
        None => println!("(no root node)"),
    }
    let anomalies = json!({
        "orphans": report.orphans,
        "extraRoots": report.extra_roots,
        "unreachable": report.unreachable,
        "duplicates": report.duplicates,
    });
    println!("{}", serde_json::to_string_pretty(&anomalies)?);
    Ok(())
}

/// Walk a clients view through paging, an external delete and a rejected write.
async fn run_demo(settings: &Settings) -> Result<(), CliError> {
    let remote = MemoryRemote::new();
    let path = format!("{}/{DEMO_OWNER}/clients", settings.query.owner_scope);
    remote.seed(
        &path,
        ["Avery", "Blake", "Casey", "Devon", "Emery"]
            .iter()
            .map(|name| {
                Record::from_json(
                    name.to_lowercase(),
                    json!({"clientName": name, "status": "Active"}),
                )
            }),
    );
    remote.insert(
        &path,
        Record::from_json("zed", json!({"clientName": "Zed", "status": "Archived"})),
    );

    let toasts = Arc::new(ToastQueue::default());
    let identity = IdentityHandle::new(Identity::signed_in(DEMO_OWNER));
    let layer = DataLayer::from_settings(
        settings,
        Arc::new(remote.clone()),
        toasts.clone(),
        identity,
    )
    .await;

    let query = layer.open(
        ViewSpec::new("clients")
            .filter("status", Operator::Eq, "Active")
            .order_by(OrderBy::asc("clientName"))
            .page_size(2),
    );
    let state = wait_until(&query, "first page", |s| s.phase == Phase::Streaming).await?;
    print_state("first page", &state);

    for step in ["load more", "load more again"] {
        match query.load_more().await? {
            LoadMore::Appended { .. } => print_state(step, &query.snapshot()),
            other => println!("{step}: {other:?}"),
        }
    }

    let counter = layer.counter();
    if let Some(descriptor) = query.descriptor() {
        let total = counter.track(descriptor).await?;
        println!("approximate total: {}", total.unwrap_or_default());
    }

    remote.remove(&path, "avery");
    let state = wait_until(&query, "external delete", |s| {
        s.items.first().is_some_and(|record| record.id == "blake")
    })
    .await?;
    print_state("after external delete", &state);

    let mutator = layer.mutator(query.handle(), EntityLabels::new("Client", "Clients"));
    remote.fail_next_mutation(RemoteError::PermissionDenied("read-only demo".to_string()));
    let rejected = Record::from_json("blake", json!({"clientName": "Blake (renamed)"}));
    if let Err(err) = mutator.update(rejected).await {
        println!("rejected update: {err}");
    }
    let state = wait_until(&query, "rollback", |s| s.phase == Phase::Streaming).await?;
    print_state("after rollback", &state);

    for toast in toasts.drain() {
        println!("toast [{:?}] {}: {}", toast.kind, toast.title, toast.detail);
    }

    let cleared = layer.sign_out().await;
    info!(
        target = "biztrack::cli",
        memory = cleared.memory,
        persistent = cleared.persistent,
        "Demo finished"
    );
    Ok(())
}

async fn wait_until(
    query: &LiveHandle,
    stage: &'static str,
    predicate: impl FnMut(&Arc<QueryState>) -> bool,
) -> Result<Arc<QueryState>, CliError> {
    let mut rx = query.watch();
    let state = match tokio::time::timeout(DEMO_WAIT, rx.wait_for(predicate)).await {
        Ok(Ok(state)) => Arc::clone(&state),
        _ => return Err(CliError::Demo(stage)),
    };
    Ok(state)
}

fn print_state(label: &str, state: &QueryState) {
    let names: Vec<&str> = state
        .items
        .iter()
        .filter_map(|record| record.field("clientName").and_then(|v| v.as_str()))
        .collect();
    println!(
        "{label}: [{}] has_more={} phase={}",
        names.join(", "),
        state.has_more,
        state.phase.as_str()
    );
}
