use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use postes_core::api::{ApiClient, ApiError};
use postes_core::config::{Config, ConnectivityConfig, State};
use postes_core::models::{NewRecord, Record};
use postes_core::photo;
use postes_core::session::{SessionManager, TokenSource};
use postes_core::storage::{LocalDb, RecordStore};
use postes_core::sync::{PassOutcome, Routed, SkipReason, SyncError, SyncOrchestrator, SyncReport, SyncTrigger};
use postes_core::{ConnectivityMonitor, ReachabilityProbe};

use crate::cli::{AddArgs, RemoteCommands};

/// Everything a command may need, opened once per invocation.
pub struct App {
    config: Config,
    store: Arc<LocalDb>,
    api: Arc<ApiClient>,
    session: Arc<SessionManager>,
}

impl App {
    pub async fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load config")?;
        let db_path = config.database_path()?;
        let store = Arc::new(LocalDb::open(&db_path)?);
        store
            .initialize()
            .await
            .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;

        let api = Arc::new(ApiClient::new(&config.api)?);
        let session = Arc::new(SessionManager::load(api.clone(), State::default_path()?)?);

        Ok(Self {
            config,
            store,
            api,
            session,
        })
    }

    fn orchestrator(&self, reachable: bool) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.store.clone(),
            self.api.clone(),
            self.session.clone(),
            Arc::new(ConnectivityMonitor::new(reachable)),
            self.config.sync.clone(),
        )
    }

    async fn server_reachable(&self) -> Result<bool> {
        server_reachable(self.api.base_url(), &self.config.connectivity).await
    }

    /// Run an authenticated API call, refreshing the access token once if
    /// the server rejects it.
    async fn authorized<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let Some(token) = self.session.access_token().await else {
            bail!("Not logged in. Run 'postes login' first");
        };
        match call(token).await {
            Err(ApiError::Unauthorized) => {
                let token = self.session.refresh().await.context("Session expired, log in again")?;
                Ok(call(token).await?)
            }
            other => Ok(other?),
        }
    }
}

pub async fn login(app: &App, username: Option<&str>, json: bool) -> Result<()> {
    use dialoguer::{Input, Password};

    let username = match username {
        Some(name) => name.to_string(),
        None => Input::<String>::new().with_prompt("Username").interact_text()?,
    };
    let password = Password::new().with_prompt("Password").interact()?;

    app.session.login(&username, &password).await?;

    if json {
        println!("{}", json!({ "status": "logged_in", "username": username }));
    } else {
        println!("Logged in as {}", username.cyan());
    }
    Ok(())
}

pub async fn logout(app: &App, json: bool) -> Result<()> {
    app.session.logout().await?;
    if json {
        println!("{}", json!({ "status": "logged_out" }));
    } else {
        println!("Session cleared");
    }
    Ok(())
}

pub async fn cities(app: &App, json: bool) -> Result<()> {
    let api = &app.api;
    let cities = app.authorized(|token| async move { api.cities(&token).await }).await?;

    if json {
        println!("{}", serde_json::to_string(&cities)?);
        return Ok(());
    }

    if cities.is_empty() {
        println!("No cities registered on the server");
        return Ok(());
    }
    for city in cities {
        println!("{:>5}  {}", city.id.to_string().dimmed(), city.name);
    }
    Ok(())
}

pub async fn neighborhoods(app: &App, city_id: i64, json: bool) -> Result<()> {
    let api = &app.api;
    let bairros = app
        .authorized(|token| async move { api.neighborhoods(city_id, &token).await })
        .await?;

    if json {
        println!("{}", serde_json::to_string(&bairros)?);
        return Ok(());
    }

    if bairros.is_empty() {
        println!("No neighborhoods for city {}", city_id);
        return Ok(());
    }
    for bairro in bairros {
        println!("{:>5}  {}", bairro.id.to_string().dimmed(), bairro.name);
    }
    Ok(())
}

fn build_record(args: &AddArgs) -> Result<NewRecord> {
    let mut record = match (args.lat, args.lon, args.zone, args.easting, args.northing) {
        (Some(lat), Some(lon), _, _, _) => NewRecord::from_position(&args.city, &args.bairro, lat, lon)?,
        (_, _, Some(zone), Some(easting), Some(northing)) => NewRecord {
            city: args.city.clone(),
            neighborhood: args.bairro.clone(),
            utm_zone: zone,
            utm_easting: easting,
            utm_northing: northing,
            notes: None,
            photo_ref: None,
        },
        _ => bail!("Give either --lat/--lon or --zone/--easting/--northing"),
    };

    if args.city.trim().is_empty() || args.bairro.trim().is_empty() {
        bail!("City and neighborhood are required");
    }
    if let Some(notes) = &args.notes {
        record = record.with_notes(notes.as_str());
    }
    Ok(record)
}

/// One-shot reachability check against the API host.
async fn server_reachable(base_url: &str, settings: &ConnectivityConfig) -> Result<bool> {
    let probe = ReachabilityProbe::new(
        base_url,
        Duration::from_secs(settings.probe_timeout_secs.max(1)),
        Duration::from_secs(settings.probe_interval_secs.max(1)),
    )?;
    Ok(probe.check().await)
}

pub async fn add(app: &App, args: &AddArgs, json: bool) -> Result<()> {
    let mut record = build_record(args)?;

    if let Some(source) = &args.photo {
        let dir = app.config.photo_dir()?;
        let prepared = photo::prepare(source, &dir, &app.config.photo)
            .with_context(|| format!("Failed to prepare photo {}", source.display()))?;
        record = record.with_photo(prepared);
    }

    let reachable = !args.offline && app.server_reachable().await?;
    let routed = app.orchestrator(reachable).submit_new(record).await?;

    if json {
        println!("{}", serde_json::to_string(&routed)?);
        return Ok(());
    }

    match routed {
        Routed::Delivered { remote_id } => match remote_id {
            Some(id) => println!("{} (server id {})", "Record sent".green(), id),
            None => println!("{}", "Record sent".green()),
        },
        Routed::Queued { local_id, reason } => {
            println!(
                "{} as #{} ({:?}); it will be sent when the connection returns",
                "Record saved locally".yellow(),
                local_id,
                reason
            );
        }
    }
    Ok(())
}

fn print_records(records: &[Record]) {
    for record in records {
        println!(
            "#{} {} / {}  zone {} {:.2} E {:.2} N  {}",
            record.id,
            record.city.cyan(),
            record.neighborhood,
            record.utm_zone,
            record.utm_easting,
            record.utm_northing,
            record.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
        );
        if let Some(notes) = &record.notes {
            println!("    {}", notes);
        }
        if let Some(photo) = &record.photo_ref {
            println!("    photo: {}", photo.display());
        }
        if let Some(err) = &record.last_error {
            println!("    {} after {} attempt(s): {}", "rejected".red(), record.attempts, err);
        }
    }
}

pub async fn list_pending(app: &App, json: bool) -> Result<()> {
    let records = app.store.list_pending().await?;

    if json {
        println!("{}", serde_json::to_string(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("Nothing waiting to sync");
        return Ok(());
    }
    println!("{} record(s) waiting to sync:", records.len());
    print_records(&records);
    Ok(())
}

pub async fn list_failed(app: &App, json: bool) -> Result<()> {
    let records = app.store.list_failed().await?;

    if json {
        println!("{}", serde_json::to_string(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No dead-lettered records");
        return Ok(());
    }
    println!("{} record(s) rejected by the server:", records.len());
    print_records(&records);
    println!("\nFix the data on the server side, then run 'postes requeue <id>'");
    Ok(())
}

pub async fn requeue(app: &App, id: i64, json: bool) -> Result<()> {
    let moved = app.store.requeue(id).await?;

    if json {
        println!("{}", json!({ "id": id, "requeued": moved }));
        return Ok(());
    }

    if moved {
        println!("Record #{} is pending again", id);
    } else {
        bail!("Record #{} is not in the dead letter", id);
    }
    Ok(())
}

pub async fn status(app: &App, json: bool) -> Result<()> {
    let counts = app.store.counts().await?;
    let logged_in = app.session.is_logged_in().await;
    let username = app.session.username().await;

    if json {
        println!(
            "{}",
            json!({
                "server": app.api.base_url(),
                "logged_in": logged_in,
                "username": username,
                "counts": counts,
            })
        );
        return Ok(());
    }

    println!("Server: {}", app.api.base_url().cyan());
    match (logged_in, username) {
        (true, Some(name)) => println!("Session: {} as {}", "Logged in".green(), name),
        (true, None) => println!("Session: {}", "Logged in".green()),
        (false, _) => println!("Session: {}", "Not logged in".red()),
    }
    println!("Pending: {}", counts.pending.to_string().yellow());
    println!("Failed:  {}", counts.failed.to_string().red());
    if app.config.sync.retain_synced {
        println!("Synced:  {}", counts.synced.to_string().green());
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    if report.attempted == 0 {
        println!("Nothing to sync");
        return;
    }
    println!(
        "Sent {} of {} record(s)",
        report.delivered.len().to_string().green(),
        report.attempted
    );
    if !report.transient.is_empty() {
        println!(
            "  {} will be retried: {:?}",
            report.transient.len().to_string().yellow(),
            report.transient
        );
    }
    for rejection in &report.rejected {
        println!("  #{} {}: {}", rejection.local_id, "rejected".red(), rejection.reason);
    }
    if !report.dead_lettered.is_empty() {
        println!("  moved to dead letter: {:?}", report.dead_lettered);
    }
}

pub async fn sync(app: &App, json: bool) -> Result<()> {
    let outcome = app.orchestrator(true).run_pass(SyncTrigger::Manual).await;

    match outcome {
        Ok(outcome) if json => println!("{}", serde_json::to_string(&outcome)?),
        Ok(PassOutcome::Completed(report)) => print_report(&report),
        Ok(PassOutcome::Skipped(SkipReason::AlreadyRunning)) => println!("A sync pass is already running"),
        Ok(PassOutcome::Skipped(reason)) => println!("Sync skipped: {:?}", reason),
        Err(SyncError::Unauthorized { reason, report }) => {
            if json {
                println!("{}", json!({ "aborted": reason, "report": report }));
            } else {
                print_report(&report);
            }
            bail!("Sync stopped: {}. Run 'postes login' and try again", reason);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// The server answers either names or catalog ids for city and bairro.
fn field_label(value: &Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    }
}

pub async fn remote(app: &App, cmd: &RemoteCommands, json: bool) -> Result<()> {
    let api = &app.api;
    match cmd {
        RemoteCommands::List => {
            let postes = app.authorized(|token| async move { api.list_postes(&token).await }).await?;
            if json {
                println!("{}", serde_json::to_string(&postes)?);
                return Ok(());
            }
            if postes.is_empty() {
                println!("No records on the server");
                return Ok(());
            }
            for poste in postes {
                println!(
                    "{:>6}  {} / {}  {}",
                    poste.id.to_string().dimmed(),
                    field_label(&poste.city).cyan(),
                    field_label(&poste.neighborhood),
                    poste.notes.as_deref().unwrap_or("")
                );
            }
        }
        RemoteCommands::Remove { id } => {
            let id = *id;
            app.authorized(|token| async move { api.delete_poste(id, &token).await })
                .await?;
            if json {
                println!("{}", json!({ "status": "deleted", "id": id }));
            } else {
                println!("Deleted server record {}", id);
            }
        }
    }
    Ok(())
}
