use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use salonbook::calendar::{CalendarSource, JsonFileSource};
use salonbook::config::{SalonConfig, Settings};
use salonbook::engine::{Engine, EngineOptions, ImportOptions};
use salonbook::jobs;
use salonbook::model::{ImportScope, ProfessionalChoice, RescheduleRequest};

/// Alternatives offered after a refused reschedule.
const SUGGESTIONS: usize = 5;

#[derive(Debug, Parser)]
#[command(name = "salonbook", about = "Salon availability and reservations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Free start times for a service on one day
    Slots(SlotsArgs),
    /// Book a service; without --professional the first free one is assigned
    Book(BookArgs),
    /// Cancel a reservation
    Cancel { id: String },
    /// Move a reservation to another date, time or professional
    Reschedule(RescheduleArgs),
    /// List reservations
    List(ListArgs),
    /// Import events from an exported external calendar
    Import(ImportArgs),
}

#[derive(Debug, Args)]
struct SlotsArgs {
    #[arg(long)]
    service: String,
    #[arg(long)]
    date: NaiveDate,
    #[arg(long)]
    professional: Option<String>,
}

#[derive(Debug, Args)]
struct BookArgs {
    #[arg(long)]
    service: String,
    #[arg(long)]
    date: NaiveDate,
    #[arg(long, value_parser = parse_time)]
    time: NaiveTime,
    #[arg(long)]
    professional: Option<String>,
}

#[derive(Debug, Args)]
struct RescheduleArgs {
    id: String,
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long, value_parser = parse_time)]
    time: Option<NaiveTime>,
    #[arg(long)]
    professional: Option<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, requires = "date")]
    professional: Option<String>,
    #[arg(long, requires = "professional")]
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// JSON file: {"calendars": {"<id>": [events]}}
    #[arg(long)]
    events: PathBuf,
    #[arg(long)]
    day: Option<NaiveDate>,
    #[arg(long, conflicts_with = "day", requires = "end_date")]
    start_date: Option<NaiveDate>,
    #[arg(long, conflicts_with = "day", requires = "start_date")]
    end_date: Option<NaiveDate>,
    /// Calendar to scan (default: every calendar in the file)
    #[arg(long, conflicts_with = "by_professional")]
    calendar: Option<String>,
    /// Scan every calendar mapped to a professional in the catalog
    #[arg(long)]
    by_professional: bool,
    /// Fallback professional for events nothing else assigns
    #[arg(long)]
    professional: Option<String>,
    #[arg(long, env = "SALONBOOK_DEFAULT_SERVICE")]
    default_service: Option<String>,
    /// Keep running and re-import every N seconds over the next --days-ahead days
    #[arg(
        long,
        value_name = "SECS",
        requires = "by_professional",
        conflicts_with_all = ["day", "start_date", "end_date", "professional"]
    )]
    every: Option<u64>,
    /// Days ahead covered by each periodic import
    #[arg(long, default_value_t = 14)]
    days_ahead: u32,
}

fn parse_time(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| format!("invalid time {raw:?}, expected HH:MM"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    salonbook::observability::init_tracing();
    let cli = Cli::parse();

    let settings = Settings::from_env();
    salonbook::observability::init_metrics(settings.metrics_port)?;
    let config = SalonConfig::load(settings.catalog_path.as_deref())?;
    let rules = config.rules.clone();
    let options = EngineOptions {
        allow_past_bookings: settings.allow_past_bookings,
    };

    let engine = match settings.wal_path() {
        Some(wal_path) => {
            if let Some(dir) = &settings.data_dir {
                std::fs::create_dir_all(dir)?;
            }
            Engine::open(config.catalog, config.hours, options, wal_path)?
        }
        None => {
            warn!("SALONBOOK_DATA_DIR not set, reservations will not be kept");
            Engine::in_memory(config.catalog, config.hours, options)
        }
    };
    let engine = Arc::new(engine);
    if engine.is_persistent() {
        tokio::spawn(jobs::run_compactor(
            engine.clone(),
            settings.compact_threshold,
            Duration::from_secs(30),
        ));
    }

    let output = match cli.command {
        Command::Slots(args) => {
            let choice = ProfessionalChoice::from(args.professional);
            let slots = engine.available_slots(&args.service, args.date, &choice).await?;
            let times: Vec<String> = slots.iter().map(|s| s.format("%H:%M").to_string()).collect();
            json!({"ok": true, "service_id": args.service, "date": args.date, "slots": times})
        }
        Command::Book(args) => {
            let choice = ProfessionalChoice::from(args.professional);
            let start = args.date.and_time(args.time);
            match engine.book(&args.service, &choice, start).await {
                Ok(reservation) => json!({"ok": true, "reservation": reservation}),
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            }
        }
        Command::Cancel { id } => {
            let cancelled = engine.cancel(&id).await?;
            json!({"ok": cancelled, "id": id})
        }
        Command::Reschedule(args) => {
            let mut request = RescheduleRequest::new(args.id);
            request.new_date = args.date;
            request.new_time = args.time;
            request.new_professional_id = args.professional;
            let outcome = engine.reschedule(&request).await?;
            if outcome.success {
                json!({"ok": true, "message": outcome.message, "reservation": outcome.reservation})
            } else {
                let r = &outcome.reservation;
                let professional = request
                    .new_professional_id
                    .clone()
                    .unwrap_or_else(|| r.professional_id.clone());
                let day = request.new_date.unwrap_or(r.start.date());
                let alternatives = engine
                    .suggest_alternatives(
                        &r.service_id,
                        day,
                        &ProfessionalChoice::Specific(professional),
                        SUGGESTIONS,
                    )
                    .await
                    .unwrap_or_default();
                let alternatives: Vec<String> = alternatives
                    .iter()
                    .map(|s| s.format("%Y-%m-%d %H:%M").to_string())
                    .collect();
                json!({
                    "ok": false,
                    "message": outcome.message,
                    "reservation": outcome.reservation,
                    "alternatives": alternatives,
                })
            }
        }
        Command::List(args) => {
            let reservations = match (args.professional, args.date) {
                (Some(professional), Some(date)) => engine.reservations_for(&professional, date).await?,
                _ => engine.list().await,
            };
            json!({"ok": true, "reservations": reservations})
        }
        Command::Import(args) => run_import(&engine, args, rules, &settings).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    if engine.is_persistent() {
        jobs::compact_if_needed(&engine, settings.compact_threshold).await?;
    }
    Ok(())
}

async fn run_import(
    engine: &Arc<Engine>,
    args: ImportArgs,
    rules: salonbook::inference::ServiceRules,
    settings: &Settings,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let source = Arc::new(JsonFileSource::load(&args.events)?);
    let import_options = ImportOptions {
        default_service: args
            .default_service
            .unwrap_or_else(|| settings.default_service.clone()),
        fallback_professional: args.professional.clone(),
        rules,
    };

    if let Some(secs) = args.every {
        info!(secs, days_ahead = args.days_ahead, "periodic import started");
        let source: Arc<dyn CalendarSource> = source;
        let reconciler = tokio::spawn(jobs::run_reconciler(
            engine.clone(),
            source,
            import_options,
            args.days_ahead,
            Duration::from_secs(secs),
        ));
        tokio::signal::ctrl_c().await?;
        reconciler.abort();
        info!("periodic import stopped");
        return Ok(json!({"ok": true}));
    }

    let (start_date, end_date) = match (args.day, args.start_date, args.end_date) {
        (Some(day), _, _) => (day, day),
        (None, Some(start), Some(end)) => (start, end),
        _ => return Ok(json!({"ok": false, "error": "give --day or --start-date and --end-date"})),
    };

    let scopes = if args.by_professional {
        engine.catalog().calendar_scopes(start_date, end_date)
    } else {
        let calendar_ids: Vec<String> = match args.calendar {
            Some(calendar) => vec![calendar],
            None => source.calendar_ids().map(str::to_string).collect(),
        };
        calendar_ids
            .into_iter()
            .map(|calendar_id| ImportScope {
                calendar_id,
                professional_id: None,
                start_date,
                end_date,
            })
            .collect()
    };

    let report = engine.reconcile(source.as_ref(), &scopes, &import_options).await;
    Ok(json!({"ok": report.scope_errors.is_empty(), "report": report}))
}
