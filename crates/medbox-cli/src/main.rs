use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use medbox_api::{
    parse_calendar_date, parse_utc_offset, CompleteFromDeviceRequest, GetDayRequest,
    MarkTakenRequest, MaterializeRequest, MedboxApi, Operation, PutReminderRequest, RangeBound,
    RangeRequest, ReconcileFutureRequest,
};
use medbox_core::{grace_from_minutes, horizon_from_hours, EngineConfig, ManualClock};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "mb")]
#[command(about = "Medication box dose record CLI")]
struct Cli {
    #[arg(long, default_value = "./medbox.sqlite3")]
    db: PathBuf,

    /// Fixed offset used for calendar days, e.g. `+02:00`.
    #[arg(long, default_value = "Z")]
    utc_offset: String,

    #[arg(long, default_value_t = 0)]
    missed_grace_minutes: i64,

    #[arg(long, default_value_t = 48)]
    horizon_hours: i64,

    /// Pin the clock to an RFC3339 instant instead of the system time.
    #[arg(long)]
    now: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Reminder {
        #[command(subcommand)]
        command: ReminderCommand,
    },
    Records {
        #[command(subcommand)]
        command: Box<RecordsCommand>,
    },
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },
    /// Run one operation given as `{"op": ..., "input": ...}` JSON.
    Ops(OpsArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ReminderCommand {
    /// Create or replace a reminder from its JSON document.
    Put(ReminderPutArgs),
    Delete(ReminderIdArgs),
    List(BoxArgs),
}

#[derive(Debug, Args)]
struct ReminderPutArgs {
    #[arg(long)]
    json: String,
}

#[derive(Debug, Args)]
struct ReminderIdArgs {
    #[arg(long)]
    reminder_id: String,
}

#[derive(Debug, Args)]
struct BoxArgs {
    #[arg(long)]
    medicine_box_id: String,
}

#[derive(Debug, Subcommand)]
enum RecordsCommand {
    Today,
    Day(DayArgs),
    Range(RangeArgs),
    Reconcile(ReconcileArgs),
    Sweep,
    MarkTaken(MarkTakenArgs),
    Materialize(MaterializeArgs),
    /// One materialize-and-sweep pass, as the service scheduler runs it.
    Tick,
}

#[derive(Debug, Args)]
struct DayArgs {
    #[arg(long)]
    date: String,
}

#[derive(Debug, Args)]
struct RangeArgs {
    /// RFC3339 instant, or `YYYY-MM-DD` for the start of that day.
    #[arg(long)]
    start: String,
    /// RFC3339 instant, or `YYYY-MM-DD` through the end of that day.
    #[arg(long)]
    end: String,
    #[arg(long)]
    user_id: Option<String>,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long)]
    medicine_box_id: Option<String>,
    #[arg(long)]
    reminder_id: Option<String>,
}

#[derive(Debug, Args)]
struct MarkTakenArgs {
    #[arg(long)]
    record_id: String,
}

#[derive(Debug, Args)]
struct MaterializeArgs {
    #[arg(long)]
    reminder_id: Option<String>,
    #[arg(long)]
    horizon_hours: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum DeviceCommand {
    Complete(DeviceCompleteArgs),
}

#[derive(Debug, Args)]
struct DeviceCompleteArgs {
    #[arg(long)]
    device_id: String,
    #[arg(long)]
    box_number: u32,
}

#[derive(Debug, Args)]
struct OpsArgs {
    #[arg(long)]
    json: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contractVersion".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contractVersion": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value)?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = build_api(&cli)?;

    match cli.command {
        Command::Db { command } => run_db(&command, &api),
        Command::Reminder { command } => run_reminder(command, &api),
        Command::Records { command } => run_records(*command, &api),
        Command::Device { command } => run_device(&command, &api),
        Command::Ops(args) => {
            let operation: Operation =
                serde_json::from_str(&args.json).context("failed to parse operation JSON")?;
            emit_json(&api.dispatch(&operation)?)
        }
    }
}

fn build_api(cli: &Cli) -> Result<MedboxApi> {
    let config = EngineConfig {
        utc_offset: parse_utc_offset(&cli.utc_offset)?,
        missed_grace: grace_from_minutes(cli.missed_grace_minutes)
            .context("invalid --missed-grace-minutes")?,
        default_horizon: horizon_from_hours(cli.horizon_hours).context("invalid --horizon-hours")?,
    };
    let api = MedboxApi::new(cli.db.clone()).with_config(config);

    match cli.now.as_deref() {
        Some(raw) => Ok(api.with_clock(Arc::new(ManualClock::new(parse_rfc3339(raw)?)))),
        None => Ok(api),
    }
}

fn run_db(command: &DbCommand, api: &MedboxApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => emit_json(&api.schema_status()?),
        DbCommand::Migrate(args) => emit_json(&api.migrate(args.dry_run)?),
    }
}

fn run_reminder(command: ReminderCommand, api: &MedboxApi) -> Result<()> {
    match command {
        ReminderCommand::Put(args) => {
            let request: PutReminderRequest =
                serde_json::from_str(&args.json).context("failed to parse reminder JSON")?;
            emit_json(&api.put_reminder(request)?)
        }
        ReminderCommand::Delete(args) => emit_json(&api.delete_reminder(&args.reminder_id)?),
        ReminderCommand::List(args) => emit_json(&api.list_reminders(&args.medicine_box_id)?),
    }
}

fn run_records(command: RecordsCommand, api: &MedboxApi) -> Result<()> {
    match command {
        RecordsCommand::Today => emit_json(&api.today()?),
        RecordsCommand::Day(args) => {
            let date = parse_calendar_date(&args.date)?;
            emit_json(&api.get_day(&GetDayRequest { date })?)
        }
        RecordsCommand::Range(args) => emit_json(&api.get_range(&RangeRequest {
            start_date: args.start.parse::<RangeBound>()?,
            end_date: args.end.parse::<RangeBound>()?,
            user_id: args.user_id,
        })?),
        RecordsCommand::Reconcile(args) => emit_json(&api.reconcile_future(&ReconcileFutureRequest {
            medicine_box_id: args.medicine_box_id,
            reminder_id: args.reminder_id,
        })?),
        RecordsCommand::Sweep => emit_json(&api.sweep_missed()?),
        RecordsCommand::MarkTaken(args) => {
            emit_json(&api.mark_taken(&MarkTakenRequest { record_id: args.record_id })?)
        }
        RecordsCommand::Materialize(args) => emit_json(&api.materialize(&MaterializeRequest {
            reminder_id: args.reminder_id,
            horizon_hours: args.horizon_hours,
        })?),
        RecordsCommand::Tick => emit_json(&api.tick()?),
    }
}

fn run_device(command: &DeviceCommand, api: &MedboxApi) -> Result<()> {
    match command {
        DeviceCommand::Complete(args) => {
            emit_json(&api.complete_from_device(&CompleteFromDeviceRequest {
                device_id: args.device_id.clone(),
                box_number: args.box_number,
            })?)
        }
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
