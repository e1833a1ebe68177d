use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use usage_ledger::{
    Clock, MeteringConfig, MeteringEngine, MeteringStore, Scope, ScopeKey, SqliteStore,
    SystemClock, UsagePeriod, UsageRequest,
};

#[derive(Debug, Parser)]
#[command(name = "usage-ledger", about = "Usage metering and credit ledger")]
struct Cli {
    /// TOML file with the store settings and plan catalog.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the sqlite path from the config.
    #[arg(long, global = true)]
    sqlite: Option<PathBuf>,
    /// Evaluate as of this RFC 3339 instant instead of the system clock.
    #[arg(long, global = true, value_parser = parse_instant)]
    now: Option<OffsetDateTime>,
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database schema.
    Init,
    /// Dry-run a usage request.
    Check(UsageArgs),
    /// Record usage, funding any overage from credits.
    Consume {
        #[command(flatten)]
        usage: UsageArgs,
        #[arg(long)]
        idempotency_key: String,
    },
    Balance(FeatureArgs),
    /// Grant a plan's recurring credits for the current billing period.
    GrantRecurring {
        #[arg(long)]
        agency: String,
        #[arg(long)]
        plan: String,
    },
    /// Apply credits bought through checkout.
    TopUp {
        #[command(flatten)]
        feature: FeatureArgs,
        #[arg(long)]
        credits: Decimal,
        #[arg(long)]
        payment_session_id: String,
    },
    /// Print the credit ledger, usage events and recent usage windows.
    Ledger {
        #[command(flatten)]
        feature: FeatureArgs,
        #[arg(long)]
        period: Option<UsagePeriod>,
        #[arg(long, default_value_t = 0)]
        periods_back: u32,
    },
    Reconcile(FeatureArgs),
}

#[derive(Debug, Args)]
struct FeatureArgs {
    #[arg(long)]
    agency: String,
    #[arg(long)]
    sub_account: Option<String>,
    #[arg(long)]
    feature: String,
}

impl FeatureArgs {
    fn scope(&self) -> Scope {
        match &self.sub_account {
            Some(sub_account) => Scope::sub_account(self.agency.clone(), sub_account.clone()),
            None => Scope::agency(self.agency.clone()),
        }
    }

    fn key(&self) -> ScopeKey {
        self.scope().feature(self.feature.clone())
    }
}

#[derive(Debug, Args)]
struct UsageArgs {
    #[command(flatten)]
    feature: FeatureArgs,
    #[arg(long)]
    quantity: Decimal,
    #[arg(long)]
    action: Option<String>,
}

impl UsageArgs {
    fn request(&self) -> UsageRequest {
        let request = UsageRequest::new(
            self.feature.scope(),
            self.feature.feature.clone(),
            self.quantity,
        );
        match &self.action {
            Some(action) => request.with_action(action.clone()),
            None => request,
        }
    }
}

fn parse_instant(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(raw, &Rfc3339)
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    usage_ledger::observability::init_tracing(cli.json_logs)?;

    let config = match &cli.config {
        Some(path) => MeteringConfig::load(path)?,
        None => MeteringConfig::default(),
    };
    let sqlite_path = cli
        .sqlite
        .clone()
        .unwrap_or_else(|| config.store.sqlite_path.clone());
    let store = SqliteStore::new(sqlite_path).with_busy_timeout(config.store.busy_timeout());
    let engine = MeteringEngine::new(config.resolver());
    let now = cli.now.unwrap_or_else(|| SystemClock.now());

    tracing::debug!(path = %store.path().display(), now = %now, "usage-ledger starting");

    match &cli.command {
        Command::Init => {
            store.init().await?;
            print_json(&serde_json::json!({ "initialized": store.path() }))?;
        }
        Command::Check(usage) => {
            let decision = engine.check_usage(&store, &usage.request(), now).await?;
            print_json(&decision)?;
        }
        Command::Consume {
            usage,
            idempotency_key,
        } => {
            let outcome = engine
                .consume_usage(&store, &usage.request(), idempotency_key, now)
                .await?;
            print_json(&outcome)?;
        }
        Command::Balance(feature) => {
            let balance = engine.credit_balance(&store, &feature.key(), now).await?;
            print_json(&balance)?;
        }
        Command::GrantRecurring { agency, plan } => {
            let report = engine
                .grant_recurring_credits_for_agency(&store, agency, plan, now)
                .await?;
            print_json(&report)?;
        }
        Command::TopUp {
            feature,
            credits,
            payment_session_id,
        } => {
            let outcome = engine
                .apply_top_up_credits_from_checkout(
                    &store,
                    &feature.scope(),
                    &feature.feature,
                    *credits,
                    payment_session_id,
                    now,
                )
                .await?;
            print_json(&outcome)?;
        }
        Command::Ledger {
            feature,
            period,
            periods_back,
        } => {
            let key = feature.key().canonical();
            let credits = store.list_credit_ledger(&key).await?;
            let events = store.list_usage_events(&key).await?;
            let windows = engine
                .usage_history(&store, &key, *period, *periods_back, now)
                .await?;
            print_json(&serde_json::json!({
                "key": key,
                "credit_ledger": credits,
                "usage_events": events,
                "usage_windows": windows,
            }))?;
        }
        Command::Reconcile(feature) => {
            let report = engine.reconcile_credit_balance(&store, &feature.key()).await?;
            print_json(&report)?;
            if !report.is_consistent() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
