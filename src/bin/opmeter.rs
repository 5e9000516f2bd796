use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use opmeter::meter::credentials::Credential;
use opmeter::meter::{Env, Meter, MeterConfig, PricingUpdate, Role, SqliteStore};
use opmeter::money;
use opmeter::payments::{PayPalConfig, PayPalGateway, parse_webhook_event};

/// Operator tool for the metering ledger.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML or JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, default_value = "opmeter.db")]
    db: PathBuf,

    /// Dotenv file layered over the process environment
    #[arg(long, global = true, default_value = ".env")]
    dotenv: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema
    Init,
    #[command(subcommand)]
    Account(AccountCommand),
    #[command(subcommand)]
    Key(KeyCommand),
    #[command(subcommand)]
    Session(SessionCommand),
    /// Resolve a session token or API key for an operation
    Auth {
        #[arg(long)]
        credential: String,
        #[arg(long)]
        operation: String,
    },
    /// Advisory check; changes nothing
    Eligibility { account: String, operation: String },
    /// Charge one operation
    Charge { account: String, operation: String },
    /// Balance, quota and recent activity
    Balance { account: String },
    #[command(subcommand)]
    Deposit(DepositCommand),
    /// Apply a payment gateway webhook payload read from a file
    Webhook { file: PathBuf },
    #[command(subcommand)]
    Pricing(PricingCommand),
    /// Explicit balance correction, e.g. a refund
    Credit {
        account: String,
        #[arg(allow_hyphen_values = true)]
        amount: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    Create {
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value = "0")]
        opening_balance: String,
    },
    Show {
        account: String,
    },
    Role {
        account: String,
        /// normal, suspended or admin
        role: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyCommand {
    Create(KeyCreateArgs),
    List { account: String },
    Revoke { account: String, key_id: String },
}

#[derive(Args, Debug)]
struct KeyCreateArgs {
    account: String,
    #[arg(long)]
    name: String,
    /// Operation the key may run; repeat or use `*`
    #[arg(long = "permission")]
    permissions: Vec<String>,
    /// RFC 3339 expiry
    #[arg(long)]
    expires_at: Option<String>,
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    Issue { account: String },
}

#[derive(Subcommand, Debug)]
enum DepositCommand {
    /// Record a pending deposit for an existing payment reference
    Create {
        account: String,
        amount: String,
        reference: String,
    },
    /// Open a gateway order and record it as pending
    Start { account: String, amount: String },
    /// Verify an order with the gateway and settle it
    Confirm { account: String, reference: String },
    Complete {
        reference: String,
        #[arg(long)]
        amount: Option<String>,
    },
    Fail {
        reference: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand, Debug)]
enum PricingCommand {
    /// Pricing in force
    Show,
    /// Admin-only change; omitted values are kept
    Set {
        /// Account making the change
        #[arg(long)]
        admin: String,
        #[arg(long)]
        operation_cost: Option<String>,
        #[arg(long)]
        free_operations: Option<u32>,
        /// `operation=price`; repeat. Replaces all custom prices
        #[arg(long = "custom-price")]
        custom_prices: Vec<String>,
        #[arg(long, conflicts_with = "custom_prices")]
        clear_custom_prices: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    opmeter::telemetry::init_tracing(cli.json_logs)?;

    let env = match std::fs::read_to_string(&cli.dotenv) {
        Ok(contents) => Env::parse_dotenv(&contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Env::default(),
        Err(err) => return Err(err.into()),
    };
    let config = match cli.config.as_ref() {
        Some(path) => MeterConfig::load(path)?,
        None => MeterConfig::default(),
    };

    let store = SqliteStore::new(&cli.db);
    store.init().await?;
    if matches!(cli.command, Command::Init) {
        return print(&serde_json::json!({ "db": store.path() }));
    }

    let currency = config.deposits.currency.clone();
    let mut meter = Meter::new(config, Arc::new(store), &env)?;
    match PayPalConfig::from_env(&env) {
        Ok(paypal) => {
            let gateway = PayPalGateway::new(paypal.with_currency(currency));
            meter = meter.with_payment_gateway(Arc::new(gateway));
        }
        Err(err) => tracing::debug!(error = %err, "payment gateway disabled"),
    }

    run(&meter, cli.command).await
}

async fn run(meter: &Meter, command: Command) -> CliResult<()> {
    match command {
        Command::Init => Ok(()),
        Command::Account(AccountCommand::Create {
            id,
            opening_balance,
        }) => {
            let opening = money::parse_decimal(&opening_balance)?;
            print(&meter.register_account(id.as_deref(), opening).await?)
        }
        Command::Account(AccountCommand::Show { account }) => {
            print(&meter.account(&account).await?)
        }
        Command::Account(AccountCommand::Role { account, role }) => {
            let role = Role::parse(&role).ok_or_else(|| format!("unknown role: {role}"))?;
            print(&meter.set_role(&account, role).await?)
        }
        Command::Key(KeyCommand::Create(args)) => {
            let expires_at = args
                .expires_at
                .as_deref()
                .map(|raw| OffsetDateTime::parse(raw, &Rfc3339))
                .transpose()?;
            let record = meter
                .create_api_key(&args.account, &args.name, &args.permissions, expires_at)
                .await?;
            print(&serde_json::json!({
                "id": record.id,
                "key": record.key,
                "permissions": record.permissions,
                "expiresAt": record.expires_at.map(|at| at.format(&Rfc3339)).transpose()?,
            }))
        }
        Command::Key(KeyCommand::List { account }) => print(&meter.list_api_keys(&account).await?),
        Command::Key(KeyCommand::Revoke { account, key_id }) => {
            meter.revoke_api_key(&account, &key_id).await?;
            print(&serde_json::json!({ "revoked": key_id }))
        }
        Command::Session(SessionCommand::Issue { account }) => {
            let token = meter.issue_session(&account).await?;
            print(&serde_json::json!({ "token": token }))
        }
        Command::Auth {
            credential,
            operation,
        } => print(
            &meter
                .authenticate(&Credential::parse(&credential), &operation)
                .await?,
        ),
        Command::Eligibility { account, operation } => {
            print(&meter.check_eligibility(&account, &operation).await?)
        }
        Command::Charge { account, operation } => print(&meter.charge(&account, &operation).await?),
        Command::Balance { account } => print(&meter.balance_summary(&account).await?),
        Command::Deposit(command) => run_deposit(meter, command).await,
        Command::Webhook { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let event = parse_webhook_event(&raw)?;
            print(&meter.handle_webhook(&event).await?)
        }
        Command::Credit {
            account,
            amount,
            reason,
        } => {
            let amount = parse_signed_amount(&amount)?;
            print(&meter.credit_adjustment(&account, amount, &reason).await?)
        }
        Command::Pricing(PricingCommand::Show) => print(&meter.pricing_settings().await?),
        Command::Pricing(PricingCommand::Set {
            admin,
            operation_cost,
            free_operations,
            custom_prices,
            clear_custom_prices,
        }) => {
            let custom_prices = if clear_custom_prices {
                Some(BTreeMap::new())
            } else if custom_prices.is_empty() {
                None
            } else {
                Some(parse_custom_prices(&custom_prices)?)
            };
            let update = PricingUpdate {
                operation_cost: operation_cost
                    .as_deref()
                    .map(money::parse_decimal)
                    .transpose()?,
                monthly_free_operations: free_operations,
                custom_prices,
            };
            print(&meter.update_pricing(&admin, update).await?)
        }
    }
}

fn parse_custom_prices(raw: &[String]) -> CliResult<BTreeMap<String, i64>> {
    let mut prices = BTreeMap::new();
    for entry in raw {
        let (operation, price) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected operation=price, got {entry:?}"))?;
        prices.insert(operation.trim().to_string(), money::parse_decimal(price.trim())?);
    }
    Ok(prices)
}

async fn run_deposit(meter: &Meter, command: DepositCommand) -> CliResult<()> {
    match command {
        DepositCommand::Create {
            account,
            amount,
            reference,
        } => {
            let amount = money::parse_decimal(&amount)?;
            print(
                &meter
                    .create_pending_deposit(&account, amount, &reference)
                    .await?,
            )
        }
        DepositCommand::Start { account, amount } => {
            let amount = money::parse_decimal(&amount)?;
            print(&meter.start_deposit(&account, amount).await?)
        }
        DepositCommand::Confirm { account, reference } => {
            print(&meter.confirm_deposit(&account, &reference).await?)
        }
        DepositCommand::Complete { reference, amount } => {
            let amount = amount.as_deref().map(money::parse_decimal).transpose()?;
            let outcome = meter.complete_deposit(&reference, amount).await?;
            print(&serde_json::json!({
                "applied": outcome.was_applied(),
                "transaction": outcome.transaction(),
            }))
        }
        DepositCommand::Fail { reference, reason } => {
            let outcome = meter.fail_deposit(&reference, &reason).await?;
            print(&serde_json::json!({
                "applied": outcome.was_applied(),
                "transaction": outcome.transaction(),
            }))
        }
    }
}

fn parse_signed_amount(raw: &str) -> CliResult<i64> {
    let raw = raw.trim();
    match raw.strip_prefix('-') {
        Some(rest) => Ok(-money::parse_decimal(rest)?),
        None => Ok(money::parse_decimal(raw.strip_prefix('+').unwrap_or(raw))?),
    }
}

fn print<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
