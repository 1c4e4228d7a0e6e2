//! mailtriage - Entry point for the sync and triage daemon

mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use mailtriage::config::Settings;
use mailtriage::domain::{Account, AccountId, AuditStatus, MessageId, Protocol};
use mailtriage::services::{CycleReport, ProgressSink};
use mailtriage::storage::queries;
use mailtriage::App;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => Settings::default_path()?,
    };
    let settings = Settings::load(&config_path)?;

    if let Commands::InitConfig = cli.command {
        settings.validate()?;
        settings.save(&config_path)?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    tracing::info!(config = %config_path.display(), "starting mailtriage");
    let app = App::build(settings).await?;

    match cli.command {
        Commands::Serve => {
            let shutdown = install_signal_handler();
            app.serve(shutdown).await?;
        }
        Commands::RunOnce => {
            for report in app.scheduler().run_once().await {
                println!(
                    "{}\t{}\t{}",
                    report.account_id,
                    report.status.as_str(),
                    report.detail
                );
            }
        }
        Commands::Sync {
            account_id,
            no_classify,
        } => {
            let (sink, printer) = progress_printer();
            let report = app
                .sync_account(&AccountId::from(account_id), !no_classify, &sink)
                .await;
            drop(sink);
            let _ = printer.await;
            check_report(report?)?;
        }
        Commands::Classify { account_id } => {
            let (sink, printer) = progress_printer();
            let report = app
                .classify_pending(&AccountId::from(account_id), &sink)
                .await;
            drop(sink);
            let _ = printer.await;
            check_report(report?)?;
        }
        Commands::Accounts => {
            for account in app.storage().all_accounts().await? {
                let usage = app.storage().mailbox_usage(&account.id).await?;
                println!(
                    "{}\t{}\t{}://{}:{}\t{}\t{} bytes\t{}",
                    account.id,
                    account.email,
                    account.protocol,
                    account.host,
                    account.port,
                    if account.is_active { "active" } else { "inactive" },
                    usage,
                    account.last_sync_error.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Folders { account_id } => {
            for folder in app.folders(&AccountId::from(account_id)).await? {
                println!("{folder}");
            }
        }
        Commands::Enable { account_id } => {
            app.set_active(&AccountId::from(account_id), true).await?;
        }
        Commands::Disable { account_id } => {
            app.set_active(&AccountId::from(account_id), false).await?;
        }
        Commands::Messages { account_id, limit } => {
            let account_id = AccountId::from(account_id);
            let messages =
                queries::messages::for_account(app.storage().db(), &account_id, limit).await?;
            for message in messages {
                let label = app
                    .storage()
                    .classification(&message.id)
                    .await?
                    .map(|c| format!("{} ({})", c.final_label, c.decided_by))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    message.id,
                    message.date.to_rfc3339(),
                    message.from.email,
                    message.subject.as_deref().unwrap_or(""),
                    label
                );
            }
        }
        Commands::AddAccount {
            email,
            host,
            protocol,
            port,
            username,
            password_env,
            no_tls,
            insecure,
            no_auto_classify,
            prompt,
        } => {
            let password = std::env::var(&password_env)
                .with_context(|| format!("set the password in ${password_env}"))?;
            let protocol = Protocol::from(protocol);
            let mut account = match protocol {
                Protocol::Imap => Account::imap(AccountId::generate(), &email, &host),
                Protocol::Pop3 => Account::pop3(AccountId::generate(), &email, &host),
            };
            if let Some(port) = port {
                account.port = port;
            }
            if let Some(username) = username {
                account.username = username;
            }
            account.use_tls = !no_tls;
            account.verify_tls = !insecure;
            account.auto_classify = !no_auto_classify;
            account.custom_classification_prompt = prompt.filter(|p| !p.trim().is_empty());

            let keychain = app.storage().keychain();
            keychain
                .set_account_password(&account.id, &password)
                .await
                .context("failed to store password")?;
            if let Err(e) = app.storage().add_account(&account).await {
                if let Err(cleanup) = keychain.remove_account_password(&account.id).await {
                    tracing::warn!(error = %cleanup, "failed to remove stored password");
                }
                return Err(e.into());
            }
            println!("{}", account.id);
        }
        Commands::Relabel { message_id, label } => {
            let known = app
                .settings()
                .classification
                .categories
                .iter()
                .any(|c| c.key == label);
            if !known {
                bail!("{label} is not a configured category");
            }
            app.storage()
                .override_classification(&MessageId::from(message_id), &label)
                .await?;
        }
        Commands::Delete { message_id } => {
            app.storage()
                .mark_deleted(&MessageId::from(message_id))
                .await?;
        }
        Commands::Audit { limit } => {
            for entry in queries::audit::recent(app.storage().db(), limit).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.created_at.to_rfc3339(),
                    entry
                        .account_id
                        .as_ref()
                        .map(|id| id.as_str())
                        .unwrap_or("-"),
                    entry.action,
                    entry.status.as_str(),
                    entry.detail
                );
            }
        }
        Commands::InitConfig => {}
    }

    Ok(())
}

/// Prints progress events as JSON lines until every sink is dropped.
fn progress_printer() -> (ProgressSink, tokio::task::JoinHandle<()>) {
    let (sink, mut stream) = ProgressSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "unprintable progress event"),
            }
        }
    });
    (sink, printer)
}

fn check_report(report: CycleReport) -> Result<()> {
    if report.status == AuditStatus::Failed {
        bail!("{}", report.detail);
    }
    Ok(())
}

/// Cancels the returned token on Ctrl+C or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received Ctrl+C");
        }

        trigger.cancel();
    });

    token
}
