//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use mailtriage::domain::Protocol;

#[derive(Parser, Debug)]
#[command(name = "mailtriage")]
#[command(version)]
#[command(about = "Incremental mail sync with rule and AI-consensus triage", long_about = None)]
pub struct Cli {
    /// Path to the settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the background scheduler until interrupted
    Serve,

    /// Run one pass over every active account and exit
    RunOnce,

    /// Sync a single account, printing progress as JSON lines
    Sync {
        /// Account to sync
        account_id: String,

        /// Store new mail without classifying it
        #[arg(long)]
        no_classify: bool,
    },

    /// Classify stored messages that have no label yet
    Classify {
        /// Account whose messages to classify
        account_id: String,
    },

    /// List configured accounts
    Accounts,

    /// List the remote folders of an account
    Folders { account_id: String },

    /// Include an account in scheduled passes
    Enable { account_id: String },

    /// Exclude an account from scheduled passes
    Disable { account_id: String },

    /// Show an account's most recent messages and their labels
    Messages {
        account_id: String,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Register an account and store its password in the keychain
    AddAccount {
        /// Email address
        #[arg(long)]
        email: String,

        /// Server hostname
        #[arg(long)]
        host: String,

        #[arg(long, value_enum, default_value_t = ProtocolArg::Imap)]
        protocol: ProtocolArg,

        /// Server port, defaults to the protocol's TLS port
        #[arg(long)]
        port: Option<u16>,

        /// Login name, defaults to the email address
        #[arg(long)]
        username: Option<String>,

        /// Environment variable holding the password
        #[arg(long, default_value = "MAILTRIAGE_PASSWORD")]
        password_env: String,

        /// Connect without TLS
        #[arg(long)]
        no_tls: bool,

        /// Skip certificate verification
        #[arg(long)]
        insecure: bool,

        /// Store mail without classifying it
        #[arg(long)]
        no_auto_classify: bool,

        /// Instructions that replace the default classification prompt
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Override a message's label
    Relabel { message_id: String, label: String },

    /// Move a message to the deleted state
    Delete { message_id: String },

    /// Show recent audit entries
    Audit {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Write the effective settings to the settings file
    InitConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ProtocolArg {
    Imap,
    Pop3,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Imap => Protocol::Imap,
            ProtocolArg::Pop3 => Protocol::Pop3,
        }
    }
}
