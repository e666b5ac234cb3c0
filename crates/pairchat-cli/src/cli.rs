//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pair two in-process participants, negotiate, and exchange a message
    Demo {
        /// Number of participants to start; consecutive joiners are paired
        #[arg(short, long, default_value_t = 2)]
        participants: usize,
        /// Message each initiator sends once connected
        #[arg(short, long, default_value = "hello")]
        message: String,
        /// Deliver every negotiation message twice
        #[arg(long)]
        duplicate_delivery: bool,
        /// Drop one participant's relay link after the message exchange
        #[arg(long)]
        drop_link: bool,
    },
    /// Chat interactively with an in-process echo partner
    Chat {
        /// Participant token to use (random if omitted)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo_flags() {
        let cli = Cli::parse_from([
            "pairchat",
            "-v",
            "demo",
            "--participants",
            "4",
            "--message",
            "hi",
            "--drop-link",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Demo {
                participants,
                message,
                duplicate_delivery,
                drop_link,
            } => {
                assert_eq!(participants, 4);
                assert_eq!(message, "hi");
                assert!(!duplicate_delivery);
                assert!(drop_link);
            }
            _ => panic!("expected demo command"),
        }
    }

    #[test]
    fn test_parse_chat_with_config() {
        let cli = Cli::parse_from(["pairchat", "--config", "pairchat.toml", "chat"]);
        assert_eq!(cli.config.as_deref(), Some("pairchat.toml"));
        assert!(matches!(cli.command, Commands::Chat { name: None }));
    }
}
