//! Command handlers for the Pairchat CLI

use std::io::Write;

use pairchat_core::{AppEvent, Command, EngineStatus, ParticipantId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::app::{describe_event, Participant, PairchatApp};
use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};

const CHAT_HELP: &str = "commands: /next  /leave  /status  /media on|off  /drop  /help  /quit";

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, app: PairchatApp) -> Result<()> {
        match cli.command {
            Commands::Demo {
                participants,
                message,
                duplicate_delivery,
                drop_link,
            } => {
                Self::handle_demo_command(app, participants, message, duplicate_delivery, drop_link)
                    .await
            }
            Commands::Chat { name } => Self::handle_chat_command(app, name).await,
            Commands::ShowConfig => Self::handle_show_config_command(&app),
        }
    }

    /// Pair participants through the relay and exchange a message in each pair
    async fn handle_demo_command(
        app: PairchatApp,
        participants: usize,
        message: String,
        duplicate_delivery: bool,
        drop_link: bool,
    ) -> Result<()> {
        if participants < 2 {
            return Err(CliError::Config(
                "a demo needs at least two participants".to_string(),
            ));
        }
        app.relay().set_duplicate_delivery(duplicate_delivery);
        info!("Starting demo with {} participants", participants);

        // Start one at a time so the relay pairs consecutive joiners
        let mut started = Vec::with_capacity(participants);
        for n in 1..=participants {
            let mut participant = app
                .start_participant(ParticipantId::new(format!("p{}", n)))
                .await?;
            participant.wait_until_queued_or_paired().await?;
            started.push(participant);
        }

        for pair in started.chunks_mut(2) {
            let [responder, initiator] = pair else {
                warn!("Odd participant out keeps waiting for a partner");
                continue;
            };
            responder.wait_for_status(EngineStatus::Connected).await?;
            initiator.wait_for_status(EngineStatus::Connected).await?;

            initiator
                .send(Command::SendText {
                    text: message.clone(),
                })
                .await?;
            let received = responder
                .wait_for("text message", |e| matches!(e, AppEvent::TextReceived { .. }))
                .await?;
            if let AppEvent::TextReceived { text, .. } = received {
                if text != message.trim() {
                    return Err(CliError::Session(format!(
                        "expected \"{}\", received \"{}\"",
                        message.trim(),
                        text
                    )));
                }
            }
        }

        if drop_link {
            if let [responder, initiator, ..] = started.as_mut_slice() {
                println!("--- dropping relay link of {} ---", responder.id);
                responder.link.drop_connection("dropped by demo");
                responder.wait_for_status(EngineStatus::Reconnecting).await?;
                initiator
                    .wait_for_status(EngineStatus::PartnerDisconnected)
                    .await?;
                responder.wait_for_status(EngineStatus::Waiting).await?;
            }
        }

        for participant in started.iter_mut() {
            let snapshot = participant.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        println!("relay: {:?}", app.relay().stats());

        for participant in started.iter_mut() {
            participant.shutdown().await?;
        }
        Ok(())
    }

    /// Interactive chat with an in-process echo partner
    async fn handle_chat_command(app: PairchatApp, name: Option<String>) -> Result<()> {
        let mut partner = app
            .start_participant(ParticipantId::new(app.config().cli.echo_partner.clone()))
            .await?;
        partner.wait_until_queued_or_paired().await?;
        let Participant {
            engine: mut partner_engine,
            events: mut partner_events,
            ..
        } = partner;
        let echo_commands = partner_engine.command_sender();
        let echo_task = tokio::spawn(async move {
            while let Some(event) = partner_events.recv().await {
                let reply = match event {
                    AppEvent::TextReceived { text, .. } => Command::SendText {
                        text: format!("echo: {}", text),
                    },
                    AppEvent::StatusChanged {
                        status: EngineStatus::PartnerDisconnected | EngineStatus::Left,
                    } => Command::UserRestart,
                    _ => continue,
                };
                if echo_commands.send(reply).await.is_err() {
                    break;
                }
            }
        });

        let participant_id = name.map(ParticipantId::new).unwrap_or_else(ParticipantId::random);
        let Participant {
            id,
            mut engine,
            mut events,
            link,
            ..
        } = app.start_participant(participant_id).await?;
        println!("You are {}. {}", id, CHAT_HELP);

        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    AppEvent::StatusReport(snapshot) => {
                        match serde_json::to_string_pretty(&snapshot) {
                            Ok(text) => println!("{}", text),
                            Err(e) => warn!("Could not render status: {}", e),
                        }
                    }
                    other => {
                        if let Some(line) = describe_event(&other) {
                            println!("{}", line);
                        }
                    }
                }
            }
        });

        let prompt = app.config().cli.prompt.clone();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{}", prompt);
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let command = match line.trim() {
                "" => continue,
                "/quit" => break,
                "/help" => {
                    println!("{}", CHAT_HELP);
                    continue;
                }
                "/drop" => {
                    link.drop_connection("dropped by user");
                    continue;
                }
                "/next" => Command::UserRestart,
                "/leave" => Command::Leave,
                "/status" => Command::GetStatus,
                "/media on" => Command::SetMediaEnabled { enabled: true },
                "/media off" => Command::SetMediaEnabled { enabled: false },
                text if text.starts_with('/') => {
                    println!("unknown command; {}", CHAT_HELP);
                    continue;
                }
                text => Command::SendText {
                    text: text.to_string(),
                },
            };
            engine.send_command(command).await?;
        }

        engine.shutdown().await?;
        partner_engine.shutdown().await?;
        echo_task.abort();
        printer.abort();
        Ok(())
    }

    fn handle_show_config_command(app: &PairchatApp) -> Result<()> {
        println!("{}", app.config().to_toml_string()?);
        Ok(())
    }
}
