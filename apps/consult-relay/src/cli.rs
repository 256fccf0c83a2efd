use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{Sink, SinkExt, StreamExt};
use reqwest::Url;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::ServeArgs;
use crate::protocol::{ClientMessage, ParticipantRole, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "consult-relay", version)]
#[command(about = "Consultation signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room as a participant and print every envelope received
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Relay base URL (e.g., ws://localhost:5000)
    #[arg(short, long, default_value = "ws://localhost:5000")]
    pub url: String,

    /// Room to join
    #[arg(short, long)]
    pub room: String,

    /// User id presented in trusted mode
    #[arg(long, default_value = "probe")]
    pub user_id: String,

    /// Role presented in trusted mode
    #[arg(long, default_value = "doctor")]
    pub role: ParticipantRole,

    /// Identity token, when the relay verifies tokens
    #[arg(long)]
    pub token: Option<String>,

    /// Chat line to send after joining
    #[arg(long)]
    pub chat: Option<String>,

    /// Seconds to keep listening after joining
    #[arg(long, default_value_t = 10)]
    pub wait_secs: u64,
}

pub fn probe_url(args: &ProbeArgs) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/ws", args.url.trim_end_matches('/')))
        .with_context(|| format!("invalid relay url: {}", args.url))?;
    {
        let mut query = url.query_pairs_mut();
        match &args.token {
            Some(token) => {
                query.append_pair("token", token);
            }
            None => {
                query.append_pair("userId", &args.user_id);
                query.append_pair("role", args.role.as_str());
            }
        }
    }
    Ok(url)
}

pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    let url = probe_url(&args)?;
    debug!(url = %url, room_id = %args.room, "connecting probe");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            error!(error = %err, "failed to connect to {}", url);
            return Err(anyhow!("connection failed: {}", err));
        }
        Err(_) => {
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    send(
        &mut write,
        &ClientMessage::JoinRoom {
            room_id: args.room.clone(),
        },
    )
    .await?;
    if let Some(text) = &args.chat {
        send(
            &mut write,
            &ClientMessage::ChatMessage {
                room_id: args.room.clone(),
                sender_id: None,
                sender_role: None,
                text: text.clone(),
                file: None,
                client_seq: Some(1),
            },
        )
        .await?;
    }

    let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                println!("relay closed the connection");
                return Ok(());
            }
            Err(_) => break,
        };
        if let Message::Text(text) = frame {
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Rejected { op, code, reason, .. }) => {
                    println!("rejected {op}: {} ({reason})", code.metric_label());
                }
                Ok(_) => println!("{}", text.as_str()),
                Err(err) => println!("unparsed frame ({err}): {}", text.as_str()),
            }
        }
    }

    send(
        &mut write,
        &ClientMessage::LeaveRoom {
            room_id: args.room.clone(),
        },
    )
    .await?;
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

async fn send<S>(write: &mut S, message: &ClientMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(message)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}
