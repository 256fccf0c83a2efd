use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Args;

use crate::candidates::DEFAULT_QUEUE_CAP;
use crate::protocol::IceServer;
use crate::relay::DEFAULT_TRANSCRIPT_DEDUP_WINDOW;

const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302";

/// Policy knobs for rooms, negotiation and liveness.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_participants: usize,
    pub empty_room_grace: Duration,
    pub heartbeat_interval: Duration,
    pub degrade_after_missed: u32,
    pub heartbeat_timeout: Duration,
    pub reconnect_grace: Duration,
    pub transcript_dedup_window: Duration,
    pub candidate_queue_cap: usize,
    pub max_negotiation_failures: u32,
    pub ice_servers: Vec<IceServer>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_participants: 2,
            empty_room_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            degrade_after_missed: 2,
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(30),
            transcript_dedup_window: DEFAULT_TRANSCRIPT_DEDUP_WINDOW,
            candidate_queue_cap: DEFAULT_QUEUE_CAP,
            max_negotiation_failures: 3,
            ice_servers: parse_ice_servers(DEFAULT_ICE_SERVERS),
        }
    }
}

impl RelayConfig {
    /// Silence after which a participant counts as unresponsive.
    pub fn degrade_after(&self) -> Duration {
        self.heartbeat_interval * self.degrade_after_missed
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_participants < 2 {
            bail!("max participants must be at least 2");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.degrade_after_missed == 0 {
            bail!("degrade-after-missed must be at least 1");
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            bail!("heartbeat timeout must not be shorter than the heartbeat interval");
        }
        if self.degrade_after() >= self.heartbeat_timeout {
            bail!(
                "heartbeat timeout must exceed interval x degrade-after-missed ({:?})",
                self.degrade_after()
            );
        }
        if self.candidate_queue_cap == 0 {
            bail!("candidate queue cap must be at least 1");
        }
        Ok(())
    }
}

/// Server flags, each with an environment fallback.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CONSULT_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: String,

    /// Maximum participants per room.
    #[arg(long, env = "CONSULT_RELAY_MAX_PARTICIPANTS", default_value_t = 2)]
    pub max_participants: usize,

    /// How long an empty room is kept for quick reconnects.
    #[arg(long, env = "CONSULT_RELAY_EMPTY_ROOM_GRACE_SECS", default_value_t = 30)]
    pub empty_room_grace_secs: u64,

    /// Liveness check period.
    #[arg(long, env = "CONSULT_RELAY_HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Missed heartbeat intervals before a participant is unresponsive.
    #[arg(long, env = "CONSULT_RELAY_DEGRADE_AFTER_MISSED", default_value_t = 2)]
    pub degrade_after_missed: u32,

    /// Silence after which a participant is removed from its rooms.
    #[arg(long, env = "CONSULT_RELAY_HEARTBEAT_TIMEOUT_SECS", default_value_t = 30)]
    pub heartbeat_timeout_secs: u64,

    /// How long a degraded room waits for recovery before closing.
    #[arg(long, env = "CONSULT_RELAY_RECONNECT_GRACE_SECS", default_value_t = 30)]
    pub reconnect_grace_secs: u64,

    /// Window in which identical transcript fragments collapse.
    #[arg(long, env = "CONSULT_RELAY_TRANSCRIPT_DEDUP_MS", default_value_t = 3_000)]
    pub transcript_dedup_ms: u64,

    /// Pending ICE candidates held per pair direction.
    #[arg(long, env = "CONSULT_RELAY_CANDIDATE_QUEUE_CAP", default_value_t = 256)]
    pub candidate_queue_cap: usize,

    /// Failed negotiations after which a room closes.
    #[arg(long, env = "CONSULT_RELAY_MAX_NEGOTIATION_FAILURES", default_value_t = 3)]
    pub max_negotiation_failures: u32,

    /// STUN/TURN URLs handed to clients on join.
    #[arg(
        long = "ice-server",
        env = "CONSULT_RELAY_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_ICE_SERVERS
    )]
    pub ice_servers: Vec<String>,

    /// Shared secret for HS256 identity tokens; trusted query identity when unset.
    #[arg(long, env = "CONSULT_RELAY_JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Base URL of the consultation bookkeeping service.
    #[arg(long, env = "CONSULT_RELAY_BOOKING_URL")]
    pub booking_url: Option<String>,

    /// Redis URL for chat/transcript persistence.
    #[arg(long, env = "CONSULT_RELAY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Retention of persisted room events.
    #[arg(long, env = "CONSULT_RELAY_EVENT_TTL_SECS", default_value_t = 86_400)]
    pub event_ttl_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CONSULT_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub relay: RelayConfig,
    pub jwt_secret: Option<String>,
    pub booking_url: Option<String>,
    pub redis_url: Option<String>,
    pub event_ttl: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let relay = RelayConfig {
            max_participants: args.max_participants,
            empty_room_grace: Duration::from_secs(args.empty_room_grace_secs),
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
            degrade_after_missed: args.degrade_after_missed,
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
            reconnect_grace: Duration::from_secs(args.reconnect_grace_secs),
            transcript_dedup_window: Duration::from_millis(args.transcript_dedup_ms),
            candidate_queue_cap: args.candidate_queue_cap,
            max_negotiation_failures: args.max_negotiation_failures,
            ice_servers: parse_ice_servers(&args.ice_servers.join(",")),
        };
        relay.validate()?;

        Ok(ServerConfig {
            listen_addr,
            relay,
            jwt_secret: args.jwt_secret.filter(|secret| !secret.is_empty()),
            booking_url: args.booking_url.filter(|url| !url.trim().is_empty()),
            redis_url: args.redis_url.filter(|url| !url.trim().is_empty()),
            event_ttl: Duration::from_secs(args.event_ttl_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn parse_ice_servers(raw: &str) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServer::stun)
        .collect()
}
