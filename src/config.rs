use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct Config {
    /// relay identifier
    ///
    /// the position of this relay in the overlay, in the range [0, nodes).
    /// the identifier determines which peers the routing step forwards to.
    #[arg(long)]
    pub id: u64,

    /// listen host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// listen port
    #[arg(long)]
    pub port: u16,

    /// relay certificate, base64-encoded PEM
    ///
    /// issued by the cluster certificate authority; presented to peers and
    /// clients during the handshake.
    #[arg(long)]
    pub cert: String,

    /// relay private key, base64-encoded PEM
    #[arg(long)]
    pub key: String,

    /// cluster certificate authority, base64-encoded PEM
    ///
    /// every peer and client certificate must chain to this authority;
    /// sessions that do not verify are refused.
    #[arg(long)]
    pub ca: String,

    /// peer addresses
    ///
    /// comma-separated host:port list of the relays this node dials at
    /// startup. the list is derived from the overlay topology by whoever
    /// launches the cluster.
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<String>,

    /// total number of relays in the overlay
    #[arg(long)]
    pub nodes: usize,

    /// startup sleep in milliseconds before dialing peers
    ///
    /// gives the other relays time to bind their listeners; dials that
    /// still fail are logged and not retried.
    #[arg(long, default_value_t = 1000)]
    pub timeout: u64,

    /// read chunk size in bytes
    ///
    /// governs only how much is read from a session per call; frames
    /// larger than one chunk are accumulated across reads.
    #[arg(long, default_value_t = 4096)]
    pub buffer: usize,

    /// log verbosity
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

impl Config {
    /// Parse the command line.
    pub fn load() -> Self {
        Self::parse()
    }
}
