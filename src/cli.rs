use std::path::PathBuf;

use clap::Parser;
use clap_complete::Shell;

use crate::config::Config;

pub const DEFAULT_CHAT_URL: &str = "http://127.0.0.1:8787/api/chat";

#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "A moderated streaming chat relay and terminal chat client")]
pub struct Args {
    /// Message to send as one chat turn (client mode)
    pub prompt: Option<String>,

    /// Run the relay server instead of the client
    #[arg(long)]
    pub serve: bool,

    /// Address to bind in server mode
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind in server mode
    #[arg(long)]
    pub port: Option<u16>,

    /// Serve simulated lorem ipsum streams instead of calling the provider
    #[arg(long)]
    pub simulate: bool,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Chat endpoint used in client mode
    #[arg(long, default_value = DEFAULT_CHAT_URL)]
    pub url: String,

    /// Challenge token to send in client mode
    #[arg(long, default_value = "local")]
    pub token: String,

    /// Print shell completions and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

impl Args {
    /// Apply flags on top of a loaded configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.simulate {
            config.simulate = true;
        }
    }
}
